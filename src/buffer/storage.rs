//! 缓冲区底层存储
//! 堆内存（`Box<[u8]>`）与按页对齐的直接内存两种实现

use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// 直接内存的对齐粒度
const DIRECT_ALIGN: usize = 4096;

/// 底层存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    /// 普通堆内存
    Heap,
    /// 按页对齐的直接内存
    Direct,
}

/// 一段固定大小的字节存储
#[derive(Debug)]
pub enum Storage {
    /// 堆内存
    Heap(Box<[u8]>),
    /// 直接内存
    Direct(AlignedBytes),
}

impl Storage {
    /// 分配指定类型和大小的存储，内容清零
    pub fn allocate(kind: StorageKind, len: usize) -> Self {
        match kind {
            StorageKind::Heap => Storage::Heap(vec![0u8; len].into_boxed_slice()),
            StorageKind::Direct => Storage::Direct(AlignedBytes::zeroed(len)),
        }
    }

    /// 存储类型
    pub fn kind(&self) -> StorageKind {
        match self {
            Storage::Heap(_) => StorageKind::Heap,
            Storage::Direct(_) => StorageKind::Direct,
        }
    }

    /// 存储长度
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 只读视图
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Heap(b) => b,
            Storage::Direct(d) => d.as_slice(),
        }
    }

    /// 可写视图
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Storage::Heap(b) => b,
            Storage::Direct(d) => d.as_mut_slice(),
        }
    }
}

impl Default for Storage {
    fn default() -> Self {
        Storage::Heap(Box::default())
    }
}

/// 按页对齐分配的字节块
pub struct AlignedBytes {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: AlignedBytes 独占其分配的内存，与 Box<[u8]> 具有相同的线程语义
unsafe impl Send for AlignedBytes {}
// SAFETY: 共享引用只能得到 &[u8]
unsafe impl Sync for AlignedBytes {}

impl AlignedBytes {
    /// 分配 `len` 字节并清零；`len == 0` 时不分配
    pub fn zeroed(len: usize) -> Self {
        if len == 0 {
            return Self {
                ptr: NonNull::dangling(),
                len: 0,
            };
        }
        let layout = Self::layout(len);
        // SAFETY: layout 的大小非零
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(p) => p,
            None => alloc::handle_alloc_error(layout),
        };
        Self { ptr, len }
    }

    fn layout(len: usize) -> Layout {
        match Layout::from_size_align(len, DIRECT_ALIGN) {
            Ok(layout) => layout,
            // 与 Vec 一致：超出 isize 的请求视为容量溢出
            Err(_) => panic!("capacity overflow: {len}"),
        }
    }

    /// 只读视图
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr 指向 len 字节的有效、已初始化内存（len == 0 时为悬垂但合法的空切片）
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// 可写视图
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: 同上，且 &mut self 保证独占
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// 起始地址，用于校验对齐
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl Drop for AlignedBytes {
    fn drop(&mut self) {
        if self.len != 0 {
            // SAFETY: ptr 由相同 layout 的 alloc_zeroed 分配
            unsafe { alloc::dealloc(self.ptr.as_ptr(), Self::layout(self.len)) }
        }
    }
}

impl std::fmt::Debug for AlignedBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBytes")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direct_storage_is_aligned_and_zeroed() {
        let mut s = Storage::allocate(StorageKind::Direct, 100);
        assert_eq!(s.kind(), StorageKind::Direct);
        assert_eq!(s.len(), 100);
        assert!(s.as_slice().iter().all(|b| *b == 0));
        if let Storage::Direct(d) = &s {
            assert_eq!(d.address() % DIRECT_ALIGN, 0);
        }
        s.as_mut_slice()[99] = 7;
        assert_eq!(s.as_slice()[99], 7);
    }

    #[test]
    fn test_empty_direct_storage() {
        let s = Storage::allocate(StorageKind::Direct, 0);
        assert!(s.is_empty());
    }
}
