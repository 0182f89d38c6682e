//! 引用计数字节缓冲区
//! 相对游标（position/limit）与绝对地址（absPos/absLimit）双模型，支持零拷贝复制视图与自动扩容

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use parking_lot::{RwLock, RwLockReadGuard};

use super::allocator::PoolShared;
use super::storage::{Storage, StorageKind};
use crate::common::error::BufferError;

/// 多个视图共享的底层存储块
pub(crate) struct Chunk {
    /// 实际字节
    storage: RwLock<Storage>,
    /// 存储类型，创建后不变
    kind: StorageKind,
    /// 仍持有该存储的视图数量，归零时回收存储
    views: AtomicUsize,
    /// 池化来源：所属池与尺寸级别
    origin: Option<(Weak<PoolShared>, usize)>,
}

impl Chunk {
    pub(crate) fn new(storage: Storage, origin: Option<(Weak<PoolShared>, usize)>) -> Arc<Self> {
        Arc::new(Self {
            kind: storage.kind(),
            storage: RwLock::new(storage),
            views: AtomicUsize::new(1),
            origin,
        })
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.storage.read().len()
    }

    fn retain_view(&self) {
        self.views.fetch_add(1, Ordering::AcqRel);
    }

    /// 某个视图放弃对存储的持有；最后一个视图负责回收
    fn release_view(&self) {
        if self.views.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        let storage = std::mem::take(&mut *self.storage.write());
        if let Some((pool, class)) = &self.origin {
            if let Some(pool) = pool.upgrade() {
                pool.recycle(*class, storage);
                return;
            }
        }
        drop(storage);
    }

    /// 按同样来源分配一个新存储块（用于扩容）
    fn allocate_like(&self, capacity: usize) -> Arc<Chunk> {
        if let Some((pool, _)) = &self.origin {
            if let Some(pool) = pool.upgrade() {
                return pool.allocate_chunk(capacity);
            }
        }
        Chunk::new(Storage::allocate(self.kind, capacity), None)
    }
}

/// 可读区域的借用守卫，用于聚合写
pub(crate) struct ReadableGuard<'a> {
    guard: RwLockReadGuard<'a, Storage>,
    start: usize,
    end: usize,
}

impl ReadableGuard<'_> {
    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.guard.as_slice()[self.start..self.end]
    }
}

/// 引用计数字节缓冲区视图
///
/// 每个视图拥有独立的游标与引用计数；底层存储由所有视图共享，
/// 只有当所有视图都释放后才会被回收（归还池或释放内存）。
pub struct Buffer {
    chunk: Arc<Chunk>,
    /// 视图在存储块中的起始偏移
    offset: usize,
    capacity: usize,
    position: usize,
    limit: usize,
    mark_position: usize,
    mark_limit: usize,
    /// 视图自身的引用计数
    refs: AtomicUsize,
    /// 空间不足时是否自动扩容
    expandable: bool,
}

impl Buffer {
    pub(crate) fn from_chunk(chunk: Arc<Chunk>, capacity: usize, expandable: bool) -> Self {
        Self {
            chunk,
            offset: 0,
            capacity,
            position: 0,
            limit: capacity,
            mark_position: 0,
            mark_limit: capacity,
            refs: AtomicUsize::new(1),
            expandable,
        }
    }

    /// 非池化的固定容量堆缓冲区
    pub fn heap(capacity: usize) -> Self {
        let chunk = Chunk::new(Storage::allocate(StorageKind::Heap, capacity), None);
        Self::from_chunk(chunk, capacity, false)
    }

    /// 非池化的固定容量直接内存缓冲区
    pub fn direct(capacity: usize) -> Self {
        let chunk = Chunk::new(Storage::allocate(StorageKind::Direct, capacity), None);
        Self::from_chunk(chunk, capacity, false)
    }

    /// 包装已有数据，position=0，limit=数据长度，不可扩容
    pub fn wrap(data: Vec<u8>) -> Self {
        let capacity = data.len();
        let chunk = Chunk::new(Storage::Heap(data.into_boxed_slice()), None);
        Self::from_chunk(chunk, capacity, false)
    }

    /// 共享的零长度哨兵，始终处于已释放状态
    pub fn empty() -> &'static Buffer {
        static EMPTY: OnceLock<Buffer> = OnceLock::new();
        EMPTY.get_or_init(|| {
            let chunk = Chunk::new(Storage::default(), None);
            chunk.views.store(0, Ordering::Release);
            let buf = Self::from_chunk(chunk, 0, false);
            buf.refs.store(0, Ordering::Release);
            buf
        })
    }

    // ---- 状态 ----

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.limit
    }

    /// 绝对读写位置：offset + position
    pub fn abs_pos(&self) -> usize {
        self.offset + self.position
    }

    /// 绝对上限：offset + limit
    pub fn abs_limit(&self) -> usize {
        self.offset + self.limit
    }

    /// 视图在底层存储中的偏移
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn is_pooled(&self) -> bool {
        self.chunk.origin.is_some()
    }

    pub fn is_direct(&self) -> bool {
        self.chunk.kind == StorageKind::Direct
    }

    pub fn is_expandable(&self) -> bool {
        self.expandable
    }

    /// 当前引用计数
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.ref_count() == 0
    }

    /// 两个视图是否共享同一底层存储
    pub fn shares_storage_with(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.chunk, &other.chunk)
    }

    // ---- 引用计数 ----

    /// 增加一次引用，返回新的计数
    pub fn retain(&self) -> Result<usize, BufferError> {
        let mut cur = self.refs.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return Err(BufferError::AlreadyReleased);
            }
            match self
                .refs
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(cur + 1),
                Err(actual) => cur = actual,
            }
        }
    }

    /// 释放一次引用；返回 `true` 表示这是最后一次引用，视图已放弃存储
    ///
    /// 对已释放的缓冲区再次释放返回 [`BufferError::AlreadyReleased`]。
    pub fn release(&self) -> Result<bool, BufferError> {
        let mut cur = self.refs.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return Err(BufferError::AlreadyReleased);
            }
            match self
                .refs
                .compare_exchange_weak(cur, cur - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    if cur == 1 {
                        self.chunk.release_view();
                        return Ok(true);
                    }
                    return Ok(false);
                }
                Err(actual) => cur = actual,
            }
        }
    }

    fn ensure_live(&self) -> Result<(), BufferError> {
        if self.is_released() {
            Err(BufferError::AlreadyReleased)
        } else {
            Ok(())
        }
    }

    // ---- 视图 ----

    /// 共享存储、游标独立的零拷贝视图
    pub fn duplicate(&self) -> Result<Buffer, BufferError> {
        self.ensure_live()?;
        self.chunk.retain_view();
        Ok(Buffer {
            chunk: Arc::clone(&self.chunk),
            offset: self.offset,
            capacity: self.capacity,
            position: self.position,
            limit: self.limit,
            mark_position: self.mark_position,
            mark_limit: self.mark_limit,
            refs: AtomicUsize::new(1),
            expandable: self.expandable,
        })
    }

    /// 覆盖 [position, limit) 的固定容量零拷贝视图
    pub fn slice(&self) -> Result<Buffer, BufferError> {
        self.ensure_live()?;
        self.chunk.retain_view();
        let len = self.remaining();
        Ok(Buffer {
            chunk: Arc::clone(&self.chunk),
            offset: self.abs_pos(),
            capacity: len,
            position: 0,
            limit: len,
            mark_position: 0,
            mark_limit: len,
            refs: AtomicUsize::new(1),
            expandable: false,
        })
    }

    // ---- 游标 ----

    pub fn clear(&mut self) -> &mut Self {
        self.position = 0;
        self.limit = self.capacity;
        self
    }

    pub fn flip(&mut self) -> &mut Self {
        self.limit = self.position;
        self.position = 0;
        self
    }

    pub fn set_position(&mut self, position: usize) -> Result<&mut Self, BufferError> {
        if position > self.limit {
            return Err(BufferError::InvalidCursor(format!(
                "position {} > limit {}",
                position, self.limit
            )));
        }
        self.position = position;
        Ok(self)
    }

    pub fn set_limit(&mut self, limit: usize) -> Result<&mut Self, BufferError> {
        if limit > self.capacity {
            return Err(BufferError::InvalidCursor(format!(
                "limit {} > capacity {}",
                limit, self.capacity
            )));
        }
        self.limit = limit;
        self.position = self.position.min(limit);
        Ok(self)
    }

    pub fn set_abs_pos(&mut self, abs_pos: usize) -> Result<&mut Self, BufferError> {
        let position = abs_pos
            .checked_sub(self.offset)
            .ok_or_else(|| BufferError::InvalidCursor(format!("absPos {} < offset", abs_pos)))?;
        self.set_position(position)
    }

    pub fn set_abs_limit(&mut self, abs_limit: usize) -> Result<&mut Self, BufferError> {
        let limit = abs_limit.checked_sub(self.offset).ok_or_else(|| {
            BufferError::InvalidCursor(format!("absLimit {} < offset", abs_limit))
        })?;
        self.set_limit(limit)
    }

    pub fn mark_position(&mut self) -> &mut Self {
        self.mark_position = self.position;
        self
    }

    pub fn reset_position(&mut self) -> &mut Self {
        self.position = self.mark_position.min(self.limit);
        self
    }

    pub fn mark_limit(&mut self) -> &mut Self {
        self.mark_limit = self.limit;
        self
    }

    pub fn reset_limit(&mut self) -> &mut Self {
        self.limit = self.mark_limit.min(self.capacity);
        self.position = self.position.min(self.limit);
        self
    }

    /// 跳过 `len` 个可读字节
    pub fn skip(&mut self, len: usize) -> Result<&mut Self, BufferError> {
        self.advance_read(len)?;
        Ok(self)
    }

    /// 将未读字节搬到视图开头，position 指向其后，limit 恢复为容量
    pub fn compact(&mut self) -> Result<&mut Self, BufferError> {
        self.ensure_live()?;
        let remaining = self.remaining();
        if self.position > 0 && remaining > 0 {
            let (from, to) = (self.abs_pos(), self.abs_limit());
            let mut storage = self.chunk.storage.write();
            storage.as_mut_slice().copy_within(from..to, self.offset);
        }
        self.position = remaining;
        self.limit = self.capacity;
        Ok(self)
    }

    // ---- 扩容 ----

    /// 扩容到至少 `capacity` 字节并复制原有内容，游标保持不变
    pub fn expand(&mut self, capacity: usize) -> Result<(), BufferError> {
        self.ensure_live()?;
        if !self.expandable {
            return Err(BufferError::ExpansionNotSupported {
                capacity: self.capacity,
                wanted: capacity,
            });
        }
        if capacity <= self.capacity {
            return Ok(());
        }
        let chunk = self.chunk.allocate_like(capacity);
        {
            let src = self.chunk.storage.read();
            let mut dst = chunk.storage.write();
            dst.as_mut_slice()[..self.capacity]
                .copy_from_slice(&src.as_slice()[self.offset..self.offset + self.capacity]);
        }
        let old = std::mem::replace(&mut self.chunk, chunk);
        old.release_view();
        if self.limit == self.capacity {
            self.limit = capacity;
        }
        if self.mark_limit == self.capacity {
            self.mark_limit = capacity;
        }
        self.offset = 0;
        self.capacity = capacity;
        Ok(())
    }

    /// 几何增长：每次至少增长原容量的一半，直到覆盖 `wanted`
    fn grown_capacity(current: usize, wanted: usize) -> usize {
        let mut cap = current;
        while cap < wanted {
            cap = (cap + (cap >> 1)).max(cap + 1);
        }
        cap
    }

    /// 相对写入前确保空间；不可扩容时返回可写入的字节数
    fn ensure_writable(&mut self, len: usize) -> Result<usize, BufferError> {
        self.ensure_live()?;
        if len <= self.remaining() {
            return Ok(len);
        }
        if self.expandable {
            let wanted = self.position + len;
            let cap = Self::grown_capacity(self.capacity, wanted.max(self.capacity + 1));
            self.expand(cap)?;
            self.limit = self.capacity;
            return Ok(len);
        }
        Ok(self.remaining())
    }

    // ---- 底层读写 ----

    fn advance_read(&mut self, len: usize) -> Result<usize, BufferError> {
        self.ensure_live()?;
        if len > self.remaining() {
            return Err(BufferError::OutOfRange {
                index: self.position,
                len,
                limit: self.limit,
            });
        }
        let at = self.abs_pos();
        self.position += len;
        Ok(at)
    }

    /// 绝对访问的起点：absPos + index，范围不得越过 absLimit
    fn abs_index(&self, index: usize, len: usize) -> Result<usize, BufferError> {
        self.ensure_live()?;
        let span = self
            .abs_pos()
            .checked_add(index)
            .and_then(|at| Some((at, at.checked_add(len)?)));
        match span {
            Some((at, end)) if end <= self.abs_limit() => Ok(at),
            _ => Err(BufferError::OutOfRange {
                index,
                len,
                limit: self.limit,
            }),
        }
    }

    fn read_array<const N: usize>(&self, at: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.chunk.storage.read().as_slice()[at..at + N]);
        out
    }

    fn write_at(&self, at: usize, src: &[u8]) {
        self.chunk.storage.write().as_mut_slice()[at..at + src.len()].copy_from_slice(src);
    }

    fn put_fixed(&mut self, src: &[u8]) -> Result<(), BufferError> {
        let writable = self.ensure_writable(src.len())?;
        if writable < src.len() {
            return Err(BufferError::OutOfRange {
                index: self.position,
                len: src.len(),
                limit: self.limit,
            });
        }
        self.write_at(self.abs_pos(), src);
        self.position += src.len();
        Ok(())
    }

    // ---- 单字节 ----

    pub fn get_byte(&mut self) -> Result<i8, BufferError> {
        let at = self.advance_read(1)?;
        Ok(i8::from_be_bytes(self.read_array(at)))
    }

    pub fn get_byte_at(&self, index: usize) -> Result<i8, BufferError> {
        let at = self.abs_index(index, 1)?;
        Ok(i8::from_be_bytes(self.read_array(at)))
    }

    pub fn get_unsigned_byte(&mut self) -> Result<i16, BufferError> {
        let at = self.advance_read(1)?;
        Ok(i16::from(u8::from_be_bytes(self.read_array(at))))
    }

    pub fn get_unsigned_byte_at(&self, index: usize) -> Result<i16, BufferError> {
        let at = self.abs_index(index, 1)?;
        Ok(i16::from(u8::from_be_bytes(self.read_array(at))))
    }

    pub fn put_byte(&mut self, value: i8) -> Result<(), BufferError> {
        self.put_fixed(&value.to_be_bytes())
    }

    pub fn put_byte_at(&mut self, index: usize, value: i8) -> Result<(), BufferError> {
        let at = self.abs_index(index, 1)?;
        self.write_at(at, &value.to_be_bytes());
        Ok(())
    }

    // ---- 字节序列 ----

    /// 写入字节切片；不可扩容且空间不足时截断，返回实际写入字节数
    pub fn put_slice(&mut self, src: &[u8]) -> Result<usize, BufferError> {
        let len = self.ensure_writable(src.len())?;
        if len > 0 {
            self.write_at(self.abs_pos(), &src[..len]);
            self.position += len;
        }
        Ok(len)
    }

    /// 把 `src` 的可读字节写入本缓冲区，两者游标都前移，返回写入字节数
    pub fn put_buffer(&mut self, src: &mut Buffer) -> Result<usize, BufferError> {
        src.ensure_live()?;
        let len = self.ensure_writable(src.remaining())?;
        if len == 0 {
            return Ok(0);
        }
        let (from, to) = (src.abs_pos(), self.abs_pos());
        if self.shares_storage_with(src) {
            self.chunk
                .storage
                .write()
                .as_mut_slice()
                .copy_within(from..from + len, to);
        } else {
            let source = src.chunk.storage.read();
            self.chunk.storage.write().as_mut_slice()[to..to + len]
                .copy_from_slice(&source.as_slice()[from..from + len]);
        }
        self.position += len;
        src.position += len;
        Ok(len)
    }

    /// 读满 `dst`，可读字节不足时报错且不移动游标
    pub fn get_slice(&mut self, dst: &mut [u8]) -> Result<(), BufferError> {
        let at = self.advance_read(dst.len())?;
        dst.copy_from_slice(&self.chunk.storage.read().as_slice()[at..at + dst.len()]);
        Ok(())
    }

    /// 读取 `len` 字节为 `Bytes`
    pub fn get_bytes(&mut self, len: usize) -> Result<Bytes, BufferError> {
        let at = self.advance_read(len)?;
        let storage = self.chunk.storage.read();
        Ok(Bytes::copy_from_slice(&storage.as_slice()[at..at + len]))
    }

    /// 复制 [position, limit) 的字节，不移动游标
    pub fn peek_remaining(&self) -> Result<Vec<u8>, BufferError> {
        self.ensure_live()?;
        let storage = self.chunk.storage.read();
        Ok(storage.as_slice()[self.abs_pos()..self.abs_limit()].to_vec())
    }

    // ---- 查找 ----

    /// 在 [absPos, absLimit) 中查找字节，返回绝对下标
    pub fn index_of(&self, b: u8) -> Result<Option<usize>, BufferError> {
        self.index_of_range(b, self.abs_pos(), self.remaining())
    }

    /// 从绝对下标 `abs_from` 起的 `len` 字节中查找
    pub fn index_of_range(
        &self,
        b: u8,
        abs_from: usize,
        len: usize,
    ) -> Result<Option<usize>, BufferError> {
        self.ensure_live()?;
        let storage = self.chunk.storage.read();
        let end = abs_from.saturating_add(len).min(storage.len());
        if abs_from >= end {
            return Ok(None);
        }
        Ok(storage.as_slice()[abs_from..end]
            .iter()
            .position(|x| *x == b)
            .map(|i| abs_from + i))
    }

    /// 在 [absPos, absLimit) 中自后向前查找字节，返回绝对下标
    pub fn last_index_of(&self, b: u8) -> Result<Option<usize>, BufferError> {
        self.last_index_of_range(b, self.abs_limit(), self.remaining())
    }

    /// 在绝对下标 `abs_end` 之前的 `len` 字节中自后向前查找
    pub fn last_index_of_range(
        &self,
        b: u8,
        abs_end: usize,
        len: usize,
    ) -> Result<Option<usize>, BufferError> {
        self.ensure_live()?;
        let storage = self.chunk.storage.read();
        let end = abs_end.min(storage.len());
        let start = end.saturating_sub(len);
        Ok(storage.as_slice()[start..end]
            .iter()
            .rposition(|x| *x == b)
            .map(|i| start + i))
    }

    // ---- IO ----

    /// 从读取源读入 [position, limit)，返回读取字节数
    pub fn read_from<R: Read + ?Sized>(&mut self, src: &mut R) -> io::Result<usize> {
        self.ensure_live().map_err(io::Error::other)?;
        let (from, to) = (self.abs_pos(), self.abs_limit());
        let n = {
            let mut storage = self.chunk.storage.write();
            src.read(&mut storage.as_mut_slice()[from..to])?
        };
        self.position += n;
        Ok(n)
    }

    /// 把 [position, limit) 写入目标，返回写出字节数
    pub fn write_to<W: Write + ?Sized>(&mut self, dst: &mut W) -> io::Result<usize> {
        let n = {
            let guard = self.readable().map_err(io::Error::other)?;
            dst.write(guard.as_slice())?
        };
        self.position += n;
        Ok(n)
    }

    /// 借出可读区域；允许同一线程对共享存储的多个视图同时借用
    pub(crate) fn readable(&self) -> Result<ReadableGuard<'_>, BufferError> {
        self.ensure_live()?;
        Ok(ReadableGuard {
            guard: self.chunk.storage.read_recursive(),
            start: self.abs_pos(),
            end: self.abs_limit(),
        })
    }

    /// 已写出 `len` 字节后前移 position
    pub(crate) fn consume(&mut self, len: usize) -> Result<(), BufferError> {
        self.advance_read(len).map(|_| ())
    }
}

/// 生成多字节整数的相对/绝对、大端/小端访问器
macro_rules! scalar_accessors {
    ($(
        $raw:ty => $out:ty, $n:literal:
            $get:ident, $get_le:ident, $get_at:ident, $get_le_at:ident,
            $put:ident, $put_le:ident, $put_at:ident, $put_le_at:ident;
    )*) => {
        #[allow(clippy::unnecessary_cast)]
        impl Buffer {
            $(
                pub fn $get(&mut self) -> Result<$out, BufferError> {
                    let at = self.advance_read($n)?;
                    Ok(<$raw>::from_be_bytes(self.read_array::<$n>(at)) as $out)
                }

                pub fn $get_le(&mut self) -> Result<$out, BufferError> {
                    let at = self.advance_read($n)?;
                    Ok(<$raw>::from_le_bytes(self.read_array::<$n>(at)) as $out)
                }

                pub fn $get_at(&self, index: usize) -> Result<$out, BufferError> {
                    let at = self.abs_index(index, $n)?;
                    Ok(<$raw>::from_be_bytes(self.read_array::<$n>(at)) as $out)
                }

                pub fn $get_le_at(&self, index: usize) -> Result<$out, BufferError> {
                    let at = self.abs_index(index, $n)?;
                    Ok(<$raw>::from_le_bytes(self.read_array::<$n>(at)) as $out)
                }

                pub fn $put(&mut self, value: $out) -> Result<(), BufferError> {
                    self.put_fixed(&(value as $raw).to_be_bytes())
                }

                pub fn $put_le(&mut self, value: $out) -> Result<(), BufferError> {
                    self.put_fixed(&(value as $raw).to_le_bytes())
                }

                pub fn $put_at(&mut self, index: usize, value: $out) -> Result<(), BufferError> {
                    let at = self.abs_index(index, $n)?;
                    self.write_at(at, &(value as $raw).to_be_bytes());
                    Ok(())
                }

                pub fn $put_le_at(&mut self, index: usize, value: $out) -> Result<(), BufferError> {
                    let at = self.abs_index(index, $n)?;
                    self.write_at(at, &(value as $raw).to_le_bytes());
                    Ok(())
                }
            )*
        }
    };
}

scalar_accessors! {
    i16 => i16, 2:
        get_short, get_short_le, get_short_at, get_short_le_at,
        put_short, put_short_le, put_short_at, put_short_le_at;
    u16 => i32, 2:
        get_unsigned_short, get_unsigned_short_le, get_unsigned_short_at, get_unsigned_short_le_at,
        put_unsigned_short, put_unsigned_short_le, put_unsigned_short_at, put_unsigned_short_le_at;
    i32 => i32, 4:
        get_int, get_int_le, get_int_at, get_int_le_at,
        put_int, put_int_le, put_int_at, put_int_le_at;
    u32 => i64, 4:
        get_unsigned_int, get_unsigned_int_le, get_unsigned_int_at, get_unsigned_int_le_at,
        put_unsigned_int, put_unsigned_int_le, put_unsigned_int_at, put_unsigned_int_le_at;
    i64 => i64, 8:
        get_long, get_long_le, get_long_at, get_long_le_at,
        put_long, put_long_le, put_long_at, put_long_le_at;
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // 仍持有引用的视图在析构时放弃存储，避免泄漏
        if self.refs.swap(0, Ordering::AcqRel) > 0 {
            self.chunk.release_view();
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Buffer[pos={},lim={},cap={},remaining={},offset={},refs={}]",
            self.position,
            self.limit,
            self.capacity,
            self.remaining(),
            self.offset,
            self.ref_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expandable(capacity: usize) -> Buffer {
        let chunk = Chunk::new(Storage::allocate(StorageKind::Heap, capacity), None);
        Buffer::from_chunk(chunk, capacity, true)
    }

    #[test]
    fn test_round_trip_both_byte_orders() {
        let mut buf = Buffer::heap(64);
        buf.put_byte(-3).unwrap();
        buf.put_short(-2).unwrap();
        buf.put_short_le(0x1234).unwrap();
        buf.put_unsigned_short(0xFFFE).unwrap();
        buf.put_int(-100_000).unwrap();
        buf.put_int_le(0x0102_0304).unwrap();
        buf.put_unsigned_int(0xFFFF_FFF0).unwrap();
        buf.put_unsigned_int_le(7).unwrap();
        buf.put_long(i64::MIN + 1).unwrap();
        buf.put_long_le(42).unwrap();
        buf.flip();

        assert_eq!(buf.get_byte().unwrap(), -3);
        assert_eq!(buf.get_short().unwrap(), -2);
        assert_eq!(buf.get_short_le().unwrap(), 0x1234);
        assert_eq!(buf.get_unsigned_short().unwrap(), 0xFFFE);
        assert_eq!(buf.get_int().unwrap(), -100_000);
        assert_eq!(buf.get_int_le().unwrap(), 0x0102_0304);
        assert_eq!(buf.get_unsigned_int().unwrap(), 0xFFFF_FFF0);
        assert_eq!(buf.get_unsigned_int_le().unwrap(), 7);
        assert_eq!(buf.get_long().unwrap(), i64::MIN + 1);
        assert_eq!(buf.get_long_le().unwrap(), 42);
        assert!(!buf.has_remaining());
    }

    #[test]
    fn test_byte_order_layout() {
        let mut buf = Buffer::heap(8);
        buf.put_int(0x0102_0304).unwrap();
        buf.put_int_le(0x0102_0304).unwrap();
        buf.flip();
        assert_eq!(buf.peek_remaining().unwrap(), vec![1, 2, 3, 4, 4, 3, 2, 1]);
    }

    #[test]
    fn test_unsigned_widening() {
        let mut buf = Buffer::wrap(vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert_eq!(buf.get_unsigned_byte_at(0).unwrap(), 255);
        assert_eq!(buf.get_byte_at(0).unwrap(), -1);
        assert_eq!(buf.get_unsigned_short_at(0).unwrap(), 65535);
        assert_eq!(buf.get_unsigned_int_at(1).unwrap(), 4_294_967_295);
        assert_eq!(buf.get_unsigned_byte().unwrap(), 255);
    }

    #[test]
    fn test_read_past_limit_fails_without_moving() {
        let mut buf = Buffer::wrap(vec![1, 2, 3]);
        let err = buf.get_int().unwrap_err();
        assert!(matches!(err, BufferError::OutOfRange { len: 4, limit: 3, .. }));
        assert_eq!(buf.position(), 0);
        assert_eq!(buf.get_short().unwrap(), 0x0102);
    }

    #[test]
    fn test_absolute_access_is_relative_to_abs_pos() {
        let mut buf = Buffer::wrap(vec![9, 0, 0, 0, 5, 7]);
        buf.skip(1).unwrap();
        assert_eq!(buf.abs_pos(), 1);
        assert_eq!(buf.get_int_at(0).unwrap(), 5);
        assert_eq!(buf.get_byte_at(4).unwrap(), 7);
        assert!(buf.get_byte_at(5).is_err());
        assert_eq!(buf.position(), 1);

        buf.put_short_at(0, 0x0A0B).unwrap();
        assert_eq!(buf.get_short().unwrap(), 0x0A0B);
    }

    #[test]
    fn test_duplicate_has_independent_cursors() {
        let mut a = Buffer::heap(16);
        a.put_slice(b"abcdef").unwrap();
        a.flip();
        let mut b = a.duplicate().unwrap();
        assert!(a.shares_storage_with(&b));

        a.skip(2).unwrap();
        assert_eq!(b.position(), 0);
        assert_eq!(b.get_bytes(3).unwrap().as_ref(), b"abc");
        assert_eq!(a.position(), 2);
        assert_eq!(a.get_bytes(2).unwrap().as_ref(), b"cd");

        // 写入对另一个视图可见
        b.put_byte_at(0, b'X' as i8).unwrap();
        assert_eq!(a.get_byte_at(0).unwrap(), b'e' as i8);
        assert_eq!(b.get_byte().unwrap(), b'X' as i8);
    }

    #[test]
    fn test_release_last_view_reclaims_storage_once() {
        let a = Buffer::heap(8);
        let b = a.duplicate().unwrap();
        assert_eq!(a.chunk.views.load(Ordering::Acquire), 2);

        assert!(a.release().unwrap());
        assert_eq!(a.chunk.len(), 8);
        assert!(b.release().unwrap());
        assert_eq!(b.chunk.len(), 0);
        assert_eq!(a.release(), Err(BufferError::AlreadyReleased));
    }

    #[test]
    fn test_retain_release_balance() {
        let buf = Buffer::heap(4);
        for _ in 0..5 {
            buf.retain().unwrap();
        }
        for _ in 0..5 {
            assert!(!buf.release().unwrap());
        }
        assert!(buf.release().unwrap());
        assert!(buf.is_released());
        assert_eq!(buf.retain(), Err(BufferError::AlreadyReleased));
        assert_eq!(buf.release(), Err(BufferError::AlreadyReleased));
    }

    #[test]
    fn test_released_buffer_rejects_access() {
        let mut buf = Buffer::heap(4);
        buf.release().unwrap();
        assert_eq!(buf.put_int(1), Err(BufferError::AlreadyReleased));
        assert!(buf.duplicate().is_err());
    }

    #[test]
    fn test_empty_sentinel_is_released() {
        let empty = Buffer::empty();
        assert!(empty.is_released());
        assert_eq!(empty.capacity(), 0);
        assert_eq!(empty.release(), Err(BufferError::AlreadyReleased));
        assert!(std::ptr::eq(empty, Buffer::empty()));
    }

    #[test]
    fn test_auto_expansion_preserves_content() {
        let mut buf = expandable(4);
        buf.put_slice(b"abcd").unwrap();
        let written = buf.put_slice(b"efghij").unwrap();
        assert_eq!(written, 6);
        assert!(buf.capacity() >= 10);
        buf.flip();
        assert_eq!(buf.peek_remaining().unwrap(), b"abcdefghij".to_vec());
    }

    #[test]
    fn test_geometric_growth() {
        assert_eq!(Buffer::grown_capacity(8, 9), 12);
        assert_eq!(Buffer::grown_capacity(8, 13), 18);
        assert_eq!(Buffer::grown_capacity(0, 3), 3);
        assert_eq!(Buffer::grown_capacity(1, 2), 2);
    }

    #[test]
    fn test_fixed_buffer_truncates() {
        let mut buf = Buffer::heap(4);
        assert_eq!(buf.put_slice(b"abcdef").unwrap(), 4);
        assert_eq!(buf.position(), 4);
        assert_eq!(buf.put_slice(b"x").unwrap(), 0);
        assert!(matches!(buf.put_int(1), Err(BufferError::OutOfRange { .. })));
        assert!(matches!(
            buf.expand(16),
            Err(BufferError::ExpansionNotSupported { capacity: 4, wanted: 16 })
        ));
    }

    #[test]
    fn test_expansion_detaches_from_duplicate() {
        let mut a = expandable(4);
        a.put_slice(b"1234").unwrap();
        let b = a.duplicate().unwrap();
        a.put_slice(b"5").unwrap();
        assert!(!a.shares_storage_with(&b));
        assert_eq!(b.chunk.views.load(Ordering::Acquire), 1);
        assert_eq!(b.capacity(), 4);
    }

    #[test]
    fn test_index_of_uses_absolute_offsets() {
        let mut buf = Buffer::wrap(b"a\r\nb\r\n".to_vec());
        assert_eq!(buf.index_of(b'\n').unwrap(), Some(2));
        assert_eq!(buf.last_index_of(b'\r').unwrap(), Some(4));
        buf.skip(3).unwrap();
        assert_eq!(buf.index_of(b'\n').unwrap(), Some(5));
        assert_eq!(buf.index_of(b'z').unwrap(), None);
        assert_eq!(buf.position(), 3);
    }

    #[test]
    fn test_absolute_index_overflow_is_out_of_range() {
        let buf = Buffer::wrap(vec![1, 2, 3, 4]);
        assert!(matches!(
            buf.get_int_at(usize::MAX - 1),
            Err(BufferError::OutOfRange { .. })
        ));
        assert!(matches!(
            buf.get_byte_at(usize::MAX),
            Err(BufferError::OutOfRange { .. })
        ));
        assert_eq!(buf.get_int_at(0).unwrap(), 0x01020304);
    }

    #[test]
    fn test_index_range_with_huge_len() {
        let buf = Buffer::wrap(b"abcdefghij".to_vec());
        assert_eq!(buf.index_of_range(9, 2, usize::MAX).unwrap(), None);
        assert_eq!(buf.index_of_range(b'j', 9, usize::MAX).unwrap(), Some(9));
        assert_eq!(buf.last_index_of_range(b'a', 10, usize::MAX).unwrap(), Some(0));
    }

    #[test]
    fn test_put_buffer_copies_between_storages() {
        let mut src = Buffer::wrap(b"xyz".to_vec());
        let mut dst = Buffer::heap(8);
        assert_eq!(dst.put_buffer(&mut src).unwrap(), 3);
        assert!(!src.has_remaining());
        dst.flip();
        assert_eq!(dst.peek_remaining().unwrap(), b"xyz");

        // 同一存储的两个视图
        let mut a = Buffer::wrap(b"abcdef".to_vec());
        let mut b = a.duplicate().unwrap();
        a.set_limit(3).unwrap();
        b.set_position(3).unwrap();
        assert_eq!(b.put_buffer(&mut a).unwrap(), 3);
        assert_eq!(a.position(), 3);
        b.clear();
        assert_eq!(b.peek_remaining().unwrap(), b"abcabc");
    }

    #[test]
    fn test_slice_and_compact() {
        let mut buf = Buffer::wrap(b"hello world".to_vec());
        buf.skip(6).unwrap();
        let mut s = buf.slice().unwrap();
        assert_eq!(s.capacity(), 5);
        assert_eq!(s.offset(), 6);
        assert_eq!(s.get_bytes(5).unwrap().as_ref(), b"world");

        buf.compact().unwrap();
        assert_eq!(buf.position(), 5);
        buf.flip();
        assert_eq!(buf.peek_remaining().unwrap(), b"world".to_vec());
    }

    #[test]
    fn test_marks() {
        let mut buf = Buffer::wrap(vec![1, 2, 3, 4]);
        buf.skip(1).unwrap().mark_position();
        buf.skip(2).unwrap();
        buf.reset_position();
        assert_eq!(buf.position(), 1);
        buf.mark_limit();
        buf.set_limit(2).unwrap();
        buf.reset_limit();
        assert_eq!(buf.limit(), 4);
    }

    #[test]
    fn test_io_helpers() {
        let mut buf = Buffer::heap(8);
        let mut src: &[u8] = b"xyz";
        assert_eq!(buf.read_from(&mut src).unwrap(), 3);
        buf.flip();
        let mut out = Vec::new();
        assert_eq!(buf.write_to(&mut out).unwrap(), 3);
        assert_eq!(out, b"xyz");
        assert!(!buf.has_remaining());
    }
}
