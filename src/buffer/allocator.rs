//! 缓冲区分配器
//! 按2的幂划分尺寸级别的无锁缓冲池，池耗尽时回退为非池化分配

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use tracing::debug;

use super::buf::{Buffer, Chunk};
use super::storage::{Storage, StorageKind};
use crate::config::BufferConfig;

/// 分配器统计
#[derive(Debug, Default)]
struct AllocatorCounters {
    /// 新切分的池化块
    allocations: AtomicU64,
    /// 复用的空闲块
    reuses: AtomicU64,
    /// 归还到空闲列表的块
    returns: AtomicU64,
    /// 回退为非池化的分配
    unpooled: AtomicU64,
}

/// 分配器统计快照
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AllocatorStats {
    /// 新切分的池化块
    pub allocations: u64,
    /// 复用的空闲块
    pub reuses: u64,
    /// 归还到空闲列表的块
    pub returns: u64,
    /// 回退为非池化的分配
    pub unpooled: u64,
    /// 池当前占用的字节数
    pub pooled_bytes: usize,
}

/// 一个尺寸级别的空闲列表
struct SizeClass {
    size: usize,
    free: ArrayQueue<Storage>,
}

/// 池的共享状态，存储块通过弱引用指回这里
pub(crate) struct PoolShared {
    kind: StorageKind,
    classes: Vec<SizeClass>,
    /// 已切分（在用或空闲）的字节数
    pooled_bytes: AtomicUsize,
    max_pool_memory: usize,
    counters: AllocatorCounters,
}

impl PoolShared {
    fn class_for(&self, size: usize) -> Option<usize> {
        self.classes.iter().position(|c| c.size >= size)
    }

    /// 从池中取出或切分一个至少 `size` 字节的存储块
    pub(crate) fn allocate_chunk(self: &Arc<Self>, size: usize) -> Arc<Chunk> {
        let Some(idx) = self.class_for(size) else {
            self.counters.unpooled.fetch_add(1, Ordering::Relaxed);
            return Chunk::new(Storage::allocate(self.kind, size), None);
        };
        let class = &self.classes[idx];
        let origin = Some((Arc::downgrade(self), idx));

        if let Some(storage) = class.free.pop() {
            self.counters.reuses.fetch_add(1, Ordering::Relaxed);
            return Chunk::new(storage, origin);
        }

        let reserved = self
            .pooled_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                let next = used + class.size;
                (next <= self.max_pool_memory).then_some(next)
            })
            .is_ok();
        if !reserved {
            debug!("缓冲池已达上限 {} 字节，回退为非池化分配", self.max_pool_memory);
            self.counters.unpooled.fetch_add(1, Ordering::Relaxed);
            return Chunk::new(Storage::allocate(self.kind, size), None);
        }

        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        Chunk::new(Storage::allocate(self.kind, class.size), origin)
    }

    /// 最后一个视图释放后归还存储块；空闲列表已满时直接释放
    pub(crate) fn recycle(&self, class: usize, storage: Storage) {
        let Some(sc) = self.classes.get(class) else {
            return;
        };
        self.counters.returns.fetch_add(1, Ordering::Relaxed);
        if sc.free.push(storage).is_err() {
            self.pooled_bytes.fetch_sub(sc.size, Ordering::AcqRel);
        }
    }
}

/// 缓冲区分配器，克隆代价很低
///
/// 每个事件循环持有自己的分配器；跨循环传递缓冲区应通过提交任务完成。
#[derive(Clone)]
pub struct BufferAllocator {
    /// `None` 表示未启用池化
    pool: Option<Arc<PoolShared>>,
    kind: StorageKind,
    auto_expansion: bool,
    /// 非池化模式下的统计
    unpooled: Arc<AtomicU64>,
}

impl BufferAllocator {
    /// 按配置创建分配器
    pub fn new(config: &BufferConfig) -> Self {
        let kind = if config.direct {
            StorageKind::Direct
        } else {
            StorageKind::Heap
        };
        let pool = config.pooled.then(|| {
            let mut classes = Vec::new();
            let mut size = config.unit_size.max(1).next_power_of_two();
            while size <= config.max_class_size {
                classes.push(SizeClass {
                    size,
                    free: ArrayQueue::new(config.max_per_class.max(1)),
                });
                size <<= 1;
            }
            Arc::new(PoolShared {
                kind,
                classes,
                pooled_bytes: AtomicUsize::new(0),
                max_pool_memory: config.max_pool_memory,
                counters: AllocatorCounters::default(),
            })
        });
        Self {
            pool,
            kind,
            auto_expansion: config.auto_expansion,
            unpooled: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 分配容量至少为 `capacity` 的缓冲区，引用计数为1
    pub fn allocate(&self, capacity: usize) -> Buffer {
        let chunk = match &self.pool {
            Some(pool) => pool.allocate_chunk(capacity),
            None => self.unpooled_chunk(capacity),
        };
        Buffer::from_chunk(chunk, capacity, self.auto_expansion)
    }

    /// 绕过池分配，扩容策略与池化缓冲区一致
    pub fn allocate_unpooled(&self, capacity: usize) -> Buffer {
        Buffer::from_chunk(self.unpooled_chunk(capacity), capacity, self.auto_expansion)
    }

    fn unpooled_chunk(&self, capacity: usize) -> Arc<Chunk> {
        self.unpooled.fetch_add(1, Ordering::Relaxed);
        Chunk::new(Storage::allocate(self.kind, capacity), None)
    }

    pub fn is_pooled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn is_direct(&self) -> bool {
        self.kind == StorageKind::Direct
    }

    /// 统计快照
    pub fn stats(&self) -> AllocatorStats {
        let own = self.unpooled.load(Ordering::Relaxed);
        match &self.pool {
            Some(pool) => AllocatorStats {
                allocations: pool.counters.allocations.load(Ordering::Relaxed),
                reuses: pool.counters.reuses.load(Ordering::Relaxed),
                returns: pool.counters.returns.load(Ordering::Relaxed),
                unpooled: pool.counters.unpooled.load(Ordering::Relaxed) + own,
                pooled_bytes: pool.pooled_bytes.load(Ordering::Relaxed),
            },
            None => AllocatorStats {
                unpooled: own,
                ..AllocatorStats::default()
            },
        }
    }

    /// 弱引用形式的池句柄，用于测试池被丢弃后的回收行为
    #[cfg(test)]
    fn downgrade(&self) -> Option<std::sync::Weak<PoolShared>> {
        self.pool.as_ref().map(Arc::downgrade)
    }
}

impl std::fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("pooled", &self.is_pooled())
            .field("kind", &self.kind)
            .field("auto_expansion", &self.auto_expansion)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BufferConfig {
        BufferConfig {
            unit_size: 64,
            max_class_size: 1024,
            max_per_class: 4,
            max_pool_memory: 4096,
            ..BufferConfig::default()
        }
    }

    #[test]
    fn test_allocate_rounds_up_to_class() {
        let alloc = BufferAllocator::new(&config());
        let buf = alloc.allocate(100);
        assert_eq!(buf.capacity(), 100);
        assert_eq!(buf.remaining(), 100);
        assert_eq!(buf.ref_count(), 1);
        assert!(buf.is_pooled());
        assert_eq!(alloc.stats().pooled_bytes, 128);
    }

    #[test]
    fn test_release_returns_to_pool_and_reuses() {
        let alloc = BufferAllocator::new(&config());
        let mut buf = alloc.allocate(64);
        buf.put_int(7).unwrap();
        buf.release().unwrap();
        assert_eq!(alloc.stats().returns, 1);

        let again = alloc.allocate(50);
        assert_eq!(again.position(), 0);
        let stats = alloc.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.pooled_bytes, 64);
    }

    #[test]
    fn test_duplicate_delays_recycling() {
        let alloc = BufferAllocator::new(&config());
        let buf = alloc.allocate(64);
        let dup = buf.duplicate().unwrap();
        buf.release().unwrap();
        assert_eq!(alloc.stats().returns, 0);
        drop(dup);
        assert_eq!(alloc.stats().returns, 1);
    }

    #[test]
    fn test_exhausted_pool_falls_back_to_unpooled() {
        let alloc = BufferAllocator::new(&config());
        let held: Vec<Buffer> = (0..4).map(|_| alloc.allocate(1024)).collect();
        assert_eq!(alloc.stats().pooled_bytes, 4096);

        let extra = alloc.allocate(1024);
        assert!(!extra.is_pooled());
        let huge = alloc.allocate(4096);
        assert!(!huge.is_pooled());
        assert_eq!(alloc.stats().unpooled, 2);
        drop(held);
        assert_eq!(alloc.stats().returns, 4);
    }

    #[test]
    fn test_full_free_list_drops_storage() {
        let alloc = BufferAllocator::new(&BufferConfig {
            max_per_class: 1,
            ..config()
        });
        let a = alloc.allocate(64);
        let b = alloc.allocate(64);
        assert_eq!(alloc.stats().pooled_bytes, 128);
        drop(a);
        drop(b);
        assert_eq!(alloc.stats().pooled_bytes, 64);
    }

    #[test]
    fn test_unpooled_allocator() {
        let alloc = BufferAllocator::new(&BufferConfig {
            pooled: false,
            direct: true,
            ..config()
        });
        let buf = alloc.allocate(10);
        assert!(!buf.is_pooled());
        assert!(buf.is_direct());
        assert_eq!(alloc.stats().unpooled, 1);
    }

    #[test]
    fn test_pooled_buffer_expands_from_pool() {
        let alloc = BufferAllocator::new(&config());
        let mut buf = alloc.allocate(64);
        buf.put_slice(&[1u8; 100]).unwrap();
        assert!(buf.capacity() >= 100);
        assert!(buf.is_pooled());
        // 原先的64字节块已归还
        assert_eq!(alloc.stats().returns, 1);
    }

    #[test]
    fn test_buffer_outlives_pool() {
        let alloc = BufferAllocator::new(&config());
        let weak = alloc.downgrade().unwrap();
        let buf = alloc.allocate(64);
        drop(alloc);
        assert!(weak.upgrade().is_none());
        drop(buf);
    }
}
