//! 缓冲区模块
//! 引用计数字节缓冲区、底层存储与池化分配器

pub mod allocator;
pub mod buf;
pub mod storage;

pub use allocator::{AllocatorStats, BufferAllocator};
pub use buf::Buffer;
pub use storage::StorageKind;
