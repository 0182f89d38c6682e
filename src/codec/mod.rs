//! 编解码模块
//! 协议层接入点：帧边界判定、解码、编码与可选的心跳帧

pub mod fixed_length;
pub mod frame;

pub use fixed_length::FixedLengthCodec;
pub use frame::{Frame, FrameKind};

use crate::buffer::Buffer;
use crate::common::error::FramingError;
use crate::connection::Channel;

/// 协议编解码器
///
/// 所有方法都在通道所属的事件循环线程上同步调用，不得阻塞，
/// 也不得在调用结束后继续持有传入的缓冲区。
pub trait Codec: Send + Sync {
    /// 协议名称，用于日志
    fn name(&self) -> &'static str;

    /// 尝试解码前至少需要缓冲的字节数；0 表示有数据即可尝试
    fn header_length(&self) -> usize;

    /// 从 `buf` 中消费一个完整帧
    ///
    /// 数据不足时返回 `Ok(None)` 且不移动 `buf` 的游标，剩余字节由调用方保存到下一次读取。
    fn decode(&self, ch: &Channel, buf: &mut Buffer) -> Result<Option<Frame>, FramingError>;

    /// 把帧编码为可直接写出的缓冲区（position=0，limit=数据长度）
    fn encode(&self, ch: &Channel, frame: &Frame) -> Result<Buffer, FramingError>;

    /// 心跳请求帧；返回 `None` 表示协议不需要心跳
    fn ping(&self, _ch: &Channel) -> Option<Frame> {
        None
    }

    /// 收到心跳请求后的响应帧
    fn pong(&self, _ch: &Channel, _ping: Frame) -> Option<Frame> {
        None
    }
}
