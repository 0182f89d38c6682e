//! 定长头编解码器
//! 4字节大端有符号长度头 + 内容；-1 表示心跳请求，-2 表示心跳响应

use super::{Codec, Frame, FrameKind};
use crate::buffer::Buffer;
use crate::common::error::FramingError;
use crate::connection::Channel;

/// 协议头长度
pub const PROTOCOL_HEADER: usize = 4;

/// 心跳请求的长度头
const PING_LENGTH: i32 = -1;

/// 心跳响应的长度头
const PONG_LENGTH: i32 = -2;

/// 定长头编解码器
#[derive(Debug, Clone)]
pub struct FixedLengthCodec {
    /// 单帧最大内容长度
    max_frame_length: usize,
}

impl FixedLengthCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    fn header_only(ch: &Channel, len: i32) -> Result<Buffer, FramingError> {
        let mut buf = ch.allocator().allocate(PROTOCOL_HEADER);
        buf.put_int(len)?;
        buf.flip();
        Ok(buf)
    }
}

impl Default for FixedLengthCodec {
    fn default() -> Self {
        Self::new(1024 * 1024 * 4)
    }
}

impl Codec for FixedLengthCodec {
    fn name(&self) -> &'static str {
        "fixed-length"
    }

    fn header_length(&self) -> usize {
        PROTOCOL_HEADER
    }

    fn decode(&self, _ch: &Channel, buf: &mut Buffer) -> Result<Option<Frame>, FramingError> {
        if buf.remaining() < PROTOCOL_HEADER {
            return Ok(None);
        }
        let len = buf.get_int_at(0)?;
        match len {
            PING_LENGTH => {
                buf.skip(PROTOCOL_HEADER)?;
                Ok(Some(Frame::ping()))
            }
            PONG_LENGTH => {
                buf.skip(PROTOCOL_HEADER)?;
                Ok(Some(Frame::pong()))
            }
            l if l < 0 => Err(FramingError::Malformed(format!("非法长度头: {}", l))),
            l => {
                let len = l as usize;
                if len > self.max_frame_length {
                    return Err(FramingError::Oversized {
                        len,
                        max: self.max_frame_length,
                    });
                }
                if buf.remaining() < PROTOCOL_HEADER + len {
                    return Ok(None);
                }
                buf.skip(PROTOCOL_HEADER)?;
                Ok(Some(Frame::data(buf.get_bytes(len)?)))
            }
        }
    }

    fn encode(&self, ch: &Channel, frame: &Frame) -> Result<Buffer, FramingError> {
        match frame.kind() {
            FrameKind::Ping => Self::header_only(ch, PING_LENGTH),
            FrameKind::Pong => Self::header_only(ch, PONG_LENGTH),
            FrameKind::Data => {
                let content = frame.content();
                let oversized = || FramingError::Oversized {
                    len: content.len(),
                    max: self.max_frame_length,
                };
                if content.len() > self.max_frame_length {
                    return Err(oversized());
                }
                // 长度头是 i32，超出部分无法表示
                let len = i32::try_from(content.len()).map_err(|_| oversized())?;
                let mut buf = ch.allocator().allocate(PROTOCOL_HEADER + content.len());
                buf.put_int(len)?;
                buf.put_slice(content)?;
                buf.flip();
                Ok(buf)
            }
        }
    }

    fn ping(&self, _ch: &Channel) -> Option<Frame> {
        Some(Frame::ping())
    }

    fn pong(&self, _ch: &Channel, _ping: Frame) -> Option<Frame> {
        Some(Frame::pong())
    }
}
