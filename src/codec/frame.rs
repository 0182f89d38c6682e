//! 应用层帧
//! 编解码器从字节流中解析出的最小消息单元

use bytes::Bytes;
use std::fmt;

/// 帧类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// 业务数据
    Data,
    /// 心跳请求
    Ping,
    /// 心跳响应
    Pong,
}

/// 解码后的应用层帧
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameKind,
    content: Bytes,
}

impl Frame {
    /// 数据帧
    pub fn data(content: impl Into<Bytes>) -> Self {
        Self {
            kind: FrameKind::Data,
            content: content.into(),
        }
    }

    /// 心跳请求帧
    pub fn ping() -> Self {
        Self {
            kind: FrameKind::Ping,
            content: Bytes::new(),
        }
    }

    /// 心跳响应帧
    pub fn pong() -> Self {
        Self {
            kind: FrameKind::Pong,
            content: Bytes::new(),
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind != FrameKind::Data
    }

    pub fn content(&self) -> &Bytes {
        &self.content
    }

    pub fn into_content(self) -> Bytes {
        self.content
    }

    /// 以 UTF-8 解释帧内容，非法字节替换为 U+FFFD
    pub fn string_content(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &self.kind)
            .field("len", &self.content.len())
            .finish()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            FrameKind::Data => f.write_str(&self.string_content()),
            FrameKind::Ping => f.write_str("PING"),
            FrameKind::Pong => f.write_str("PONG"),
        }
    }
}
