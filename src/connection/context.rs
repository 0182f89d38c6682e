//! 通道上下文
//! 接入器/连接器创建通道时注入的编解码器与事件处理器

use std::fmt;
use std::sync::Arc;

use super::handler::IoEventHandle;
use crate::codec::Codec;

/// 同一接入器或连接器下所有通道共享的上下文
pub struct ChannelContext {
    codec: Arc<dyn Codec>,
    handler: Arc<dyn IoEventHandle>,
}

impl ChannelContext {
    pub fn new<C, H>(codec: C, handler: H) -> Arc<Self>
    where
        C: Codec + 'static,
        H: IoEventHandle + 'static,
    {
        Self::from_parts(Arc::new(codec), Arc::new(handler))
    }

    pub fn from_parts(codec: Arc<dyn Codec>, handler: Arc<dyn IoEventHandle>) -> Arc<Self> {
        Arc::new(Self { codec, handler })
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub fn handler(&self) -> &Arc<dyn IoEventHandle> {
        &self.handler
    }
}

impl fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelContext")
            .field("codec", &self.codec.name())
            .finish_non_exhaustive()
    }
}
