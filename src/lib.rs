//! ioloop 核心库
//! 基于多路复用的网络 I/O 反应器：引用计数缓冲区、事件循环、通道与编解码契约

#![allow(clippy::module_inception)]

// 公共依赖
pub use bytes::Bytes;
pub use std::sync::Arc;

pub mod buffer;
pub mod codec;
pub mod common;
pub mod config;
pub mod connection;
pub mod event_loop;
pub mod server;

// 导出核心类型
pub use buffer::{Buffer, BufferAllocator};
pub use codec::{Codec, FixedLengthCodec, Frame, FrameKind};
pub use common::error::{
    BackendError, BufferError, ConfigError, ConnectionError, FramingError, IoLoopError, Result,
    TaskError,
};
pub use config::IoConfig;
pub use connection::{
    Channel, ChannelConnector, ChannelContext, ChannelHandle, DefaultIoEventHandle, IoEventHandle,
};
pub use event_loop::{EventLoop, EventLoopGroup, EventLoopHandle, LoopContext};
pub use server::{ChannelAcceptor, IoServer};

/// 初始化日志，`RUST_LOG` 优先于 `log.level`；配置了 `file_path` 时追加写入该文件
pub fn init(
    log: &config::LogConfig,
) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&log.level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true);
    match &log.file_path {
        Some(path) => {
            let file = config::open_log_file(path)?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .try_init()
        }
        None => builder.try_init(),
    }
}

/// 按配置文件启动服务器
pub fn start_server(
    config_path: &str,
    context: Arc<ChannelContext>,
) -> std::result::Result<IoServer, IoLoopError> {
    let config = config::load(config_path)?;
    IoServer::start(&config, context)
}
