//! 连接管理模块
//! 通道状态机、应用事件接口、空闲心跳与主动连接器

pub mod channel;
pub mod connector;
pub mod context;
pub mod handler;
pub mod idle;

// 重新导出常用类型
pub use channel::{Channel, ChannelHandle, ChannelState};
pub use connector::ChannelConnector;
pub use context::ChannelContext;
pub use handler::{DefaultIoEventHandle, IoEventHandle};
