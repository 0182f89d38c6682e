//! 应用事件处理接口
//! 帧、打开、关闭、空闲与异常回调，均在通道所属的事件循环线程上同步调用

use std::time::Instant;

use tracing::{info, warn};

use super::channel::Channel;
use super::idle;
use crate::codec::Frame;
use crate::common::error::ConnectionError;

/// 应用事件处理器
#[cfg_attr(test, mockall::automock)]
pub trait IoEventHandle: Send + Sync {
    /// 收到一个完整的数据帧
    fn on_frame(&self, ch: &mut Channel, frame: Frame);

    /// 通道进入打开状态
    fn on_open(&self, _ch: &mut Channel) {}

    /// 通道关闭，每个打开过的通道恰好触发一次
    fn on_close(&self, _ch: &mut Channel) {}

    /// 空闲检测周期到达，`last_idle` 为上一周期的时间点
    fn on_idle(&self, ch: &mut Channel, last_idle: Instant, now: Instant) {
        idle::heartbeat(ch, last_idle, now);
    }

    /// 读写或解码失败，随后通道会被关闭
    fn on_error(&self, ch: &mut Channel, err: &ConnectionError) {
        warn!("通道 {} 发生错误: {}", ch, err);
    }
}

/// 未设置处理器时的默认实现，仅记录收到的帧
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultIoEventHandle;

impl IoEventHandle for DefaultIoEventHandle {
    fn on_frame(&self, ch: &mut Channel, frame: Frame) {
        info!("未设置处理器，通道 {} 收到: {}", ch, frame);
    }
}
