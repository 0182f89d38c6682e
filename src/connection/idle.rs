//! 空闲检测与心跳
//! 连续两个检测周期都没有读到数据的通道会被关闭

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use super::channel::Channel;

/// 默认的空闲处理策略
///
/// - 上一周期以来有过读入：不做处理并清除心跳标记；
/// - 首次静默：打上标记，编解码器提供心跳帧时发送心跳；
/// - 已标记后再次静默：关闭通道。
pub fn heartbeat(ch: &mut Channel, last_idle: Instant, _now: Instant) {
    if !ch.is_open() {
        return;
    }
    if ch.last_access() >= last_idle {
        ch.set_missed_idle(false);
        return;
    }
    if ch.missed_idle() {
        info!("心跳周期内未检测到活动，关闭 {}", ch);
        ch.close();
        return;
    }
    ch.set_missed_idle(true);
    let context = Arc::clone(ch.context());
    let Some(ping) = context.codec().ping(ch) else {
        // 协议不需要心跳
        return;
    };
    if let Err(e) = ch.write_and_flush(ping) {
        warn!("发送心跳失败 {}: {}", ch, e);
    }
}
