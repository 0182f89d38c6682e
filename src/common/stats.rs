//! 统计信息模块
//! 跟踪每个事件循环的连接、流量与任务指标

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// 事件循环统计，由循环线程更新，任意线程读取
#[derive(Debug, Default)]
pub struct LoopStats {
    /// 打开的通道数
    channels_opened: AtomicU64,
    /// 关闭的通道数
    channels_closed: AtomicU64,
    /// 接收字节数
    bytes_read: AtomicU64,
    /// 发送字节数
    bytes_written: AtomicU64,
    /// 解码出的帧数
    frames_decoded: AtomicU64,
    /// 执行的任务数（含延时任务）
    tasks_run: AtomicU64,
    /// panic 的任务数
    task_failures: AtomicU64,
    /// 循环迭代（唤醒）次数
    wakeups: AtomicU64,
    /// 因空闲被关闭的通道数
    idle_closed: AtomicU64,
}

/// 统计快照
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatsSnapshot {
    /// 事件循环名称
    pub name: String,
    /// 当前通道数
    pub current_channels: u64,
    pub channels_opened: u64,
    pub channels_closed: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub frames_decoded: u64,
    pub tasks_run: u64,
    pub task_failures: u64,
    pub wakeups: u64,
    pub idle_closed: u64,
    /// 快照时间
    pub taken_at: DateTime<Utc>,
}

impl LoopStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn channel_opened(&self) {
        self.channels_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn channel_closed(&self) {
        self.channels_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_written(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn frame_decoded(&self) {
        self.frames_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_run(&self) {
        self.tasks_run.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn task_failed(&self) {
        self.task_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn wakeup(&self) {
        self.wakeups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn idle_close(&self) {
        self.idle_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// 当前打开的通道数
    pub fn current_channels(&self) -> u64 {
        let opened = self.channels_opened.load(Ordering::Relaxed);
        opened.saturating_sub(self.channels_closed.load(Ordering::Relaxed))
    }

    /// 生成快照
    pub fn snapshot(&self, name: &str) -> LoopStatsSnapshot {
        LoopStatsSnapshot {
            name: name.to_string(),
            current_channels: self.current_channels(),
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            tasks_run: self.tasks_run.load(Ordering::Relaxed),
            task_failures: self.task_failures.load(Ordering::Relaxed),
            wakeups: self.wakeups.load(Ordering::Relaxed),
            idle_closed: self.idle_closed.load(Ordering::Relaxed),
            taken_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes() {
        let stats = LoopStats::new();
        stats.channel_opened();
        stats.channel_opened();
        stats.channel_closed();
        stats.add_read(10);
        stats.add_written(4);

        let snap = stats.snapshot("worker-0");
        assert_eq!(snap.current_channels, 1);
        assert_eq!(snap.bytes_read, 10);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["name"], "worker-0");
        assert_eq!(json["bytes_written"], 4);
        assert!(json["taken_at"].is_string());
    }
}
