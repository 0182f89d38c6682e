//! 事件循环组
//! 固定数量的事件循环，按轮询顺序分配新通道

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use super::{EventLoop, EventLoopHandle};
use crate::common::error::IoLoopError;
use crate::common::stats::LoopStatsSnapshot;
use crate::config::{BufferConfig, EventLoopConfig, IoConfig};

struct GroupInner {
    name: String,
    loops: Vec<EventLoopHandle>,
    next: AtomicUsize,
}

/// 事件循环组，可克隆共享
#[derive(Clone)]
pub struct EventLoopGroup {
    inner: Arc<GroupInner>,
}

impl EventLoopGroup {
    /// 按 `config.event_loop.threads` 启动事件循环
    pub fn new(name: &str, config: &IoConfig) -> Result<Self, IoLoopError> {
        Self::with_threads(
            name,
            config.event_loop.threads,
            &config.event_loop,
            &config.buffer,
        )
    }

    /// 启动 `threads` 个事件循环，线程名为 `{name}-{index}`
    ///
    /// 任一循环启动失败时停止已启动的循环并返回错误。
    pub fn with_threads(
        name: &str,
        threads: usize,
        event_loop: &EventLoopConfig,
        buffer: &BufferConfig,
    ) -> Result<Self, IoLoopError> {
        let threads = threads.max(1);
        let config = Arc::new(event_loop.clone());
        let mut loops = Vec::with_capacity(threads);
        for index in 0..threads {
            let loop_name = format!("{}-{}", name, index);
            match EventLoop::spawn(loop_name, index, Arc::clone(&config), buffer) {
                Ok(handle) => loops.push(handle),
                Err(e) => {
                    error!("启动事件循环 {}-{} 失败: {}", name, index, e);
                    for l in &loops {
                        l.shutdown();
                    }
                    for l in &loops {
                        l.join();
                    }
                    return Err(e);
                }
            }
        }
        info!("事件循环组 {} 已启动 {} 个线程", name, threads);
        Ok(Self {
            inner: Arc::new(GroupInner {
                name: name.to_string(),
                loops,
                next: AtomicUsize::new(0),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// 轮询选择下一个事件循环
    pub fn next(&self) -> &EventLoopHandle {
        let n = self.inner.next.fetch_add(1, Ordering::Relaxed);
        &self.inner.loops[n % self.inner.loops.len()]
    }

    pub fn loops(&self) -> &[EventLoopHandle] {
        &self.inner.loops
    }

    pub fn len(&self) -> usize {
        self.inner.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.loops.is_empty()
    }

    pub fn shutdown(&self) {
        for l in &self.inner.loops {
            l.shutdown();
        }
    }

    /// 等待所有循环线程退出
    pub fn join(&self) {
        for l in &self.inner.loops {
            l.join();
        }
    }

    /// 各循环的统计快照
    pub fn stats(&self) -> Vec<LoopStatsSnapshot> {
        self.inner
            .loops
            .iter()
            .map(|l| l.stats().snapshot(l.name()))
            .collect()
    }
}
