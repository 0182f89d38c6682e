//! 事件循环模块
//! 单线程反应器：多路复用等待、读写分派、空闲检测、跨线程任务与延时任务

pub mod backend;
pub mod group;
pub mod task;

pub use backend::{Backend, Interest, ReadyEvent};
pub use group::EventLoopGroup;
pub use task::{DelayedTask, Task};

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::{SocketAddr, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::buffer::{Buffer, BufferAllocator};
use crate::common::error::{ConnectionError, IoLoopError, TaskError};
use crate::common::stats::LoopStats;
use crate::config::{BufferConfig, EventLoopConfig};
use crate::connection::connector::{self, PendingConnect};
use crate::connection::{Channel, ChannelContext};
use crate::server::{self, AcceptorRegistration};
use task::DelayedQueue;

/// 停机时最多排空任务队列的轮数，防止任务无限自我提交
const FINAL_DRAIN_ROUNDS: usize = 16;

/// 循环线程与提交者共享的状态
struct LoopShared {
    name: String,
    index: usize,
    config: Arc<EventLoopConfig>,
    backend: Arc<Backend>,
    stats: Arc<LoopStats>,
    tasks: SegQueue<Task>,
    /// 已有唤醒在途，后续提交无需再次唤醒
    wake_pending: AtomicBool,
    /// 已请求停机
    shutdown: AtomicBool,
    /// 已完成最终排空，不再接受任务
    terminated: AtomicBool,
    /// 已通过终止检查、尚未完成入队的提交者数量
    submitting: AtomicUsize,
    thread_id: OnceLock<ThreadId>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// 事件循环句柄，可在任意线程克隆与使用
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<LoopShared>,
}

impl EventLoopHandle {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// 在所属组中的下标
    pub fn index(&self) -> usize {
        self.shared.index
    }

    pub fn config(&self) -> &Arc<EventLoopConfig> {
        &self.shared.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.shared.backend.name()
    }

    pub fn stats(&self) -> &Arc<LoopStats> {
        &self.shared.stats
    }

    /// 当前线程是否就是该事件循环的线程
    pub fn in_event_loop(&self) -> bool {
        self.shared.thread_id.get() == Some(&thread::current().id())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    /// 提交任务，任务按提交顺序在循环线程上执行
    ///
    /// 循环阻塞等待时由第一个提交者负责唤醒，其余提交不再产生系统调用。
    pub fn submit<F>(&self, f: F) -> Result<(), TaskError>
    where
        F: FnOnce(&mut LoopContext) + Send + 'static,
    {
        self.shared.submitting.fetch_add(1, Ordering::SeqCst);
        if self.shared.terminated.load(Ordering::SeqCst) {
            self.shared.submitting.fetch_sub(1, Ordering::SeqCst);
            return Err(TaskError::Rejected);
        }
        self.shared.tasks.push(Box::new(f));
        self.shared.submitting.fetch_sub(1, Ordering::SeqCst);
        if !self.in_event_loop() && !self.shared.wake_pending.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.shared.backend.wake() {
                error!("唤醒事件循环 {} 失败: {}", self.name(), e);
            }
        }
        Ok(())
    }

    /// 延时执行任务，返回可取消的句柄
    pub fn schedule<F>(&self, delay: Duration, f: F) -> Result<DelayedTask, TaskError>
    where
        F: FnOnce(&mut LoopContext) + Send + 'static,
    {
        let handle = DelayedTask::new(Instant::now() + delay);
        let queued = handle.clone();
        self.submit(move |ctx| ctx.delayed.push(&queued, Box::new(f)))?;
        Ok(handle)
    }

    /// 请求停机；循环会在当前迭代结束后排空队列并关闭所有通道
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("请求停止事件循环 {}", self.name());
        if let Err(e) = self.shared.backend.wake() {
            error!("唤醒事件循环 {} 失败: {}", self.name(), e);
        }
    }

    /// 等待循环线程退出；在循环线程内调用时立即返回
    pub fn join(&self) {
        if self.in_event_loop() {
            return;
        }
        let thread = self.shared.thread.lock().take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                error!("事件循环 {} 线程异常退出", self.name());
            }
        }
    }

    /// 没有线程的句柄，供单元测试构造通道
    #[cfg(test)]
    pub(crate) fn detached(backend: Arc<Backend>, config: Arc<EventLoopConfig>) -> Self {
        Self {
            shared: Arc::new(LoopShared {
                name: "detached".to_string(),
                index: 0,
                config,
                backend,
                stats: Arc::new(LoopStats::new()),
                tasks: SegQueue::new(),
                wake_pending: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                submitting: AtomicUsize::new(0),
                thread_id: OnceLock::new(),
                thread: Mutex::new(None),
            }),
        }
    }
}

impl fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoopHandle")
            .field("name", &self.shared.name)
            .field("backend", &self.backend_name())
            .finish_non_exhaustive()
    }
}

/// 通道使用的循环资源
#[derive(Clone)]
pub(crate) struct LoopResources {
    pub(crate) backend: Arc<Backend>,
    pub(crate) allocator: BufferAllocator,
    pub(crate) stats: Arc<LoopStats>,
    pub(crate) config: Arc<EventLoopConfig>,
    pub(crate) handle: EventLoopHandle,
}

impl LoopResources {
    #[cfg(test)]
    pub(crate) fn detached(config: EventLoopConfig) -> Self {
        let backend = Arc::new(
            Backend::open(crate::config::BackendKind::Portable).expect("portable backend"),
        );
        let config = Arc::new(config);
        let handle = EventLoopHandle::detached(Arc::clone(&backend), Arc::clone(&config));
        Self {
            backend,
            allocator: BufferAllocator::new(&BufferConfig::default()),
            stats: Arc::clone(handle.stats()),
            config,
            handle,
        }
    }
}

/// 事件循环线程的本地状态，显式传给每个任务
pub struct LoopContext {
    pub(crate) res: LoopResources,
    /// 所有读取共用的直接内存读缓冲区
    read_buf: Buffer,
    pub(crate) channels: HashMap<usize, Channel>,
    pub(crate) acceptors: HashMap<usize, AcceptorRegistration>,
    pub(crate) connecting: HashMap<usize, PendingConnect>,
    delayed: DelayedQueue,
    attributes: HashMap<String, Box<dyn Any + Send>>,
    last_idle: Instant,
}

impl LoopContext {
    fn new(res: LoopResources, read_buffer_size: usize) -> Self {
        Self {
            res,
            read_buf: Buffer::direct(read_buffer_size),
            channels: HashMap::new(),
            acceptors: HashMap::new(),
            connecting: HashMap::new(),
            delayed: DelayedQueue::default(),
            attributes: HashMap::new(),
            last_idle: Instant::now(),
        }
    }

    pub fn handle(&self) -> &EventLoopHandle {
        &self.res.handle
    }

    pub fn config(&self) -> &EventLoopConfig {
        &self.res.config
    }

    pub fn allocator(&self) -> &BufferAllocator {
        &self.res.allocator
    }

    pub fn stats(&self) -> &Arc<LoopStats> {
        &self.res.stats
    }

    /// 当前持有的已打开通道数
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, token: usize) -> Option<&Channel> {
        self.channels.get(&token)
    }

    /// 所有通道的句柄
    pub fn channel_handles(&self) -> Vec<crate::connection::ChannelHandle> {
        self.channels.values().map(Channel::handle).collect()
    }

    /// 在通道上执行操作；令牌已被其他通道复用时不执行。操作后关闭的通道会被移除
    pub fn with_channel<R>(
        &mut self,
        token: usize,
        id: u64,
        f: impl FnOnce(&mut Channel) -> R,
    ) -> Option<R> {
        let ch = self.channels.get_mut(&token).filter(|c| c.id() == id)?;
        let r = f(ch);
        self.reap(token);
        Some(r)
    }

    /// 注册一个已连接的套接字并打开通道
    pub fn register_channel(
        &mut self,
        stream: TcpStream,
        remote: SocketAddr,
        context: Arc<ChannelContext>,
    ) -> Result<&mut Channel, ConnectionError> {
        let limit = self.res.config.channel_size_limit;
        if self.channels.len() + self.connecting.len() >= limit {
            return Err(ConnectionError::ChannelLimitExceeded(limit));
        }
        let mut ch = Channel::new(stream, remote, context, self.res.clone());
        self.res
            .backend
            .register(ch.fd(), ch.token(), Interest::READABLE)
            .map_err(ConnectionError::Registration)?;
        ch.open();
        Ok(self.channels.entry(ch.token()).or_insert(ch))
    }

    /// 移除已关闭的通道
    pub(crate) fn reap(&mut self, token: usize) {
        if self.channels.get(&token).is_some_and(Channel::is_closed) {
            self.channels.remove(&token);
        }
    }

    /// 在本循环上延时执行任务
    pub fn schedule<F>(&mut self, delay: Duration, f: F) -> DelayedTask
    where
        F: FnOnce(&mut LoopContext) + Send + 'static,
    {
        let handle = DelayedTask::new(Instant::now() + delay);
        self.delayed.push(&handle, Box::new(f));
        handle
    }

    // ---- 循环本地属性 ----

    /// 设置属性，返回旧值
    pub fn set_attribute<T: Any + Send>(
        &mut self,
        key: impl Into<String>,
        value: T,
    ) -> Option<Box<dyn Any + Send>> {
        self.attributes.insert(key.into(), Box::new(value))
    }

    pub fn attribute<T: Any>(&self, key: &str) -> Option<&T> {
        self.attributes.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    pub fn attribute_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.attributes.get_mut(key).and_then(|v| v.downcast_mut::<T>())
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<Box<dyn Any + Send>> {
        self.attributes.remove(key)
    }

    pub fn clear_attributes(&mut self) {
        self.attributes.clear();
    }

    // ---- 循环主体 ----

    fn run(mut self) {
        let name = self.res.handle.name().to_string();
        info!("事件循环 {} 启动，后端 {}", name, self.res.backend.name());
        let idle = self.res.config.idle_time();
        let mut next_idle = Instant::now() + idle;
        let mut events = Vec::with_capacity(256);

        while !self.res.handle.is_shutdown() {
            let now = Instant::now();
            let mut timeout = next_idle.saturating_duration_since(now);
            if let Some(deadline) = self.delayed.next_deadline() {
                timeout = timeout.min(deadline.saturating_duration_since(now));
            }
            if !self.res.handle.shared.tasks.is_empty() {
                timeout = Duration::ZERO;
            }

            events.clear();
            if let Err(e) = self.res.backend.wait(&mut events, Some(timeout)) {
                error!("事件循环 {} {}", name, e);
            }
            self.res.handle.shared.wake_pending.store(false, Ordering::Release);
            self.res.stats.wakeup();

            self.process_events(&events);

            let now = Instant::now();
            if now >= next_idle {
                self.idle_cycle(now);
                next_idle = now + idle;
            }
            self.run_tasks();
            self.run_delayed();
        }

        self.stop();
        info!("事件循环 {} 已停止", name);
    }

    fn process_events(&mut self, events: &[ReadyEvent]) {
        let read_first = self.res.config.channel_read_first;
        for ev in events {
            let token = ev.token;
            if self.acceptors.contains_key(&token) {
                server::accept_ready(self, token);
                continue;
            }
            if self.connecting.contains_key(&token) {
                connector::connect_ready(self, token);
                continue;
            }
            let Some(ch) = self.channels.get_mut(&token) else {
                trace!("忽略未知令牌 {}", token);
                continue;
            };
            if read_first {
                if ev.readable {
                    ch.handle_readable(&mut self.read_buf);
                }
                if ev.writable {
                    ch.handle_writable();
                }
            } else {
                if ev.writable {
                    ch.handle_writable();
                }
                if ev.readable {
                    ch.handle_readable(&mut self.read_buf);
                }
            }
            if ch.is_closed() {
                self.channels.remove(&token);
            }
        }
    }

    fn idle_cycle(&mut self, now: Instant) {
        let last_idle = self.last_idle;
        for ch in self.channels.values_mut() {
            let context = Arc::clone(ch.context());
            context.handler().on_idle(ch, last_idle, now);
            if ch.is_closed() {
                self.res.stats.idle_close();
            }
        }
        self.channels.retain(|_, ch| !ch.is_closed());
        self.last_idle = now;
    }

    fn run_task(&mut self, task: Task) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| task(self)));
        self.res.stats.task_run();
        if let Err(payload) = result {
            self.res.stats.task_failed();
            error!(
                "事件循环 {} {}",
                self.res.handle.name(),
                TaskError::from_panic(payload)
            );
        }
    }

    /// 执行本轮开始时已在队列中的任务，新提交的留到下一轮
    fn run_tasks(&mut self) -> usize {
        let n = self.res.handle.shared.tasks.len();
        let mut ran = 0;
        for _ in 0..n {
            let Some(task) = self.res.handle.shared.tasks.pop() else {
                break;
            };
            self.run_task(task);
            ran += 1;
        }
        ran
    }

    fn run_delayed(&mut self) -> usize {
        let now = Instant::now();
        let mut ran = 0;
        while let Some(task) = self.delayed.pop_due(now) {
            self.run_task(task);
            ran += 1;
        }
        ran
    }

    /// 停机：排空两个队列，关闭所有通道与监听，释放读缓冲区
    fn stop(&mut self) {
        connector::fail_all(self);

        for _ in 0..FINAL_DRAIN_ROUNDS {
            let mut ran = self.run_tasks();
            while let Some(task) = self.delayed.pop_any() {
                self.run_task(task);
                ran += 1;
            }
            if ran == 0 {
                break;
            }
        }
        let shared = Arc::clone(&self.res.handle.shared);
        shared.terminated.store(true, Ordering::SeqCst);
        // 等待已通过终止检查的提交者完成入队，之后队列不会再增长
        while shared.submitting.load(Ordering::SeqCst) > 0 {
            thread::yield_now();
        }
        while let Some(task) = shared.tasks.pop() {
            self.run_task(task);
        }
        while let Some(task) = self.delayed.pop_any() {
            self.run_task(task);
        }
        if !self.delayed.is_empty() {
            debug!("丢弃 {} 个停机后提交的延时任务", self.delayed.len());
        }
        connector::fail_all(self);

        let channels: Vec<Channel> = self.channels.drain().map(|(_, ch)| ch).collect();
        for mut ch in channels {
            ch.close();
        }
        for token in self.acceptors.keys().copied().collect::<Vec<_>>() {
            server::unregister(self, token);
        }
        if let Err(e) = self.read_buf.release() {
            debug!("释放读缓冲区失败: {}", e);
        }
    }
}

/// 事件循环构造器
pub struct EventLoop;

impl EventLoop {
    /// 创建后端并启动名为 `name` 的循环线程
    ///
    /// 后端句柄无法创建时返回错误，这是启动阶段唯一的致命错误。
    pub fn spawn(
        name: impl Into<String>,
        index: usize,
        config: Arc<EventLoopConfig>,
        buffer: &BufferConfig,
    ) -> Result<EventLoopHandle, IoLoopError> {
        let name = name.into();
        let backend = Arc::new(Backend::open(config.backend)?);
        let shared = Arc::new(LoopShared {
            name: name.clone(),
            index,
            config: Arc::clone(&config),
            backend: Arc::clone(&backend),
            stats: Arc::new(LoopStats::new()),
            tasks: SegQueue::new(),
            wake_pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            submitting: AtomicUsize::new(0),
            thread_id: OnceLock::new(),
            thread: Mutex::new(None),
        });
        let handle = EventLoopHandle { shared };
        let res = LoopResources {
            backend,
            allocator: BufferAllocator::new(buffer),
            stats: Arc::clone(handle.stats()),
            config,
            handle: handle.clone(),
        };
        let read_buffer_size = buffer.read_buffer_size;

        let thread = thread::Builder::new().name(name).spawn(move || {
            let _ = res.handle.shared.thread_id.set(thread::current().id());
            LoopContext::new(res, read_buffer_size).run();
        })?;
        *handle.shared.thread.lock() = Some(thread);
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use std::sync::mpsc;

    fn spawn(backend: BackendKind) -> EventLoopHandle {
        let config = EventLoopConfig {
            backend,
            idle_time_ms: 50,
            ..EventLoopConfig::default()
        };
        EventLoop::spawn("test-0", 0, Arc::new(config), &BufferConfig::default()).unwrap()
    }

    #[test]
    fn test_tasks_run_in_order_on_loop_thread() {
        for kind in [BackendKind::Native, BackendKind::Portable] {
            let el = spawn(kind);
            assert!(!el.in_event_loop());
            let (tx, rx) = mpsc::channel();
            for i in 0..100 {
                let tx = tx.clone();
                el.submit(move |ctx| {
                    tx.send((i, ctx.handle().in_event_loop())).unwrap();
                })
                .unwrap();
            }
            let got: Vec<(i32, bool)> = (0..100).map(|_| rx.recv().unwrap()).collect();
            assert!(got.iter().all(|(_, on_loop)| *on_loop));
            assert_eq!(
                got.iter().map(|(i, _)| *i).collect::<Vec<_>>(),
                (0..100).collect::<Vec<_>>()
            );
            el.shutdown();
            el.join();
        }
    }

    #[test]
    fn test_wake_is_coalesced() {
        let el = spawn(BackendKind::Portable);
        // 阻塞循环，使后续提交都在同一个唤醒窗口内
        let (block_tx, block_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel();
        el.submit(move |_| {
            started_tx.send(()).unwrap();
            block_rx.recv().unwrap();
        })
        .unwrap();
        started_rx.recv().unwrap();
        el.shared.wake_pending.store(false, Ordering::Release);
        for _ in 0..50 {
            el.submit(|_| {}).unwrap();
        }
        assert!(el.shared.wake_pending.load(Ordering::Acquire));
        block_tx.send(()).unwrap();

        let (tx, rx) = mpsc::channel();
        el.submit(move |ctx| tx.send(ctx.stats().snapshot("t").tasks_run).unwrap())
            .unwrap();
        assert!(rx.recv().unwrap() >= 51);
        el.shutdown();
        el.join();
    }

    #[test]
    fn test_delayed_tasks_ordered_and_cancelable() {
        let el = spawn(BackendKind::Native);
        let (tx, rx) = mpsc::channel();
        let t1 = tx.clone();
        el.schedule(Duration::from_millis(60), move |_| t1.send(2).unwrap())
            .unwrap();
        let t2 = tx.clone();
        el.schedule(Duration::from_millis(20), move |_| t2.send(1).unwrap())
            .unwrap();
        let t3 = tx.clone();
        let canceled = el
            .schedule(Duration::from_millis(40), move |_| t3.send(99).unwrap())
            .unwrap();
        canceled.cancel();

        let start = Instant::now();
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        el.shutdown();
        el.join();
    }

    #[test]
    fn test_panicking_task_does_not_stop_loop() {
        let el = spawn(BackendKind::Auto);
        el.submit(|_| panic!("boom")).unwrap();
        let (tx, rx) = mpsc::channel();
        el.submit(move |ctx| tx.send(ctx.stats().snapshot("t").task_failures).unwrap())
            .unwrap();
        assert_eq!(rx.recv().unwrap(), 1);
        el.shutdown();
        el.join();
    }

    #[test]
    fn test_attributes_are_loop_local() {
        let el = spawn(BackendKind::Auto);
        let (tx, rx) = mpsc::channel();
        el.submit(|ctx| {
            ctx.set_attribute("counter", 1u32);
        })
        .unwrap();
        el.submit(move |ctx| {
            *ctx.attribute_mut::<u32>("counter").unwrap() += 1;
            let wrong_type = ctx.attribute::<String>("counter").is_none();
            let value = *ctx.attribute::<u32>("counter").unwrap();
            ctx.remove_attribute("counter");
            tx.send((value, wrong_type, ctx.attribute::<u32>("counter").is_none()))
                .unwrap();
        })
        .unwrap();
        assert_eq!(rx.recv().unwrap(), (2, true, true));
        el.shutdown();
        el.join();
    }

    #[test]
    fn test_shutdown_drains_then_rejects() {
        let el = spawn(BackendKind::Auto);
        let (tx, rx) = mpsc::channel();
        let delayed_tx = tx.clone();
        el.schedule(Duration::from_secs(3600), move |_| {
            delayed_tx.send("delayed").unwrap()
        })
        .unwrap();
        // 确保延时任务已入堆
        let (sync_tx, sync_rx) = mpsc::channel();
        el.submit(move |_| sync_tx.send(()).unwrap()).unwrap();
        sync_rx.recv().unwrap();

        el.submit(move |_| tx.send("task").unwrap()).unwrap();
        el.shutdown();
        el.join();

        let mut got: Vec<&str> = rx.try_iter().collect();
        got.sort_unstable();
        assert_eq!(got, vec!["delayed", "task"]);
        assert!(el.is_terminated());
        assert!(matches!(el.submit(|_| {}), Err(TaskError::Rejected)));
    }

    #[test]
    fn test_accepted_submits_run_when_racing_shutdown() {
        for _ in 0..20 {
            let el = spawn(BackendKind::Auto);
            let executed = Arc::new(AtomicUsize::new(0));
            let submitters: Vec<_> = (0..4)
                .map(|_| {
                    let el = el.clone();
                    let executed = Arc::clone(&executed);
                    thread::spawn(move || {
                        let mut accepted = 0;
                        for _ in 0..500 {
                            let executed = Arc::clone(&executed);
                            match el.submit(move |_| {
                                executed.fetch_add(1, Ordering::SeqCst);
                            }) {
                                Ok(()) => accepted += 1,
                                Err(TaskError::Rejected) => break,
                                Err(e) => panic!("unexpected {}", e),
                            }
                        }
                        accepted
                    })
                })
                .collect();
            thread::sleep(Duration::from_micros(200));
            el.shutdown();
            let accepted: usize = submitters.into_iter().map(|t| t.join().unwrap()).sum();
            el.join();
            assert_eq!(executed.load(Ordering::SeqCst), accepted);
        }
    }
}
