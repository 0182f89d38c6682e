//! 通道状态机
//! 封装单个套接字：读取解码、写队列聚合写出、打开/关闭生命周期

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use super::context::ChannelContext;
use crate::buffer::buf::ReadableGuard;
use crate::buffer::{Buffer, BufferAllocator};
use crate::codec::{Codec, Frame, FrameKind};
use crate::common::error::{BufferError, ConnectionError, TaskError};
use crate::event_loop::backend::Interest;
use crate::event_loop::{EventLoopHandle, LoopResources};

/// 单次聚合写出的缓冲区数量上限，`write_buffers` 超过时按此截断
const MAX_IOV: usize = 64;

/// 全局通道ID
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// 等待连接完成（仅主动连接的通道）
    Connecting,
    /// 已打开
    Open,
    /// 正在关闭
    Closing,
    /// 已关闭（终态）
    Closed,
}

/// 单个连接在其事件循环上的表示
pub struct Channel {
    /// 通道ID，全局唯一
    id: u64,
    /// 后端令牌
    token: usize,
    stream: TcpStream,
    state: ChannelState,
    context: Arc<ChannelContext>,
    res: LoopResources,
    local_addr: Option<SocketAddr>,
    remote_addr: SocketAddr,
    /// 未能组成完整帧的剩余字节（读模式）
    remainder: Option<Buffer>,
    /// 待写出的缓冲区，先进先出
    write_queue: VecDeque<Buffer>,
    /// 是否已向后端登记可写关注
    writable_armed: bool,
    /// 最后一次读到数据的时间
    last_access: Instant,
    /// 上一个空闲周期内是否已发送过心跳
    missed_idle: bool,
    /// 是否曾经打开过
    opened: bool,
}

impl Channel {
    pub(crate) fn new(
        stream: TcpStream,
        remote_addr: SocketAddr,
        context: Arc<ChannelContext>,
        res: LoopResources,
    ) -> Self {
        Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            token: stream.as_raw_fd() as usize,
            local_addr: stream.local_addr().ok(),
            stream,
            state: ChannelState::Connecting,
            context,
            res,
            remote_addr,
            remainder: None,
            write_queue: VecDeque::new(),
            writable_armed: false,
            last_access: Instant::now(),
            missed_idle: false,
            opened: false,
        }
    }

    // ---- 属性 ----

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> usize {
        self.token
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    pub fn context(&self) -> &Arc<ChannelContext> {
        &self.context
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        self.context.codec()
    }

    /// 所属事件循环的分配器
    pub fn allocator(&self) -> &BufferAllocator {
        &self.res.allocator
    }

    pub fn event_loop(&self) -> &EventLoopHandle {
        &self.res.handle
    }

    /// 可跨线程使用的通道句柄
    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            id: self.id,
            token: self.token,
            event_loop: self.res.handle.clone(),
        }
    }

    pub fn write_queue_len(&self) -> usize {
        self.write_queue.len()
    }

    pub(crate) fn missed_idle(&self) -> bool {
        self.missed_idle
    }

    pub(crate) fn set_missed_idle(&mut self, missed: bool) {
        self.missed_idle = missed;
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    #[cfg(test)]
    pub(crate) fn set_last_access(&mut self, at: Instant) {
        self.last_access = at;
    }

    // ---- 生命周期 ----

    /// 进入打开状态并触发 `on_open`
    pub(crate) fn open(&mut self) {
        if self.state != ChannelState::Connecting {
            return;
        }
        self.state = ChannelState::Open;
        self.opened = true;
        self.last_access = Instant::now();
        self.res.stats.channel_opened();
        debug!("通道打开 {}", self);
        let context = Arc::clone(&self.context);
        context.handler().on_open(self);
    }

    /// 检查非阻塞连接的结果；返回 `true` 表示已连接
    pub(crate) fn finish_connect(&mut self) -> Result<bool, ConnectionError> {
        let failed = |source| ConnectionError::ConnectFailed {
            addr: self.remote_addr,
            source,
        };
        if let Some(e) = self.stream.take_error().map_err(failed)? {
            return Err(failed(e));
        }
        match self.stream.peer_addr() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(false),
            Err(e) => return Err(failed(e)),
        }
        self.local_addr = self.stream.local_addr().ok();
        self.res
            .backend
            .reregister(self.fd(), self.token, Interest::READABLE)
            .map_err(ConnectionError::Registration)?;
        Ok(true)
    }

    /// 关闭通道：释放队列中的缓冲区、注销后端、触发一次 `on_close`
    ///
    /// 重复调用无效果；关闭后的通道不会再次打开。
    pub fn close(&mut self) {
        if matches!(self.state, ChannelState::Closing | ChannelState::Closed) {
            return;
        }
        self.state = ChannelState::Closing;
        let dropped = self.write_queue.len();
        self.write_queue.clear();
        self.remainder = None;
        if let Err(e) = self.res.backend.deregister(self.fd()) {
            debug!("注销通道 {} 失败: {}", self, e);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.state = ChannelState::Closed;
        debug!("通道关闭 {}，丢弃 {} 个待写缓冲区", self, dropped);

        if self.opened {
            self.res.stats.channel_closed();
            let context = Arc::clone(&self.context);
            context.handler().on_close(self);
        }
    }

    /// 把错误交给处理器后关闭
    pub(crate) fn close_with_error(&mut self, err: &ConnectionError) {
        if self.is_open() {
            let context = Arc::clone(&self.context);
            context.handler().on_error(self, err);
        }
        self.close();
    }

    // ---- 读路径 ----

    /// 读就绪：读入循环共享的读缓冲区并逐帧解码
    pub(crate) fn handle_readable(&mut self, read_buf: &mut Buffer) {
        if !self.is_open() {
            return;
        }
        read_buf.clear();
        let n = match read_buf.read_from(&mut self.stream) {
            Ok(0) => {
                trace!("对端关闭 {}", self);
                self.close();
                return;
            }
            Ok(n) => n,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                return
            }
            Err(e) => {
                self.close_with_error(&e.into());
                return;
            }
        };
        self.res.stats.add_read(n);
        self.last_access = Instant::now();
        read_buf.flip();
        if let Err(e) = self.accept_bytes(read_buf) {
            self.close_with_error(&e);
        }
    }

    /// 把新读到的字节与上次剩余的字节合并后解码
    pub(crate) fn accept_bytes(&mut self, input: &mut Buffer) -> Result<(), ConnectionError> {
        match self.remainder.take() {
            Some(rem) => {
                let mut rem = self.append(rem, input)?;
                let res = self.decode_frames(&mut rem);
                if self.is_open() && rem.has_remaining() {
                    self.remainder = Some(rem);
                }
                res
            }
            None => {
                self.decode_frames(input)?;
                if self.is_open() && input.has_remaining() {
                    let mut rem = self.res.allocator.allocate(input.remaining());
                    rem.put_buffer(input)?;
                    rem.flip();
                    self.remainder = Some(rem);
                }
                Ok(())
            }
        }
    }

    fn append(&self, mut rem: Buffer, input: &mut Buffer) -> Result<Buffer, BufferError> {
        rem.compact()?;
        if rem.remaining() < input.remaining() {
            let need = rem.position() + input.remaining();
            let mut bigger = self.res.allocator.allocate(need.max(rem.capacity() * 2));
            rem.flip();
            bigger.put_buffer(&mut rem)?;
            rem.release()?;
            rem = bigger;
        }
        rem.put_buffer(input)?;
        rem.flip();
        Ok(rem)
    }

    fn decode_frames(&mut self, src: &mut Buffer) -> Result<(), ConnectionError> {
        let context = Arc::clone(&self.context);
        let codec = context.codec();
        let header = codec.header_length();
        while self.is_open() && src.has_remaining() && src.remaining() >= header {
            match codec.decode(self, src)? {
                Some(frame) => {
                    self.res.stats.frame_decoded();
                    self.dispatch(&context, frame);
                }
                None => break,
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, context: &ChannelContext, frame: Frame) {
        match frame.kind() {
            FrameKind::Ping => {
                if let Some(pong) = context.codec().pong(self, frame) {
                    if let Err(e) = self.write_and_flush(pong) {
                        debug!("回复心跳失败 {}: {}", self, e);
                    }
                }
            }
            FrameKind::Pong => trace!("收到心跳响应 {}", self),
            FrameKind::Data => context.handler().on_frame(self, frame),
        }
    }

    // ---- 写路径 ----

    /// 编码并写出一个帧
    pub fn write_and_flush(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        if !self.is_open() {
            return Err(ConnectionError::Closed);
        }
        let context = Arc::clone(&self.context);
        let buf = context.codec().encode(self, &frame)?;
        self.write_buffer(buf)
    }

    /// 把已编码的缓冲区放入写队列并尽量立即写出
    ///
    /// 写队列达到上限时拒绝并释放该缓冲区。
    pub fn write_buffer(&mut self, buf: Buffer) -> Result<(), ConnectionError> {
        if !self.is_open() {
            drop(buf);
            return Err(ConnectionError::Closed);
        }
        let cap = self.res.config.max_write_queue;
        if cap > 0 && self.write_queue.len() >= cap {
            drop(buf);
            return Err(ConnectionError::WriteQueueFull(cap));
        }
        self.write_queue.push_back(buf);
        if self.writable_armed {
            // 等待可写事件
            return Ok(());
        }
        self.flush()
    }

    /// 写就绪
    pub(crate) fn handle_writable(&mut self) {
        if !self.is_open() {
            return;
        }
        if let Err(e) = self.flush() {
            trace!("写出失败 {}: {}", self, e);
        }
    }

    fn flush(&mut self) -> Result<(), ConnectionError> {
        let res = self.write_queued().and_then(|_| self.update_interest());
        if let Err(e) = &res {
            self.close_with_error(e);
        }
        res
    }

    fn write_queued(&mut self) -> Result<(), ConnectionError> {
        let max = self.res.config.write_buffers.clamp(1, MAX_IOV);
        loop {
            while self.write_queue.front().is_some_and(|b| !b.has_remaining()) {
                self.write_queue.pop_front();
            }
            if self.write_queue.is_empty() {
                return Ok(());
            }
            let written = {
                let count = self.write_queue.len().min(max);
                let mut guards: [Option<ReadableGuard<'_>>; MAX_IOV] =
                    std::array::from_fn(|_| None);
                for (slot, buf) in guards.iter_mut().zip(self.write_queue.iter().take(count)) {
                    *slot = Some(buf.readable()?);
                }
                let mut slices = [IoSlice::new(&[]); MAX_IOV];
                for (slot, guard) in slices.iter_mut().zip(guards.iter().flatten()) {
                    *slot = IoSlice::new(guard.as_slice());
                }
                (&self.stream).write_vectored(&slices[..count])
            };
            match written {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.res.stats.add_written(n);
                    self.advance_queue(n)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn advance_queue(&mut self, mut written: usize) -> Result<(), BufferError> {
        while written > 0 {
            let Some(front) = self.write_queue.front_mut() else {
                break;
            };
            let n = written.min(front.remaining());
            front.consume(n)?;
            written -= n;
            if !front.has_remaining() {
                self.write_queue.pop_front();
            }
        }
        Ok(())
    }

    /// 写队列非空时登记可写关注，清空后撤销
    fn update_interest(&mut self) -> Result<(), ConnectionError> {
        let want = !self.write_queue.is_empty();
        if want == self.writable_armed {
            return Ok(());
        }
        let interest = if want {
            Interest::BOTH
        } else {
            Interest::READABLE
        };
        self.res
            .backend
            .reregister(self.fd(), self.token, interest)
            .map_err(ConnectionError::Registration)?;
        self.writable_armed = want;
        Ok(())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[id={}, remote={}]", self.id, self.remote_addr)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("token", &self.token)
            .field("state", &self.state)
            .field("remote_addr", &self.remote_addr)
            .field("write_queue", &self.write_queue.len())
            .finish_non_exhaustive()
    }
}

/// 可跨线程传递的通道句柄，所有操作以任务形式提交到通道所属的事件循环
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    id: u64,
    token: usize,
    event_loop: EventLoopHandle,
}

impl ChannelHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event_loop(&self) -> &EventLoopHandle {
        &self.event_loop
    }

    /// 在通道所属线程上操作通道；通道已关闭时不执行
    pub fn execute<F>(&self, f: F) -> Result<(), TaskError>
    where
        F: FnOnce(&mut Channel) + Send + 'static,
    {
        let (token, id) = (self.token, self.id);
        self.event_loop.submit(move |ctx| {
            if ctx.with_channel(token, id, f).is_none() {
                trace!("通道 {} 已不存在", id);
            }
        })
    }

    pub fn write_and_flush(&self, frame: Frame) -> Result<(), TaskError> {
        self.execute(move |ch| {
            if let Err(e) = ch.write_and_flush(frame) {
                debug!("写入通道 {} 失败: {}", ch, e);
            }
        })
    }

    pub fn close(&self) -> Result<(), TaskError> {
        self.execute(|ch| ch.close())
    }
}
