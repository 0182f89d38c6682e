//! 主动连接器
//! 非阻塞连接、可写就绪时确认结果、超时由延时任务触发

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use super::channel::Channel;
use super::context::ChannelContext;
use crate::common::error::ConnectionError;
use crate::event_loop::backend::Interest;
use crate::event_loop::{DelayedTask, EventLoopGroup, LoopContext};

/// 连接完成回调，在通道所属的事件循环线程上调用一次
pub type ConnectCallback = Box<dyn FnOnce(Result<&mut Channel, ConnectionError>) + Send>;

/// 等待连接完成的通道
pub(crate) struct PendingConnect {
    channel: Channel,
    callback: ConnectCallback,
    timer: DelayedTask,
}

/// 主动连接器
pub struct ChannelConnector;

impl ChannelConnector {
    /// 连接 `host:port`，通道分配到 `group` 的下一个事件循环
    ///
    /// 结果只通过 `callback` 送达；`timeout` 为空时使用配置的连接超时。
    pub fn connect<F>(
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        group: &EventLoopGroup,
        context: Arc<ChannelContext>,
        callback: F,
    ) where
        F: FnOnce(Result<&mut Channel, ConnectionError>) + Send + 'static,
    {
        let target = group.next().clone();
        let timeout = timeout.unwrap_or_else(|| target.config().connect_timeout());

        let addr = match resolve(host, port) {
            Ok(addr) => addr,
            Err(e) => return callback(Err(e)),
        };
        let stream = match start_connect(addr) {
            Ok(stream) => stream,
            Err(source) => return callback(Err(ConnectionError::ConnectFailed { addr, source })),
        };
        debug!("发起连接 {} -> {}", addr, target.name());

        // 提交被拒绝时回调仍需送达
        let slot: Arc<Mutex<Option<ConnectCallback>>> =
            Arc::new(Mutex::new(Some(Box::new(callback))));
        let task_slot = Arc::clone(&slot);
        let submitted = target.submit(move |ctx| {
            if let Some(callback) = task_slot.lock().take() {
                begin(ctx, stream, addr, context, timeout, callback);
            }
        });
        if submitted.is_err() {
            if let Some(callback) = slot.lock().take() {
                callback(Err(ConnectionError::LoopStopped));
            }
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, ConnectionError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|e| ConnectionError::Resolve(format!("{}:{}: {}", host, port, e)))?
        .next()
        .ok_or_else(|| ConnectionError::Resolve(format!("{}:{}", host, port)))
}

fn start_connect(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }
    Ok(socket.into())
}

/// 在循环线程上登记可写关注并启动超时
fn begin(
    ctx: &mut LoopContext,
    stream: TcpStream,
    addr: SocketAddr,
    context: Arc<ChannelContext>,
    timeout: Duration,
    callback: ConnectCallback,
) {
    let limit = ctx.res.config.channel_size_limit;
    if ctx.channels.len() + ctx.connecting.len() >= limit {
        return callback(Err(ConnectionError::ChannelLimitExceeded(limit)));
    }
    let channel = Channel::new(stream, addr, context, ctx.res.clone());
    if let Err(e) = ctx
        .res
        .backend
        .register(channel.fd(), channel.token(), Interest::WRITABLE)
    {
        return callback(Err(ConnectionError::Registration(e)));
    }
    let (token, id) = (channel.token(), channel.id());
    let timer = ctx.schedule(timeout, move |ctx| expire(ctx, token, id, addr, timeout));
    ctx.connecting.insert(
        token,
        PendingConnect {
            channel,
            callback,
            timer,
        },
    );
}

/// 可写就绪：确认连接结果
pub(crate) fn connect_ready(ctx: &mut LoopContext, token: usize) {
    let Some(pending) = ctx.connecting.get_mut(&token) else {
        return;
    };
    let result = pending.channel.finish_connect();
    if let Ok(false) = result {
        return;
    }
    let Some(PendingConnect {
        mut channel,
        callback,
        timer,
    }) = ctx.connecting.remove(&token)
    else {
        return;
    };
    timer.cancel();
    match result {
        Ok(_) => {
            channel.open();
            let ch = ctx.channels.entry(token).or_insert(channel);
            callback(Ok(ch));
            ctx.reap(token);
        }
        Err(e) => {
            warn!("{}", e);
            channel.close();
            callback(Err(e));
        }
    }
}

fn expire(ctx: &mut LoopContext, token: usize, id: u64, addr: SocketAddr, timeout: Duration) {
    if !ctx
        .connecting
        .get(&token)
        .is_some_and(|p| p.channel.id() == id)
    {
        return;
    }
    if let Some(mut pending) = ctx.connecting.remove(&token) {
        warn!("连接 {} 超时", addr);
        pending.channel.close();
        (pending.callback)(Err(ConnectionError::ConnectTimeout { addr, timeout }));
    }
}

/// 事件循环停止时让所有未完成的连接以 `LoopStopped` 结束
pub(crate) fn fail_all(ctx: &mut LoopContext) {
    let pending: Vec<PendingConnect> = ctx.connecting.drain().map(|(_, p)| p).collect();
    for mut p in pending {
        p.timer.cancel();
        p.channel.close();
        (p.callback)(Err(ConnectionError::LoopStopped));
    }
}
