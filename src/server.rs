//! 接入器模块
//! 绑定监听套接字，接受连接并按轮询分配到工作事件循环

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::mpsc;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, trace, warn};

use crate::common::error::{ConnectionError, IoLoopError, TaskError};
use crate::common::stats::LoopStatsSnapshot;
use crate::config::IoConfig;
use crate::connection::{Channel, ChannelContext};
use crate::event_loop::backend::Interest;
use crate::event_loop::{EventLoopGroup, EventLoopHandle, LoopContext};

/// 监听队列长度
const BACKLOG: i32 = 1024;

/// 每个接入连接的完成回调，在目标工作循环线程上调用
pub type AcceptCallback = Arc<dyn Fn(Result<&mut Channel, ConnectionError>) + Send + Sync>;

/// 注册在接入循环上的监听器
pub(crate) struct AcceptorRegistration {
    listener: TcpListener,
    workers: EventLoopGroup,
    context: Arc<ChannelContext>,
    callback: AcceptCallback,
}

/// 已绑定的接入器
pub struct ChannelAcceptor {
    local_addr: SocketAddr,
    token: usize,
    boss: EventLoopHandle,
}

impl ChannelAcceptor {
    /// 绑定 `addr` 并注册到 `boss` 组的一个事件循环
    pub fn bind(
        addr: SocketAddr,
        boss: &EventLoopGroup,
        workers: &EventLoopGroup,
        context: Arc<ChannelContext>,
    ) -> Result<Self, IoLoopError> {
        Self::bind_with_callback(
            addr,
            boss,
            workers,
            context,
            Arc::new(|r: Result<&mut Channel, ConnectionError>| match r {
                Ok(ch) => trace!("接入 {}", ch),
                Err(e) => warn!("接入失败: {}", e),
            }),
        )
    }

    /// 同 [`bind`](Self::bind)，每个接入连接的结果交给 `callback`
    pub fn bind_with_callback(
        addr: SocketAddr,
        boss: &EventLoopGroup,
        workers: &EventLoopGroup,
        context: Arc<ChannelContext>,
        callback: AcceptCallback,
    ) -> Result<Self, IoLoopError> {
        let listener = listen(addr)?;
        let local_addr = listener.local_addr()?;
        let token = listener.as_raw_fd() as usize;
        let boss = boss.next().clone();
        if boss.in_event_loop() {
            return Err(ConnectionError::Registration(io::Error::new(
                io::ErrorKind::Other,
                "不能在接入循环线程上同步绑定",
            ))
            .into());
        }

        let registration = AcceptorRegistration {
            listener,
            workers: workers.clone(),
            context,
            callback,
        };
        let (tx, rx) = mpsc::channel();
        boss.submit(move |ctx| {
            let _ = tx.send(register(ctx, registration));
        })?;
        rx.recv().map_err(|_| ConnectionError::LoopStopped)??;

        info!("开始监听 {} ({})", local_addr, boss.name());
        Ok(Self {
            local_addr,
            token,
            boss,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 停止监听并关闭监听套接字
    pub fn unbind(&self) -> Result<(), TaskError> {
        let token = self.token;
        let addr = self.local_addr;
        self.boss.submit(move |ctx| {
            unregister(ctx, token);
            info!("停止监听 {}", addr);
        })
    }
}

/// 服务器：一个接入循环、`threads` 个工作循环与一个接入器
pub struct IoServer {
    boss: EventLoopGroup,
    workers: EventLoopGroup,
    acceptor: ChannelAcceptor,
}

impl IoServer {
    /// 按配置启动事件循环组并开始监听 `config.bind_addr`
    pub fn start(config: &IoConfig, context: Arc<ChannelContext>) -> Result<Self, IoLoopError> {
        config.validate()?;
        let boss = EventLoopGroup::with_threads("boss", 1, &config.event_loop, &config.buffer)?;
        let workers = match EventLoopGroup::new("worker", config) {
            Ok(workers) => workers,
            Err(e) => {
                boss.shutdown();
                boss.join();
                return Err(e);
            }
        };
        match ChannelAcceptor::bind(config.bind_addr, &boss, &workers, context) {
            Ok(acceptor) => Ok(Self {
                boss,
                workers,
                acceptor,
            }),
            Err(e) => {
                for group in [&boss, &workers] {
                    group.shutdown();
                    group.join();
                }
                Err(e)
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn workers(&self) -> &EventLoopGroup {
        &self.workers
    }

    /// 接入循环与工作循环的统计快照
    pub fn stats(&self) -> Vec<LoopStatsSnapshot> {
        let mut stats = self.boss.stats();
        stats.extend(self.workers.stats());
        stats
    }

    /// 停止监听并关闭所有事件循环
    pub fn shutdown(&self) {
        info!("服务器正在关闭...");
        if let Err(e) = self.acceptor.unbind() {
            debug!("停止监听失败: {}", e);
        }
        for group in [&self.boss, &self.workers] {
            group.shutdown();
        }
        for group in [&self.boss, &self.workers] {
            group.join();
        }
        info!("所有事件循环已停止");
    }
}

fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

fn register(
    ctx: &mut LoopContext,
    registration: AcceptorRegistration,
) -> Result<(), ConnectionError> {
    let fd = registration.listener.as_raw_fd();
    ctx.res
        .backend
        .register(fd, fd as usize, Interest::READABLE)
        .map_err(ConnectionError::Registration)?;
    ctx.acceptors.insert(fd as usize, registration);
    Ok(())
}

pub(crate) fn unregister(ctx: &mut LoopContext, token: usize) {
    if let Some(registration) = ctx.acceptors.remove(&token) {
        if let Err(e) = ctx.res.backend.deregister(registration.listener.as_raw_fd()) {
            debug!("注销监听器失败: {}", e);
        }
    }
}

/// 监听器可读：接受所有排队的连接
pub(crate) fn accept_ready(ctx: &mut LoopContext, token: usize) {
    let Some(registration) = ctx.acceptors.get(&token) else {
        return;
    };
    loop {
        let (stream, addr) = match registration.listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("接受连接失败: {}", e);
                break;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            warn!("设置非阻塞失败 {}: {}", addr, e);
            continue;
        }
        let _ = stream.set_nodelay(true);

        let target = registration.workers.next();
        let context = Arc::clone(&registration.context);
        let callback = Arc::clone(&registration.callback);
        let on_reject = Arc::clone(&registration.callback);
        let accepted =
            target.submit(move |ctx| register_accepted(ctx, stream, addr, context, callback));
        if let Err(e) = accepted {
            // 连接随被拒绝的任务一起关闭
            warn!("工作循环 {} 拒绝连接 {}: {}", target.name(), addr, e);
            on_reject(Err(ConnectionError::LoopStopped));
        }
    }
}

fn register_accepted(
    ctx: &mut LoopContext,
    stream: TcpStream,
    addr: SocketAddr,
    context: Arc<ChannelContext>,
    callback: AcceptCallback,
) {
    match ctx.register_channel(stream, addr, context) {
        Ok(ch) => {
            let token = ch.token();
            callback(Ok(ch));
            ctx.reap(token);
        }
        Err(e) => callback(Err(e)),
    }
}
