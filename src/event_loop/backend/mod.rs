//! 多路复用后端
//! 内核原生通知机制（epoll/kqueue，经由 polling）与可移植的 poll(2) 选择器

mod native;
mod portable;

pub use native::NativeBackend;
pub use portable::PortableBackend;

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::warn;

use crate::common::error::BackendError;
use crate::config::BackendKind;

/// 关注的就绪事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Interest = Interest {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Interest = Interest {
        readable: false,
        writable: true,
    };
    pub const BOTH: Interest = Interest {
        readable: true,
        writable: true,
    };
}

/// 一次就绪通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyEvent {
    /// 注册时给出的令牌
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
}

/// 事件循环使用的后端，启动时按能力探测选定
///
/// 两种实现都采用水平触发语义，唤醒通知在 `wait` 内部消化，不会出现在返回的事件中。
#[derive(Debug)]
pub enum Backend {
    Native(NativeBackend),
    Portable(PortableBackend),
}

impl Backend {
    /// 按配置打开后端；`Auto` 时原生后端不可用则回退到 poll
    pub fn open(kind: BackendKind) -> Result<Backend, BackendError> {
        match kind {
            BackendKind::Native => NativeBackend::new().map(Backend::Native),
            BackendKind::Portable => PortableBackend::new().map(Backend::Portable),
            BackendKind::Auto => match NativeBackend::new() {
                Ok(b) => Ok(Backend::Native(b)),
                Err(e) => {
                    warn!("原生后端不可用，回退到 poll: {}", e);
                    PortableBackend::new().map(Backend::Portable)
                }
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Backend::Native(_) => "native",
            Backend::Portable(_) => "portable",
        }
    }

    /// 注册描述符
    pub fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        match self {
            Backend::Native(b) => b.register(fd, token, interest),
            Backend::Portable(b) => b.register(fd, token, interest),
        }
    }

    /// 修改关注的事件
    pub fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        match self {
            Backend::Native(b) => b.reregister(fd, token, interest),
            Backend::Portable(b) => b.reregister(fd, token, interest),
        }
    }

    /// 注销描述符，必须在关闭描述符之前调用
    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        match self {
            Backend::Native(b) => b.deregister(fd),
            Backend::Portable(b) => b.deregister(fd),
        }
    }

    /// 等待就绪事件，追加到 `events` 并返回数量；被信号中断视为0个事件
    pub fn wait(
        &self,
        events: &mut Vec<ReadyEvent>,
        timeout: Option<Duration>,
    ) -> Result<usize, BackendError> {
        let res = match self {
            Backend::Native(b) => b.wait(events, timeout),
            Backend::Portable(b) => b.wait(events, timeout),
        };
        match res {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(BackendError::Wait(e)),
        }
    }

    /// 唤醒阻塞在 `wait` 中的线程，可从任意线程调用
    pub fn wake(&self) -> Result<(), BackendError> {
        match self {
            Backend::Native(b) => b.wake(),
            Backend::Portable(b) => b.wake(),
        }
        .map_err(BackendError::Wake)
    }
}
