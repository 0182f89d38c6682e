//! 内核原生后端
//! 基于 polling 的 epoll/kqueue 封装，水平触发

use std::io;
use std::os::unix::io::{BorrowedFd, RawFd};
use std::time::Duration;

use parking_lot::Mutex;
use polling::{Event, Events, PollMode, Poller};

use super::{Interest, ReadyEvent};
use crate::common::error::BackendError;

/// 内核原生后端
pub struct NativeBackend {
    poller: Poller,
    /// 仅由事件循环线程使用的事件缓冲
    events: Mutex<Events>,
}

impl NativeBackend {
    pub fn new() -> Result<Self, BackendError> {
        let poller = Poller::new().map_err(|source| BackendError::Open {
            kind: "native",
            source,
        })?;
        Ok(Self {
            poller,
            events: Mutex::new(Events::new()),
        })
    }

    fn event(token: usize, interest: Interest) -> Event {
        match (interest.readable, interest.writable) {
            (true, true) => Event::all(token),
            (true, false) => Event::readable(token),
            (false, true) => Event::writable(token),
            (false, false) => Event::none(token),
        }
    }

    pub(super) fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        // SAFETY: 调用方保证 fd 在注销前一直有效
        unsafe {
            self.poller
                .add_with_mode(fd, Self::event(token, interest), PollMode::Level)
        }
    }

    pub(super) fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        // SAFETY: fd 已注册且尚未关闭
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller
            .modify_with_mode(fd, Self::event(token, interest), PollMode::Level)
    }

    pub(super) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: 同上
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.poller.delete(fd)
    }

    pub(super) fn wait(
        &self,
        out: &mut Vec<ReadyEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let mut events = self.events.lock();
        events.clear();
        self.poller.wait(&mut events, timeout)?;
        let before = out.len();
        out.extend(events.iter().map(|e| ReadyEvent {
            token: e.key,
            readable: e.readable,
            writable: e.writable,
        }));
        Ok(out.len() - before)
    }

    pub(super) fn wake(&self) -> io::Result<()> {
        self.poller.notify()
    }
}

impl std::fmt::Debug for NativeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBackend").finish_non_exhaustive()
    }
}
