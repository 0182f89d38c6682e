//! 可移植后端
//! 基于 poll(2) 的选择器，用一对非阻塞 Unix 套接字实现唤醒

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use parking_lot::Mutex;

use super::{Interest, ReadyEvent};
use crate::common::error::BackendError;

/// 可移植后端
#[derive(Debug)]
pub struct PortableBackend {
    /// fd -> (令牌, 关注事件)
    registry: Mutex<HashMap<RawFd, (usize, Interest)>>,
    /// 仅由事件循环线程使用的 pollfd 缓冲
    pollfds: Mutex<Vec<libc::pollfd>>,
    wake_rx: UnixStream,
    wake_tx: UnixStream,
}

impl PortableBackend {
    pub fn new() -> Result<Self, BackendError> {
        let open_err = |source| BackendError::Open {
            kind: "portable",
            source,
        };
        let (wake_rx, wake_tx) = UnixStream::pair().map_err(open_err)?;
        wake_rx.set_nonblocking(true).map_err(open_err)?;
        wake_tx.set_nonblocking(true).map_err(open_err)?;
        Ok(Self {
            registry: Mutex::new(HashMap::new()),
            pollfds: Mutex::new(Vec::new()),
            wake_rx,
            wake_tx,
        })
    }

    pub(super) fn register(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        let mut reg = self.registry.lock();
        if reg.contains_key(&fd) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, "fd already registered"));
        }
        reg.insert(fd, (token, interest));
        Ok(())
    }

    pub(super) fn reregister(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        match self.registry.lock().get_mut(&fd) {
            Some(entry) => {
                *entry = (token, interest);
                Ok(())
            }
            None => Err(io::Error::new(io::ErrorKind::NotFound, "fd not registered")),
        }
    }

    pub(super) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.registry
            .lock()
            .remove(&fd)
            .map(|_| ())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "fd not registered"))
    }

    pub(super) fn wait(
        &self,
        out: &mut Vec<ReadyEvent>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let mut pollfds = self.pollfds.lock();
        pollfds.clear();
        pollfds.push(libc::pollfd {
            fd: self.wake_rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        let tokens: Vec<(usize, Interest)> = {
            let reg = self.registry.lock();
            reg.iter()
                .map(|(fd, (token, interest))| {
                    let mut events = 0;
                    if interest.readable {
                        events |= libc::POLLIN;
                    }
                    if interest.writable {
                        events |= libc::POLLOUT;
                    }
                    pollfds.push(libc::pollfd {
                        fd: *fd,
                        events,
                        revents: 0,
                    });
                    (*token, *interest)
                })
                .collect()
        };

        let timeout_ms = match timeout {
            None => -1,
            Some(d) => {
                // 向上取整，避免亚毫秒超时退化为忙轮询
                let ms = d.as_nanos().div_ceil(1_000_000);
                ms.min(i32::MAX as u128) as libc::c_int
            }
        };
        // SAFETY: pollfds 在调用期间保持有效，长度与传入的数量一致
        let n = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }

        if pollfds[0].revents != 0 {
            self.drain_wake();
        }
        let before = out.len();
        for (pfd, (token, interest)) in pollfds[1..].iter().zip(tokens) {
            let r = pfd.revents;
            if r == 0 {
                continue;
            }
            // 错误与挂断同时报告为可读可写，由读写路径取得具体错误
            let failed = r & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            out.push(ReadyEvent {
                token,
                readable: r & libc::POLLIN != 0 || (failed && interest.readable),
                writable: r & libc::POLLOUT != 0 || (failed && interest.writable),
            });
        }
        Ok(out.len() - before)
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake_rx).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    }

    pub(super) fn wake(&self) -> io::Result<()> {
        match (&self.wake_tx).write(&[1]) {
            Ok(_) => Ok(()),
            // 缓冲区已满说明已有未消化的唤醒
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_registration_rejected() {
        let backend = PortableBackend::new().unwrap();
        let (a, _b) = UnixStream::pair().unwrap();
        backend.register(a.as_raw_fd(), 1, Interest::READABLE).unwrap();
        let err = backend.register(a.as_raw_fd(), 1, Interest::READABLE).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        backend.deregister(a.as_raw_fd()).unwrap();
        assert_eq!(
            backend.deregister(a.as_raw_fd()).unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
    }

    #[test]
    fn test_hangup_reported() {
        let backend = PortableBackend::new().unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        backend.register(a.as_raw_fd(), 9, Interest::READABLE).unwrap();
        drop(b);
        let mut events = Vec::new();
        backend.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].readable);
    }

    #[test]
    fn test_coalesced_wakes_drained() {
        let backend = PortableBackend::new().unwrap();
        for _ in 0..100 {
            backend.wake().unwrap();
        }
        let mut events = Vec::new();
        backend.wait(&mut events, Some(Duration::from_secs(1))).unwrap();
        assert!(events.is_empty());
        // 唤醒已被消化，下一次等待会超时
        let start = std::time::Instant::now();
        backend.wait(&mut events, Some(Duration::from_millis(30))).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
