// src/driver.rs
use crate::error::RavelResult;
use crate::syscalls::Epoll;
use libc::{c_int, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP};

/// Which direction a connection wants to be woken for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Contract between a connection and the event loop that owns its readiness.
///
/// Registrations are one-shot: after a readiness event fires the fd is
/// disarmed until `rearm` is called, so at most one worker ever holds a
/// connection at a time.
pub trait EventDriver: Send + Sync {
    fn register(&self, fd: c_int, token: u64) -> RavelResult<()>;
    fn rearm(&self, fd: c_int, token: u64, interest: Interest) -> RavelResult<()>;
    fn unregister(&self, fd: c_int) -> RavelResult<()>;
}

/// The production driver over a shared epoll instance.
pub struct EpollDriver {
    epoll: Epoll,
}

impl EpollDriver {
    pub fn new() -> RavelResult<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
        })
    }

    /// Raw access for the event loop's wait call and listener registration.
    pub fn epoll(&self) -> &Epoll {
        &self.epoll
    }
}

impl EventDriver for EpollDriver {
    fn register(&self, fd: c_int, token: u64) -> RavelResult<()> {
        self.epoll
            .add(fd, token, EPOLLIN | EPOLLRDHUP | EPOLLONESHOT)
    }

    fn rearm(&self, fd: c_int, token: u64, interest: Interest) -> RavelResult<()> {
        let ev = match interest {
            Interest::Read => EPOLLIN,
            Interest::Write => EPOLLOUT,
        };
        self.epoll.modify(fd, token, ev | EPOLLRDHUP | EPOLLONESHOT)
    }

    fn unregister(&self, fd: c_int) -> RavelResult<()> {
        self.epoll.delete(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_pair() -> (c_int, c_int) {
        let mut fds = [0 as c_int; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        (fds[0], fds[1])
    }

    #[test]
    fn oneshot_fires_once_until_rearmed() {
        let driver = EpollDriver::new().unwrap();
        let (a, b) = socket_pair();
        driver.register(a, 7).unwrap();

        unsafe {
            libc::write(b, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 8];
        let n = driver.epoll().wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        let token = events[0].u64;
        assert_eq!(token, 7);

        // Disarmed now, even though the byte is still unread.
        let n = driver.epoll().wait(&mut events, 50).unwrap();
        assert_eq!(n, 0);

        driver.rearm(a, 7, Interest::Read).unwrap();
        let n = driver.epoll().wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);

        driver.unregister(a).unwrap();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn write_interest_reports_writable() {
        let driver = EpollDriver::new().unwrap();
        let (a, b) = socket_pair();
        driver.register(a, 1).unwrap();
        driver.rearm(a, 1, Interest::Write).unwrap();

        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; 8];
        let n = driver.epoll().wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        let flags = events[0].events as i32;
        assert!(flags & libc::EPOLLOUT != 0);

        driver.unregister(a).unwrap();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }
}
