//! Readiness notification for sockets and CGI pipes.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};

/// What a registered descriptor is waited on for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
    /// Registered, but only hangups and errors are reported.
    Suspended,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

pub trait Poller {
    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;
    fn remove(&mut self, fd: RawFd) -> io::Result<()>;
    /// Wait up to `timeout` for events. An interrupted wait yields no events.
    fn wait(&mut self, timeout: Duration) -> io::Result<Vec<Event>>;
}

/// Level-triggered epoll instance.
pub struct Epoll {
    epfd: RawFd,
    events: Vec<EpollEvent>,
}

impl Epoll {
    pub fn new(max_events: usize) -> io::Result<Self> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            epfd,
            events: vec![EpollEvent::empty(); max_events.max(1)],
        })
    }

    fn control(&mut self, op: EpollOp, fd: RawFd, interest: Interest) -> io::Result<()> {
        let flags = match interest {
            Interest::Readable => EpollFlags::EPOLLIN,
            Interest::Writable => EpollFlags::EPOLLOUT,
            Interest::Suspended => EpollFlags::empty(),
        };
        let mut event = EpollEvent::new(flags, fd as u64);
        epoll_ctl(self.epfd, op, fd, &mut event)?;
        Ok(())
    }
}

impl Poller for Epoll {
    fn add(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.control(EpollOp::EpollCtlAdd, fd, interest)
    }

    fn modify(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.control(EpollOp::EpollCtlMod, fd, interest)
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, &mut EpollEvent::empty())?;
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> io::Result<Vec<Event>> {
        let count = match epoll_wait(self.epfd, &mut self.events, timeout.as_millis() as isize) {
            Ok(count) => count,
            Err(Errno::EINTR) => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(self.events[..count]
            .iter()
            .map(|event| {
                let flags = event.events();
                Event {
                    fd: event.data() as RawFd,
                    readable: flags.contains(EpollFlags::EPOLLIN),
                    writable: flags.contains(EpollFlags::EPOLLOUT),
                    hangup: flags.contains(EpollFlags::EPOLLHUP),
                    error: flags.contains(EpollFlags::EPOLLERR),
                }
            })
            .collect())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        let _ = nix::unistd::close(self.epfd);
    }
}
