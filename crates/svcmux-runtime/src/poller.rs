//! The master's event poller: epoll plus an eventfd wakeup.
//!
//! One registration per live descriptor, edge-triggered, with the
//! owning service's id as the registration token. Readiness that the
//! service has not drained yet accumulates in its gate, so edge
//! semantics match the accumulate-masks contract.
//!
//! The wakeup primitive is an always-registered eventfd: any thread
//! holding a [`Waker`] can force a blocked `wait` to return promptly
//! after queueing work for the master. Multiple wakes before the
//! master drains the counter coalesce into one.

use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::sync::Arc;

use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use svcmux_core::{EventMask, ServiceId};

/// Registration token reserved for the wakeup eventfd.
const WAKE_TOKEN: u64 = u64::MAX;

/// A readiness notification keyed by the owning service.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PollEvent {
    pub svid: ServiceId,
    pub masks: EventMask,
}

/// The wakeup eventfd. Closed on drop.
struct WakeFd(RawFd);

impl WakeFd {
    fn new() -> io::Result<WakeFd> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WakeFd(fd))
    }

    fn ring(&self) {
        let val: u64 = 1;
        // EAGAIN means the counter is already nonzero: a wake is pending
        let _ = unsafe {
            libc::write(
                self.0,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }

    fn drain(&self) {
        let mut val: u64 = 0;
        let _ = unsafe {
            libc::read(
                self.0,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// Cloneable handle that interrupts the master's wait.
#[derive(Clone)]
pub(crate) struct Waker(Arc<WakeFd>);

impl Waker {
    pub fn wake(&self) {
        self.0.ring();
    }
}

pub(crate) struct Poller {
    epoll: Epoll,
    wake: Arc<WakeFd>,
    /// Reused kernel-event buffer.
    buf: Vec<EpollEvent>,
}

fn to_flags(masks: EventMask) -> EpollFlags {
    let mut f = EpollFlags::empty();
    if masks.intersects(EventMask::READ) {
        f |= EpollFlags::EPOLLIN;
    }
    if masks.intersects(EventMask::WRITE) {
        f |= EpollFlags::EPOLLOUT;
    }
    if masks.intersects(EventMask::PRI) {
        f |= EpollFlags::EPOLLPRI;
    }
    if masks.intersects(EventMask::RDH) {
        f |= EpollFlags::EPOLLRDHUP;
    }
    f
}

fn from_flags(f: EpollFlags) -> EventMask {
    let mut m = EventMask::NONE;
    if f.contains(EpollFlags::EPOLLIN) {
        m |= EventMask::READ;
    }
    if f.contains(EpollFlags::EPOLLOUT) {
        m |= EventMask::WRITE;
    }
    if f.contains(EpollFlags::EPOLLPRI) {
        m |= EventMask::PRI;
    }
    if f.contains(EpollFlags::EPOLLRDHUP) {
        m |= EventMask::RDH;
    }
    if f.contains(EpollFlags::EPOLLHUP) {
        m |= EventMask::HUP;
    }
    if f.contains(EpollFlags::EPOLLERR) {
        m |= EventMask::ERR;
    }
    m
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io::Error::from)?;
        let wake = Arc::new(WakeFd::new()?);
        // level-triggered on purpose: a wake posted between drain and
        // wait must still show up
        let bfd = unsafe { BorrowedFd::borrow_raw(wake.0) };
        epoll
            .add(bfd, EpollEvent::new(EpollFlags::EPOLLIN, WAKE_TOKEN))
            .map_err(io::Error::from)?;
        Ok(Poller {
            epoll,
            wake,
            buf: vec![EpollEvent::empty(); 128],
        })
    }

    pub fn waker(&self) -> Waker {
        Waker(self.wake.clone())
    }

    /// Register a descriptor for the named service.
    pub fn add(&self, fd: RawFd, svid: ServiceId, masks: EventMask) -> io::Result<()> {
        let ev = EpollEvent::new(to_flags(masks) | EpollFlags::EPOLLET, svid.as_u32() as u64);
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.add(bfd, ev).map_err(io::Error::from)
    }

    /// Change the interest set of an existing registration.
    pub fn modify(&self, fd: RawFd, svid: ServiceId, masks: EventMask) -> io::Result<()> {
        let mut ev = EpollEvent::new(to_flags(masks) | EpollFlags::EPOLLET, svid.as_u32() as u64);
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.modify(bfd, &mut ev).map_err(io::Error::from)
    }

    /// Drop a registration.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let bfd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.delete(bfd).map_err(io::Error::from)
    }

    /// Block until at least one event or a wakeup.
    pub fn wait(&mut self, out: &mut Vec<PollEvent>) -> io::Result<usize> {
        self.poll(EpollTimeout::NONE, out)
    }

    /// Collect whatever is ready right now without blocking.
    pub fn try_wait(&mut self, out: &mut Vec<PollEvent>) -> io::Result<usize> {
        self.poll(0u16.into(), out)
    }

    /// Block for at most `ms` milliseconds (capped at u16::MAX).
    pub fn timed_wait(&mut self, ms: u32, out: &mut Vec<PollEvent>) -> io::Result<usize> {
        let ms = ms.min(u16::MAX as u32) as u16;
        self.poll(ms.into(), out)
    }

    fn poll(&mut self, timeout: EpollTimeout, out: &mut Vec<PollEvent>) -> io::Result<usize> {
        let n = loop {
            match self.epoll.wait(&mut self.buf, timeout) {
                Ok(n) => break n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from(e)),
            }
        };
        for ev in &self.buf[..n] {
            if ev.data() == WAKE_TOKEN {
                self.wake.drain();
                continue;
            }
            out.push(PollEvent {
                svid: ServiceId::new(ev.data() as u32),
                masks: from_flags(ev.events()),
            });
        }
        Ok(out.len())
    }
}
