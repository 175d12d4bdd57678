use crate::error::ServerResult;
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use tracing::error;

/// Portable readiness bitset. Maps onto EPOLLIN/EPOLLOUT/EPOLLERR/EPOLLHUP on
/// Linux and the kqueue filters on macOS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventFlags(u8);

impl EventFlags {
    pub const READ: EventFlags = EventFlags(0b0001);
    pub const WRITE: EventFlags = EventFlags(0b0010);
    pub const ERROR: EventFlags = EventFlags(0b0100);
    pub const HANGUP: EventFlags = EventFlags(0b1000);

    pub fn empty() -> Self {
        EventFlags(0)
    }

    pub fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for EventFlags {
    type Output = EventFlags;

    fn bitor(self, rhs: EventFlags) -> EventFlags {
        EventFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: EventFlags) {
        self.0 |= rhs.0;
    }
}

/// One readiness notification delivered by [`EventNotifier::wait`].
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub fd: RawFd,
    pub flags: EventFlags,
}

/// Wraps one kernel readiness object (epoll on Linux, kqueue on macOS).
///
/// Registration is edge-triggered: a readable fd must be drained until the
/// read yields WouldBlock, or the kernel will not notify again.
pub struct EventNotifier {
    poller: sys::Poller,
}

impl EventNotifier {
    /// Construction failure is fatal; the server cannot start without a
    /// readiness object.
    pub fn new() -> ServerResult<Self> {
        Ok(Self {
            poller: sys::Poller::new()?,
        })
    }

    pub fn register(&self, fd: RawFd, interest: EventFlags) -> ServerResult<()> {
        self.poller.add(fd, interest)
    }

    /// Idempotent; silent on fds the kernel no longer knows about.
    pub fn unregister(&self, fd: RawFd) {
        self.poller.delete(fd);
    }

    /// Block up to `timeout_ms` for readiness. Returns an empty batch on
    /// timeout or benign interruption; non-benign wait errors are logged and
    /// also yield an empty batch so the runloop keeps going.
    pub fn wait(&mut self, timeout_ms: i32) -> Vec<Event> {
        match self.poller.wait(timeout_ms) {
            Ok(events) => events,
            Err(e) => {
                error!(error = %e, "event wait failed");
                Vec::new()
            }
        }
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use super::{Event, EventFlags};
    use crate::error::ServerResult;
    use libc::c_int;
    use std::io;
    use std::os::unix::io::RawFd;
    use std::ptr;

    const MAX_EVENTS: usize = 1024;

    pub struct Poller {
        epoll_fd: c_int,
        events: Vec<libc::epoll_event>,
    }

    fn interest_bits(interest: EventFlags) -> u32 {
        let mut bits = libc::EPOLLET as u32;
        if interest.contains(EventFlags::READ) {
            bits |= libc::EPOLLIN as u32;
        }
        if interest.contains(EventFlags::WRITE) {
            bits |= libc::EPOLLOUT as u32;
        }
        if interest.contains(EventFlags::HANGUP) {
            bits |= libc::EPOLLRDHUP as u32;
        }
        bits
    }

    fn flags_from_bits(bits: u32) -> EventFlags {
        let mut flags = EventFlags::empty();
        if bits & libc::EPOLLIN as u32 != 0 {
            flags |= EventFlags::READ;
        }
        if bits & libc::EPOLLOUT as u32 != 0 {
            flags |= EventFlags::WRITE;
        }
        if bits & libc::EPOLLERR as u32 != 0 {
            flags |= EventFlags::ERROR;
        }
        if bits & (libc::EPOLLHUP as u32 | libc::EPOLLRDHUP as u32) != 0 {
            flags |= EventFlags::HANGUP;
        }
        flags
    }

    impl Poller {
        pub fn new() -> ServerResult<Self> {
            unsafe {
                let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self {
                    epoll_fd: fd,
                    events: vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
                })
            }
        }

        pub fn add(&self, fd: RawFd, interest: EventFlags) -> ServerResult<()> {
            let mut event = libc::epoll_event {
                events: interest_bits(interest),
                u64: fd as u64,
            };
            unsafe {
                if libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: RawFd) {
            unsafe {
                // ENOENT and EBADF are the idempotent cases: the fd was never
                // registered, or was closed and auto-removed by the kernel.
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut());
            }
        }

        pub fn wait(&mut self, timeout_ms: i32) -> ServerResult<Vec<Event>> {
            unsafe {
                let res = libc::epoll_wait(
                    self.epoll_fd,
                    self.events.as_mut_ptr(),
                    self.events.len() as c_int,
                    timeout_ms,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(Vec::new());
                    }
                    return Err(err.into());
                }

                let n = res as usize;
                let mut out = Vec::with_capacity(n);
                for ev in &self.events[..n] {
                    out.push(Event {
                        fd: ev.u64 as RawFd,
                        flags: flags_from_bits(ev.events),
                    });
                }
                Ok(out)
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.epoll_fd);
            }
        }
    }
}

#[cfg(target_os = "macos")]
mod sys {
    use super::{Event, EventFlags};
    use crate::error::ServerResult;
    use libc::{c_int, c_void, kevent, timespec};
    use std::io;
    use std::os::unix::io::RawFd;
    use std::ptr;

    const MAX_EVENTS: usize = 1024;

    pub struct Poller {
        kqueue_fd: c_int,
        events: Vec<kevent>,
    }

    // kevent's udata pointer is only ever used as an integer token here; the
    // event buffer carries no shared ownership.
    unsafe impl Send for Poller {}

    impl Poller {
        pub fn new() -> ServerResult<Self> {
            unsafe {
                let fd = libc::kqueue();
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self {
                    kqueue_fd: fd,
                    events: vec![std::mem::zeroed::<kevent>(); MAX_EVENTS],
                })
            }
        }

        fn change(&self, fd: RawFd, filter: i16, action: u16) -> c_int {
            let change = kevent {
                ident: fd as usize,
                filter,
                flags: action,
                fflags: 0,
                data: 0,
                udata: fd as usize as *mut c_void,
            };
            unsafe { libc::kevent(self.kqueue_fd, &change, 1, ptr::null_mut(), 0, ptr::null()) }
        }

        pub fn add(&self, fd: RawFd, interest: EventFlags) -> ServerResult<()> {
            // EV_CLEAR gives edge-triggered delivery, matching the epoll path.
            let action = libc::EV_ADD | libc::EV_ENABLE | libc::EV_CLEAR;
            if interest.contains(EventFlags::READ)
                && self.change(fd, libc::EVFILT_READ, action) < 0
            {
                return Err(io::Error::last_os_error().into());
            }
            if interest.contains(EventFlags::WRITE)
                && self.change(fd, libc::EVFILT_WRITE, action) < 0
            {
                return Err(io::Error::last_os_error().into());
            }
            Ok(())
        }

        pub fn delete(&self, fd: RawFd) {
            // Either filter may be absent; deletion stays silent.
            self.change(fd, libc::EVFILT_READ, libc::EV_DELETE);
            self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE);
        }

        pub fn wait(&mut self, timeout_ms: i32) -> ServerResult<Vec<Event>> {
            let ts = timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            };

            unsafe {
                let res = libc::kevent(
                    self.kqueue_fd,
                    ptr::null(),
                    0,
                    self.events.as_mut_ptr(),
                    self.events.len() as c_int,
                    &ts,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(Vec::new());
                    }
                    return Err(err.into());
                }

                let n = res as usize;
                let mut out = Vec::with_capacity(n);
                for ev in &self.events[..n] {
                    let mut flags = EventFlags::empty();
                    if ev.filter == libc::EVFILT_READ {
                        flags |= EventFlags::READ;
                    }
                    if ev.filter == libc::EVFILT_WRITE {
                        flags |= EventFlags::WRITE;
                    }
                    if ev.flags & libc::EV_EOF != 0 {
                        flags |= EventFlags::HANGUP;
                    }
                    if ev.flags & libc::EV_ERROR != 0 {
                        flags |= EventFlags::ERROR;
                    }
                    out.push(Event {
                        fd: ev.ident as RawFd,
                        flags,
                    });
                }
                Ok(out)
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.kqueue_fd);
            }
        }
    }
}
