use crate::error::ServerResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;

#[cfg(target_os = "linux")]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;
#[cfg(target_os = "macos")]
const SEND_FLAGS: c_int = 0;

// ---- Socket Operations ----

/// Create a non-blocking TCP listener with SO_REUSEADDR.
pub fn create_listen_socket(host: &str, port: u16, backlog: i32) -> ServerResult<RawFd> {
    let addr_str = format!("{}:{}", host, port);
    let addr: std::net::SocketAddr = addr_str
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        #[cfg(target_os = "linux")]
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        #[cfg(target_os = "macos")]
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        #[cfg(target_os = "macos")]
        if let Err(e) = set_nonblocking(fd) {
            libc::close(fd);
            return Err(e);
        }

        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        bind_addr(fd, &addr)?;

        if libc::listen(fd, backlog.max(128)) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Bind a socket to an address (shared between platforms).
fn bind_addr(fd: c_int, addr: &std::net::SocketAddr) -> ServerResult<()> {
    unsafe {
        match addr {
            std::net::SocketAddr::V4(a) => {
                #[cfg(target_os = "macos")]
                let sin = libc::sockaddr_in {
                    sin_len: mem::size_of::<libc::sockaddr_in>() as u8,
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                #[cfg(target_os = "linux")]
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
            std::net::SocketAddr::V6(a) => {
                #[cfg(target_os = "macos")]
                let sin6 = libc::sockaddr_in6 {
                    sin6_len: mem::size_of::<libc::sockaddr_in6>() as u8,
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                #[cfg(target_os = "linux")]
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

/// The port a bound socket actually landed on. Needed when binding port 0.
pub fn local_port(fd: RawFd) -> ServerResult<u16> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = &storage as *const _ as *const libc::sockaddr_in;
                Ok(u16::from_be((*sin).sin_port))
            }
            libc::AF_INET6 => {
                let sin6 = &storage as *const _ as *const libc::sockaddr_in6;
                Ok(u16::from_be((*sin6).sin6_port))
            }
            _ => Err(io::Error::new(io::ErrorKind::Other, "unknown address family").into()),
        }
    }
}

fn peer_from_storage(storage: &libc::sockaddr_storage) -> (IpAddr, u16) {
    unsafe {
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = storage as *const _ as *const libc::sockaddr_in;
                let ip = Ipv4Addr::from((*sin).sin_addr.s_addr.to_ne_bytes());
                (IpAddr::V4(ip), u16::from_be((*sin).sin_port))
            }
            libc::AF_INET6 => {
                let sin6 = storage as *const _ as *const libc::sockaddr_in6;
                let ip = Ipv6Addr::from((*sin6).sin6_addr.s6_addr);
                (IpAddr::V6(ip), u16::from_be((*sin6).sin6_port))
            }
            _ => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }
}

/// Accept one pending connection. Returns the new non-blocking fd and the
/// peer address, or `None` when the accept queue is drained.
pub fn accept_connection(listen_fd: RawFd) -> ServerResult<Option<(RawFd, IpAddr, u16)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

        #[cfg(target_os = "linux")]
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );
        #[cfg(target_os = "macos")]
        let fd = libc::accept(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }

        #[cfg(target_os = "macos")]
        {
            if let Err(e) = set_nonblocking(fd) {
                libc::close(fd);
                return Err(e);
            }
            // macOS has no MSG_NOSIGNAL; suppress SIGPIPE at the socket level.
            let one: c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
        }

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        let (ip, port) = peer_from_storage(&storage);
        Ok(Some((fd, ip, port)))
    }
}

#[allow(dead_code)]
fn set_nonblocking(fd: RawFd) -> ServerResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

/// Read from a non-blocking fd. `None` means WouldBlock; `Some(0)` is EOF.
pub fn recv_nonblocking(fd: RawFd, buf: &mut [u8]) -> ServerResult<Option<usize>> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Write to a non-blocking socket without raising SIGPIPE. `None` means
/// WouldBlock.
pub fn send_nonblocking(fd: RawFd, buf: &[u8]) -> ServerResult<Option<usize>> {
    unsafe {
        let res = libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), SEND_FLAGS);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Control Pipe Operations ----

/// Fixed size of one control-pipe message. Well under PIPE_BUF, so writes
/// are atomic and a reader never sees a torn message.
pub const PIPE_MSG_LEN: usize = 8;

/// Create a Unix pipe with a non-blocking read end. Returns (read, write).
pub fn create_pipe() -> ServerResult<(RawFd, RawFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fds[0]);
            libc::close(fds[1]);
            return Err(err.into());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Blocking write of one fixed-size control message.
pub fn write_pipe_msg(pipe_write_fd: RawFd, msg: &[u8; PIPE_MSG_LEN]) -> ServerResult<()> {
    unsafe {
        let n = libc::write(
            pipe_write_fd,
            msg.as_ptr() as *const c_void,
            PIPE_MSG_LEN,
        );
        if n < 0 {
            Err(io::Error::last_os_error().into())
        } else {
            Ok(())
        }
    }
}

/// Non-blocking read of one control message. `None` when the pipe is drained.
pub fn read_pipe_msg(pipe_read_fd: RawFd) -> ServerResult<Option<[u8; PIPE_MSG_LEN]>> {
    let mut buf = [0u8; PIPE_MSG_LEN];
    unsafe {
        let n = libc::read(
            pipe_read_fd,
            buf.as_mut_ptr() as *mut c_void,
            PIPE_MSG_LEN,
        );
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else if n as usize == PIPE_MSG_LEN {
            Ok(Some(buf))
        } else {
            // 0 on closed write end, or a short read that cannot happen for
            // atomic sub-PIPE_BUF writes; either way there is nothing usable.
            Ok(None)
        }
    }
}
