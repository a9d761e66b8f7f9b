//! Thin non-blocking socket layer over raw libc calls.
//!
//! IPv4 TCP only, matching what the runtime's event bridge drives.
//! Descriptors are returned as `OwnedFd` wherever ownership transfers;
//! raw-fd entry points are for descriptors a service already owns.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use svcmux_core::svc_warn;

fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    sa
}

fn addr_from(sa: &libc::sockaddr_in) -> SocketAddr {
    let ip = Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes());
    SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sa.sin_port)))
}

fn new_stream_socket() -> io::Result<RawFd> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Bind and listen on `addr`. The returned socket is non-blocking.
pub fn listen(addr: SocketAddrV4, backlog: i32) -> io::Result<OwnedFd> {
    let fd = new_stream_socket()?;

    unsafe {
        let opt: i32 = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const i32 as *const libc::c_void,
            4,
        );
    }

    let sa = sockaddr_in(addr);
    let ret = unsafe {
        libc::bind(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        let e = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(e);
    }

    if unsafe { libc::listen(fd, backlog) } != 0 {
        let e = io::Error::last_os_error();
        unsafe {
            libc::close(fd);
        }
        return Err(e);
    }

    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Drain every pending connection on a listening socket, invoking
/// `on_conn` once per accepted descriptor. Returns how many were
/// accepted. Accept errors other than exhaustion are warned about and
/// stop the drain.
pub fn accept_all<F>(fd: RawFd, mut on_conn: F) -> usize
where
    F: FnMut(OwnedFd, SocketAddr),
{
    let mut count = 0;
    loop {
        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let r = unsafe {
            libc::accept4(
                fd,
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if r < 0 {
            let e = io::Error::last_os_error();
            match e.raw_os_error() {
                Some(libc::EAGAIN) => break,
                Some(libc::EINTR) | Some(libc::ECONNABORTED) => continue,
                _ => {
                    svc_warn!("accept failed: {}", e);
                    break;
                }
            }
        }
        let conn = unsafe { OwnedFd::from_raw_fd(r) };
        on_conn(conn, addr_from(&sa));
        count += 1;
    }
    count
}

/// Start a non-blocking connect. The second return value is true while
/// the connect is still in flight (register the socket as `Connecting`
/// and wait for the connect-response).
pub fn connect(addr: SocketAddrV4) -> io::Result<(OwnedFd, bool)> {
    let fd = new_stream_socket()?;
    let sa = sockaddr_in(addr);
    let ret = unsafe {
        libc::connect(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        return Ok((unsafe { OwnedFd::from_raw_fd(fd) }, false));
    }
    let e = io::Error::last_os_error();
    if e.raw_os_error() == Some(libc::EINPROGRESS) {
        return Ok((unsafe { OwnedFd::from_raw_fd(fd) }, true));
    }
    unsafe {
        libc::close(fd);
    }
    Err(e)
}

/// Local address of a bound socket.
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockname(
            fd,
            &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(addr_from(&sa))
}

/// Read from a non-blocking socket. `Ok(0)` is end of stream;
/// `ErrorKind::WouldBlock` means the readable edge is exhausted.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Write to a non-blocking socket.
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Close a descriptor by dropping ownership of it.
pub fn close(fd: OwnedFd) {
    drop(fd);
}
