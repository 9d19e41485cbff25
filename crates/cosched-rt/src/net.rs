// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Non-blocking TCP handle over libc.
//!
//! Sockets are created with `SOCK_NONBLOCK | SOCK_CLOEXEC`, so every raw call
//! returns `WouldBlock` instead of parking the thread. The descriptor is the
//! handle the scheduler waits on. Linux only.

use std::cell::Cell;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::socket::RawStream;
use crate::syscall::Handle;

#[derive(Debug)]
pub struct TcpSocket {
    fd: RawFd,
    /// A connect returned EINPROGRESS and hasn't been confirmed yet.
    connecting: Cell<bool>,
    closed: Cell<bool>,
}

impl TcpSocket {
    pub fn new_v4() -> io::Result<Self> {
        Self::with_domain(libc::AF_INET)
    }

    pub fn new_v6() -> io::Result<Self> {
        Self::with_domain(libc::AF_INET6)
    }

    /// A socket in the address family of `addr`.
    pub fn for_addr(addr: &SocketAddr) -> io::Result<Self> {
        match addr {
            SocketAddr::V4(_) => Self::new_v4(),
            SocketAddr::V6(_) => Self::new_v6(),
        }
    }

    fn with_domain(domain: libc::c_int) -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self::from_fd(fd))
    }

    fn from_fd(fd: RawFd) -> Self {
        Self {
            fd,
            connecting: Cell::new(false),
            closed: Cell::new(false),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        self.fd
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed.get() {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        Ok(())
    }

    fn set_reuseaddr(&self) -> io::Result<()> {
        let one: libc::c_int = 1;
        let ret = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Pending error from an asynchronous connect, if any.
    fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((err != 0).then(|| io::Error::from_raw_os_error(err)))
    }
}

impl RawStream for TcpSocket {
    fn handle(&self) -> Handle {
        Handle::from_raw_fd(self.fd)
    }

    fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.check_open()?;
        self.set_reuseaddr()?;
        let (storage, len) = std_to_sockaddr(&addr);
        let ret = unsafe {
            libc::bind(self.fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn listen(&self, backlog: u32) -> io::Result<()> {
        self.check_open()?;
        let backlog = backlog.min(libc::c_int::MAX as u32) as libc::c_int;
        if unsafe { libc::listen(self.fd, backlog) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn accept(&self) -> io::Result<(Rc<dyn RawStream>, SocketAddr)> {
        self.check_open()?;
        let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut addrlen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

        let client_fd = unsafe {
            libc::accept4(
                self.fd,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut addrlen,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if client_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let peer = unsafe { sockaddr_to_std(&addr) };
        log::trace!("accepted fd {} from {}", client_fd, peer);
        Ok((Rc::new(TcpSocket::from_fd(client_fd)), peer))
    }

    fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        self.check_open()?;
        if self.connecting.get() {
            if let Some(err) = self.take_error()? {
                self.connecting.set(false);
                return Err(err);
            }
        }

        let (storage, len) = std_to_sockaddr(&addr);
        let ret = unsafe {
            libc::connect(self.fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret == 0 {
            self.connecting.set(false);
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EISCONN) => {
                self.connecting.set(false);
                Ok(())
            }
            Some(libc::EINPROGRESS) | Some(libc::EALREADY) => {
                self.connecting.set(true);
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
            _ => {
                self.connecting.set(false);
                Err(err)
            }
        }
    }

    fn read(&self, max: usize) -> io::Result<Vec<u8>> {
        self.check_open()?;
        let mut buf = vec![0u8; max];
        let n = unsafe {
            libc::recv(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(n as usize);
        Ok(buf)
    }

    fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        let n = unsafe {
            libc::send(
                self.fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.replace(true) {
            return Ok(());
        }
        if unsafe { libc::close(self.fd) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.check_open()?;
        let mut addr: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut addrlen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                self.fd,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut addrlen,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { sockaddr_to_std(&addr) })
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        if !self.closed.get() {
            unsafe { libc::close(self.fd) };
        }
    }
}

fn std_to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr.s_addr = u32::from(*a.ip()).to_be();
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_scope_id = a.scope_id();
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Convert a raw sockaddr_storage to a SocketAddr.
unsafe fn sockaddr_to_std(addr: &libc::sockaddr_storage) -> SocketAddr {
    match addr.ss_family as i32 {
        libc::AF_INET => {
            let addr4 = &*(addr as *const _ as *const libc::sockaddr_in);
            let ip = Ipv4Addr::from(u32::from_be(addr4.sin_addr.s_addr));
            SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(addr4.sin_port)))
        }
        libc::AF_INET6 => {
            let addr6 = &*(addr as *const _ as *const libc::sockaddr_in6);
            SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(addr6.sin6_addr.s6_addr),
                u16::from_be(addr6.sin6_port),
                addr6.sin6_flowinfo,
                addr6.sin6_scope_id,
            ))
        }
        _ => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
    }
}
