//! Socket bootstrap: descriptor creation with a pre-listen option set, and
//! the bind-then-listen sequence, both expressed through the same
//! negated-errno error type as the ring syscalls.
//!
//! These helpers only mint configured descriptors; all I/O on them goes
//! through submission entries on a [`Ring`](crate::Ring).

use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use libc::{c_int, c_void, socklen_t};

use crate::error::{Error, Result};

bitflags::bitflags! {
    /// Socket options applied at creation time, before any bind.
    ///
    /// When several are requested they are applied in declaration order:
    /// keep-alive, address reuse, port reuse, linger. The first option the
    /// kernel rejects aborts the whole creation.
    pub struct SocketOptions: u32 {
        /// `SO_KEEPALIVE`: periodic liveness probes on idle connections.
        const KEEPALIVE = 1 << 0;
        /// `SO_REUSEADDR`: rebind a local address still in `TIME_WAIT`.
        const REUSEADDR = 1 << 1;
        /// `SO_REUSEPORT`: share one address/port across several sockets.
        const REUSEPORT = 1 << 2;
        /// `SO_LINGER` with a zero timeout: close discards unsent data and
        /// resets the connection instead of lingering.
        const LINGER = 1 << 3;
    }
}

/// A socket address in the kernel's wire form, ready to pass to `bind(2)` or
/// to reference from an `accept`/`connect` submission entry.
///
/// Backed by a `sockaddr_storage` so one type covers both IPv4 and IPv6.
#[derive(Clone, Copy)]
pub struct RawAddress {
    storage: libc::sockaddr_storage,
    len: socklen_t,
}

impl RawAddress {
    pub fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const libc::sockaddr_storage as *const libc::sockaddr
    }

    pub fn len(&self) -> socklen_t {
        self.len
    }

    /// The address family (`AF_INET` or `AF_INET6`).
    pub fn family(&self) -> c_int {
        c_int::from(self.storage.ss_family)
    }
}

impl From<SocketAddr> for RawAddress {
    fn from(addr: SocketAddr) -> Self {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                unsafe {
                    std::ptr::write(
                        &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in,
                        sin,
                    );
                }
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: v6.scope_id(),
                };
                unsafe {
                    std::ptr::write(
                        &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6,
                        sin6,
                    );
                }
                mem::size_of::<libc::sockaddr_in6>()
            }
        };
        RawAddress {
            storage,
            len: len as socklen_t,
        }
    }
}

impl std::fmt::Debug for RawAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawAddress")
            .field("family", &self.family())
            .field("len", &self.len)
            .finish()
    }
}

/// Create a socket of the given domain and type and apply `options` in their
/// declaration order.
///
/// The first rejected option aborts creation: the descriptor is closed and
/// the rejecting `setsockopt` failure is returned, so a success always means
/// every requested option took effect.
pub fn create_socket(domain: c_int, socket_type: c_int, options: SocketOptions) -> Result<RawFd> {
    let fd = unsafe { libc::socket(domain, socket_type, 0) };
    if fd < 0 {
        return Err(Error::last_syscall());
    }

    if let Err(error) = apply_options(fd, options) {
        unsafe {
            libc::close(fd);
        }
        return Err(error);
    }

    log::debug!(
        "created socket fd {} (domain {}, type {}, options {:?})",
        fd,
        domain,
        socket_type,
        options,
    );
    Ok(fd)
}

fn apply_options(fd: RawFd, options: SocketOptions) -> Result<()> {
    if options.contains(SocketOptions::KEEPALIVE) {
        set_flag(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE)?;
    }
    if options.contains(SocketOptions::REUSEADDR) {
        set_flag(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR)?;
    }
    if options.contains(SocketOptions::REUSEPORT) {
        set_flag(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT)?;
    }
    if options.contains(SocketOptions::LINGER) {
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        set_option(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const libc::linger as *const c_void,
            mem::size_of::<libc::linger>() as socklen_t,
        )?;
    }
    Ok(())
}

fn set_flag(fd: RawFd, level: c_int, name: c_int) -> Result<()> {
    let enable: c_int = 1;
    set_option(
        fd,
        level,
        name,
        &enable as *const c_int as *const c_void,
        mem::size_of::<c_int>() as socklen_t,
    )
}

fn set_option(
    fd: RawFd,
    level: c_int,
    name: c_int,
    value: *const c_void,
    len: socklen_t,
) -> Result<()> {
    let ret = unsafe { libc::setsockopt(fd, level, name, value, len) };
    if ret < 0 {
        return Err(Error::last_syscall());
    }
    Ok(())
}

/// Bind `fd` to `address` and put it into the listening state with the given
/// backlog. The two-step sequence is atomic from the caller's perspective: a
/// bind failure (`EADDRINUSE` and friends) is reported without attempting the
/// listen.
pub fn prepare_for_listen(fd: RawFd, address: &RawAddress, backlog: c_int) -> Result<()> {
    let ret = unsafe { libc::bind(fd, address.as_ptr(), address.len()) };
    if ret < 0 {
        return Err(Error::last_syscall());
    }
    let ret = unsafe { libc::listen(fd, backlog) };
    if ret < 0 {
        return Err(Error::last_syscall());
    }
    Ok(())
}

/// Convenience composition of [`create_socket`] and [`prepare_for_listen`]
/// for the common TCP listener shape. The domain is derived from the address
/// family; the descriptor is closed on any failure along the way.
pub fn create_listener(
    addr: SocketAddr,
    options: SocketOptions,
    backlog: c_int,
) -> Result<RawFd> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = create_socket(domain, libc::SOCK_STREAM, options)?;
    let address = RawAddress::from(addr);
    if let Err(error) = prepare_for_listen(fd, &address, backlog) {
        unsafe {
            libc::close(fd);
        }
        return Err(error);
    }
    Ok(fd)
}
