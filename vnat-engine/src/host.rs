//! Host socket primitives.
//!
//! Everything the engine does to the outside world goes through the
//! [`HostSocket`] / [`HostBackend`] traits, so tests can script descriptors
//! without touching the network. The real implementation wraps non-blocking
//! BSD sockets via nix. Would-block and interrupted results are reported as
//! their distinct `io::ErrorKind`s and never conflated with hard errors.

use std::io::{self, IoSlice, IoSliceMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    self, AddressFamily, Backlog, MsgFlags, Shutdown, SockFlag, SockProtocol, SockType,
    SockaddrIn, SockaddrIn6, SockaddrStorage,
};
use nix::sys::uio;

/// Address family of a host descriptor or socket address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Family {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }
}

/// Protocol selector for datagram descriptors. ICMP flows use unprivileged
/// ping sockets, which behave like datagram sockets on Linux.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DgramProto {
    Udp,
    Icmp,
}

/// One non-blocking host descriptor.
pub trait HostSocket {
    fn family(&self) -> Family;
    fn raw_fd(&self) -> RawFd;

    /// Start a non-blocking connect; an in-progress result is success.
    fn connect(&mut self, addr: SocketAddr) -> io::Result<()>;

    fn readv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize>;
    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize>;
    fn send_oob(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Bytes available to read right now (FIONREAD).
    fn available(&self) -> io::Result<usize>;

    fn shutdown_read(&mut self) -> io::Result<()>;
    fn shutdown_write(&mut self) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Factory for host descriptors. All sockets come up non-blocking.
pub trait HostBackend {
    type Socket: HostSocket;

    fn stream(&mut self, family: Family) -> io::Result<Self::Socket>;
    fn datagram(&mut self, family: Family, proto: DgramProto) -> io::Result<Self::Socket>;

    /// Bind and listen on the host loopback of the given family.
    fn listen_loopback(&mut self, family: Family, port: u16) -> io::Result<Self::Socket>;
}

/// Whether an I/O failure means "nothing happened this tick".
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

nix::ioctl_read_bad!(fionread, nix::libc::FIONREAD, nix::libc::c_int);

/// Real host socket backed by an owned fd.
#[derive(Debug)]
pub struct SysSocket {
    fd: OwnedFd,
    family: Family,
}

impl SysSocket {
    fn new(fd: OwnedFd, family: Family) -> Self {
        Self { fd, family }
    }
}

fn address_family(family: Family) -> AddressFamily {
    match family {
        Family::V4 => AddressFamily::Inet,
        Family::V6 => AddressFamily::Inet6,
    }
}

fn storage_to_std(addr: Option<SockaddrStorage>) -> io::Result<SocketAddr> {
    let addr =
        addr.ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "peer without address"))?;
    if let Some(sin) = addr.as_sockaddr_in() {
        Ok(SocketAddr::V4(SocketAddrV4::new(sin.ip(), sin.port())))
    } else if let Some(sin6) = addr.as_sockaddr_in6() {
        Ok(SocketAddr::V6(SocketAddrV6::new(
            sin6.ip(),
            sin6.port(),
            sin6.flowinfo(),
            sin6.scope_id(),
        )))
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported peer address family",
        ))
    }
}

impl HostSocket for SysSocket {
    fn family(&self) -> Family {
        self.family
    }

    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        match socket::connect(self.fd.as_raw_fd(), &SockaddrStorage::from(addr)) {
            Ok(()) | Err(Errno::EINPROGRESS) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn readv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        uio::readv(&self.fd, bufs).map_err(io::Error::from)
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        uio::writev(&self.fd, bufs).map_err(io::Error::from)
    }

    fn send_oob(&mut self, buf: &[u8]) -> io::Result<usize> {
        socket::send(self.fd.as_raw_fd(), buf, MsgFlags::MSG_OOB).map_err(io::Error::from)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, peer) =
            socket::recvfrom::<SockaddrStorage>(self.fd.as_raw_fd(), buf).map_err(io::Error::from)?;
        Ok((n, storage_to_std(peer)?))
    }

    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        socket::sendto(
            self.fd.as_raw_fd(),
            buf,
            &SockaddrStorage::from(addr),
            MsgFlags::empty(),
        )
        .map_err(io::Error::from)
    }

    fn available(&self) -> io::Result<usize> {
        let mut n: nix::libc::c_int = 0;
        unsafe { fionread(self.fd.as_raw_fd(), &mut n) }.map_err(io::Error::from)?;
        Ok(n.max(0) as usize)
    }

    fn shutdown_read(&mut self) -> io::Result<()> {
        socket::shutdown(self.fd.as_raw_fd(), Shutdown::Read).map_err(io::Error::from)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        socket::shutdown(self.fd.as_raw_fd(), Shutdown::Write).map_err(io::Error::from)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        let addr = socket::getsockname::<SockaddrStorage>(self.fd.as_raw_fd())
            .map_err(io::Error::from)?;
        storage_to_std(Some(addr))
    }
}

/// Backend creating real non-blocking sockets.
#[derive(Debug, Default)]
pub struct SysBackend;

impl HostBackend for SysBackend {
    type Socket = SysSocket;

    fn stream(&mut self, family: Family) -> io::Result<SysSocket> {
        let fd = socket::socket(
            address_family(family),
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(io::Error::from)?;
        // Urgent data arrives in the normal byte stream; the engine tracks
        // the urgent boundary itself.
        socket::setsockopt(&fd, socket::sockopt::OobInline, &true).map_err(io::Error::from)?;
        Ok(SysSocket::new(fd, family))
    }

    fn datagram(&mut self, family: Family, proto: DgramProto) -> io::Result<SysSocket> {
        let protocol = match (proto, family) {
            (DgramProto::Udp, _) => None,
            (DgramProto::Icmp, Family::V4) => Some(SockProtocol::Icmp),
            (DgramProto::Icmp, Family::V6) => Some(SockProtocol::IcmpV6),
        };
        let fd = socket::socket(
            address_family(family),
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK,
            protocol,
        )
        .map_err(io::Error::from)?;
        Ok(SysSocket::new(fd, family))
    }

    fn listen_loopback(&mut self, family: Family, port: u16) -> io::Result<SysSocket> {
        let fd = socket::socket(
            address_family(family),
            SockType::Stream,
            SockFlag::SOCK_NONBLOCK,
            None,
        )
        .map_err(io::Error::from)?;
        socket::setsockopt(&fd, socket::sockopt::ReuseAddr, &true).map_err(io::Error::from)?;
        match family {
            Family::V4 => {
                let addr = SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
                socket::bind(fd.as_raw_fd(), &addr).map_err(io::Error::from)?;
            }
            Family::V6 => {
                let addr =
                    SockaddrIn6::from(SocketAddrV6::new(Ipv6Addr::LOCALHOST, port, 0, 0));
                socket::bind(fd.as_raw_fd(), &addr).map_err(io::Error::from)?;
            }
        }
        let backlog = Backlog::new(4).map_err(io::Error::from)?;
        socket::listen(&fd, backlog).map_err(io::Error::from)?;
        Ok(SysSocket::new(fd, family))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from_raw_os_error(
            nix::libc::EHOSTUNREACH
        )));
    }

    #[test]
    fn test_family_of() {
        let v4: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let v6: SocketAddr = "[::1]:80".parse().unwrap();
        assert_eq!(Family::of(&v4), Family::V4);
        assert_eq!(Family::of(&v6), Family::V6);
    }
}
