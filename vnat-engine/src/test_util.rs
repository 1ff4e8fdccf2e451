//! Scripted host-socket fakes and recording collaborators shared by unit
//! and integration tests. Nothing here touches the network.

use std::collections::{HashMap, VecDeque};
use std::io::{self, IoSlice, IoSliceMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::engine::{ForwardRules, GuestOutput, TcpCollaborator};
use crate::flow::TcpToken;
use crate::host::{DgramProto, Family, HostBackend, HostSocket};
use crate::pktbuf::PacketBuffer;
use crate::table::FlowHandle;

/// Scriptable failure for a mock socket operation.
#[derive(Debug, Clone, Copy)]
pub enum ScriptErr {
    WouldBlock,
    Interrupted,
    /// A hard failure with this raw errno (e.g. `libc::EHOSTUNREACH`).
    Raw(i32),
}

impl ScriptErr {
    fn into_io(self) -> io::Error {
        match self {
            ScriptErr::WouldBlock => io::ErrorKind::WouldBlock.into(),
            ScriptErr::Interrupted => io::ErrorKind::Interrupted.into(),
            ScriptErr::Raw(code) => io::Error::from_raw_os_error(code),
        }
    }
}

static NEXT_FD: AtomicI32 = AtomicI32::new(1000);

/// Scripted stand-in for one host descriptor.
#[derive(Debug)]
pub struct MockSocket {
    pub family: Family,
    fd: RawFd,
    pub local: SocketAddr,

    read_script: VecDeque<Result<Vec<u8>, ScriptErr>>,
    write_script: VecDeque<Result<usize, ScriptErr>>,
    oob_script: VecDeque<Result<usize, ScriptErr>>,
    recv_script: VecDeque<Result<(Vec<u8>, SocketAddr), ScriptErr>>,
    send_script: VecDeque<Result<usize, ScriptErr>>,

    readv_offered: Vec<usize>,
    written: Vec<u8>,
    oob: Vec<u8>,
    sent: Vec<(Vec<u8>, SocketAddr)>,
    pub connected_to: Option<SocketAddr>,
    shutdown_read: bool,
    shutdown_write: bool,
}

impl MockSocket {
    pub fn new(family: Family) -> Self {
        let local = match family {
            Family::V4 => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
            Family::V6 => SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, 0, 0, 0)),
        };
        Self {
            family,
            fd: NEXT_FD.fetch_add(1, Ordering::Relaxed),
            local,
            read_script: VecDeque::new(),
            write_script: VecDeque::new(),
            oob_script: VecDeque::new(),
            recv_script: VecDeque::new(),
            send_script: VecDeque::new(),
            readv_offered: Vec::new(),
            written: Vec::new(),
            oob: Vec::new(),
            sent: Vec::new(),
            connected_to: None,
            shutdown_read: false,
            shutdown_write: false,
        }
    }

    pub fn push_read(&mut self, result: Result<Vec<u8>, ScriptErr>) {
        self.read_script.push_back(result);
    }

    pub fn push_write(&mut self, result: Result<usize, ScriptErr>) {
        self.write_script.push_back(result);
    }

    pub fn push_oob(&mut self, result: Result<usize, ScriptErr>) {
        self.oob_script.push_back(result);
    }

    pub fn push_recv(&mut self, result: Result<(Vec<u8>, SocketAddr), ScriptErr>) {
        self.recv_script.push_back(result);
    }

    pub fn push_send(&mut self, result: Result<usize, ScriptErr>) {
        self.send_script.push_back(result);
    }

    /// Total iov capacity offered to each readv call.
    pub fn readv_offered(&self) -> &[usize] {
        &self.readv_offered
    }

    /// Everything written through the normal path, concatenated.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// Everything sent out-of-band, concatenated.
    pub fn oob(&self) -> &[u8] {
        &self.oob
    }

    pub fn sent(&self) -> &[(Vec<u8>, SocketAddr)] {
        &self.sent
    }

    pub fn shutdown_read_called(&self) -> bool {
        self.shutdown_read
    }

    pub fn shutdown_write_called(&self) -> bool {
        self.shutdown_write
    }
}

impl HostSocket for MockSocket {
    fn family(&self) -> Family {
        self.family
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        self.connected_to = Some(addr);
        Ok(())
    }

    fn readv(&mut self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let capacity: usize = bufs.iter().map(|b| b.len()).sum();
        self.readv_offered.push(capacity);
        let data = match self.read_script.pop_front() {
            Some(Ok(data)) => data,
            Some(Err(e)) => return Err(e.into_io()),
            None => return Err(io::ErrorKind::WouldBlock.into()),
        };
        let mut copied = 0;
        for buf in bufs.iter_mut() {
            if copied == data.len() {
                break;
            }
            let n = buf.len().min(data.len() - copied);
            buf[..n].copy_from_slice(&data[copied..copied + n]);
            copied += n;
        }
        Ok(copied)
    }

    fn writev(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let limit = match self.write_script.pop_front() {
            Some(Ok(limit)) => limit,
            Some(Err(e)) => return Err(e.into_io()),
            None => usize::MAX,
        };
        let mut taken = 0;
        for buf in bufs {
            if taken == limit {
                break;
            }
            let n = buf.len().min(limit - taken);
            self.written.extend_from_slice(&buf[..n]);
            taken += n;
        }
        Ok(taken)
    }

    fn send_oob(&mut self, buf: &[u8]) -> io::Result<usize> {
        let limit = match self.oob_script.pop_front() {
            Some(Ok(limit)) => limit,
            Some(Err(e)) => return Err(e.into_io()),
            None => usize::MAX,
        };
        let n = buf.len().min(limit);
        self.oob.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (data, peer) = match self.recv_script.pop_front() {
            Some(Ok(entry)) => entry,
            Some(Err(e)) => return Err(e.into_io()),
            None => return Err(io::ErrorKind::WouldBlock.into()),
        };
        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, peer))
    }

    fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        match self.send_script.pop_front() {
            Some(Err(e)) => return Err(e.into_io()),
            Some(Ok(_)) | None => {}
        }
        self.sent.push((buf.to_vec(), addr));
        Ok(buf.len())
    }

    fn available(&self) -> io::Result<usize> {
        // FIONREAD reports the size of the next queued datagram.
        match self.recv_script.front() {
            Some(Ok((data, _))) => Ok(data.len()),
            _ => Ok(0),
        }
    }

    fn shutdown_read(&mut self) -> io::Result<()> {
        self.shutdown_read = true;
        Ok(())
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown_write = true;
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

/// Backend handing out mock sockets. Pre-scripted sockets can be queued;
/// otherwise fresh ones are created on demand.
#[derive(Debug, Default)]
pub struct MockBackend {
    /// Sockets to hand out next, in order.
    pub queue: VecDeque<MockSocket>,
    /// Datagram descriptors created, in order.
    pub created: Vec<(Family, DgramProto)>,
    /// Stream descriptors created, in order.
    pub streams_created: Vec<Family>,
    /// Ports passed to `listen_loopback`, in order.
    pub listened: Vec<u16>,
    /// Make the next bind fail, as an occupied port would.
    pub fail_listen: bool,
}

impl MockBackend {
    fn next_socket(&mut self, family: Family) -> MockSocket {
        match self.queue.pop_front() {
            Some(mut sock) => {
                sock.family = family;
                sock
            }
            None => MockSocket::new(family),
        }
    }
}

impl HostBackend for MockBackend {
    type Socket = MockSocket;

    fn stream(&mut self, family: Family) -> io::Result<MockSocket> {
        self.streams_created.push(family);
        Ok(self.next_socket(family))
    }

    fn datagram(&mut self, family: Family, proto: DgramProto) -> io::Result<MockSocket> {
        self.created.push((family, proto));
        Ok(self.next_socket(family))
    }

    fn listen_loopback(&mut self, family: Family, port: u16) -> io::Result<MockSocket> {
        if self.fail_listen {
            return Err(io::ErrorKind::AddrInUse.into());
        }
        self.listened.push(port);
        let mut sock = self.next_socket(family);
        sock.local = match family {
            Family::V4 => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)),
            Family::V6 => SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, port, 0, 0)),
        };
        Ok(sock)
    }
}

/// TCP collaborator that records every notification.
#[derive(Debug, Default)]
pub struct RecordingTcp {
    pub(crate) next: u32,
    /// MSS reported for every control block; zero disables alignment.
    pub mss: usize,
    pub closed: Vec<TcpToken>,
    pub urgent: Vec<(TcpToken, usize)>,
    pub shortened: Vec<TcpToken>,
}

impl TcpCollaborator for RecordingTcp {
    fn new_control(&mut self) -> TcpToken {
        let token = TcpToken(self.next);
        self.next += 1;
        token
    }

    fn max_segment_size(&self, _token: TcpToken) -> usize {
        self.mss
    }

    fn socket_closed(&mut self, token: TcpToken) {
        self.closed.push(token);
    }

    fn mark_urgent(&mut self, token: TcpToken, pending: usize) {
        self.urgent.push((token, pending));
    }

    fn shorten_keepalive(&mut self, token: TcpToken) {
        self.shortened.push(token);
    }
}

/// Guest output sink that keeps everything it is handed.
#[derive(Debug, Default)]
pub struct RecordingOutput {
    pub udp4: Vec<(FlowHandle, Vec<u8>, SocketAddrV4)>,
    pub udp6: Vec<(FlowHandle, Vec<u8>, SocketAddrV6, SocketAddrV6)>,
    pub icmp4: Vec<(Vec<u8>, Ipv4Addr, Ipv4Addr)>,
    pub icmp6: Vec<(Vec<u8>, Ipv6Addr, Ipv6Addr)>,
    pub reflected: Vec<(FlowHandle, Vec<u8>)>,
}

impl GuestOutput for RecordingOutput {
    fn udp_v4(&mut self, flow: FlowHandle, packet: PacketBuffer, peer: SocketAddrV4) {
        self.udp4.push((flow, packet.data().to_vec(), peer));
    }

    fn udp_v6(
        &mut self,
        flow: FlowHandle,
        packet: PacketBuffer,
        src: SocketAddrV6,
        dst: SocketAddrV6,
    ) {
        self.udp6.push((flow, packet.data().to_vec(), src, dst));
    }

    fn icmp_v4(&mut self, packet: PacketBuffer, src: Ipv4Addr, dst: Ipv4Addr) {
        self.icmp4.push((packet.data().to_vec(), src, dst));
    }

    fn icmp_v6(&mut self, packet: PacketBuffer, src: Ipv6Addr, dst: Ipv6Addr) {
        self.icmp6.push((packet.data().to_vec(), src, dst));
    }

    fn reflect_icmp(&mut self, flow: FlowHandle, trigger: PacketBuffer) {
        self.reflected.push((flow, trigger.data().to_vec()));
    }
}

/// Forwarding policy with no redirections.
#[derive(Debug, Default)]
pub struct NoRules;

impl ForwardRules for NoRules {
    fn redirect(&self, _dst: SocketAddrV4) -> Option<SocketAddrV4> {
        None
    }
}

/// Forwarding policy backed by an explicit map.
#[derive(Debug, Default)]
pub struct MapRules(pub HashMap<SocketAddrV4, SocketAddrV4>);

impl ForwardRules for MapRules {
    fn redirect(&self, dst: SocketAddrV4) -> Option<SocketAddrV4> {
        self.0.get(&dst).copied()
    }
}
