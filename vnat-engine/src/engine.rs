//! The NAT engine: flow tables, collaborator seams and the entry points
//! the owning event loop calls on readiness.
//!
//! The engine is single-threaded and never blocks: every host descriptor is
//! non-blocking and every entry point runs to completion within the call.
//! The loop samples the clock once per tick and passes it in, along with
//! its fd-interest bookkeeping, so there is no process-wide mutable state
//! behind these APIs.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

use tracing::debug;

use crate::config::{Millis, NatConfig};
use crate::dns::DnsRewrite;
use crate::error::{ConfigError, EngineError};
use crate::flow::{Flow, FlowKind, Phase, TcpToken};
use crate::host::{Family, HostBackend, HostSocket};
use crate::pktbuf::PacketBuffer;
use crate::stream::{self, MAX_URGENT, Transfer};
use crate::table::{FlowClass, FlowHandle, FlowTable};
use crate::translate::AddressTranslator;

/// TCP control-block collaborator. The engine never owns control blocks; it
/// holds opaque tokens and reports events through this seam.
pub trait TcpCollaborator {
    fn new_control(&mut self) -> TcpToken;
    /// Path MSS for segment-aligned buffer preparation.
    fn max_segment_size(&self, token: TcpToken) -> usize;
    /// The host side of the connection closed (orderly or hard).
    fn socket_closed(&mut self, token: TcpToken);
    /// `pending` guest-bound bytes are urgent, ending at the urgent pointer.
    fn mark_urgent(&mut self, token: TcpToken, pending: usize);
    /// One-shot-accept forwarding sockets must time out quickly.
    fn shorten_keepalive(&mut self, token: TcpToken);
}

/// Sink for fully formed packets headed to the guest.
pub trait GuestOutput {
    fn udp_v4(&mut self, flow: FlowHandle, packet: PacketBuffer, peer: SocketAddrV4);
    fn udp_v6(
        &mut self,
        flow: FlowHandle,
        packet: PacketBuffer,
        src: SocketAddrV6,
        dst: SocketAddrV6,
    );
    /// ICMP error message; `src`/`dst` are the addresses for the IP header
    /// wrapped around it.
    fn icmp_v4(&mut self, packet: PacketBuffer, src: Ipv4Addr, dst: Ipv4Addr);
    fn icmp_v6(&mut self, packet: PacketBuffer, src: Ipv6Addr, dst: Ipv6Addr);
    /// Reflect a guest echo request whose host-side ping got an answer.
    fn reflect_icmp(&mut self, flow: FlowHandle, trigger: PacketBuffer);
}

/// Configured port-redirection hook, consulted on every outbound datagram.
pub trait ForwardRules {
    fn redirect(&self, dst: SocketAddrV4) -> Option<SocketAddrV4>;
}

/// Per-tick descriptor interest, owned by the event loop and passed into
/// every entry point. Half-close transitions drop the interest of the side
/// that is gone so the remainder of the tick skips it.
#[derive(Debug, Default)]
pub struct InterestSet {
    read: HashSet<RawFd>,
    write: HashSet<RawFd>,
    oob: HashSet<RawFd>,
}

impl InterestSet {
    pub fn clear(&mut self) {
        self.read.clear();
        self.write.clear();
        self.oob.clear();
    }

    pub fn watch_read(&mut self, fd: RawFd) {
        self.read.insert(fd);
    }

    pub fn watch_write(&mut self, fd: RawFd) {
        self.write.insert(fd);
    }

    pub fn watch_oob(&mut self, fd: RawFd) {
        self.oob.insert(fd);
    }

    pub fn unwatch_read(&mut self, fd: RawFd) {
        self.read.remove(&fd);
    }

    pub fn unwatch_write(&mut self, fd: RawFd) {
        self.write.remove(&fd);
    }

    pub fn unwatch_oob(&mut self, fd: RawFd) {
        self.oob.remove(&fd);
    }

    pub fn is_read_watched(&self, fd: RawFd) -> bool {
        self.read.contains(&fd)
    }

    pub fn is_write_watched(&self, fd: RawFd) -> bool {
        self.write.contains(&fd)
    }

    pub fn is_oob_watched(&self, fd: RawFd) -> bool {
        self.oob.contains(&fd)
    }
}

/// Call-scoped context threaded through the data paths: the tick clock, the
/// loop's interest set, and the collaborators.
pub struct Ctx<'a> {
    pub now: Millis,
    pub interest: &'a mut InterestSet,
    pub tcp: &'a mut dyn TcpCollaborator,
    pub output: &'a mut dyn GuestOutput,
    pub rules: &'a dyn ForwardRules,
}

/// What an entry point did with the readiness it was handed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Nothing happened this tick.
    None,
    /// Bytes moved guest-ward.
    Read(usize),
    /// Bytes moved host-ward.
    Wrote(usize),
    /// A forwarded-port listener has a host connection pending accept.
    AcceptReady,
    /// One direction of a stream closed; the flow stays for its half-close
    /// sequence.
    Closed,
    /// The flow was torn down; the handle is now stale.
    Detached,
}

pub struct Nat<B: HostBackend> {
    pub(crate) cfg: NatConfig,
    pub(crate) backend: B,
    pub(crate) translator: AddressTranslator,
    pub(crate) rewrite: Option<DnsRewrite>,
    pub(crate) streams: FlowTable<B::Socket>,
    pub(crate) datagrams: FlowTable<B::Socket>,
}

impl<B: HostBackend> Nat<B> {
    pub fn new(cfg: NatConfig, backend: B) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let rewrite = if cfg.dns_rewrite {
            Some(DnsRewrite::new(&cfg.dns_rewrite_old, &cfg.dns_rewrite_new)?)
        } else {
            None
        };
        Ok(Self {
            translator: AddressTranslator::new(&cfg),
            rewrite,
            cfg,
            backend,
            streams: FlowTable::new(FlowClass::Stream),
            datagrams: FlowTable::new(FlowClass::Datagram),
        })
    }

    pub fn config(&self) -> &NatConfig {
        &self.cfg
    }

    // ----- flow creation and lookup -------------------------------------

    /// Track a new guest TCP connection. The host descriptor is opened by
    /// [`connect_stream`](Self::connect_stream).
    pub fn stream_flow(
        &mut self,
        local: SocketAddr,
        foreign: SocketAddr,
        tcp: &mut dyn TcpCollaborator,
    ) -> FlowHandle {
        let mut flow = Flow::stream(local, foreign, self.cfg.stream_capacity);
        flow.tcp = Some(tcp.new_control());
        self.streams.insert(flow)
    }

    /// Track a new guest UDP pseudo-session. `trigger` is the datagram that
    /// opened the flow, retained for error replies.
    pub fn datagram_flow(
        &mut self,
        local: SocketAddr,
        foreign: SocketAddr,
        trigger: PacketBuffer,
        now: Millis,
    ) -> Result<FlowHandle, EngineError> {
        self.new_datagram_flow(FlowKind::Udp, local, foreign, trigger, now)
    }

    /// Track a guest ping. The host side is an unprivileged ICMP socket.
    pub fn icmp_flow(
        &mut self,
        local: SocketAddr,
        foreign: SocketAddr,
        trigger: PacketBuffer,
        now: Millis,
    ) -> Result<FlowHandle, EngineError> {
        self.new_datagram_flow(FlowKind::Icmp, local, foreign, trigger, now)
    }

    fn new_datagram_flow(
        &mut self,
        kind: FlowKind,
        local: SocketAddr,
        foreign: SocketAddr,
        trigger: PacketBuffer,
        now: Millis,
    ) -> Result<FlowHandle, EngineError> {
        let family = Family::of(&foreign);
        let sock = self.backend.datagram(family, kind.dgram_proto())?;
        let mut flow = Flow::datagram(kind, local, foreign);
        flow.socket = Some(sock);
        flow.trigger = Some(trigger);
        flow.expiry = Some(now + self.cfg.expire_ms);
        Ok(self.datagrams.insert(flow))
    }

    pub fn lookup_stream(
        &mut self,
        local: &SocketAddr,
        foreign: Option<&SocketAddr>,
    ) -> Option<FlowHandle> {
        self.streams.lookup(local, foreign)
    }

    pub fn lookup_datagram(
        &mut self,
        local: &SocketAddr,
        foreign: Option<&SocketAddr>,
    ) -> Option<FlowHandle> {
        self.datagrams.lookup(local, foreign)
    }

    pub fn flow(&self, handle: FlowHandle) -> Option<&Flow<B::Socket>> {
        match handle.class() {
            FlowClass::Stream => self.streams.get(handle),
            FlowClass::Datagram => self.datagrams.get(handle),
        }
    }

    pub fn flow_mut(&mut self, handle: FlowHandle) -> Option<&mut Flow<B::Socket>> {
        match handle.class() {
            FlowClass::Stream => self.streams.get_mut(handle),
            FlowClass::Datagram => self.datagrams.get_mut(handle),
        }
    }

    /// Snapshot of every live flow handle, streams first.
    pub fn poll_handles(&self) -> Vec<FlowHandle> {
        let mut handles = self.streams.handles();
        handles.extend(self.datagrams.handles());
        handles
    }

    /// Tear a flow down now: unlink it and release buffers and descriptor.
    pub fn detach(&mut self, handle: FlowHandle) -> bool {
        let removed = match handle.class() {
            FlowClass::Stream => self.streams.remove(handle),
            FlowClass::Datagram => self.datagrams.remove(handle),
        };
        removed.is_some()
    }

    // ----- poll interest -------------------------------------------------

    pub fn wants_read(&self, handle: FlowHandle) -> bool {
        self.flow(handle).is_some_and(Flow::wants_read)
    }

    pub fn wants_write(&self, handle: FlowHandle) -> bool {
        self.flow(handle).is_some_and(Flow::wants_write)
    }

    pub fn wants_oob(&self, handle: FlowHandle) -> bool {
        self.flow(handle).is_some_and(Flow::wants_oob)
    }

    pub fn raw_fd(&self, handle: FlowHandle) -> Option<RawFd> {
        self.flow(handle)?.socket.as_ref().map(HostSocket::raw_fd)
    }

    /// Repopulate the loop's interest set from the current flow states.
    pub fn rebuild_interest(&self, interest: &mut InterestSet) {
        interest.clear();
        for handle in self.poll_handles() {
            let Some(flow) = self.flow(handle) else {
                continue;
            };
            let Some(fd) = flow.socket.as_ref().map(HostSocket::raw_fd) else {
                continue;
            };
            if flow.wants_read() {
                interest.watch_read(fd);
            }
            if flow.wants_write() {
                interest.watch_write(fd);
            }
            if flow.wants_oob() {
                interest.watch_oob(fd);
            }
        }
    }

    // ----- readiness entry points ---------------------------------------

    /// The host descriptor is readable.
    pub fn on_readable(
        &mut self,
        handle: FlowHandle,
        ctx: &mut Ctx<'_>,
    ) -> Result<Activity, EngineError> {
        match handle.class() {
            FlowClass::Datagram => self.receive_datagram(handle, ctx),
            FlowClass::Stream => {
                let flow = self.streams.get_mut(handle).ok_or(EngineError::StaleHandle)?;
                if flow.is_listening() {
                    return Ok(Activity::AcceptReady);
                }
                let transfer = stream::read_from_host(flow, ctx.interest, ctx.tcp);
                Ok(self.after_stream_transfer(handle, transfer, true))
            }
        }
    }

    /// The host descriptor reported exceptional (urgent-data) readiness.
    pub fn on_urgent_readable(
        &mut self,
        handle: FlowHandle,
        ctx: &mut Ctx<'_>,
    ) -> Result<Activity, EngineError> {
        let flow = self.streams.get_mut(handle).ok_or(EngineError::StaleHandle)?;
        let transfer = stream::read_urgent_from_host(flow, ctx.interest, ctx.tcp);
        Ok(self.after_stream_transfer(handle, transfer, true))
    }

    /// The host descriptor is writable. Completes an in-flight connect
    /// first, then flushes pending guest bytes.
    pub fn on_writable(
        &mut self,
        handle: FlowHandle,
        ctx: &mut Ctx<'_>,
    ) -> Result<Activity, EngineError> {
        if handle.class() == FlowClass::Datagram {
            return Ok(Activity::None);
        }
        let flow = self.streams.get_mut(handle).ok_or(EngineError::StaleHandle)?;
        if flow.is_listening() {
            return Ok(Activity::None);
        }
        if flow.phase() == Phase::Connecting {
            debug!(foreign = %flow.foreign, "host connect completed");
            flow.mark_connected();
        }
        let transfer = stream::write_to_host(flow, ctx.interest, ctx.tcp);
        Ok(self.after_stream_transfer(handle, transfer, false))
    }

    fn after_stream_transfer(
        &mut self,
        handle: FlowHandle,
        transfer: Transfer,
        reading: bool,
    ) -> Activity {
        let dead = self
            .streams
            .get(handle)
            .is_none_or(|flow| flow.is_dead());
        if dead {
            self.streams.remove(handle);
            return Activity::Detached;
        }
        match transfer {
            Transfer::Closed => Activity::Closed,
            Transfer::Bytes(0) => Activity::None,
            Transfer::Bytes(n) if reading => Activity::Read(n),
            Transfer::Bytes(n) => Activity::Wrote(n),
        }
    }

    // ----- stream-side services for the TCP collaborator ----------------

    /// Open the host descriptor for a stream flow and start connecting to
    /// its (translated) foreign address.
    pub fn connect_stream(&mut self, handle: FlowHandle) -> Result<(), EngineError> {
        let flow = self.streams.get_mut(handle).ok_or(EngineError::StaleHandle)?;
        let (addr, _) = self.translator.translate_outbound(flow.family, flow.foreign);
        stream::connect(flow, addr, &mut self.backend)?;
        Ok(())
    }

    /// Queue guest payload for the host side; returns how much fit.
    pub fn enqueue_from_guest(
        &mut self,
        handle: FlowHandle,
        data: &[u8],
    ) -> Result<usize, EngineError> {
        let flow = self.streams.get_mut(handle).ok_or(EngineError::StaleHandle)?;
        Ok(flow.from_guest.append(data))
    }

    /// Copy guest-bound bytes without consuming them; the collaborator
    /// releases them with [`consume_to_guest`](Self::consume_to_guest) once
    /// acknowledged.
    pub fn peek_to_guest(
        &self,
        handle: FlowHandle,
        offset: usize,
        out: &mut [u8],
    ) -> Result<usize, EngineError> {
        let flow = self.streams.get(handle).ok_or(EngineError::StaleHandle)?;
        Ok(flow.to_guest.peek(offset, out))
    }

    pub fn consume_to_guest(&mut self, handle: FlowHandle, n: usize) -> Result<(), EngineError> {
        let flow = self.streams.get_mut(handle).ok_or(EngineError::StaleHandle)?;
        let n = n.min(flow.to_guest.pending());
        flow.to_guest.commit_read(n);
        Ok(())
    }

    /// Inject host-side bytes (e.g. from a proxied connection) toward the
    /// guest through the aligned-span path.
    pub fn inject_to_guest(
        &mut self,
        handle: FlowHandle,
        data: &[u8],
        ctx: &mut Ctx<'_>,
    ) -> Result<(), EngineError> {
        let flow = self.streams.get_mut(handle).ok_or(EngineError::StaleHandle)?;
        stream::inject_to_guest(flow, data, ctx.interest, ctx.tcp)
    }

    /// The collaborator declares the first `n` pending guest bytes urgent.
    pub fn set_urgent(&mut self, handle: FlowHandle, n: usize) -> Result<(), EngineError> {
        let flow = self.streams.get_mut(handle).ok_or(EngineError::StaleHandle)?;
        flow.urgent = n.min(MAX_URGENT);
        Ok(())
    }

    /// The guest is done sending: close the host write side once the
    /// buffered bytes have drained.
    pub fn enter_forward_drain(
        &mut self,
        handle: FlowHandle,
        interest: &mut InterestSet,
    ) -> Result<(), EngineError> {
        let flow = self.streams.get_mut(handle).ok_or(EngineError::StaleHandle)?;
        flow.enter_forward_drain(interest);
        if flow.is_dead() {
            self.streams.remove(handle);
        }
        Ok(())
    }
}
