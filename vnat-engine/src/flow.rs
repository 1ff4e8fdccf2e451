//! Flow records and the lifecycle state machine.
//!
//! A [`Flow`] is one virtual connection or datagram pseudo-session. Its
//! lifecycle is a closed set of phases plus one orthogonal drain flag;
//! every transition goes through a named method here, so illegal
//! combinations (e.g. both directions closed but still selectable) cannot
//! be produced from call sites.

use std::net::SocketAddr;

use crate::config::Millis;
use crate::engine::InterestSet;
use crate::host::{DgramProto, Family, HostSocket};
use crate::pktbuf::PacketBuffer;
use crate::ring::RingBuffer;

/// Opaque handle to a TCP control block owned by the TCP collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpToken(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Tcp,
    Udp,
    Icmp,
}

impl FlowKind {
    pub fn dgram_proto(&self) -> DgramProto {
        match self {
            FlowKind::Icmp => DgramProto::Icmp,
            _ => DgramProto::Udp,
        }
    }
}

/// Lifecycle phase. `HalfClosed` never has both sides set; that combination
/// is [`Phase::Dead`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Listening { accept_once: bool },
    Connecting,
    Connected,
    HalfClosed { recv_closed: bool, send_closed: bool },
    Dead,
}

#[derive(Debug)]
pub struct Flow<S> {
    pub kind: FlowKind,
    /// Family of the host descriptor; can change mid-life when a
    /// translation reattaches the flow across the IPv4/IPv6 boundary.
    pub family: Family,
    /// Guest-side address of the flow.
    pub local: SocketAddr,
    /// Remote address as the guest sees it.
    pub foreign: SocketAddr,
    phase: Phase,
    forward_drain: bool,
    pub socket: Option<S>,
    /// Bytes read from the host, headed for the guest.
    pub to_guest: RingBuffer,
    /// Bytes from the guest, headed for the host.
    pub from_guest: RingBuffer,
    pub tcp: Option<TcpToken>,
    /// Idle teardown deadline; `None` for non-expirable flows (listeners,
    /// streams).
    pub expiry: Option<Millis>,
    /// Urgent bytes queued at the front of `from_guest`.
    pub urgent: usize,
    /// The guest packet that opened the flow, retained for error replies.
    pub trigger: Option<PacketBuffer>,
    /// Host-side forwarded port, set only on listeners.
    pub host_port: Option<u16>,
}

impl<S: HostSocket> Flow<S> {
    pub fn stream(local: SocketAddr, foreign: SocketAddr, capacity: usize) -> Self {
        Self {
            kind: FlowKind::Tcp,
            family: Family::of(&foreign),
            local,
            foreign,
            phase: Phase::Connecting,
            forward_drain: false,
            socket: None,
            to_guest: RingBuffer::new(capacity),
            from_guest: RingBuffer::new(capacity),
            tcp: None,
            expiry: None,
            urgent: 0,
            trigger: None,
            host_port: None,
        }
    }

    pub fn datagram(kind: FlowKind, local: SocketAddr, foreign: SocketAddr) -> Self {
        Self {
            kind,
            family: Family::of(&foreign),
            local,
            foreign,
            phase: Phase::Connecting,
            forward_drain: false,
            socket: None,
            to_guest: RingBuffer::empty(),
            from_guest: RingBuffer::empty(),
            tcp: None,
            expiry: None,
            urgent: 0,
            trigger: None,
            host_port: None,
        }
    }

    /// Listener flow for a forwarded port: no data buffers, only a control
    /// block placeholder and the host binding.
    pub fn listener(local: SocketAddr, accept_once: bool) -> Self {
        Self {
            kind: FlowKind::Tcp,
            family: Family::of(&local),
            local,
            foreign: local,
            phase: Phase::Listening { accept_once },
            forward_drain: false,
            socket: None,
            to_guest: RingBuffer::empty(),
            from_guest: RingBuffer::empty(),
            tcp: None,
            expiry: None,
            urgent: 0,
            trigger: None,
            host_port: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_dead(&self) -> bool {
        self.phase == Phase::Dead
    }

    pub fn is_listening(&self) -> bool {
        matches!(self.phase, Phase::Listening { .. })
    }

    pub fn forward_drain(&self) -> bool {
        self.forward_drain
    }

    pub fn recv_closed(&self) -> bool {
        matches!(
            self.phase,
            Phase::HalfClosed {
                recv_closed: true,
                ..
            } | Phase::Dead
        )
    }

    pub fn send_closed(&self) -> bool {
        matches!(
            self.phase,
            Phase::HalfClosed {
                send_closed: true,
                ..
            } | Phase::Dead
        )
    }

    /// A connect has been started on the host descriptor.
    pub fn mark_connecting(&mut self) {
        self.phase = Phase::Connecting;
        self.forward_drain = false;
    }

    /// The host side is established (or, for datagram flows, the first send
    /// went out and the descriptor is now readiness-eligible).
    pub fn mark_connected(&mut self) {
        self.phase = Phase::Connected;
        self.forward_drain = false;
    }

    /// The host will deliver no more data. Half-closes the read side of a
    /// live descriptor and drops its write interest for the rest of the
    /// tick. If the send side is already closed the flow is dead.
    pub fn mark_receive_closed(&mut self, interest: &mut InterestSet) {
        if self.phase != Phase::Dead {
            if let Some(sock) = self.socket.as_mut() {
                let _ = sock.shutdown_read();
                interest.unwatch_write(sock.raw_fd());
            }
        }
        self.phase = match self.phase {
            Phase::Dead
            | Phase::HalfClosed {
                send_closed: true, ..
            } => Phase::Dead,
            _ => Phase::HalfClosed {
                recv_closed: true,
                send_closed: false,
            },
        };
    }

    /// The host will accept no more data. Symmetric to
    /// [`mark_receive_closed`](Self::mark_receive_closed).
    pub fn mark_send_closed(&mut self, interest: &mut InterestSet) {
        if self.phase != Phase::Dead {
            if let Some(sock) = self.socket.as_mut() {
                let _ = sock.shutdown_write();
                interest.unwatch_read(sock.raw_fd());
                interest.unwatch_oob(sock.raw_fd());
            }
        }
        self.phase = match self.phase {
            Phase::Dead
            | Phase::HalfClosed {
                recv_closed: true, ..
            } => Phase::Dead,
            _ => Phase::HalfClosed {
                recv_closed: false,
                send_closed: true,
            },
        };
    }

    /// Close the send side once everything buffered has been flushed.
    pub fn enter_forward_drain(&mut self, interest: &mut InterestSet) {
        if self.from_guest.is_empty() {
            self.mark_send_closed(interest);
        } else {
            self.forward_drain = true;
        }
    }

    /// Read interest for the next poll round. Stream flows only want data
    /// while their guest-bound buffer has room; that is the engine's whole
    /// back-pressure story.
    pub fn wants_read(&self) -> bool {
        if self.socket.is_none() {
            return false;
        }
        match self.phase {
            Phase::Listening { .. } => true,
            Phase::Connected
            | Phase::HalfClosed {
                recv_closed: false, ..
            } => match self.kind {
                FlowKind::Tcp => self.to_guest.free_space() > 0,
                _ => true,
            },
            _ => false,
        }
    }

    /// Write interest: a stream with queued or urgent data, or a connect in
    /// flight.
    pub fn wants_write(&self) -> bool {
        if self.socket.is_none() || self.kind != FlowKind::Tcp {
            return false;
        }
        match self.phase {
            Phase::Connecting => true,
            Phase::Connected
            | Phase::HalfClosed {
                send_closed: false, ..
            } => self.from_guest.pending() > 0 || self.urgent > 0,
            _ => false,
        }
    }

    /// Exceptional-condition (urgent data) interest.
    pub fn wants_oob(&self) -> bool {
        if self.socket.is_none() || self.kind != FlowKind::Tcp {
            return false;
        }
        matches!(
            self.phase,
            Phase::Connected
                | Phase::HalfClosed {
                    recv_closed: false,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::MockSocket;

    fn stream_flow() -> Flow<MockSocket> {
        let mut flow = Flow::stream(
            "10.0.2.15:4000".parse().unwrap(),
            "93.184.216.34:80".parse().unwrap(),
            64,
        );
        flow.socket = Some(MockSocket::new(Family::V4));
        flow.mark_connected();
        flow
    }

    #[test]
    fn test_half_close_then_other_side_is_dead() {
        let mut interest = InterestSet::default();
        let mut flow = stream_flow();

        flow.mark_receive_closed(&mut interest);
        assert!(flow.recv_closed());
        assert!(!flow.is_dead());

        flow.mark_send_closed(&mut interest);
        assert!(flow.is_dead());
    }

    #[test]
    fn test_send_close_first_then_receive_close_is_dead() {
        let mut interest = InterestSet::default();
        let mut flow = stream_flow();

        flow.mark_send_closed(&mut interest);
        assert!(flow.send_closed());
        assert!(!flow.is_dead());

        flow.mark_receive_closed(&mut interest);
        assert!(flow.is_dead());
    }

    #[test]
    fn test_half_close_shuts_down_descriptor_side() {
        let mut interest = InterestSet::default();
        let mut flow = stream_flow();
        flow.mark_receive_closed(&mut interest);
        assert!(flow.socket.as_ref().unwrap().shutdown_read_called());
        flow.mark_send_closed(&mut interest);
        assert!(flow.socket.as_ref().unwrap().shutdown_write_called());
    }

    #[test]
    fn test_forward_drain_with_empty_buffer_closes_immediately() {
        let mut interest = InterestSet::default();
        let mut flow = stream_flow();
        flow.enter_forward_drain(&mut interest);
        assert!(flow.send_closed());
        assert!(!flow.forward_drain());
    }

    #[test]
    fn test_forward_drain_with_pending_data_waits() {
        let mut interest = InterestSet::default();
        let mut flow = stream_flow();
        flow.from_guest.append(b"pending");
        flow.enter_forward_drain(&mut interest);
        assert!(!flow.send_closed());
        assert!(flow.forward_drain());
    }

    #[test]
    fn test_reconnect_clears_drain_flag() {
        let mut interest = InterestSet::default();
        let mut flow = stream_flow();
        flow.from_guest.append(b"x");
        flow.enter_forward_drain(&mut interest);
        assert!(flow.forward_drain());
        flow.mark_connected();
        assert!(!flow.forward_drain());
    }

    #[test]
    fn test_back_pressure_gates_read_interest() {
        let mut flow = stream_flow();
        assert!(flow.wants_read());
        let free = flow.to_guest.free_space();
        flow.to_guest.append(&vec![0u8; free]);
        assert!(!flow.wants_read());
    }

    #[test]
    fn test_write_interest_needs_data_or_connect() {
        let mut flow = stream_flow();
        assert!(!flow.wants_write());
        flow.from_guest.append(b"x");
        assert!(flow.wants_write());

        let mut connecting = stream_flow();
        connecting.mark_connecting();
        assert!(connecting.wants_write());
    }

    #[test]
    fn test_dead_flow_wants_nothing() {
        let mut interest = InterestSet::default();
        let mut flow = stream_flow();
        flow.mark_receive_closed(&mut interest);
        flow.mark_send_closed(&mut interest);
        assert!(!flow.wants_read());
        assert!(!flow.wants_write());
        assert!(!flow.wants_oob());
    }
}
