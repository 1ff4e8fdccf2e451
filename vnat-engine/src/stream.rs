//! Byte-stream transfer between ring buffers and host sockets.
//!
//! These paths run only when the owning event loop reports readiness, so a
//! would-block result is a no-op rather than an error. An orderly
//! zero-length read and a hard error both drive the half-close state
//! machine and notify the TCP collaborator; the difference is only in the
//! log line.

use std::io::{self, IoSlice, IoSliceMut};
use std::net::SocketAddr;

use tracing::{debug, trace};

use crate::engine::{InterestSet, TcpCollaborator};
use crate::error::EngineError;
use crate::flow::Flow;
use crate::host::{Family, HostBackend, HostSocket, is_transient};

/// Cap on bytes moved through the out-of-band path in one call.
pub const MAX_URGENT: usize = 2048;

/// Result of one data-path invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Bytes moved this call; zero when nothing happened (would-block,
    /// empty buffer).
    Bytes(usize),
    /// The transfer direction is gone; the state machine has advanced and
    /// the TCP collaborator has been told.
    Closed,
}

/// Open a non-blocking stream descriptor and start connecting it to `addr`.
/// An in-progress connect is success; completion is observed as write
/// readiness.
pub fn connect<B: HostBackend>(
    flow: &mut Flow<B::Socket>,
    addr: SocketAddr,
    backend: &mut B,
) -> io::Result<()> {
    let family = Family::of(&addr);
    let mut sock = backend.stream(family)?;
    sock.connect(addr)?;
    flow.family = family;
    flow.socket = Some(sock);
    flow.mark_connecting();
    Ok(())
}

/// Pull bytes from the host descriptor into the guest-bound ring buffer.
/// Spans are segment-aligned so the TCP collaborator emits full segments.
pub fn read_from_host<S: HostSocket>(
    flow: &mut Flow<S>,
    interest: &mut InterestSet,
    tcp: &mut dyn TcpCollaborator,
) -> Transfer {
    let mss = flow.tcp.map(|t| tcp.max_segment_size(t)).unwrap_or(0);
    let free = flow.to_guest.free_space();
    if free == 0 {
        return Transfer::Bytes(0);
    }
    let result = {
        let Some(sock) = flow.socket.as_mut() else {
            return Transfer::Bytes(0);
        };
        let (a, b) = flow.to_guest.writable_regions_aligned(free, mss);
        if a.is_empty() && b.is_empty() {
            return Transfer::Bytes(0);
        }
        let niov = if b.is_empty() { 1 } else { 2 };
        let mut iov = [IoSliceMut::new(a), IoSliceMut::new(b)];
        sock.readv(&mut iov[..niov])
    };
    match result {
        Ok(0) => {
            debug!(foreign = %flow.foreign, "host closed the read side");
            receive_gone(flow, interest, tcp)
        }
        Ok(n) => {
            flow.to_guest.commit_write(n);
            trace!(n, "read from host");
            Transfer::Bytes(n)
        }
        Err(e) if is_transient(&e) => Transfer::Bytes(0),
        Err(e) => {
            debug!(foreign = %flow.foreign, error = %e, "host read failed");
            receive_gone(flow, interest, tcp)
        }
    }
}

/// Host read variant for exceptional readiness: urgent bytes arrive inline,
/// so this is a normal read followed by telling the collaborator how much
/// of the guest-bound buffer is now urgent.
pub fn read_urgent_from_host<S: HostSocket>(
    flow: &mut Flow<S>,
    interest: &mut InterestSet,
    tcp: &mut dyn TcpCollaborator,
) -> Transfer {
    let transfer = read_from_host(flow, interest, tcp);
    if transfer != Transfer::Closed {
        if let Some(token) = flow.tcp {
            tcp.mark_urgent(token, flow.to_guest.pending());
        }
    }
    transfer
}

/// Push pending guest bytes to the host descriptor, urgent data first.
pub fn write_to_host<S: HostSocket>(
    flow: &mut Flow<S>,
    interest: &mut InterestSet,
    tcp: &mut dyn TcpCollaborator,
) -> Transfer {
    if flow.urgent > 0 {
        match send_urgent(flow) {
            Ok(_) => {
                if flow.from_guest.is_empty() {
                    return Transfer::Bytes(0);
                }
            }
            Err(e) if is_transient(&e) => return Transfer::Bytes(0),
            Err(e) => {
                debug!(foreign = %flow.foreign, error = %e, "urgent send failed");
                return send_gone(flow, interest, tcp);
            }
        }
    }

    let pending = flow.from_guest.pending();
    if pending == 0 {
        return Transfer::Bytes(0);
    }
    let result = {
        let Some(sock) = flow.socket.as_mut() else {
            return Transfer::Bytes(0);
        };
        let (a, b) = flow.from_guest.readable_regions(pending);
        let niov = if b.is_empty() { 1 } else { 2 };
        let iov = [IoSlice::new(a), IoSlice::new(b)];
        sock.writev(&iov[..niov])
    };
    match result {
        Err(e) if is_transient(&e) => Transfer::Bytes(0),
        Ok(n) if n > 0 => {
            flow.from_guest.commit_read(n);
            trace!(n, "wrote to host");
            if flow.forward_drain() && flow.from_guest.is_empty() {
                flow.mark_send_closed(interest);
            }
            Transfer::Bytes(n)
        }
        Ok(_) => {
            debug!(foreign = %flow.foreign, "host rejected the write");
            send_gone(flow, interest, tcp)
        }
        Err(e) => {
            debug!(foreign = %flow.foreign, error = %e, "host write failed");
            send_gone(flow, interest, tcp)
        }
    }
}

/// Copy a linear host-side buffer into the guest-bound ring through the
/// aligned-span path. Room was promised by an earlier readiness check; if
/// it no longer suffices the flow's receive side is taken down, exactly as
/// for a hard read failure.
pub fn inject_to_guest<S: HostSocket>(
    flow: &mut Flow<S>,
    data: &[u8],
    interest: &mut InterestSet,
    tcp: &mut dyn TcpCollaborator,
) -> Result<(), EngineError> {
    let mss = flow.tcp.map(|t| tcp.max_segment_size(t)).unwrap_or(0);
    match flow.to_guest.copy_in(data, mss) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!(foreign = %flow.foreign, error = %e, "guest-bound copy overran its room");
            receive_gone(flow, interest, tcp);
            Err(e)
        }
    }
}

/// Stage up to [`MAX_URGENT`] pending bytes linearly (the ring may wrap)
/// and push them out-of-band. Cursors advance by what was actually sent,
/// never more.
fn send_urgent<S: HostSocket>(flow: &mut Flow<S>) -> io::Result<usize> {
    let cap = flow.urgent.min(MAX_URGENT).min(flow.from_guest.pending());
    let mut staging = [0u8; MAX_URGENT];
    let want = flow.from_guest.peek(0, &mut staging[..cap]);
    if want == 0 {
        flow.urgent = 0;
        return Ok(0);
    }
    let sock = flow
        .socket
        .as_mut()
        .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
    let n = sock.send_oob(&staging[..want])?;
    flow.from_guest.commit_read(n);
    flow.urgent = flow.urgent.saturating_sub(n);
    trace!(n, left = flow.urgent, "sent urgent data");
    Ok(n)
}

fn receive_gone<S: HostSocket>(
    flow: &mut Flow<S>,
    interest: &mut InterestSet,
    tcp: &mut dyn TcpCollaborator,
) -> Transfer {
    flow.mark_receive_closed(interest);
    if let Some(token) = flow.tcp {
        tcp.socket_closed(token);
    }
    Transfer::Closed
}

fn send_gone<S: HostSocket>(
    flow: &mut Flow<S>,
    interest: &mut InterestSet,
    tcp: &mut dyn TcpCollaborator,
) -> Transfer {
    flow.mark_send_closed(interest);
    if let Some(token) = flow.tcp {
        tcp.socket_closed(token);
    }
    Transfer::Closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::TcpToken;
    use crate::test_util::{MockSocket, RecordingTcp, ScriptErr};

    fn flow_with(capacity: usize, sock: MockSocket) -> Flow<MockSocket> {
        let mut flow = Flow::stream(
            "10.0.2.15:4000".parse().unwrap(),
            "93.184.216.34:80".parse().unwrap(),
            capacity,
        );
        flow.tcp = Some(TcpToken(7));
        flow.socket = Some(sock);
        flow.mark_connected();
        flow
    }

    #[test]
    fn test_read_commits_into_guest_ring() {
        let mut sock = MockSocket::new(Family::V4);
        sock.push_read(Ok(b"hello".to_vec()));
        let mut flow = flow_with(64, sock);
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp::default();

        assert_eq!(
            read_from_host(&mut flow, &mut interest, &mut tcp),
            Transfer::Bytes(5)
        );
        let mut out = [0u8; 8];
        assert_eq!(flow.to_guest.read_into(&mut out), 5);
        assert_eq!(&out[..5], b"hello");
    }

    #[test]
    fn test_read_offers_segment_aligned_room() {
        let mut sock = MockSocket::new(Family::V4);
        sock.push_read(Ok(vec![0u8; 10]));
        let mut flow = flow_with(10, sock);
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp {
            mss: 4,
            ..RecordingTcp::default()
        };

        // A contiguous run of 10 is trimmed to 8 before the read.
        assert_eq!(
            read_from_host(&mut flow, &mut interest, &mut tcp),
            Transfer::Bytes(8)
        );
        assert_eq!(flow.socket.as_ref().unwrap().readv_offered(), &[8]);
    }

    #[test]
    fn test_transient_read_is_a_no_op() {
        let mut sock = MockSocket::new(Family::V4);
        sock.push_read(Err(ScriptErr::WouldBlock));
        sock.push_read(Err(ScriptErr::Interrupted));
        let mut flow = flow_with(64, sock);
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp::default();

        for _ in 0..2 {
            assert_eq!(
                read_from_host(&mut flow, &mut interest, &mut tcp),
                Transfer::Bytes(0)
            );
        }
        assert!(!flow.recv_closed());
        assert!(tcp.closed.is_empty());
    }

    #[test]
    fn test_orderly_close_drives_half_close_and_notifies() {
        let mut sock = MockSocket::new(Family::V4);
        sock.push_read(Ok(Vec::new()));
        let mut flow = flow_with(64, sock);
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp::default();

        assert_eq!(
            read_from_host(&mut flow, &mut interest, &mut tcp),
            Transfer::Closed
        );
        assert!(flow.recv_closed());
        assert_eq!(tcp.closed, vec![TcpToken(7)]);
        assert!(flow.socket.as_ref().unwrap().shutdown_read_called());
    }

    #[test]
    fn test_hard_read_error_closes_receive_side() {
        let mut sock = MockSocket::new(Family::V4);
        sock.push_read(Err(ScriptErr::Raw(nix::libc::ECONNRESET)));
        let mut flow = flow_with(64, sock);
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp::default();

        assert_eq!(
            read_from_host(&mut flow, &mut interest, &mut tcp),
            Transfer::Closed
        );
        assert!(flow.recv_closed());
    }

    #[test]
    fn test_write_drains_pending_bytes() {
        let mut flow = flow_with(64, MockSocket::new(Family::V4));
        flow.from_guest.append(b"payload");
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp::default();

        assert_eq!(
            write_to_host(&mut flow, &mut interest, &mut tcp),
            Transfer::Bytes(7)
        );
        assert_eq!(flow.socket.as_ref().unwrap().written(), b"payload");
        assert!(flow.from_guest.is_empty());
    }

    #[test]
    fn test_partial_write_keeps_remainder_queued() {
        let mut sock = MockSocket::new(Family::V4);
        sock.push_write(Ok(3));
        let mut flow = flow_with(64, sock);
        flow.from_guest.append(b"payload");
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp::default();

        assert_eq!(
            write_to_host(&mut flow, &mut interest, &mut tcp),
            Transfer::Bytes(3)
        );
        assert_eq!(flow.from_guest.pending(), 4);
    }

    #[test]
    fn test_urgent_bytes_go_out_of_band_first() {
        let mut flow = flow_with(64, MockSocket::new(Family::V4));
        flow.from_guest.append(b"abcdef");
        flow.urgent = 3;
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp::default();

        assert_eq!(
            write_to_host(&mut flow, &mut interest, &mut tcp),
            Transfer::Bytes(3)
        );
        let sock = flow.socket.as_ref().unwrap();
        assert_eq!(sock.oob(), b"abc");
        assert_eq!(sock.written(), b"def");
        assert_eq!(flow.urgent, 0);
    }

    #[test]
    fn test_urgent_drain_returns_without_normal_write() {
        let mut flow = flow_with(64, MockSocket::new(Family::V4));
        flow.from_guest.append(b"abc");
        flow.urgent = 3;
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp::default();

        assert_eq!(
            write_to_host(&mut flow, &mut interest, &mut tcp),
            Transfer::Bytes(0)
        );
        let sock = flow.socket.as_ref().unwrap();
        assert_eq!(sock.oob(), b"abc");
        assert!(sock.written().is_empty());
    }

    #[test]
    fn test_urgent_staging_crosses_the_wrap() {
        let mut flow = flow_with(8, MockSocket::new(Family::V4));
        // Push the cursors so the next append wraps.
        flow.from_guest.append(&[0u8; 6]);
        let mut sink = [0u8; 6];
        flow.from_guest.read_into(&mut sink);
        flow.from_guest.append(b"wrap");
        flow.urgent = 4;
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp::default();

        write_to_host(&mut flow, &mut interest, &mut tcp);
        assert_eq!(flow.socket.as_ref().unwrap().oob(), b"wrap");
    }

    #[test]
    fn test_forward_drain_completion_closes_send_side() {
        let mut flow = flow_with(64, MockSocket::new(Family::V4));
        flow.from_guest.append(b"last");
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp::default();
        flow.enter_forward_drain(&mut interest);
        assert!(flow.forward_drain());

        assert_eq!(
            write_to_host(&mut flow, &mut interest, &mut tcp),
            Transfer::Bytes(4)
        );
        assert!(flow.send_closed());
        // Drain completion is not an error: no close notification.
        assert!(tcp.closed.is_empty());
    }

    #[test]
    fn test_write_failure_closes_send_side() {
        let mut sock = MockSocket::new(Family::V4);
        sock.push_write(Err(ScriptErr::Raw(nix::libc::EPIPE)));
        let mut flow = flow_with(64, sock);
        flow.from_guest.append(b"x");
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp::default();

        assert_eq!(
            write_to_host(&mut flow, &mut interest, &mut tcp),
            Transfer::Closed
        );
        assert!(flow.send_closed());
        assert_eq!(tcp.closed, vec![TcpToken(7)]);
    }

    #[test]
    fn test_inject_overrun_takes_down_receive_side() {
        let mut flow = flow_with(8, MockSocket::new(Family::V4));
        flow.to_guest.append(&[0u8; 6]);
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp::default();

        let err = inject_to_guest(&mut flow, &[0u8; 4], &mut interest, &mut tcp).unwrap_err();
        assert!(matches!(err, EngineError::BufferTooSmall { .. }));
        assert!(flow.recv_closed());
        assert_eq!(tcp.closed, vec![TcpToken(7)]);
    }

    #[test]
    fn test_inject_fits_and_reads_back() {
        let mut flow = flow_with(16, MockSocket::new(Family::V4));
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp::default();

        inject_to_guest(&mut flow, b"proxied", &mut interest, &mut tcp).unwrap();
        let mut out = [0u8; 8];
        assert_eq!(flow.to_guest.read_into(&mut out), 7);
        assert_eq!(&out[..7], b"proxied");
    }

    #[test]
    fn test_read_urgent_marks_collaborator() {
        let mut sock = MockSocket::new(Family::V4);
        sock.push_read(Ok(b"urg".to_vec()));
        let mut flow = flow_with(64, sock);
        let mut interest = InterestSet::default();
        let mut tcp = RecordingTcp::default();

        read_urgent_from_host(&mut flow, &mut interest, &mut tcp);
        assert_eq!(tcp.urgent, vec![(TcpToken(7), 3)]);
    }
}
