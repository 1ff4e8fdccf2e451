//! Per-packet transfer for UDP and ICMP flows, plus the listen/unlisten
//! mechanism behind inbound port forwarding.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use tracing::{debug, info, trace, warn};

use crate::dns::DNS_PORT;
use crate::engine::{Activity, Ctx, Nat, TcpCollaborator};
use crate::error::EngineError;
use crate::flow::{Flow, FlowKind};
use crate::host::{Family, HostBackend, HostSocket, is_transient};
use crate::icmp;
use crate::pktbuf::{DGRAM_ROOM, HEADROOM_V4, HEADROOM_V6, PacketBuffer};
use crate::table::FlowHandle;
use crate::translate;

/// Receive buffer for ping replies; echo payloads are small.
const ICMP_RECV_ROOM: usize = 256;

/// What the receive path decided while the flow was borrowed.
enum RecvOutcome {
    Nothing,
    Delivered(usize),
    /// Hard receive failure: synthesize an error from this, then detach.
    Failed(std::io::Error),
    /// ICMP reply reflected; the one-shot flow is done.
    Reflected,
}

impl<B: HostBackend> Nat<B> {
    /// A datagram descriptor is readable. ICMP flows reflect one reply and
    /// are done; UDP flows forward the payload to the guest. A hard receive
    /// failure turns into a protocol-level unreachable reply and immediate
    /// teardown.
    pub fn receive_datagram(
        &mut self,
        handle: FlowHandle,
        ctx: &mut Ctx<'_>,
    ) -> Result<Activity, EngineError> {
        let flow = self
            .datagrams
            .get_mut(handle)
            .ok_or(EngineError::StaleHandle)?;

        let outcome = match flow.kind {
            FlowKind::Icmp => {
                let sock = flow.socket.as_mut().ok_or(EngineError::NoDescriptor)?;
                let mut buf = [0u8; ICMP_RECV_ROOM];
                match sock.recv_from(&mut buf) {
                    Ok((n, _peer)) => {
                        trace!(n, "ping reply from host");
                        if let Some(trigger) = flow.trigger.take() {
                            ctx.output.reflect_icmp(handle, trigger);
                        }
                        RecvOutcome::Reflected
                    }
                    Err(e) if is_transient(&e) => RecvOutcome::Nothing,
                    Err(e) => RecvOutcome::Failed(e),
                }
            }
            _ => {
                let headroom = match Family::of(&flow.foreign) {
                    Family::V4 => HEADROOM_V4,
                    Family::V6 => HEADROOM_V6,
                };
                let mut pkt = PacketBuffer::with_headroom(headroom, DGRAM_ROOM);
                let sock = flow.socket.as_mut().ok_or(EngineError::NoDescriptor)?;
                // Size the buffer to what the descriptor reports; DNS answers
                // and QUIC-ish payloads can exceed the default room.
                let avail = sock.available().unwrap_or(0);
                if avail > pkt.free_room() {
                    pkt.grow(headroom + avail);
                }
                match sock.recv_from(pkt.write_area()) {
                    Ok((n, peer)) => {
                        pkt.set_len(n);
                        if let Some(rewrite) = &self.rewrite {
                            rewrite.rewrite_inbound(
                                flow.family,
                                flow.foreign.port(),
                                pkt.data_mut(),
                            );
                        }
                        if flow.expiry.is_some() {
                            let window = if flow.foreign.port() == DNS_PORT {
                                self.cfg.expire_fast_ms
                            } else {
                                self.cfg.expire_ms
                            };
                            flow.expiry = Some(ctx.now + window);
                        }
                        let n = pkt.len();
                        deliver_to_guest(&self.translator, flow, handle, pkt, peer, ctx);
                        RecvOutcome::Delivered(n)
                    }
                    Err(e) if is_transient(&e) => RecvOutcome::Nothing,
                    Err(e) => RecvOutcome::Failed(e),
                }
            }
        };

        match outcome {
            RecvOutcome::Nothing => Ok(Activity::None),
            RecvOutcome::Delivered(n) => Ok(Activity::Read(n)),
            RecvOutcome::Reflected => {
                self.datagrams.remove(handle);
                Ok(Activity::Detached)
            }
            RecvOutcome::Failed(e) => {
                debug!(error = %e, "datagram receive failed, replying unreachable");
                self.reply_unreachable(handle, &e, ctx);
                self.datagrams.remove(handle);
                Ok(Activity::Detached)
            }
        }
    }

    /// Send one guest datagram to the host side: translate the destination,
    /// consult the forwarding policy, reattach the descriptor family if the
    /// translation crossed the IPv4/IPv6 boundary, apply the outbound DNS
    /// rewrite, then `sendto`. Failures are returned without retry.
    pub fn send_datagram(
        &mut self,
        handle: FlowHandle,
        pkt: &mut PacketBuffer,
        ctx: &mut Ctx<'_>,
    ) -> Result<(), EngineError> {
        let flow = self
            .datagrams
            .get_mut(handle)
            .ok_or(EngineError::StaleHandle)?;

        let (mut addr, _special) = self.translator.translate_outbound(flow.family, flow.foreign);
        if let SocketAddr::V4(v4) = addr {
            if let Some(redirected) = ctx.rules.redirect(v4) {
                info!(
                    now = ctx.now,
                    src = %flow.local,
                    original = %v4,
                    redirected = %redirected,
                    "redirected UDP destination"
                );
                addr = SocketAddr::V4(redirected);
            }
        }

        translate::ensure_family(flow, Family::of(&addr), &mut self.backend)?;
        if let Some(rewrite) = &self.rewrite {
            rewrite.rewrite_outbound(flow.family, flow.foreign.port(), pkt.data_mut());
        }

        let sock = flow.socket.as_mut().ok_or(EngineError::NoDescriptor)?;
        sock.send_to(pkt.data(), addr)?;
        trace!(n = pkt.len(), to = %addr, "datagram sent");

        if flow.expiry.is_some() {
            flow.expiry = Some(ctx.now + self.cfg.expire_ms);
        }
        // Readiness-eligible from now on: the reply will come to this
        // descriptor.
        flow.mark_connected();
        Ok(())
    }

    /// Bind a host loopback listener for an inbound forwarded port. The
    /// flow carries no data buffers, only a control-block placeholder; the
    /// guest-visible peer is the alias address at the bound port.
    pub fn listen(
        &mut self,
        port: u16,
        local_addr: Ipv4Addr,
        local_port: u16,
        accept_once: bool,
        ipv6: bool,
        tcp: &mut dyn TcpCollaborator,
    ) -> Result<FlowHandle, EngineError> {
        let family = if ipv6 { Family::V6 } else { Family::V4 };
        let sock = self.backend.listen_loopback(family, port)?;
        let bound = sock.local_addr()?;

        let token = tcp.new_control();
        if accept_once {
            tcp.shorten_keepalive(token);
        }

        let mut flow = Flow::listener(
            SocketAddr::V4(SocketAddrV4::new(local_addr, local_port)),
            accept_once,
        );
        flow.family = family;
        flow.tcp = Some(token);
        flow.host_port = Some(port);
        flow.foreign = SocketAddr::V4(SocketAddrV4::new(self.translator.alias_v4(), bound.port()));
        flow.socket = Some(sock);

        info!(port, bound = %bound, accept_once, "forwarded port listening");
        Ok(self.streams.insert(flow))
    }

    /// Remove the listener bound to `port`. Idempotent: a missing listener
    /// is not-found, not an error.
    pub fn unlisten(&mut self, port: u16, ctx: &mut Ctx<'_>) -> bool {
        let found = self
            .streams
            .handles()
            .into_iter()
            .find(|&h| {
                self.streams
                    .get(h)
                    .is_some_and(|flow| flow.host_port == Some(port))
            });
        let Some(handle) = found else {
            debug!(port, "unlisten: no listener on port");
            return false;
        };
        if let Some(flow) = self.streams.get_mut(handle) {
            flow.mark_receive_closed(ctx.interest);
            flow.mark_send_closed(ctx.interest);
        }
        self.streams.remove(handle);
        info!(port, "forwarded port removed");
        true
    }

    /// Build and emit the family-appropriate unreachable reply from the
    /// packet that opened the flow.
    fn reply_unreachable(&mut self, handle: FlowHandle, err: &std::io::Error, ctx: &mut Ctx<'_>) {
        let Some(flow) = self.datagrams.get_mut(handle) else {
            return;
        };
        let Some(trigger) = flow.trigger.take() else {
            warn!(local = %flow.local, "no trigger packet, dropping error reply");
            return;
        };
        // The guest-facing family decides which protocol speaks.
        match flow.local {
            SocketAddr::V4(_) => {
                if let Some((pkt, src, dst)) = icmp::unreachable_v4(trigger.data(), err) {
                    ctx.output.icmp_v4(pkt, src, dst);
                }
            }
            SocketAddr::V6(_) => {
                if let Some((pkt, src, dst)) = icmp::unreachable_v6(trigger.data(), err) {
                    ctx.output.icmp_v6(pkt, src, dst);
                }
            }
        }
    }
}

/// Hand a received datagram to the guest-side output for its family. An
/// IPv6 source inside the virtual prefix keeps the flow's foreign address
/// as the apparent sender, so the guest sees a consistent virtual peer.
fn deliver_to_guest<S: HostSocket>(
    translator: &crate::translate::AddressTranslator,
    flow: &Flow<S>,
    handle: FlowHandle,
    pkt: PacketBuffer,
    peer: SocketAddr,
    ctx: &mut Ctx<'_>,
) {
    match (flow.foreign, flow.local) {
        (SocketAddr::V4(_), _) => {
            let src = match peer {
                SocketAddr::V4(v4) => v4,
                SocketAddr::V6(v6) => {
                    // Host answered over IPv6 for a v4-facing flow (a DNS
                    // reroute); present the flow's own peer to the guest.
                    trace!(peer = %v6, "v6 peer on v4-facing flow");
                    match flow.foreign {
                        SocketAddr::V4(f) => SocketAddrV4::new(*f.ip(), v6.port()),
                        SocketAddr::V6(_) => return,
                    }
                }
            };
            ctx.output.udp_v4(handle, pkt, src);
        }
        (SocketAddr::V6(foreign), SocketAddr::V6(local)) => {
            let peer_port = peer.port();
            let src_ip = match peer {
                SocketAddr::V6(v6) if !translator.in_virtual_prefix(foreign.ip()) => *v6.ip(),
                // Inside the virtual prefix the guest must keep seeing the
                // virtual peer it addressed.
                _ => *foreign.ip(),
            };
            let src = SocketAddrV6::new(src_ip, peer_port, 0, 0);
            let dst = SocketAddrV6::new(*local.ip(), local.port(), 0, 0);
            ctx.output.udp_v6(handle, pkt, src, dst);
        }
        (SocketAddr::V6(_), SocketAddr::V4(_)) => {
            debug!("mismatched flow families, dropping datagram");
        }
    }
}
