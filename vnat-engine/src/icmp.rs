//! ICMP/ICMPv6 unreachable synthesis from host error codes.
//!
//! When a host-side datagram operation fails hard, the guest still deserves
//! a protocol-level answer. The reply is built from the guest packet that
//! opened the flow: type/code from the host errno, body carrying the
//! original IP header plus the first payload bytes, addresses swapped so
//! the error appears to come from the unreachable destination.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    Icmpv4DstUnreachable, Icmpv4Packet, Icmpv4Repr, Icmpv6DstUnreachable, Icmpv6Packet,
    Icmpv6Repr, Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr,
};

use crate::pktbuf::{LINK_HEADROOM, PacketBuffer};

/// Bytes of the offending datagram echoed back in the error body.
const ERROR_PAYLOAD: usize = 8;

fn v4_reason(err: &io::Error) -> Icmpv4DstUnreachable {
    match err.raw_os_error() {
        Some(nix::libc::EHOSTUNREACH) => Icmpv4DstUnreachable::HostUnreachable,
        Some(nix::libc::ENETUNREACH) => Icmpv4DstUnreachable::NetUnreachable,
        _ => Icmpv4DstUnreachable::PortUnreachable,
    }
}

fn v6_reason(err: &io::Error) -> Icmpv6DstUnreachable {
    match err.raw_os_error() {
        Some(nix::libc::EHOSTUNREACH) => Icmpv6DstUnreachable::AddrUnreachable,
        Some(nix::libc::ENETUNREACH) => Icmpv6DstUnreachable::NoRoute,
        _ => Icmpv6DstUnreachable::PortUnreachable,
    }
}

/// Build an ICMP destination-unreachable message for the IPv4 packet in
/// `trigger`. Returns the message plus the source/destination for the IP
/// header the output collaborator will wrap around it. `None` when the
/// trigger cannot be parsed (nothing sensible can be synthesized).
pub fn unreachable_v4(
    trigger: &[u8],
    err: &io::Error,
) -> Option<(PacketBuffer, Ipv4Addr, Ipv4Addr)> {
    let packet = Ipv4Packet::new_checked(trigger).ok()?;
    let header = Ipv4Repr::parse(&packet, &ChecksumCapabilities::default()).ok()?;
    let payload = packet.payload();
    let data = &payload[..payload.len().min(ERROR_PAYLOAD)];

    let repr = Icmpv4Repr::DstUnreachable {
        reason: v4_reason(err),
        header,
        data,
    };
    let mut pkt = PacketBuffer::with_headroom(LINK_HEADROOM + 20, repr.buffer_len());
    let len = repr.buffer_len();
    let mut icmp = Icmpv4Packet::new_unchecked(&mut pkt.write_area()[..len]);
    repr.emit(&mut icmp, &ChecksumCapabilities::default());
    pkt.set_len(len);

    Some((pkt, header.dst_addr, header.src_addr))
}

/// IPv6 counterpart of [`unreachable_v4`]. The checksum covers the pseudo
/// header, so the same swapped addresses are baked in here and must be used
/// by the collaborator's IPv6 header.
pub fn unreachable_v6(
    trigger: &[u8],
    err: &io::Error,
) -> Option<(PacketBuffer, Ipv6Addr, Ipv6Addr)> {
    let packet = Ipv6Packet::new_checked(trigger).ok()?;
    let header = Ipv6Repr::parse(&packet).ok()?;
    let payload = packet.payload();
    let data = &payload[..payload.len().min(ERROR_PAYLOAD)];

    let src = header.dst_addr;
    let dst = header.src_addr;
    let repr = Icmpv6Repr::DstUnreachable {
        reason: v6_reason(err),
        header,
        data,
    };
    let mut pkt = PacketBuffer::with_headroom(LINK_HEADROOM + 40, repr.buffer_len());
    let len = repr.buffer_len();
    let mut icmp = Icmpv6Packet::new_unchecked(&mut pkt.write_area()[..len]);
    repr.emit(
        &src,
        &dst,
        &mut icmp,
        &ChecksumCapabilities::default(),
    );
    pkt.set_len(len);

    Some((pkt, src, dst))
}
