//! Virtual-address translation: the NAT policy core.
//!
//! The guest talks to reserved addresses inside its virtual subnet (the
//! gateway, the DNS aliases); before anything reaches a host socket those
//! must be mapped onto real endpoints. IPv6 destinations inside the virtual
//! prefix collapse onto the host loopback the same way.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use ipnet::Ipv6Net;
use tracing::trace;

use crate::config::NatConfig;
use crate::flow::Flow;
use crate::host::{Family, HostBackend, HostSocket};

#[derive(Debug, Clone)]
pub struct AddressTranslator {
    special_net: Ipv4Addr,
    alias_low: u8,
    dns_low: u8,
    dns_servers: Vec<SocketAddr>,
    virtual_prefix: Ipv6Net,
}

impl AddressTranslator {
    pub fn new(cfg: &NatConfig) -> Self {
        Self {
            special_net: cfg.special_net,
            alias_low: cfg.alias_low,
            dns_low: cfg.dns_low,
            dns_servers: cfg.dns_servers.clone(),
            virtual_prefix: cfg.virtual_prefix,
        }
    }

    /// The guest-visible alias address for host-side endpoints.
    pub fn alias_v4(&self) -> Ipv4Addr {
        let mut octets = self.special_net.octets();
        octets[3] = self.alias_low;
        Ipv4Addr::from(octets)
    }

    pub fn in_virtual_prefix(&self, ip: &Ipv6Addr) -> bool {
        self.virtual_prefix.contains(ip)
    }

    fn in_special_net(&self, ip: &Ipv4Addr) -> bool {
        ip.octets()[..3] == self.special_net.octets()[..3]
    }

    /// Map a destination onto its real host endpoint. Returns the translated
    /// address and whether a mapping applied. The port is always preserved;
    /// `family` selects which loopback a non-DNS special address lands on.
    pub fn translate_outbound(&self, family: Family, addr: SocketAddr) -> (SocketAddr, bool) {
        match addr {
            SocketAddr::V4(v4) => {
                if !self.in_special_net(v4.ip()) {
                    return (addr, false);
                }
                let low = v4.ip().octets()[3];
                let slot = low.checked_sub(self.dns_low).map(usize::from);
                if let Some(server) = slot.and_then(|i| self.dns_servers.get(i)) {
                    let mapped = with_port(*server, v4.port());
                    trace!(from = %addr, to = %mapped, "translated DNS alias");
                    (mapped, true)
                } else {
                    (loopback(family, v4.port()), true)
                }
            }
            SocketAddr::V6(v6) => {
                if self.in_virtual_prefix(v6.ip()) {
                    (loopback(family, v6.port()), true)
                } else {
                    (addr, false)
                }
            }
        }
    }
}

fn with_port(addr: SocketAddr, port: u16) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) => SocketAddr::V4(SocketAddrV4::new(*v4.ip(), port)),
        SocketAddr::V6(v6) => SocketAddr::V6(SocketAddrV6::new(*v6.ip(), port, 0, 0)),
    }
}

fn loopback(family: Family, port: u16) -> SocketAddr {
    match family {
        Family::V4 => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)),
        Family::V6 => SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::LOCALHOST, port, 0, 0)),
    }
}

/// Make the flow's datagram descriptor match `family`, replacing it when a
/// translation has crossed the IPv4/IPv6 boundary (a DNS answer can reroute
/// the next query to a host IPv6 resolver; `sendto` then needs an IPv6
/// descriptor).
pub fn ensure_family<B: HostBackend>(
    flow: &mut Flow<B::Socket>,
    family: Family,
    backend: &mut B,
) -> io::Result<()> {
    if let Some(sock) = &flow.socket {
        if sock.family() == family {
            return Ok(());
        }
    }
    // Dropping the previous descriptor closes it.
    flow.socket = Some(backend.datagram(family, flow.kind.dgram_proto())?);
    flow.family = family;
    Ok(())
}
