//! User-mode NAT engine for virtualized guests.
//!
//! Multiplexes guest TCP/UDP/ICMP traffic onto ordinary unprivileged host
//! sockets: no tun/tap device, no elevated privileges. The engine is a
//! single-threaded core driven by an external event loop; it owns the flow
//! tables, ring buffers and NAT policy, and talks to its surroundings
//! through narrow collaborator traits (TCP control blocks, guest packet
//! output, forwarding rules, host sockets).

pub mod config;
pub mod datagram;
pub mod dns;
pub mod engine;
pub mod error;
pub mod expiry;
pub mod flow;
pub mod host;
pub mod icmp;
pub mod pktbuf;
pub mod ring;
pub mod stream;
pub mod table;
pub mod test_util;
pub mod translate;

pub use config::{Millis, NatConfig};
pub use dns::{DNS_PORT, DnsRewrite, encode_name};
pub use engine::{
    Activity, Ctx, ForwardRules, GuestOutput, InterestSet, Nat, TcpCollaborator,
};
pub use error::{ConfigError, EngineError};
pub use flow::{Flow, FlowKind, Phase, TcpToken};
pub use host::{DgramProto, Family, HostBackend, HostSocket, SysBackend, SysSocket, is_transient};
pub use pktbuf::PacketBuffer;
pub use ring::RingBuffer;
pub use stream::{MAX_URGENT, Transfer};
pub use table::{FlowClass, FlowHandle, FlowTable};
pub use translate::AddressTranslator;
