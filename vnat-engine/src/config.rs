//! Startup configuration for the NAT engine.
//!
//! All values are fixed for the lifetime of the engine. Validation happens
//! once in [`NatConfig::validate`]; packet-processing paths never re-check
//! these invariants.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use ipnet::Ipv6Net;
use serde::Deserialize;

use crate::dns::encode_name;
use crate::error::ConfigError;

/// Milliseconds of the event loop's tick clock.
pub type Millis = u64;

/// Idle teardown window for datagram flows.
pub const EXPIRE_MS: Millis = 240_000;

/// Shortened window for DNS flows, which are almost always one-shot.
pub const EXPIRE_FAST_MS: Millis = 10_000;

/// Engine configuration, deserializable from the node's config store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatConfig {
    /// Base address of the virtual /24 the guest lives in.
    pub special_net: Ipv4Addr,
    /// Low byte of the gateway alias inside the virtual /24.
    pub alias_low: u8,
    /// Low byte of the first DNS alias inside the virtual /24.
    pub dns_low: u8,
    /// Real resolver addresses backing the DNS aliases, in alias order.
    pub dns_servers: Vec<SocketAddr>,
    /// Virtual IPv6 prefix recognized for loopback redirection.
    pub virtual_prefix: Ipv6Net,
    /// Rewrite AAAA queries for `dns_rewrite_old` into `dns_rewrite_new`.
    pub dns_rewrite: bool,
    pub dns_rewrite_old: String,
    pub dns_rewrite_new: String,
    /// Idle teardown window for datagram flows.
    pub expire_ms: Millis,
    /// Shortened teardown window for DNS flows.
    pub expire_fast_ms: Millis,
    /// Capacity of each per-flow stream ring buffer.
    pub stream_capacity: usize,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            special_net: Ipv4Addr::new(10, 0, 2, 0),
            alias_low: 2,
            dns_low: 3,
            dns_servers: Vec::new(),
            virtual_prefix: Ipv6Net::new(Ipv6Addr::new(0xfec0, 0, 0, 0, 0, 0, 0, 0), 64)
                .expect("prefix length is within bounds"),
            dns_rewrite: false,
            dns_rewrite_old: String::new(),
            dns_rewrite_new: String::new(),
            expire_ms: EXPIRE_MS,
            expire_fast_ms: EXPIRE_FAST_MS,
            stream_capacity: 32 * 1024,
        }
    }
}

impl NatConfig {
    /// Check the invariants the packet paths rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.special_net.octets()[3] != 0 {
            return Err(ConfigError::BadSpecialNet(self.special_net));
        }
        if self.stream_capacity == 0 {
            return Err(ConfigError::ZeroStreamCapacity);
        }
        if self.dns_rewrite {
            let old = encode_name(&self.dns_rewrite_old);
            let new = encode_name(&self.dns_rewrite_new);
            if old.len() != new.len() {
                return Err(ConfigError::NameLengthMismatch {
                    old: old.len(),
                    new: new.len(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        NatConfig::default().validate().unwrap();
    }

    #[test]
    fn test_rewrite_length_mismatch_is_rejected() {
        let cfg = NatConfig {
            dns_rewrite: true,
            dns_rewrite_old: "android.clients.google.com".into(),
            dns_rewrite_new: "short.example".into(),
            ..NatConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NameLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_zero_stream_capacity_is_rejected() {
        let cfg = NatConfig {
            stream_capacity: 0,
            ..NatConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::ZeroStreamCapacity)
        ));
    }

    #[test]
    fn test_special_net_must_be_aligned() {
        let cfg = NatConfig {
            special_net: Ipv4Addr::new(10, 0, 2, 15),
            ..NatConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::BadSpecialNet(_))));
    }
}
