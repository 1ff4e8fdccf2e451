//! DNS name encoding and the AAAA query rewriter.
//!
//! The rewriter exists for one narrow purpose: a service name that is not
//! reachable over pure IPv6 can be silently replaced with a reachable alias
//! of identical encoded length, so no offsets inside the packet shift and
//! nothing else needs re-parsing. Both names are fixed at startup.

use crate::host::Family;

/// Well-known DNS port; flows talking to it get the short expiry window.
pub const DNS_PORT: u16 = 53;

/// AAAA resource record type.
const TYPE_AAAA: u16 = 28;

/// Offset of the query name inside a DNS message.
const NAME_OFFSET: usize = 12;

/// Encode a domain name into its wire form: each label preceded by its
/// length byte, terminated by a zero byte. `"a.bc.com"` becomes
/// `[1 a 2 b c 3 c o m 0]`, always `name.len() + 2` bytes.
pub fn encode_name(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

/// In-place rewriter for AAAA queries and their replies.
#[derive(Debug, Clone)]
pub struct DnsRewrite {
    old: Vec<u8>,
    new: Vec<u8>,
}

impl DnsRewrite {
    /// Build a rewriter from the two names. Length equality is validated
    /// here, once, so the packet path can overwrite bytes without shifting
    /// anything; a mismatch refuses to enable the feature instead of
    /// failing later.
    pub fn new(old_name: &str, new_name: &str) -> Result<Self, crate::error::ConfigError> {
        let old = encode_name(old_name);
        let new = encode_name(new_name);
        if old.len() != new.len() {
            return Err(crate::error::ConfigError::NameLengthMismatch {
                old: old.len(),
                new: new.len(),
            });
        }
        Ok(Self { old, new })
    }

    /// Rewrite a query on its way to the host resolver.
    pub fn rewrite_outbound(&self, family: Family, foreign_port: u16, data: &mut [u8]) -> bool {
        Self::apply(family, foreign_port, data, &self.old, &self.new)
    }

    /// Restore the original name in a reply on its way to the guest.
    pub fn rewrite_inbound(&self, family: Family, foreign_port: u16, data: &mut [u8]) -> bool {
        Self::apply(family, foreign_port, data, &self.new, &self.old)
    }

    fn apply(family: Family, foreign_port: u16, data: &mut [u8], src: &[u8], dst: &[u8]) -> bool {
        // Only DNS traffic on the IPv6 path is eligible.
        if foreign_port != DNS_PORT || family == Family::V4 {
            return false;
        }
        let end = NAME_OFFSET + src.len();
        if data.len() < end + 2 {
            return false;
        }
        if &data[NAME_OFFSET..end] != src {
            return false;
        }
        let qtype = u16::from_be_bytes([data[end], data[end + 1]]);
        if qtype != TYPE_AAAA {
            return false;
        }
        data[NAME_OFFSET..end].copy_from_slice(dst);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OLD: &str = "android.clients.google.com";
    const NEW: &str = "androidhack.googleapis.com";

    /// DNS header + encoded query name + qtype/qclass.
    fn query(name: &str, qtype: u16) -> Vec<u8> {
        let mut pkt = vec![0u8; NAME_OFFSET];
        pkt[0] = 0xab; // txid
        pkt[1] = 0xcd;
        pkt.extend_from_slice(&encode_name(name));
        pkt.extend_from_slice(&qtype.to_be_bytes());
        pkt.extend_from_slice(&1u16.to_be_bytes()); // IN
        pkt
    }

    #[test]
    fn test_encode_name() {
        assert_eq!(
            encode_name("a.bc.com"),
            vec![1, b'a', 2, b'b', b'c', 3, b'c', b'o', b'm', 0]
        );
        assert_eq!(encode_name("a.bc.com").len(), "a.bc.com".len() + 2);
    }

    #[test]
    fn test_mismatched_lengths_refused() {
        assert!(DnsRewrite::new(OLD, "tiny.example").is_err());
    }

    #[test]
    fn test_aaaa_query_is_rewritten_in_place() {
        let rw = DnsRewrite::new(OLD, NEW).unwrap();
        let mut pkt = query(OLD, TYPE_AAAA);
        let len_before = pkt.len();
        assert!(rw.rewrite_outbound(Family::V6, DNS_PORT, &mut pkt));
        assert_eq!(pkt.len(), len_before);
        assert_eq!(&pkt[NAME_OFFSET..NAME_OFFSET + NEW.len() + 2], &encode_name(NEW)[..]);
    }

    #[test]
    fn test_a_query_left_alone() {
        let rw = DnsRewrite::new(OLD, NEW).unwrap();
        let mut pkt = query(OLD, 1);
        let before = pkt.clone();
        assert!(!rw.rewrite_outbound(Family::V6, DNS_PORT, &mut pkt));
        assert_eq!(pkt, before);
    }

    #[test]
    fn test_other_port_left_alone() {
        let rw = DnsRewrite::new(OLD, NEW).unwrap();
        let mut pkt = query(OLD, TYPE_AAAA);
        let before = pkt.clone();
        assert!(!rw.rewrite_outbound(Family::V6, 5353, &mut pkt));
        assert_eq!(pkt, before);
    }

    #[test]
    fn test_ipv4_path_left_alone() {
        let rw = DnsRewrite::new(OLD, NEW).unwrap();
        let mut pkt = query(OLD, TYPE_AAAA);
        assert!(!rw.rewrite_outbound(Family::V4, DNS_PORT, &mut pkt));
    }

    #[test]
    fn test_short_packet_left_alone() {
        let rw = DnsRewrite::new(OLD, NEW).unwrap();
        let mut pkt = vec![0u8; NAME_OFFSET + 4];
        assert!(!rw.rewrite_outbound(Family::V6, DNS_PORT, &mut pkt));
    }

    #[test]
    fn test_inbound_restores_original_name() {
        let rw = DnsRewrite::new(OLD, NEW).unwrap();
        let mut pkt = query(OLD, TYPE_AAAA);
        rw.rewrite_outbound(Family::V6, DNS_PORT, &mut pkt);
        assert!(rw.rewrite_inbound(Family::V6, DNS_PORT, &mut pkt));
        assert_eq!(pkt, query(OLD, TYPE_AAAA));
    }
}
