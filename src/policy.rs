//! Source-address admission policy: an ordered allow-list of IPv4 exact
//! addresses and CIDR ranges.
//!
//! IPv6 peers are never admitted: the current contract is IPv4 only,
//! extending it is left to a future policy version, not this one.

use ipnetwork::Ipv4Network;
use std::net::{IpAddr, Ipv4Addr};
use tracing::warn;

/// A single allow-list rule, either an exact address or a CIDR range.
///
/// `Cidr` carries `network` already masked: `network & mask == network` is
/// an invariant of every value produced by `parse`. This is what makes
/// `A.B.C.D/N` and `(A.B.C.D & mask_N)/N` produce the same acceptance
/// function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowRule {
    Exact(u32),
    Cidr { network: u32, mask: u32 },
}

impl AllowRule {
    /// Parse a single entry: `A.B.C.D` or `A.B.C.D/N`. Returns `None` on any
    /// malformed entry; callers are expected to log and drop it rather than
    /// fail startup.
    pub fn parse(entry: &str) -> Option<Self> {
        let entry = entry.trim();
        if entry.is_empty() {
            return None;
        }

        if entry.contains('/') {
            let network: Ipv4Network = entry.parse().ok()?;
            let prefix = network.prefix();
            let mask = mask_for_prefix(prefix)?;
            let addr_bits = u32::from(network.ip());
            Some(AllowRule::Cidr {
                network: addr_bits & mask,
                mask,
            })
        } else {
            let addr: Ipv4Addr = entry.parse().ok()?;
            Some(AllowRule::Exact(u32::from(addr)))
        }
    }

    /// Parse a comma-separated list of entries, dropping (with a warning)
    /// any entry that fails to parse. Never fails startup.
    pub fn parse_list(raw: &str) -> Vec<AllowRule> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|entry| match AllowRule::parse(entry) {
                Some(rule) => Some(rule),
                None => {
                    warn!("dropping unparseable ALLOWED_IPS entry: {entry:?}");
                    None
                }
            })
            .collect()
    }

    fn matches(&self, addr: u32) -> bool {
        match *self {
            AllowRule::Exact(a) => a == addr,
            AllowRule::Cidr { network, mask } => (addr & mask) == network,
        }
    }

    fn is_universal(&self) -> bool {
        matches!(self, AllowRule::Cidr { network: 0, mask: 0 })
    }
}

fn mask_for_prefix(prefix: u8) -> Option<u32> {
    if prefix > 32 {
        return None;
    }
    if prefix == 0 {
        Some(0)
    } else {
        Some(0xFFFF_FFFFu32 << (32 - prefix))
    }
}

/// Immutable, lock-free source-address policy built once at startup.
pub struct AddressPolicy {
    rules: Vec<AllowRule>,
}

impl AddressPolicy {
    pub fn new(rules: Vec<AllowRule>) -> Self {
        Self { rules }
    }

    /// Decide whether `addr` is admitted.
    ///
    /// An empty rule set allows everything (development convenience,
    /// documented and logged prominently at startup). A universal
    /// `0.0.0.0/0` rule anywhere in the set also allows everything.
    /// Non-IPv4 peers are always denied.
    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        if self.rules.iter().any(AllowRule::is_universal) {
            return true;
        }

        let IpAddr::V4(v4) = addr else {
            return false;
        };
        let bits = u32::from(v4);
        self.rules.iter().any(|rule| rule.matches(bits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_exact_address() {
        assert_eq!(
            AllowRule::parse("203.0.113.5"),
            Some(AllowRule::Exact(u32::from(Ipv4Addr::new(203, 0, 113, 5))))
        );
    }

    #[test]
    fn parses_cidr_and_normalizes_network() {
        // 10.0.0.5/8 should normalize the network portion to 10.0.0.0.
        let rule = AllowRule::parse("10.0.0.5/8").unwrap();
        assert_eq!(
            rule,
            AllowRule::Cidr {
                network: u32::from(Ipv4Addr::new(10, 0, 0, 0)),
                mask: 0xFF00_0000,
            }
        );
    }

    #[test]
    fn slash_zero_mask_is_zero() {
        let rule = AllowRule::parse("1.2.3.4/0").unwrap();
        assert_eq!(rule, AllowRule::Cidr { network: 0, mask: 0 });
    }

    #[test]
    fn drops_invalid_entries_without_failing() {
        let rules = AllowRule::parse_list("10.0.0.0/8, not-an-ip, 192.168.1.1, 1.2.3.4/99");
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn empty_rule_set_allows_everything() {
        let policy = AddressPolicy::new(vec![]);
        assert!(policy.is_allowed("203.0.113.5".parse().unwrap()));
    }

    #[test]
    fn universal_rule_allows_everything() {
        let policy = AddressPolicy::new(vec![AllowRule::Cidr { network: 0, mask: 0 }]);
        assert!(policy.is_allowed("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn cidr_slash_32_admits_only_exact_address() {
        let rule = AllowRule::parse("203.0.113.5/32").unwrap();
        let policy = AddressPolicy::new(vec![rule]);
        assert!(policy.is_allowed("203.0.113.5".parse().unwrap()));
        assert!(!policy.is_allowed("203.0.113.6".parse().unwrap()));
    }

    #[test]
    fn first_match_wins_among_rules() {
        let policy = AddressPolicy::new(vec![
            AllowRule::parse("10.0.0.0/8").unwrap(),
            AllowRule::parse("192.168.1.1").unwrap(),
        ]);
        assert!(policy.is_allowed("10.1.2.3".parse().unwrap()));
        assert!(policy.is_allowed("192.168.1.1".parse().unwrap()));
        assert!(!policy.is_allowed("203.0.113.5".parse().unwrap()));
    }

    #[test]
    fn ipv6_peer_is_always_denied() {
        let policy = AddressPolicy::new(vec![AllowRule::parse("10.0.0.0/8").unwrap()]);
        assert!(!policy.is_allowed("::1".parse().unwrap()));
    }

    #[test]
    fn canonicalization_invariant() {
        // A.B.C.D/N and (A.B.C.D & mask_N)/N must produce the same acceptance
        // function.
        let a = AllowRule::parse("172.16.5.200/12").unwrap();
        let b = AllowRule::parse("172.16.0.0/12").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn is_allowed_is_deterministic() {
        let policy = AddressPolicy::new(vec![AllowRule::parse("10.0.0.0/8").unwrap()]);
        let addr: IpAddr = "10.1.1.1".parse().unwrap();
        let first = policy.is_allowed(addr);
        for _ in 0..100 {
            assert_eq!(policy.is_allowed(addr), first);
        }
    }
}
