//! Parses the host's neighbor table.
//!
//! Two formats are understood, one per line:
//!
//! ```text
//! ? (192.168.1.20) at 52:54:0:12:34:56 [ether] on vmbr0      (arp -an)
//! 192.168.1.20 dev vmbr0 lladdr 52:54:00:12:34:56 REACHABLE  (ip neigh)
//! ```
//!
//! Incomplete entries and anything else are skipped.

use super::MacAddress;
use regex::Regex;
use std::net::Ipv4Addr;
use std::sync::OnceLock;

/// One resolved entry from the neighbor table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Neighbor {
    pub address: Ipv4Addr,
    pub hardware_address: MacAddress,
}

fn arp_regex() -> &'static Regex {
    static COMPUTED: OnceLock<Regex> = OnceLock::new();
    COMPUTED.get_or_init(|| {
        Regex::new(r"\((\d{1,3}(?:\.\d{1,3}){3})\)\s+at\s+([0-9A-Fa-f]{1,2}(?:[:-][0-9A-Fa-f]{1,2}){5})")
            .expect("BUG: arp pattern should compile")
    })
}

fn neigh_regex() -> &'static Regex {
    static COMPUTED: OnceLock<Regex> = OnceLock::new();
    COMPUTED.get_or_init(|| {
        Regex::new(r"^(\d{1,3}(?:\.\d{1,3}){3})\s.*\blladdr\s+([0-9A-Fa-f]{1,2}(?:[:-][0-9A-Fa-f]{1,2}){5})")
            .expect("BUG: neighbor pattern should compile")
    })
}

/// Parses `arp -an` or `ip neigh` output.
pub fn parse_neighbors(output: &str) -> Vec<Neighbor> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let captures = arp_regex()
                .captures(line)
                .or_else(|| neigh_regex().captures(line))?;
            Some(Neighbor {
                address: captures[1].parse().ok()?,
                hardware_address: captures[2].parse().ok()?,
            })
        })
        .collect()
}

/// Returns the first neighbor whose hardware address is one of `targets`.
pub fn find_by_hardware(neighbors: &[Neighbor], targets: &[MacAddress]) -> Option<Neighbor> {
    neighbors
        .iter()
        .find(|n| targets.contains(&n.hardware_address))
        .copied()
}

/// Returns the hardware address recorded for `address`, if any.
pub fn hardware_for(neighbors: &[Neighbor], address: Ipv4Addr) -> Option<MacAddress> {
    neighbors
        .iter()
        .find(|n| n.address == address)
        .map(|n| n.hardware_address)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARP: &str = "\
? (192.168.1.1) at 0:11:22:33:44:55 [ether] on vmbr0
? (192.168.1.20) at 52:54:00:AB:CD:EF [ether] on vmbr0
? (192.168.1.30) at <incomplete> on vmbr0
gateway (192.168.1.254) at aa-bb-cc-dd-ee-ff on en0 ifscope [ethernet]
";

    const NEIGH: &str = "\
192.168.1.20 dev vmbr0 lladdr 52:54:00:ab:cd:ef REACHABLE
192.168.1.31 dev vmbr0  FAILED
fe80::1 dev vmbr0 lladdr 00:11:22:33:44:55 router STALE
";

    #[test]
    fn parses_arp_output() {
        let neighbors = parse_neighbors(ARP);
        let addresses: Vec<_> = neighbors.iter().map(|n| n.address.to_string()).collect();
        assert_eq!(vec!["192.168.1.1", "192.168.1.20", "192.168.1.254"], addresses);
        assert_eq!("00:11:22:33:44:55", neighbors[0].hardware_address.to_string());
    }

    #[test]
    fn parses_ip_neigh_output() {
        let neighbors = parse_neighbors(NEIGH);
        assert_eq!(1, neighbors.len());
        assert_eq!(Ipv4Addr::new(192, 168, 1, 20), neighbors[0].address);
    }

    #[test]
    fn finds_by_hardware_address() {
        let neighbors = parse_neighbors(ARP);
        let target: MacAddress = "52:54:00:ab:cd:ef".parse().unwrap();

        let found = find_by_hardware(&neighbors, &[target]).unwrap();
        assert_eq!(Ipv4Addr::new(192, 168, 1, 20), found.address);
        assert_eq!(
            Some(target),
            hardware_for(&neighbors, Ipv4Addr::new(192, 168, 1, 20)),
        );
        assert_eq!(None, hardware_for(&neighbors, Ipv4Addr::new(192, 168, 1, 30)));
    }
}
