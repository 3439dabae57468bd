use std::collections::BTreeSet;
use std::net::IpAddr;

use netcon_stack::{IpCidr, MacAddr};

/// An Ethernet multicast subscription derived from an interface address.
///
/// `adi` is the additional distinguishing information carried alongside the MAC; for IPv4 it is
/// the address itself so ARP broadcasts can be scoped to the host being resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MulticastGroup {
    pub mac: MacAddr,
    pub adi: u32,
}

impl MulticastGroup {
    pub fn for_address(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self {
                mac: MacAddr::BROADCAST,
                adi: u32::from(v4),
            },
            IpAddr::V6(v6) => {
                let o = v6.octets();
                Self {
                    // Solicited-node multicast.
                    mac: MacAddr([0x33, 0x33, 0xff, o[13], o[14], o[15]]),
                    adi: 0,
                }
            }
        }
    }
}

/// Addresses assigned to the interface plus the multicast snapshot last reported by [`scan`].
///
/// [`scan`]: AddressSet::scan
#[derive(Debug, Default)]
pub struct AddressSet {
    addrs: BTreeSet<IpCidr>,
    reported: BTreeSet<MulticastGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupChanges {
    pub added: Vec<MulticastGroup>,
    pub removed: Vec<MulticastGroup>,
}

impl GroupChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl AddressSet {
    /// Returns true if the address was not already present.
    pub fn insert(&mut self, cidr: IpCidr) -> bool {
        self.addrs.insert(cidr)
    }

    pub fn remove(&mut self, cidr: &IpCidr) -> bool {
        self.addrs.remove(cidr)
    }

    pub fn contains(&self, cidr: &IpCidr) -> bool {
        self.addrs.contains(cidr)
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn to_vec(&self) -> Vec<IpCidr> {
        self.addrs.iter().copied().collect()
    }

    pub fn groups(&self) -> BTreeSet<MulticastGroup> {
        self.addrs
            .iter()
            .map(|c| MulticastGroup::for_address(c.addr()))
            .collect()
    }

    /// Diffs the current group set against the previous scan and records it as reported.
    pub fn scan(&mut self) -> GroupChanges {
        let current = self.groups();
        let changes = GroupChanges {
            added: current.difference(&self.reported).copied().collect(),
            removed: self.reported.difference(&current).copied().collect(),
        };
        self.reported = current;
        changes
    }
}
