use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use crate::packet::MacAddr;
use crate::Millis;

const ENTRY_TTL_MS: Millis = 60_000;
const REQUEST_INTERVAL_MS: Millis = 1_000;
const PENDING_TIMEOUT_MS: Millis = 3_000;
const MAX_PENDING_PER_HOST: usize = 16;

#[derive(Debug, Clone, Copy)]
struct Entry {
    mac: MacAddr,
    expires_at: Millis,
}

#[derive(Debug)]
struct Pending {
    packets: VecDeque<Vec<u8>>,
    first_request: Millis,
    last_request: Millis,
}

/// ARP cache plus IPv4 packets parked while their next hop resolves.
#[derive(Debug, Default)]
pub(crate) struct NeighborCache {
    entries: HashMap<Ipv4Addr, Entry>,
    pending: HashMap<Ipv4Addr, Pending>,
}

impl NeighborCache {
    pub fn lookup(&self, ip: Ipv4Addr, now: Millis) -> Option<MacAddr> {
        self.entries
            .get(&ip)
            .filter(|e| e.expires_at > now)
            .map(|e| e.mac)
    }

    /// Records a mapping and returns any packets that were waiting on it.
    pub fn learn(&mut self, ip: Ipv4Addr, mac: MacAddr, now: Millis) -> Vec<Vec<u8>> {
        self.entries.insert(
            ip,
            Entry {
                mac,
                expires_at: now + ENTRY_TTL_MS,
            },
        );
        self.pending
            .remove(&ip)
            .map(|p| p.packets.into_iter().collect())
            .unwrap_or_default()
    }

    /// Parks a packet for `ip`. Returns true when a request should go out now.
    pub fn enqueue(&mut self, ip: Ipv4Addr, packet: Vec<u8>, now: Millis) -> bool {
        match self.pending.get_mut(&ip) {
            Some(p) => {
                if p.packets.len() >= MAX_PENDING_PER_HOST {
                    p.packets.pop_front();
                }
                p.packets.push_back(packet);
                if now.saturating_sub(p.last_request) >= REQUEST_INTERVAL_MS {
                    p.last_request = now;
                    return true;
                }
                false
            }
            None => {
                self.pending.insert(
                    ip,
                    Pending {
                        packets: VecDeque::from([packet]),
                        first_request: now,
                        last_request: now,
                    },
                );
                true
            }
        }
    }

    /// Targets whose request should be repeated.
    pub fn due_requests(&mut self, now: Millis) -> Vec<Ipv4Addr> {
        let mut due = Vec::new();
        for (ip, p) in self.pending.iter_mut() {
            if now.saturating_sub(p.last_request) >= REQUEST_INTERVAL_MS {
                p.last_request = now;
                due.push(*ip);
            }
        }
        due
    }

    pub fn next_request_at(&self) -> Option<Millis> {
        self.pending
            .values()
            .map(|p| p.last_request + REQUEST_INTERVAL_MS)
            .min()
    }

    pub fn expire(&mut self, now: Millis) {
        self.entries.retain(|_, e| e.expires_at > now);
        self.pending
            .retain(|_, p| now.saturating_sub(p.first_request) < PENDING_TIMEOUT_MS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);

    #[test]
    fn learn_flushes_parked_packets_in_order() {
        let mut cache = NeighborCache::default();
        assert!(cache.enqueue(IP, vec![1], 0));
        assert!(!cache.enqueue(IP, vec![2], 10));
        let flushed = cache.learn(IP, MacAddr([2; 6]), 20);
        assert_eq!(flushed, vec![vec![1], vec![2]]);
        assert_eq!(cache.lookup(IP, 30), Some(MacAddr([2; 6])));
    }

    #[test]
    fn requests_are_rate_limited_and_pending_expires() {
        let mut cache = NeighborCache::default();
        cache.enqueue(IP, vec![1], 0);
        assert!(cache.due_requests(500).is_empty());
        assert_eq!(cache.due_requests(1_000), vec![IP]);
        cache.expire(PENDING_TIMEOUT_MS);
        assert!(cache.due_requests(10_000).is_empty());
    }

    #[test]
    fn entries_expire() {
        let mut cache = NeighborCache::default();
        cache.learn(IP, MacAddr([3; 6]), 0);
        assert!(cache.lookup(IP, ENTRY_TTL_MS).is_none());
        cache.expire(ENTRY_TTL_MS);
        assert!(cache.entries.is_empty());
    }
}
