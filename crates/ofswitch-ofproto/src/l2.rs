//! MAC learning table for OFPP_NORMAL and standalone forwarding.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tracing::trace;

/// Default entry lifetime.
pub const L2_AGING_NS: u64 = 300 * 1_000_000_000;

/// Default bound on learned addresses.
pub const L2_MAX_ENTRIES: usize = 8192;

struct L2Entry {
    of_port: u32,
    last_seen_ns: AtomicU64,
}

/// The learning table, keyed by (VLAN, MAC). Untagged traffic learns
/// under VLAN 0.
pub struct L2Table {
    entries: DashMap<(u16, [u8; 6]), L2Entry>,
    aging_ns: u64,
    max_entries: usize,
}

impl Default for L2Table {
    fn default() -> Self {
        Self::new(L2_AGING_NS, L2_MAX_ENTRIES)
    }
}

impl L2Table {
    /// Creates a table with the given aging period and size bound.
    pub fn new(aging_ns: u64, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            aging_ns,
            max_entries: max_entries.max(1),
        }
    }

    /// Records that `mac` was seen on `of_port`.
    pub fn learn(&self, now_ns: u64, vlan: u16, mac: [u8; 6], of_port: u32) {
        if let Some(entry) = self.entries.get(&(vlan, mac)) {
            entry.last_seen_ns.store(now_ns, Ordering::Relaxed);
            if entry.of_port != of_port {
                drop(entry);
                // Station moved.
                self.entries.insert(
                    (vlan, mac),
                    L2Entry {
                        of_port,
                        last_seen_ns: AtomicU64::new(now_ns),
                    },
                );
            }
            return;
        }
        if self.entries.len() >= self.max_entries {
            trace!(vlan, "mac table full, not learning");
            return;
        }
        self.entries.insert(
            (vlan, mac),
            L2Entry {
                of_port,
                last_seen_ns: AtomicU64::new(now_ns),
            },
        );
    }

    /// Port the destination was last seen on, unless the entry aged out.
    pub fn lookup(&self, now_ns: u64, vlan: u16, mac: [u8; 6]) -> Option<u32> {
        let entry = self.entries.get(&(vlan, mac))?;
        let seen = entry.last_seen_ns.load(Ordering::Relaxed);
        if now_ns.saturating_sub(seen) > self.aging_ns {
            drop(entry);
            self.entries.remove(&(vlan, mac));
            return None;
        }
        Some(entry.of_port)
    }

    /// Sweeps expired entries; called from the management timer.
    pub fn expire(&self, now_ns: u64) {
        self.entries
            .retain(|_, e| now_ns.saturating_sub(e.last_seen_ns.load(Ordering::Relaxed)) <= self.aging_ns);
    }

    /// Forgets every address learned on the given port; called when a
    /// port leaves the bridge or its link drops.
    pub fn purge_port(&self, of_port: u32) {
        self.entries.retain(|_, e| e.of_port != of_port);
    }

    /// Learned entry count.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is learned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC_A: [u8; 6] = [2, 0, 0, 0, 0, 0xa];
    const MAC_B: [u8; 6] = [2, 0, 0, 0, 0, 0xb];

    #[test]
    fn test_learn_and_lookup() {
        let t = L2Table::default();
        t.learn(0, 0, MAC_A, 3);
        assert_eq!(t.lookup(0, 0, MAC_A), Some(3));
        assert_eq!(t.lookup(0, 0, MAC_B), None);
        // Same MAC, different VLAN: separate entry.
        assert_eq!(t.lookup(0, 100, MAC_A), None);
    }

    #[test]
    fn test_station_move() {
        let t = L2Table::default();
        t.learn(0, 0, MAC_A, 3);
        t.learn(1, 0, MAC_A, 5);
        assert_eq!(t.lookup(1, 0, MAC_A), Some(5));
    }

    #[test]
    fn test_aging() {
        let t = L2Table::new(1_000, 16);
        t.learn(0, 0, MAC_A, 3);
        assert_eq!(t.lookup(500, 0, MAC_A), Some(3));
        assert_eq!(t.lookup(2_000, 0, MAC_A), None);
        assert!(t.is_empty());
    }

    #[test]
    fn test_expire_sweep() {
        let t = L2Table::new(1_000, 16);
        t.learn(0, 0, MAC_A, 1);
        t.learn(1_500, 0, MAC_B, 2);
        t.expire(2_000);
        assert_eq!(t.len(), 1);
        assert_eq!(t.lookup(2_000, 0, MAC_B), Some(2));
    }

    #[test]
    fn test_purge_port() {
        let t = L2Table::default();
        t.learn(0, 0, MAC_A, 1);
        t.learn(0, 0, MAC_B, 2);
        t.purge_port(1);
        assert_eq!(t.lookup(0, 0, MAC_A), None);
        assert_eq!(t.lookup(0, 0, MAC_B), Some(2));
    }

    #[test]
    fn test_table_bound() {
        let t = L2Table::new(L2_AGING_NS, 1);
        t.learn(0, 0, MAC_A, 1);
        t.learn(0, 0, MAC_B, 2);
        assert_eq!(t.len(), 1);
        assert_eq!(t.lookup(0, 0, MAC_B), None);
    }
}
