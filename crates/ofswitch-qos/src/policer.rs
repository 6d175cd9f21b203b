//! Port-level egress policers.
//!
//! A policer applies one single-rate marker to a port's aggregate egress
//! traffic. Packets marked red run the policer's action chain; the only
//! action currently defined is discard. Counters satisfy
//! `passed + dropped == offered`.

use std::sync::atomic::{AtomicU64, Ordering};

use ofswitch_packet::meta::PktColor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::QosResult;
use crate::srtcm::{SrTcm, SrTcmConfig};

/// Actions a policer can run on red packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicerActionKind {
    /// Drop the packet.
    Discard,
}

/// Policer rate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicerConfig {
    /// Committed rate in kilobits per second.
    pub bandwidth_limit: u64,
    /// Burst tolerance in bytes.
    pub burst_size_limit: u64,
    /// Share of the port bandwidth this policer represents; carried for
    /// the configuration plane, not used by the marker.
    pub bandwidth_percent: u8,
    /// Action chain run on red packets, in order.
    pub actions: Vec<PolicerActionKind>,
}

/// Counter snapshot for one policer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicerStats {
    /// Packets that conformed and were forwarded.
    pub passed: u64,
    /// Packets dropped by the action chain.
    pub dropped: u64,
}

/// A port-level egress policer.
///
/// One TX thread drives the marker; the configuration plane reads the
/// counters concurrently, so they are atomics.
pub struct Policer {
    config: PolicerConfig,
    marker: Mutex<SrTcm>,
    passed: AtomicU64,
    dropped: AtomicU64,
}

impl Policer {
    /// Builds a policer from its configuration.
    pub fn new(config: PolicerConfig) -> QosResult<Self> {
        let marker = SrTcm::new(SrTcmConfig {
            cir: config.bandwidth_limit * 125,
            cbs: config.burst_size_limit,
            ebs: 0,
        })?;
        Ok(Self {
            config,
            marker: Mutex::new(marker),
            passed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    /// Polices one packet. Returns `true` when the packet may proceed;
    /// `false` means the action chain discarded it and the caller must
    /// free it.
    pub fn police(&self, now_ns: u64, pkt_len: u64) -> bool {
        let color = self.marker.lock().check_blind(now_ns, pkt_len);
        if color == PktColor::Red {
            for action in &self.config.actions {
                match action {
                    PolicerActionKind::Discard => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return false;
                    }
                }
            }
        }
        self.passed.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// The configuration this policer was built from.
    pub fn config(&self) -> &PolicerConfig {
        &self.config
    }

    /// Counter snapshot; torn-but-monotonic reads are acceptable.
    pub fn stats(&self) -> PolicerStats {
        PolicerStats {
            passed: self.passed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    fn discard_policer(kbps: u64, burst: u64) -> Policer {
        Policer::new(PolicerConfig {
            bandwidth_limit: kbps,
            burst_size_limit: burst,
            bandwidth_percent: 0,
            actions: vec![PolicerActionKind::Discard],
        })
        .unwrap()
    }

    #[test]
    fn test_conforming_traffic_passes() {
        let p = discard_policer(1000, 1500);
        assert!(p.police(0, 1000));
        let stats = p.stats();
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn test_red_is_discarded() {
        let p = discard_policer(8, 1000);
        assert!(p.police(0, 1000));
        assert!(!p.police(0, 1000));
        let stats = p.stats();
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_counts_conserve_offered() {
        let p = discard_policer(1000, 1500);
        let mut offered = 0u64;
        let mut now = 0u64;
        for _ in 0..500 {
            now += SEC / 1000;
            p.police(now, 1500);
            offered += 1;
        }
        let stats = p.stats();
        assert_eq!(stats.passed + stats.dropped, offered);
        assert!(stats.dropped > 0);
    }

    #[test]
    fn test_empty_action_chain_forwards_red() {
        let p = Policer::new(PolicerConfig {
            bandwidth_limit: 8,
            burst_size_limit: 100,
            bandwidth_percent: 0,
            actions: Vec::new(),
        })
        .unwrap();
        assert!(p.police(0, 100));
        // Red, but no discard action configured.
        assert!(p.police(0, 100));
        assert_eq!(p.stats().dropped, 0);
    }

    #[test]
    fn test_half_rate_drop_ratio() {
        // 1000 kbps policer, 1500-byte packets offered at ~2x rate for
        // one simulated second: about half must drop.
        let p = discard_policer(1000, 1500);
        let pkt = 1500u64;
        // 2 Mbps = 250000 B/s / 1500 B ≈ 167 packets over one second.
        let total = 167u64;
        let mut dropped = 0u64;
        for i in 0..total {
            let now = i * SEC / total;
            if !p.police(now, pkt) {
                dropped += 1;
            }
        }
        let ratio = dropped as f64 / total as f64;
        assert!(
            (0.4..=0.6).contains(&ratio),
            "drop ratio {ratio} out of expected band"
        );
    }
}
