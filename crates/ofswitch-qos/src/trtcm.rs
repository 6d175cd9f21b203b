//! Two-rate three-color marker.
//!
//! Two independent token buckets: the peak bucket refills at PIR up to
//! PBS and the committed bucket at CIR up to CBS. A packet the peak
//! bucket cannot cover is red; one only the peak bucket covers is
//! yellow; one both cover is green.

use ofswitch_packet::meta::PktColor;
use serde::{Deserialize, Serialize};

use crate::error::{QosError, QosResult};

const NS_PER_SEC: u128 = 1_000_000_000;

/// Parameters for a two-rate marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrTcmConfig {
    /// Committed information rate, units per second.
    pub cir: u64,
    /// Committed burst size.
    pub cbs: u64,
    /// Peak information rate, units per second.
    pub pir: u64,
    /// Peak burst size.
    pub pbs: u64,
}

/// Two-rate three-color marker state.
#[derive(Debug, Clone)]
pub struct TrTcm {
    cir: u64,
    cbs: u64,
    pir: u64,
    pbs: u64,
    tc: u64,
    tp: u64,
    last_ns: u64,
}

impl TrTcm {
    /// Creates a marker with full buckets. The peak rate must be at
    /// least the committed rate.
    pub fn new(config: TrTcmConfig) -> QosResult<Self> {
        if config.cir == 0 || config.pir == 0 {
            return Err(QosError::InvalidRate {
                reason: "information rate is zero".into(),
            });
        }
        if config.pir < config.cir {
            return Err(QosError::InvalidRate {
                reason: "peak rate below committed rate".into(),
            });
        }
        if config.cbs == 0 || config.pbs == 0 {
            return Err(QosError::InvalidRate {
                reason: "burst size is zero".into(),
            });
        }
        Ok(Self {
            cir: config.cir,
            cbs: config.cbs,
            pir: config.pir,
            pbs: config.pbs,
            tc: config.cbs,
            tp: config.pbs,
            last_ns: 0,
        })
    }

    fn refill(&mut self, now_ns: u64) {
        if now_ns <= self.last_ns {
            return;
        }
        let elapsed = (now_ns - self.last_ns) as u128;
        let c_tokens = (elapsed * self.cir as u128 / NS_PER_SEC) as u64;
        let p_tokens = (elapsed * self.pir as u128 / NS_PER_SEC) as u64;
        if c_tokens == 0 && p_tokens == 0 {
            return;
        }
        self.last_ns = now_ns;
        self.tc = self.cbs.min(self.tc + c_tokens);
        self.tp = self.pbs.min(self.tp + p_tokens);
    }

    /// Color-blind check at `now_ns` for `len` units.
    pub fn check_blind(&mut self, now_ns: u64, len: u64) -> PktColor {
        self.refill(now_ns);
        if self.tp < len {
            return PktColor::Red;
        }
        if self.tc < len {
            self.tp -= len;
            return PktColor::Yellow;
        }
        self.tp -= len;
        self.tc -= len;
        PktColor::Green
    }

    /// Color-aware check: an incoming color can only stay or worsen.
    pub fn check_aware(&mut self, now_ns: u64, len: u64, color_in: PktColor) -> PktColor {
        match color_in {
            PktColor::Green => self.check_blind(now_ns, len),
            PktColor::Yellow => {
                self.refill(now_ns);
                if self.tp < len {
                    PktColor::Red
                } else {
                    self.tp -= len;
                    PktColor::Yellow
                }
            }
            PktColor::Red => PktColor::Red,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    fn marker(cir: u64, cbs: u64, pir: u64, pbs: u64) -> TrTcm {
        TrTcm::new(TrTcmConfig { cir, cbs, pir, pbs }).unwrap()
    }

    #[test]
    fn test_peak_below_committed_rejected() {
        assert!(TrTcm::new(TrTcmConfig {
            cir: 1000,
            cbs: 100,
            pir: 500,
            pbs: 100,
        })
        .is_err());
    }

    #[test]
    fn test_green_yellow_red_ladder() {
        let mut m = marker(1000, 100, 2000, 300);
        assert_eq!(m.check_blind(0, 100), PktColor::Green);
        // Committed bucket empty, peak bucket has 200 left.
        assert_eq!(m.check_blind(0, 150), PktColor::Yellow);
        assert_eq!(m.check_blind(0, 100), PktColor::Red);
    }

    #[test]
    fn test_two_rates_refill_independently() {
        let mut m = marker(1000, 1000, 4000, 4000);
        assert_eq!(m.check_blind(0, 1000), PktColor::Green);
        assert_eq!(m.check_blind(0, 3000), PktColor::Yellow);
        // Quarter second: committed +250, peak +1000.
        assert_eq!(m.check_blind(SEC / 4, 250), PktColor::Green);
        assert_eq!(m.check_blind(SEC / 4, 750), PktColor::Yellow);
        assert_eq!(m.check_blind(SEC / 4, 1), PktColor::Red);
    }

    #[test]
    fn test_aware_yellow_consumes_only_peak() {
        let mut m = marker(1000, 1000, 2000, 2000);
        assert_eq!(m.check_aware(0, 400, PktColor::Yellow), PktColor::Yellow);
        // Committed bucket untouched.
        assert_eq!(m.check_blind(0, 1000), PktColor::Green);
    }

    #[test]
    fn test_aware_red_stays_red() {
        let mut m = marker(1000, 1000, 2000, 2000);
        assert_eq!(m.check_aware(0, 1, PktColor::Red), PktColor::Red);
    }
}
