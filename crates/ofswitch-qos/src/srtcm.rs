//! Single-rate three-color marker (RFC 2697).
//!
//! Two token buckets: the committed bucket refills at CIR up to CBS, and
//! refill overflow spills into the excess bucket up to EBS. A packet is
//! green when the committed bucket covers it, yellow when only the excess
//! bucket does, red otherwise.

use ofswitch_packet::meta::PktColor;
use serde::{Deserialize, Serialize};

use crate::error::{QosError, QosResult};

const NS_PER_SEC: u128 = 1_000_000_000;

/// Parameters for a single-rate marker. Units are bytes (or packets when
/// the owning meter runs in packet mode) and bytes per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrTcmConfig {
    /// Committed information rate, units per second.
    pub cir: u64,
    /// Committed burst size.
    pub cbs: u64,
    /// Excess burst size; zero disables the yellow band.
    pub ebs: u64,
}

/// Single-rate three-color marker state.
#[derive(Debug, Clone)]
pub struct SrTcm {
    cir: u64,
    cbs: u64,
    ebs: u64,
    tc: u64,
    te: u64,
    last_ns: u64,
}

impl SrTcm {
    /// Creates a marker with full buckets.
    pub fn new(config: SrTcmConfig) -> QosResult<Self> {
        if config.cir == 0 {
            return Err(QosError::InvalidRate {
                reason: "committed information rate is zero".into(),
            });
        }
        if config.cbs == 0 && config.ebs == 0 {
            return Err(QosError::InvalidRate {
                reason: "both burst sizes are zero".into(),
            });
        }
        Ok(Self {
            cir: config.cir,
            cbs: config.cbs,
            ebs: config.ebs,
            tc: config.cbs,
            te: config.ebs,
            last_ns: 0,
        })
    }

    fn refill(&mut self, now_ns: u64) {
        if now_ns <= self.last_ns {
            return;
        }
        let elapsed = (now_ns - self.last_ns) as u128;
        let tokens = (elapsed * self.cir as u128 / NS_PER_SEC) as u64;
        if tokens == 0 {
            // Keep the timestamp so sub-token intervals accumulate.
            return;
        }
        self.last_ns = now_ns;
        let committed_room = self.cbs - self.tc;
        if tokens <= committed_room {
            self.tc += tokens;
        } else {
            self.tc = self.cbs;
            self.te = self.ebs.min(self.te + (tokens - committed_room));
        }
    }

    /// Color-blind check: meters `len` units at `now_ns` and returns the
    /// packet color, consuming tokens for green and yellow.
    pub fn check_blind(&mut self, now_ns: u64, len: u64) -> PktColor {
        self.refill(now_ns);
        if self.tc >= len {
            self.tc -= len;
            PktColor::Green
        } else if self.te >= len {
            self.te -= len;
            PktColor::Yellow
        } else {
            PktColor::Red
        }
    }

    /// Color-aware check: an incoming color can only stay or worsen.
    pub fn check_aware(&mut self, now_ns: u64, len: u64, color_in: PktColor) -> PktColor {
        self.refill(now_ns);
        match color_in {
            PktColor::Green => {
                if self.tc >= len {
                    self.tc -= len;
                    PktColor::Green
                } else if self.te >= len {
                    self.te -= len;
                    PktColor::Yellow
                } else {
                    PktColor::Red
                }
            }
            PktColor::Yellow => {
                if self.te >= len {
                    self.te -= len;
                    PktColor::Yellow
                } else {
                    PktColor::Red
                }
            }
            PktColor::Red => PktColor::Red,
        }
    }

    /// Tokens currently in the committed bucket.
    pub fn committed_tokens(&self) -> u64 {
        self.tc
    }

    /// Tokens currently in the excess bucket.
    pub fn excess_tokens(&self) -> u64 {
        self.te
    }
}
