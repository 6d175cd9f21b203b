//! OpenFlow meters.
//!
//! A meter is an ordered list of bands, each with its own single-rate
//! marker. Rates are kilobits per second unless the packet-per-second
//! flag is set; the markers run on bytes (or packets) per second, so
//! kbps values are converted at configure time.
//!
//! Band selection iterates every band on every packet and keeps the
//! first band whose marker reports red. Bands must therefore be
//! provisioned in increasing rate order for the highest exceeded rate to
//! win; the table logs a warning when they are not.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{QosError, QosResult};
use crate::srtcm::{SrTcm, SrTcmConfig};

/// Meter rate unit is kilobits per second (the default).
pub const METER_FLAG_KBPS: u16 = 1 << 0;
/// Meter rate unit is packets per second.
pub const METER_FLAG_PKTPS: u16 = 1 << 1;
/// Band burst sizes are configured.
pub const METER_FLAG_BURST: u16 = 1 << 2;
/// Collect input and per-band counters.
pub const METER_FLAG_STATS: u16 = 1 << 3;

/// Most bands one meter may carry.
pub const METER_MAX_BANDS: usize = 16;

/// kbps → bytes per second.
fn kbps_to_byteps(kbps: u32) -> u64 {
    kbps as u64 * 1000 / 8
}

/// Band behavior when its rate is exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandType {
    /// Discard the packet.
    Drop,
    /// Raise the DSCP drop precedence.
    DscpRemark,
    /// Experimenter-defined behavior.
    Experimenter,
}

/// Configuration of one meter band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterBandConfig {
    /// What happens to packets exceeding this band's rate.
    pub kind: BandType,
    /// Rate in kbps, or packets per second under the pps flag.
    pub rate: u32,
    /// Burst size, honored only under the burst flag.
    pub burst_size: u32,
    /// Drop precedence levels to add; DSCP remark only.
    pub prec_level: u8,
    /// Experimenter id; experimenter bands only.
    pub experimenter: u32,
}

/// What the pipeline must do with a metered packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeterOutcome {
    /// No band exceeded; forward unchanged.
    Pass,
    /// A drop band was selected.
    Drop,
    /// A DSCP remark band was selected.
    Remark {
        /// Drop precedence levels to add.
        prec_level: u8,
    },
    /// An experimenter band was selected; the pipeline forwards.
    Experimenter {
        /// The experimenter id from the band.
        experimenter: u32,
    },
}

struct MeterBand {
    config: MeterBandConfig,
    marker: SrTcm,
    packet_band_count: u64,
    byte_band_count: u64,
}

/// One OpenFlow meter with its bands and counters.
pub struct Meter {
    meter_id: u32,
    flags: u16,
    bands: Vec<MeterBand>,
    /// Flow entries currently referencing this meter.
    pub flow_count: u32,
    input_packet_count: u64,
    input_byte_count: u64,
    created: Instant,
}

impl Meter {
    /// Builds a meter, configuring one marker per band.
    pub fn new(meter_id: u32, flags: u16, bands: &[MeterBandConfig]) -> QosResult<Self> {
        if bands.len() > METER_MAX_BANDS {
            return Err(QosError::TooManyBands {
                count: bands.len(),
                max: METER_MAX_BANDS,
            });
        }
        let pps = flags & METER_FLAG_PKTPS != 0;
        let burst = flags & METER_FLAG_BURST != 0;
        let mut built = Vec::with_capacity(bands.len());
        for band in bands {
            let (cir, cbs) = if pps {
                (band.rate as u64, band.rate as u64)
            } else {
                (kbps_to_byteps(band.rate), kbps_to_byteps(band.rate))
            };
            let ebs = if burst {
                if pps {
                    band.burst_size as u64
                } else {
                    kbps_to_byteps(band.burst_size)
                }
            } else {
                0
            };
            built.push(MeterBand {
                config: *band,
                marker: SrTcm::new(SrTcmConfig { cir, cbs, ebs })?,
                packet_band_count: 0,
                byte_band_count: 0,
            });
        }
        debug!(meter_id, flags, bands = built.len(), "configured meter");
        Ok(Self {
            meter_id,
            flags,
            bands: built,
            flow_count: 0,
            input_packet_count: 0,
            input_byte_count: 0,
            created: Instant::now(),
        })
    }

    /// OpenFlow meter id.
    pub fn meter_id(&self) -> u32 {
        self.meter_id
    }

    /// Configured flag bits.
    pub fn flags(&self) -> u16 {
        self.flags
    }

    /// Meters one packet of `pkt_len` bytes at `now_ns` and returns the
    /// required treatment.
    ///
    /// Every band's marker runs on every packet; the first band observed
    /// red is the selected band.
    pub fn meter_packet(&mut self, now_ns: u64, pkt_len: u64) -> MeterOutcome {
        let stats = self.flags & METER_FLAG_STATS != 0;
        if stats {
            self.input_packet_count += 1;
            self.input_byte_count += pkt_len;
        }
        let units = if self.flags & METER_FLAG_PKTPS != 0 {
            1
        } else {
            pkt_len
        };
        let mut selected: Option<usize> = None;
        for (idx, band) in self.bands.iter_mut().enumerate() {
            let color = band.marker.check_blind(now_ns, units);
            if selected.is_none() && color == ofswitch_packet::meta::PktColor::Red {
                selected = Some(idx);
            }
        }
        match selected {
            Some(idx) => {
                let band = &mut self.bands[idx];
                if stats {
                    band.packet_band_count += 1;
                    band.byte_band_count += pkt_len;
                }
                match band.config.kind {
                    BandType::Drop => MeterOutcome::Drop,
                    BandType::DscpRemark => MeterOutcome::Remark {
                        prec_level: band.config.prec_level,
                    },
                    BandType::Experimenter => MeterOutcome::Experimenter {
                        experimenter: band.config.experimenter,
                    },
                }
            }
            None => MeterOutcome::Pass,
        }
    }

    /// Counter snapshot for the multipart stats reply.
    pub fn stats(&self) -> MeterStats {
        MeterStats {
            meter_id: self.meter_id,
            flow_count: self.flow_count,
            input_packet_count: self.input_packet_count,
            input_byte_count: self.input_byte_count,
            duration_sec: self.created.elapsed().as_secs() as u32,
            bands: self
                .bands
                .iter()
                .map(|b| BandStats {
                    packet_band_count: b.packet_band_count,
                    byte_band_count: b.byte_band_count,
                })
                .collect(),
        }
    }

    /// Configuration snapshot for the multipart config reply.
    pub fn config(&self) -> MeterConfig {
        MeterConfig {
            meter_id: self.meter_id,
            flags: self.flags,
            bands: self.bands.iter().map(|b| b.config).collect(),
        }
    }
}

/// Per-band counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BandStats {
    /// Packets the band acted on.
    pub packet_band_count: u64,
    /// Bytes the band acted on.
    pub byte_band_count: u64,
}

/// Meter counter snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterStats {
    /// OpenFlow meter id.
    pub meter_id: u32,
    /// Flow entries referencing the meter.
    pub flow_count: u32,
    /// Packets offered to the meter.
    pub input_packet_count: u64,
    /// Bytes offered to the meter.
    pub input_byte_count: u64,
    /// Seconds since the meter was created.
    pub duration_sec: u32,
    /// One entry per band, in band order.
    pub bands: Vec<BandStats>,
}

/// Meter configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    /// OpenFlow meter id.
    pub meter_id: u32,
    /// Configured flag bits.
    pub flags: u16,
    /// Band configurations in band order.
    pub bands: Vec<MeterBandConfig>,
}

/// Table of meters keyed by meter id. Shared between the configuration
/// plane and the workers; each meter is individually locked for the
/// duration of one packet's check.
#[derive(Default)]
pub struct MeterTable {
    meters: DashMap<u32, Arc<Mutex<Meter>>>,
}

impl MeterTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    fn warn_nonmonotonic(meter_id: u32, bands: &[MeterBandConfig]) {
        if bands.windows(2).any(|w| w[0].rate > w[1].rate) {
            warn!(
                meter_id,
                "meter bands are not in increasing rate order; the first \
                 exceeded band wins, later higher-rate bands never trigger"
            );
        }
    }

    /// Adds a meter; fails when the id is taken.
    pub fn add(&self, meter_id: u32, flags: u16, bands: &[MeterBandConfig]) -> QosResult<()> {
        if self.meters.contains_key(&meter_id) {
            return Err(QosError::MeterExists { meter_id });
        }
        Self::warn_nonmonotonic(meter_id, bands);
        let meter = Meter::new(meter_id, flags, bands)?;
        self.meters.insert(meter_id, Arc::new(Mutex::new(meter)));
        Ok(())
    }

    /// Replaces a meter's flags and bands, keeping its identity.
    pub fn modify(&self, meter_id: u32, flags: u16, bands: &[MeterBandConfig]) -> QosResult<()> {
        let entry = self
            .meters
            .get(&meter_id)
            .ok_or(QosError::MeterNotFound { meter_id })?;
        Self::warn_nonmonotonic(meter_id, bands);
        let mut replacement = Meter::new(meter_id, flags, bands)?;
        let mut current = entry.lock();
        replacement.flow_count = current.flow_count;
        *current = replacement;
        Ok(())
    }

    /// Removes a meter.
    pub fn delete(&self, meter_id: u32) -> QosResult<()> {
        self.meters
            .remove(&meter_id)
            .map(|_| ())
            .ok_or(QosError::MeterNotFound { meter_id })
    }

    /// Looks up a meter for per-packet use.
    pub fn lookup(&self, meter_id: u32) -> Option<Arc<Mutex<Meter>>> {
        self.meters.get(&meter_id).map(|e| Arc::clone(e.value()))
    }

    /// Number of meters in the table.
    pub fn len(&self) -> usize {
        self.meters.len()
    }

    /// True when no meters are configured.
    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }

    /// Stats snapshots for every meter, ordered by id.
    pub fn stats(&self) -> Vec<MeterStats> {
        let mut all: Vec<MeterStats> = self.meters.iter().map(|e| e.value().lock().stats()).collect();
        all.sort_by_key(|s| s.meter_id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: u64 = 1_000_000_000;

    fn drop_band(rate_kbps: u32) -> MeterBandConfig {
        MeterBandConfig {
            kind: BandType::Drop,
            rate: rate_kbps,
            burst_size: 0,
            prec_level: 0,
            experimenter: 0,
        }
    }

    #[test]
    fn test_under_rate_passes() {
        // 1000 kbps = 125000 B/s; bucket starts full at 125000.
        let mut m = Meter::new(1, METER_FLAG_KBPS | METER_FLAG_STATS, &[drop_band(1000)]).unwrap();
        assert_eq!(m.meter_packet(0, 1000), MeterOutcome::Pass);
        let stats = m.stats();
        assert_eq!(stats.input_packet_count, 1);
        assert_eq!(stats.input_byte_count, 1000);
        assert_eq!(stats.bands[0].packet_band_count, 0);
    }

    #[test]
    fn test_burst_exhaustion_selects_band() {
        let mut m = Meter::new(1, METER_FLAG_KBPS | METER_FLAG_STATS, &[drop_band(8)]).unwrap();
        // 8 kbps = 1000 B/s; drain the full bucket then exceed.
        assert_eq!(m.meter_packet(0, 1000), MeterOutcome::Pass);
        assert_eq!(m.meter_packet(0, 1000), MeterOutcome::Drop);
        let stats = m.stats();
        assert_eq!(stats.bands[0].packet_band_count, 1);
        assert_eq!(stats.bands[0].byte_band_count, 1000);
    }

    #[test]
    fn test_first_red_band_wins() {
        // Two bands; the lower-rate band turns red first and stays
        // selected even while the higher band is also red.
        let mut m = Meter::new(
            1,
            METER_FLAG_KBPS | METER_FLAG_STATS,
            &[drop_band(8), drop_band(16)],
        )
        .unwrap();
        // Band 0 bucket: 1000; band 1 bucket: 2000.
        assert_eq!(m.meter_packet(0, 1000), MeterOutcome::Pass);
        // Band 0 red, band 1 still green.
        assert_eq!(m.meter_packet(0, 1000), MeterOutcome::Drop);
        let stats = m.stats();
        assert_eq!(stats.bands[0].packet_band_count, 1);
        assert_eq!(stats.bands[1].packet_band_count, 0);
        // Both red now; band 0 still wins.
        assert_eq!(m.meter_packet(0, 1000), MeterOutcome::Drop);
        let stats = m.stats();
        assert_eq!(stats.bands[0].packet_band_count, 2);
        assert_eq!(stats.bands[1].packet_band_count, 0);
    }

    #[test]
    fn test_band_counts_bounded_by_input() {
        let mut m = Meter::new(
            7,
            METER_FLAG_KBPS | METER_FLAG_STATS,
            &[drop_band(8), drop_band(80)],
        )
        .unwrap();
        let mut now = 0;
        for _ in 0..200 {
            now += SEC / 100;
            m.meter_packet(now, 500);
        }
        let stats = m.stats();
        let band_total: u64 = stats.bands.iter().map(|b| b.packet_band_count).sum();
        assert!(band_total <= stats.input_packet_count);
    }

    #[test]
    fn test_pktps_mode_counts_packets() {
        let mut m = Meter::new(1, METER_FLAG_PKTPS, &[drop_band(2)]).unwrap();
        // Two packets per second; bucket starts with 2 tokens.
        assert_eq!(m.meter_packet(0, 9000), MeterOutcome::Pass);
        assert_eq!(m.meter_packet(0, 9000), MeterOutcome::Pass);
        assert_eq!(m.meter_packet(0, 64), MeterOutcome::Drop);
    }

    #[test]
    fn test_dscp_remark_band_exports_prec() {
        let band = MeterBandConfig {
            kind: BandType::DscpRemark,
            rate: 8,
            burst_size: 0,
            prec_level: 2,
            experimenter: 0,
        };
        let mut m = Meter::new(1, METER_FLAG_KBPS, &[band]).unwrap();
        assert_eq!(m.meter_packet(0, 1000), MeterOutcome::Pass);
        assert_eq!(
            m.meter_packet(0, 1000),
            MeterOutcome::Remark { prec_level: 2 }
        );
    }

    #[test]
    fn test_stats_flag_gates_counters() {
        let mut m = Meter::new(1, METER_FLAG_KBPS, &[drop_band(8)]).unwrap();
        m.meter_packet(0, 1000);
        m.meter_packet(0, 1000);
        let stats = m.stats();
        assert_eq!(stats.input_packet_count, 0);
        assert_eq!(stats.bands[0].packet_band_count, 0);
    }

    #[test]
    fn test_table_add_lookup_delete() {
        let table = MeterTable::new();
        table.add(3, METER_FLAG_KBPS, &[drop_band(1000)]).unwrap();
        assert!(matches!(
            table.add(3, METER_FLAG_KBPS, &[drop_band(1000)]),
            Err(QosError::MeterExists { meter_id: 3 })
        ));
        assert!(table.lookup(3).is_some());
        table.delete(3).unwrap();
        assert!(table.lookup(3).is_none());
        assert!(matches!(
            table.delete(3),
            Err(QosError::MeterNotFound { meter_id: 3 })
        ));
    }

    #[test]
    fn test_table_modify_keeps_flow_count() {
        let table = MeterTable::new();
        table.add(1, METER_FLAG_KBPS, &[drop_band(1000)]).unwrap();
        table.lookup(1).unwrap().lock().flow_count = 4;
        table
            .modify(1, METER_FLAG_KBPS | METER_FLAG_STATS, &[drop_band(2000)])
            .unwrap();
        let meter = table.lookup(1).unwrap();
        let meter = meter.lock();
        assert_eq!(meter.flow_count, 4);
        assert_eq!(meter.flags(), METER_FLAG_KBPS | METER_FLAG_STATS);
    }
}
