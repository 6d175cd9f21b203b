//! QoS scenarios under controlled virtual time: policer drop ratios and
//! multi-band meter behavior.

#[cfg(test)]
mod tests {
    use ofswitch_qos::meter::{METER_FLAG_KBPS, METER_FLAG_STATS};
    use ofswitch_qos::{
        BandType, Meter, MeterBandConfig, MeterOutcome, Policer, PolicerActionKind, PolicerConfig,
    };

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

    /// Runs `pkts` packets of `len` bytes through a meter at an offered
    /// rate of `kbps`, spread over the time it takes at that rate.
    fn offer(meter: &mut Meter, pkts: u64, len: u64, kbps: u64) -> (u64, u64) {
        let byteps = kbps * 125;
        let mut passed = 0;
        let mut dropped = 0;
        for i in 0..pkts {
            let now = i * len * SEC / byteps;
            match meter.meter_packet(now, len) {
                MeterOutcome::Drop => dropped += 1,
                _ => passed += 1,
            }
        }
        (passed, dropped)
    }

    #[test]
    fn test_policer_single_rate_discard_half() {
        // 1000 kbps policer, 1500-byte burst; 1500-byte packets offered
        // at 2 Mbps. About half must drop.
        let policer = Policer::new(PolicerConfig {
            bandwidth_limit: 1000,
            burst_size_limit: 1500,
            bandwidth_percent: 0,
            actions: vec![PolicerActionKind::Discard],
        })
        .unwrap();
        let total = 100u64;
        let mut dropped = 0u64;
        for i in 0..total {
            // 1500 B at 2 Mbps = 6 ms per packet.
            let now = i * 6_000_000;
            if !policer.police(now, 1500) {
                dropped += 1;
            }
        }
        let stats = policer.stats();
        assert_eq!(stats.passed + stats.dropped, total);
        let ratio = dropped as f64 / total as f64;
        assert!(
            (0.4..=0.6).contains(&ratio),
            "expected ~50% red, got {ratio}"
        );
    }

    #[test]
    fn test_meter_two_band_under_first_band() {
        // Bands at 1000 and 2000 kbps. Offered at 800 kbps everything
        // passes.
        let mut m = Meter::new(
            1,
            METER_FLAG_KBPS | METER_FLAG_STATS,
            &[drop_band(1000), drop_band(2000)],
        )
        .unwrap();
        let (passed, dropped) = offer(&mut m, 200, 1500, 800);
        assert_eq!(dropped, 0);
        assert_eq!(passed, 200);
        let stats = m.stats();
        assert_eq!(stats.input_packet_count, 200);
        assert!(stats.bands.iter().all(|b| b.packet_band_count == 0));
    }

    #[test]
    fn test_meter_two_band_excess_hits_first_band() {
        // Offered at 2500 kbps: the 1000 kbps band absorbs the excess.
        let mut m = Meter::new(
            1,
            METER_FLAG_KBPS | METER_FLAG_STATS,
            &[drop_band(1000), drop_band(2000)],
        )
        .unwrap();
        let (_passed, dropped) = offer(&mut m, 500, 1500, 2500);
        assert!(dropped > 0);
        let stats = m.stats();
        assert!(stats.bands[0].packet_band_count > 0);
        // Band 1 never wins while band 0 is red first.
        assert_eq!(stats.bands[1].packet_band_count, 0);
    }

    #[test]
    fn test_meter_two_band_first_red_wins_at_high_rate() {
        // Even at 3000 kbps, above both bands, band selection stays on
        // the first band that turns red. Bands must be provisioned in
        // increasing rate order for the highest to ever win.
        let mut m = Meter::new(
            1,
            METER_FLAG_KBPS | METER_FLAG_STATS,
            &[drop_band(1000), drop_band(2000)],
        )
        .unwrap();
        let (_passed, dropped) = offer(&mut m, 400, 1500, 3000);
        assert!(dropped > 100);
        let stats = m.stats();
        assert!(stats.bands[0].packet_band_count > 0);
        assert_eq!(stats.bands[1].packet_band_count, 0);
        let band_total: u64 = stats.bands.iter().map(|b| b.packet_band_count).sum();
        assert!(band_total <= stats.input_packet_count);
    }

    #[test]
    fn test_meter_band_counts_bounded_by_input() {
        let mut m = Meter::new(
            9,
            METER_FLAG_KBPS | METER_FLAG_STATS,
            &[drop_band(100), drop_band(200), drop_band(400)],
        )
        .unwrap();
        offer(&mut m, 1000, 800, 900);
        let stats = m.stats();
        let band_total: u64 = stats.bands.iter().map(|b| b.packet_band_count).sum();
        assert!(band_total <= stats.input_packet_count);
        assert_eq!(stats.input_packet_count, 1000);
    }

    #[test]
    fn test_policer_conserves_counts_across_rates() {
        for kbps in [100u64, 1000, 10_000] {
            let policer = Policer::new(PolicerConfig {
                bandwidth_limit: kbps,
                burst_size_limit: 3000,
                bandwidth_percent: 0,
                actions: vec![PolicerActionKind::Discard],
            })
            .unwrap();
            let mut offered = 0u64;
            for i in 0..300u64 {
                let now = i * SEC / 300;
                policer.police(now, 1500);
                offered += 1;
            }
            let stats = policer.stats();
            assert_eq!(stats.passed + stats.dropped, offered);
        }
    }
}
