//! Worker selection for received packets.
//!
//! The fifoness policy decides which worker handles each packet of an
//! RX burst: round-robin for pure balance, by input port for per-port
//! ordering, or by flow hash (the same hash the flow cache fingerprints
//! with) for per-flow ordering across ports.

use ofswitch_ofproto::fingerprint;
use ofswitch_packet::Mbuf;

use crate::config::Fifoness;

/// Picks the worker for one packet. `burst_index` is the packet's
/// position within its RX burst; `n_workers` must be nonzero.
#[inline]
pub fn select_worker(fifoness: Fifoness, m: &Mbuf, burst_index: usize, n_workers: usize) -> usize {
    match fifoness {
        Fifoness::None => burst_index % n_workers,
        Fifoness::Port => m.meta().in_port as usize % n_workers,
        Fifoness::Flow => (fingerprint(m) % n_workers as u64) as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(in_port: u32, payload: &[u8]) -> Mbuf {
        let mut m = Mbuf::from_slice(payload);
        m.meta_mut().in_port = in_port;
        m
    }

    #[test]
    fn test_none_round_robins() {
        let m = pkt(0, &[0; 64]);
        let picks: Vec<usize> = (0..8).map(|i| select_worker(Fifoness::None, &m, i, 4)).collect();
        assert_eq!(picks, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }

    #[test]
    fn test_port_pins_by_input_port() {
        for port in 0..16 {
            let m = pkt(port, &[port as u8; 64]);
            let w = select_worker(Fifoness::Port, &m, 0, 4);
            assert_eq!(w, port as usize % 4);
            // Burst position is irrelevant.
            assert_eq!(select_worker(Fifoness::Port, &m, 7, 4), w);
        }
    }

    #[test]
    fn test_flow_same_header_same_worker() {
        let a = pkt(3, &[0xab; 64]);
        let b = pkt(3, &[0xab; 64]);
        assert_eq!(
            select_worker(Fifoness::Flow, &a, 0, 4),
            select_worker(Fifoness::Flow, &b, 5, 4)
        );
    }

    #[test]
    fn test_flow_differs_by_port() {
        // The seed is the input port, so equal frames on different
        // ports may diverge; verify the hash actually uses the port by
        // scanning for at least one divergence.
        let mut diverged = false;
        for port in 0..32 {
            let a = pkt(0, &[0x11; 64]);
            let b = pkt(port, &[0x11; 64]);
            if select_worker(Fifoness::Flow, &a, 0, 8) != select_worker(Fifoness::Flow, &b, 0, 8) {
                diverged = true;
                break;
            }
        }
        assert!(diverged);
    }

    #[test]
    fn test_flow_spreads_flows() {
        // Many distinct flows should touch more than one worker.
        let mut seen = std::collections::HashSet::new();
        for i in 0..64u8 {
            let mut payload = [0u8; 64];
            payload[5] = i;
            let m = pkt(0, &payload);
            seen.insert(select_worker(Fifoness::Flow, &m, 0, 4));
        }
        assert!(seen.len() > 1);
    }
}
