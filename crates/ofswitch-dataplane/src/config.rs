//! Pipeline tunables.

use ofswitch_packet::PoolConfig;
use serde::{Deserialize, Serialize};

/// Worker-selection policy: the ordering/balance trade for RX dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fifoness {
    /// Round-robin within the burst; best balance, no ordering.
    None,
    /// All packets from one input port go to one worker.
    Port,
    /// Hash of the L2 header and input port; per-flow ordering.
    Flow,
}

/// Tunables for the pipeline runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataplaneConfig {
    /// Worker-selection policy.
    pub fifoness: Fifoness,
    /// Packets per driver RX burst.
    pub burst_size_io_rx_read: usize,
    /// Pending-array fill before an RX ring enqueue.
    pub burst_size_io_rx_write: usize,
    /// Packets per worker ring dequeue.
    pub burst_size_worker_read: usize,
    /// Worker pending-array fill before a TX ring enqueue.
    pub burst_size_worker_write: usize,
    /// Packets per TX ring dequeue.
    pub burst_size_io_tx_read: usize,
    /// TX pending-array fill before handing a batch to the driver.
    pub burst_size_io_tx_write: usize,
    /// Capacity of each I/O→worker ring; power of two.
    pub ring_rx_size: usize,
    /// Capacity of each worker→TX ring; power of two.
    pub ring_tx_size: usize,
    /// Packet-buffer pool layout.
    pub pool: PoolConfig,
    /// Per-worker flow-cache bound.
    pub cache_entries: usize,
    /// Disables the flow cache entirely.
    pub no_cache: bool,
}

impl Default for DataplaneConfig {
    fn default() -> Self {
        Self {
            fifoness: Fifoness::Flow,
            burst_size_io_rx_read: 32,
            burst_size_io_rx_write: 32,
            burst_size_worker_read: 32,
            burst_size_worker_write: 32,
            burst_size_io_tx_read: 32,
            burst_size_io_tx_write: 32,
            ring_rx_size: 1024,
            ring_tx_size: 1024,
            pool: PoolConfig::default(),
            cache_entries: ofswitch_ofproto::cache::DEFAULT_CACHE_ENTRIES,
            no_cache: false,
        }
    }
}

/// Pending arrays are flushed every this many loop iterations.
pub const LCORE_IO_FLUSH: u64 = 100;

/// Workers flush, check the stop flag and the flowdb generation every
/// this many iterations.
pub const LCORE_WORKER_FLUSH: u64 = 1000;

/// I/O lcores check the stop flag every this many iterations; the
/// shutdown latency bound.
pub const UPDATE_TICK: u64 = 2_000_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_power_of_two_rings() {
        let c = DataplaneConfig::default();
        assert!(c.ring_rx_size.is_power_of_two());
        assert!(c.ring_tx_size.is_power_of_two());
    }

    #[test]
    fn test_fifoness_serde_names() {
        let j = serde_json::to_string(&Fifoness::Flow).unwrap();
        assert_eq!(j, "\"flow\"");
        let f: Fifoness = serde_json::from_str("\"port\"").unwrap();
        assert_eq!(f, Fifoness::Port);
    }
}
