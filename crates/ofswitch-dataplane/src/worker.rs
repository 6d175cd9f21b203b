//! Worker-side loop bodies: ring dequeue, kernel invocation, and the
//! egress sink that batches packets toward the TX rings.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use ofswitch_ofproto::{FlowCache, Kernel, OutputSink, Port};
use ofswitch_packet::{Mbuf, PoolLocal};
use tracing::trace;

use crate::lcore::{IoParams, WorkerOut, WorkerParams};

/// Output sink writing into the worker's per-port pending arrays.
pub struct WorkerSink<'a> {
    out: &'a mut std::collections::HashMap<u32, WorkerOut>,
    bsz_wr: usize,
}

impl<'a> WorkerSink<'a> {
    /// Wraps a worker's egress map for one batch.
    pub fn new(out: &'a mut std::collections::HashMap<u32, WorkerOut>, bsz_wr: usize) -> Self {
        Self { out, bsz_wr }
    }
}

impl OutputSink for WorkerSink<'_> {
    fn output(&mut self, port: Arc<Port>, m: Mbuf) {
        let slot = match self.out.get_mut(&port.index()) {
            Some(slot) => slot,
            None => {
                // No ring toward this port from this worker: the port
                // appeared after the topology was built.
                port.counters()
                    .tx_dropped
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return;
            }
        };
        slot.pending.push(m);
        if slot.pending.len() < self.bsz_wr {
            slot.flush = true;
            return;
        }
        slot.flush = false;
        slot.ring.enqueue_burst(&mut slot.pending);
        if !slot.pending.is_empty() {
            trace!(
                port = port.index(),
                overflow = slot.pending.len(),
                "tx ring full, freeing"
            );
            slot.pending.clear();
        }
    }
}

/// One worker pass: drain each input ring once and run the kernel on
/// whatever arrived.
pub fn worker_tick(
    w: &mut WorkerParams,
    kernel: &Kernel,
    cache: &mut FlowCache,
    bsz_rd: usize,
    bsz_wr: usize,
) {
    for i in 0..w.rings_in.len() {
        let mut batch = Vec::with_capacity(bsz_rd);
        let n = w.rings_in[i].dequeue_burst(&mut batch, bsz_rd);
        if n == 0 {
            continue;
        }
        for m in batch.iter_mut() {
            m.meta_mut().worker_id = w.worker_id;
        }
        let mut sink = WorkerSink::new(&mut w.out, bsz_wr);
        kernel.process_batch(batch, cache, &mut sink);
    }
}

/// Mixed-role RX: burst-receive and hand the batch straight to the
/// kernel, bypassing the worker rings.
pub fn mixed_rx(
    io: &mut IoParams,
    pool: &mut PoolLocal,
    kernel: &Kernel,
    cache: &mut FlowCache,
    out: &mut HashMap<u32, WorkerOut>,
    bsz_rd: usize,
    bsz_wr: usize,
) {
    for binding in io.rx.iter() {
        let iface = match binding.port.interface() {
            Some(iface) => iface,
            None => continue,
        };
        let mut batch = Vec::with_capacity(bsz_rd);
        let n = iface.rx_burst(binding.queue, pool, &mut batch, bsz_rd);
        if n == 0 {
            continue;
        }
        let counters = binding.port.counters();
        counters.rx_packets.fetch_add(n as u64, Ordering::Relaxed);
        let bytes: u64 = batch.iter().map(|m| m.len() as u64).sum();
        counters.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
        let port_index = binding.port.index();
        for m in batch.iter_mut() {
            m.meta_mut().in_port = port_index;
        }
        let mut sink = WorkerSink::new(out, bsz_wr);
        kernel.process_batch(batch, cache, &mut sink);
    }
}

/// Flush tick: pushes every partial egress batch into its TX ring.
pub fn worker_flush(w: &mut WorkerParams) {
    for slot in w.out.values_mut() {
        if !slot.flush || slot.pending.is_empty() {
            continue;
        }
        slot.ring.enqueue_burst(&mut slot.pending);
        slot.pending.clear();
        slot.flush = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ring;
    use ofswitch_ofproto::PortTable;
    use std::collections::HashMap;

    #[test]
    fn test_sink_batches_and_flushes() {
        let ports = PortTable::new(4);
        let port = ports.create("p0").unwrap();
        let (producer, mut consumer) = ring(64).unwrap();
        let mut out = HashMap::new();
        out.insert(
            port.index(),
            WorkerOut {
                ring: producer,
                pending: Vec::new(),
                flush: false,
            },
        );

        {
            let mut sink = WorkerSink::new(&mut out, 4);
            for i in 0..3u8 {
                sink.output(Arc::clone(&port), Mbuf::from_slice(&[i; 60]));
            }
        }
        // Partial batch still pending.
        let mut drained = Vec::new();
        assert_eq!(consumer.dequeue_burst(&mut drained, 8), 0);

        let mut w = WorkerParams {
            worker_id: 0,
            rings_in: Vec::new(),
            out,
        };
        worker_flush(&mut w);
        assert_eq!(consumer.dequeue_burst(&mut drained, 8), 3);
    }

    #[test]
    fn test_sink_drops_for_unknown_port() {
        let ports = PortTable::new(4);
        let port = ports.create("p0").unwrap();
        let mut out = HashMap::new();
        let mut sink = WorkerSink::new(&mut out, 4);
        sink.output(Arc::clone(&port), Mbuf::from_slice(&[0u8; 60]));
        assert_eq!(port.stats().tx_dropped, 1);
    }

    #[test]
    fn test_sink_enqueues_full_batch() {
        let ports = PortTable::new(4);
        let port = ports.create("p0").unwrap();
        let (producer, mut consumer) = ring(64).unwrap();
        let mut out = HashMap::new();
        out.insert(
            port.index(),
            WorkerOut {
                ring: producer,
                pending: Vec::new(),
                flush: false,
            },
        );
        let mut sink = WorkerSink::new(&mut out, 2);
        sink.output(Arc::clone(&port), Mbuf::from_slice(&[1u8; 60]));
        sink.output(Arc::clone(&port), Mbuf::from_slice(&[2u8; 60]));
        let mut drained = Vec::new();
        assert_eq!(consumer.dequeue_burst(&mut drained, 8), 2);
    }
}
