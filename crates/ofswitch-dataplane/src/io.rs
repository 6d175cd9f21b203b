//! I/O-side loop bodies: driver RX with worker dispatch, and ring
//! drain with policing, scheduling and driver TX.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use ofswitch_ofproto::Port;
use ofswitch_packet::csum::finalize_tx;
use ofswitch_packet::{Mbuf, PoolLocal};
use ofswitch_qos::MeterClock;
use tracing::trace;

use crate::classifier::select_worker;
use crate::config::{DataplaneConfig, Fifoness};
use crate::lcore::{IoParams, IoRxOut};

/// Appends one packet to a worker's pending batch, enqueueing the batch
/// into the ring when it reaches `bsz`. Overflow packets are freed on
/// the spot; the producer owns them until the ring does.
fn rx_buffer_to_send(out: &mut IoRxOut, m: Mbuf, bsz: usize) {
    out.pending.push(m);
    if out.pending.len() < bsz {
        out.flush = true;
        return;
    }
    out.flush = false;
    out.ring.enqueue_burst(&mut out.pending);
    if !out.pending.is_empty() {
        trace!(overflow = out.pending.len(), "worker ring full, freeing");
        out.pending.clear();
    }
}

/// One RX pass: burst-receive from every bound queue, stamp the ingress
/// port, and dispatch per the fifoness policy.
pub fn io_rx(
    io: &mut IoParams,
    pool: &mut PoolLocal,
    fifoness: Fifoness,
    bsz_rd: usize,
    bsz_wr: usize,
) {
    let n_workers = io.rx_out.len();
    if n_workers == 0 {
        return;
    }
    let mut burst: Vec<Mbuf> = Vec::with_capacity(bsz_rd);
    for i in 0..io.rx.len() {
        burst.clear();
        let (port_index, n) = {
            let binding = &io.rx[i];
            let iface = match binding.port.interface() {
                Some(iface) => iface,
                None => continue,
            };
            let n = iface.rx_burst(binding.queue, pool, &mut burst, bsz_rd);
            (binding.port.index(), n)
        };
        if n == 0 {
            continue;
        }
        {
            let counters = io.rx[i].port.counters();
            counters.rx_packets.fetch_add(n as u64, Ordering::Relaxed);
            let bytes: u64 = burst.iter().map(|m| m.len() as u64).sum();
            counters.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
        for (j, mut m) in burst.drain(..).enumerate() {
            m.meta_mut().in_port = port_index;
            let wkid = select_worker(fifoness, &m, j, n_workers);
            rx_buffer_to_send(&mut io.rx_out[wkid], m, bsz_wr);
        }
    }
}

/// Flush tick: pushes every partial RX batch into its worker ring.
pub fn io_rx_flush(io: &mut IoParams) {
    for out in io.rx_out.iter_mut() {
        if !out.flush || out.pending.is_empty() {
            continue;
        }
        out.ring.enqueue_burst(&mut out.pending);
        out.pending.clear();
        out.flush = false;
    }
}

/// Runs one pending TX batch through the port's policer, scheduler and
/// checksum finalization, then hands it to the driver. Unsent packets
/// are freed and counted as `tx_dropped`.
pub fn transmit(port: &Arc<Port>, pkts: &mut Vec<Mbuf>, clock: &MeterClock, queue: u16) {
    if pkts.is_empty() {
        return;
    }
    let iface = match port.interface() {
        Some(iface) => iface,
        None => {
            port.counters()
                .tx_dropped
                .fetch_add(pkts.len() as u64, Ordering::Relaxed);
            pkts.clear();
            return;
        }
    };
    let now = clock.now_ns();

    // Policer first: red drops regardless of queue.
    if let Some(policer) = port.policer() {
        pkts.retain(|m| !m.meta().drop && policer.police(now, m.len() as u64));
    } else {
        pkts.retain(|m| !m.meta().drop);
    }

    let caps = iface.tx_offload_caps();
    pkts.retain_mut(|m| finalize_tx(m, caps).is_ok());

    // Shaped ports go through the scheduler; the dequeue directly after
    // the enqueue releases whatever this tick's budget allows.
    let scheduled = port.with_scheduler(|sched| {
        let offered = pkts.len();
        let mut released = Vec::with_capacity(offered);
        for m in pkts.drain(..) {
            sched.enqueue(now, m);
        }
        sched.dequeue(offered.max(1), &mut released);
        released
    });
    if let Some(mut released) = scheduled {
        *pkts = std::mem::take(&mut released);
    }
    if pkts.is_empty() {
        return;
    }

    let offered = pkts.len();
    let mut bytes = 0u64;
    for m in pkts.iter() {
        bytes += m.len() as u64;
    }
    let sent = iface.tx_burst(queue, pkts);
    let unsent = offered - sent;
    let counters = port.counters();
    counters.tx_packets.fetch_add(sent as u64, Ordering::Relaxed);
    if unsent > 0 {
        let unsent_bytes: u64 = pkts.iter().map(|m| m.len() as u64).sum();
        bytes -= unsent_bytes;
        counters.tx_dropped.fetch_add(unsent as u64, Ordering::Relaxed);
        pkts.clear();
    }
    counters.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
}

/// One TX pass: drain every worker ring toward each owned port and
/// transmit full batches.
pub fn io_tx(io: &mut IoParams, clock: &MeterClock, bsz_rd: usize, bsz_wr: usize) {
    for tx in io.tx.iter_mut() {
        for ring in tx.rings.iter_mut() {
            let room = bsz_rd.saturating_sub(tx.pending.len());
            if room == 0 {
                break;
            }
            ring.dequeue_burst(&mut tx.pending, room);
        }
        if tx.pending.is_empty() {
            continue;
        }
        if tx.pending.len() < bsz_wr {
            tx.flush = true;
            continue;
        }
        tx.flush = false;
        transmit(&tx.port, &mut tx.pending, clock, 0);
    }
}

/// Flush tick: transmits every partial TX batch.
pub fn io_tx_flush(io: &mut IoParams, clock: &MeterClock) {
    for tx in io.tx.iter_mut() {
        if !tx.flush || tx.pending.is_empty() {
            continue;
        }
        tx.flush = false;
        transmit(&tx.port, &mut tx.pending, clock, 0);
    }
}

/// Both flushes, as run from the mixed-role loop.
pub fn io_flush(io: &mut IoParams, clock: &MeterClock) {
    io_rx_flush(io);
    io_tx_flush(io, clock);
}

/// Convenience accessors for the tick bodies.
pub fn burst_sizes(config: &DataplaneConfig) -> (usize, usize, usize, usize) {
    (
        config.burst_size_io_rx_read,
        config.burst_size_io_rx_write,
        config.burst_size_io_tx_read,
        config.burst_size_io_tx_write,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::ring;
    use ofswitch_driver::{InterfaceConfig, LoopbackDriver, NetDriver};
    use ofswitch_ofproto::{Interface, PortTable};
    use ofswitch_packet::{MbufPool, PoolConfig};

    fn loop_port(
        ports: &PortTable,
        driver: &Arc<LoopbackDriver>,
        name: &str,
    ) -> (Arc<Port>, u32) {
        let iface = Interface::attach(
            name,
            Arc::<LoopbackDriver>::clone(driver) as Arc<dyn NetDriver>,
            InterfaceConfig {
                device: name.to_string(),
                ..Default::default()
            },
        )
        .unwrap();
        iface.start().unwrap();
        let drv_port = iface.port_id();
        let port = ports.create(name).unwrap();
        port.set_interface(Some(iface));
        port.set_link_up(true);
        (port, drv_port)
    }

    #[test]
    fn test_transmit_counts_and_pads() {
        let ports = PortTable::new(4);
        let driver = Arc::new(LoopbackDriver::new());
        let (port_a, drv_a) = loop_port(&ports, &driver, "a");
        let (_port_b, drv_b) = loop_port(&ports, &driver, "b");
        driver.pair(drv_a, drv_b).unwrap();

        let clock = MeterClock::new();
        let mut pkts = vec![Mbuf::from_slice(&[0xee; 59])];
        transmit(&port_a, &mut pkts, &clock, 0);
        assert!(pkts.is_empty());
        assert_eq!(port_a.stats().tx_packets, 1);

        // The runt was padded before the wire.
        let delivered = driver.drain(drv_b).unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].len(), 60);
    }

    #[test]
    fn test_transmit_drop_flagged_packets() {
        let ports = PortTable::new(4);
        let driver = Arc::new(LoopbackDriver::new());
        let (port_a, drv_a) = loop_port(&ports, &driver, "a");
        let (_port_b, drv_b) = loop_port(&ports, &driver, "b");
        driver.pair(drv_a, drv_b).unwrap();

        let clock = MeterClock::new();
        let mut dropped = Mbuf::from_slice(&[1u8; 64]);
        dropped.meta_mut().drop = true;
        let mut pkts = vec![dropped, Mbuf::from_slice(&[2u8; 64])];
        transmit(&port_a, &mut pkts, &clock, 0);
        let delivered = driver.drain(drv_b).unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data()[0], 2);
    }

    #[test]
    fn test_transmit_policer_discards_red() {
        use ofswitch_qos::{Policer, PolicerActionKind, PolicerConfig};
        let ports = PortTable::new(4);
        let driver = Arc::new(LoopbackDriver::new());
        let (port_a, drv_a) = loop_port(&ports, &driver, "a");
        let (_port_b, drv_b) = loop_port(&ports, &driver, "b");
        driver.pair(drv_a, drv_b).unwrap();
        port_a.set_policer(Some(Arc::new(
            Policer::new(PolicerConfig {
                bandwidth_limit: 8,
                burst_size_limit: 100,
                bandwidth_percent: 0,
                actions: vec![PolicerActionKind::Discard],
            })
            .unwrap(),
        )));

        let clock = MeterClock::new();
        let mut pkts = vec![
            Mbuf::from_slice(&[1u8; 100]),
            Mbuf::from_slice(&[2u8; 100]),
        ];
        transmit(&port_a, &mut pkts, &clock, 0);
        // Bucket held 100 bytes: exactly one survived.
        let delivered = driver.drain(drv_b).unwrap();
        assert_eq!(delivered.len(), 1);
        let pstats = port_a.policer().unwrap().stats();
        assert_eq!(pstats.passed + pstats.dropped, 2);
    }

    #[test]
    fn test_transmit_without_interface_counts_drops() {
        let ports = PortTable::new(4);
        let port = ports.create("naked").unwrap();
        let clock = MeterClock::new();
        let mut pkts = vec![Mbuf::from_slice(&[0u8; 64])];
        transmit(&port, &mut pkts, &clock, 0);
        assert!(pkts.is_empty());
        assert_eq!(port.stats().tx_dropped, 1);
    }

    #[test]
    fn test_rx_buffer_batches_at_threshold() {
        let (producer, mut consumer) = ring(64).unwrap();
        let mut out = IoRxOut {
            ring: producer,
            pending: Vec::new(),
            flush: false,
        };
        for i in 0..3 {
            rx_buffer_to_send(&mut out, Mbuf::from_slice(&[i as u8; 60]), 4);
            assert!(out.flush);
        }
        // Fourth packet completes the batch and enqueues it.
        rx_buffer_to_send(&mut out, Mbuf::from_slice(&[3u8; 60]), 4);
        assert!(!out.flush);
        assert!(out.pending.is_empty());
        let mut drained = Vec::new();
        assert_eq!(consumer.dequeue_burst(&mut drained, 8), 4);
    }

    #[test]
    fn test_io_rx_dispatches_from_driver() {
        let ports = PortTable::new(4);
        let driver = Arc::new(LoopbackDriver::new());
        let (port_a, drv_a) = loop_port(&ports, &driver, "a");

        // Two workers, flow fifoness.
        let (p0, mut c0) = ring(64).unwrap();
        let (p1, mut c1) = ring(64).unwrap();
        let mut io = IoParams {
            rx: vec![crate::lcore::RxQueueBinding {
                port: Arc::clone(&port_a),
                queue: 0,
            }],
            rx_out: vec![
                IoRxOut {
                    ring: p0,
                    pending: Vec::new(),
                    flush: false,
                },
                IoRxOut {
                    ring: p1,
                    pending: Vec::new(),
                    flush: false,
                },
            ],
            tx: Vec::new(),
        };

        for i in 0..8u8 {
            driver
                .inject(drv_a, Mbuf::from_slice(&[i; 64]))
                .unwrap();
        }
        let pool = MbufPool::new(PoolConfig {
            capacity: 64,
            cache_size: 8,
            socket_id: 0,
        });
        let mut local = pool.local();
        io_rx(&mut io, &mut local, Fifoness::Flow, 32, 4);
        io_rx_flush(&mut io);

        let mut got = Vec::new();
        c0.dequeue_burst(&mut got, 64);
        c1.dequeue_burst(&mut got, 64);
        assert_eq!(got.len(), 8);
        // Every packet was stamped with the ingress port index.
        assert!(got.iter().all(|m| m.meta().in_port == port_a.index()));
        assert_eq!(port_a.stats().rx_packets, 8);
    }
}
