//! The pipeline runtime: ring topology construction, pinned thread
//! spawning, role loops, and cooperative shutdown.
//!
//! One ring connects every (pure-I/O lcore, worker) pair for RX and
//! every (worker, TX port) pair for TX. Threads busy-poll; the stop
//! flag is read only at update ticks, so the hot path stays branch-light
//! and worst-case shutdown latency is bounded by the tick period.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ofswitch_ofproto::{CacheStats, FlowCache, Kernel, PortTable};
use ofswitch_packet::MbufPool;
use ofswitch_qos::MeterClock;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::affinity::pin_current_thread;
use crate::config::{DataplaneConfig, LCORE_IO_FLUSH, LCORE_WORKER_FLUSH, UPDATE_TICK};
use crate::error::{DataplaneError, DataplaneResult};
use crate::io::{io_rx, io_rx_flush, io_tx, io_tx_flush};
use crate::lcore::{
    assign_worker_ids, IoParams, IoRxOut, LcoreAssignment, LcoreRole, LcoreSlot, RxQueueBinding,
    TxPortParams, WorkerOut, WorkerParams,
};
use crate::ring::ring;
use crate::worker::{mixed_rx, worker_flush, worker_tick};

/// Handle over the running pipeline threads.
pub struct PipelineRuntime {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    ports: Arc<PortTable>,
    cache_stats: Arc<Mutex<HashMap<u32, CacheStats>>>,
}

impl PipelineRuntime {
    /// Builds the ring topology for `assignments` and spawns one pinned
    /// thread per non-disabled lcore.
    pub fn spawn(
        config: DataplaneConfig,
        ports: Arc<PortTable>,
        pool: Arc<MbufPool>,
        assignments: Vec<LcoreAssignment>,
    ) -> DataplaneResult<Self> {
        let worker_ids = assign_worker_ids(&assignments);
        let n_workers = worker_ids.len();
        let has_pure_rx = assignments
            .iter()
            .any(|a| a.role == LcoreRole::Io && !a.rx_queues.is_empty());
        if has_pure_rx && n_workers == 0 {
            return Err(DataplaneError::BadLayout {
                reason: "rx queues bound but no worker lcores".to_string(),
            });
        }

        // Worker lcores in worker-id order; ring vectors index by id.
        let mut worker_lcores: Vec<(usize, u32)> =
            worker_ids.iter().map(|(&l, &w)| (l, w)).collect();
        worker_lcores.sort_by_key(|&(_, w)| w);

        let mut slots: HashMap<usize, LcoreSlot> = HashMap::new();
        for a in &assignments {
            if a.role == LcoreRole::Disabled {
                continue;
            }
            let mut io = IoParams::default();
            for &(port_index, queue) in &a.rx_queues {
                let port = ports.get(port_index).ok_or_else(|| DataplaneError::BadLayout {
                    reason: format!("rx port index {port_index} is not in the port table"),
                })?;
                io.rx.push(RxQueueBinding { port, queue });
            }
            for &port_index in &a.tx_ports {
                let port = ports.get(port_index).ok_or_else(|| DataplaneError::BadLayout {
                    reason: format!("tx port index {port_index} is not in the port table"),
                })?;
                io.tx.push(TxPortParams {
                    port,
                    rings: Vec::new(),
                    pending: Vec::new(),
                    flush: false,
                });
            }
            let worker = worker_ids.get(&a.lcore_id).map(|&worker_id| WorkerParams {
                worker_id,
                rings_in: Vec::new(),
                out: HashMap::new(),
            });
            slots.insert(
                a.lcore_id,
                LcoreSlot {
                    lcore_id: a.lcore_id,
                    role: a.role,
                    io,
                    worker,
                },
            );
        }

        // RX rings: every pure-I/O lcore with rx queues feeds every
        // worker. Mixed lcores run their own rx inline.
        let rx_producers: Vec<usize> = assignments
            .iter()
            .filter(|a| a.role == LcoreRole::Io && !a.rx_queues.is_empty())
            .map(|a| a.lcore_id)
            .collect();
        for &io_lcore in &rx_producers {
            for &(worker_lcore, _) in &worker_lcores {
                let (producer, consumer) = ring(config.ring_rx_size)?;
                slots
                    .get_mut(&io_lcore)
                    .expect("slot built above")
                    .io
                    .rx_out
                    .push(IoRxOut {
                        ring: producer,
                        pending: Vec::new(),
                        flush: false,
                    });
                slots
                    .get_mut(&worker_lcore)
                    .expect("slot built above")
                    .worker
                    .as_mut()
                    .expect("worker role")
                    .rings_in
                    .push(consumer);
            }
        }

        // TX rings: every worker feeds every TX port.
        let tx_owners: Vec<(usize, Vec<u32>)> = assignments
            .iter()
            .filter(|a| !a.tx_ports.is_empty())
            .map(|a| (a.lcore_id, a.tx_ports.clone()))
            .collect();
        for (io_lcore, tx_ports) in &tx_owners {
            for (pos, &port_index) in tx_ports.iter().enumerate() {
                let mut consumers = Vec::with_capacity(worker_lcores.len());
                for &(worker_lcore, _) in &worker_lcores {
                    let (producer, consumer) = ring(config.ring_tx_size)?;
                    slots
                        .get_mut(&worker_lcore)
                        .expect("slot built above")
                        .worker
                        .as_mut()
                        .expect("worker role")
                        .out
                        .insert(
                            port_index,
                            WorkerOut {
                                ring: producer,
                                pending: Vec::new(),
                                flush: false,
                            },
                        );
                    consumers.push(consumer);
                }
                let slot = slots.get_mut(io_lcore).expect("slot built above");
                slot.io.tx[pos].rings = consumers;
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let kernel = Arc::new(Kernel::new(Arc::clone(&ports)));
        let cache_stats: Arc<Mutex<HashMap<u32, CacheStats>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut threads = Vec::new();

        let mut slot_list: Vec<LcoreSlot> = slots.into_values().collect();
        slot_list.sort_by_key(|s| s.lcore_id);
        for slot in slot_list {
            let stop = Arc::clone(&stop);
            let config = config.clone();
            let kernel = Arc::clone(&kernel);
            let pool_local = pool.local();
            let stats_slot = Arc::clone(&cache_stats);
            let name = format!("ofswitch-lcore{}", slot.lcore_id);
            let handle = std::thread::Builder::new().name(name).spawn(move || {
                pin_current_thread(slot.lcore_id);
                match slot.role {
                    LcoreRole::Io => io_loop(slot, pool_local, &config, &stop),
                    LcoreRole::Worker => worker_loop(slot, &kernel, &config, &stop, &stats_slot),
                    LcoreRole::IoWorker => {
                        mixed_loop(slot, pool_local, &kernel, &config, &stop, &stats_slot)
                    }
                    LcoreRole::Disabled => {}
                }
            })?;
            threads.push(handle);
        }
        info!(
            lcores = threads.len(),
            workers = n_workers,
            "pipeline running"
        );
        Ok(Self {
            stop,
            threads,
            ports,
            cache_stats,
        })
    }

    /// Requests cooperative shutdown and joins every pipeline thread.
    /// Worst-case latency is one update tick.
    pub fn stop(&mut self) -> DataplaneResult<()> {
        if self.threads.is_empty() {
            return Err(DataplaneError::AlreadyStopped);
        }
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!("pipeline stopped");
        Ok(())
    }

    /// True while pipeline threads run.
    pub fn is_running(&self) -> bool {
        !self.threads.is_empty()
    }

    /// The port table the pipeline serves.
    pub fn ports(&self) -> &Arc<PortTable> {
        &self.ports
    }

    /// Aggregated flow-cache statistics across workers, as published at
    /// their flush ticks.
    pub fn flowcache_stats(&self) -> CacheStats {
        let map = self.cache_stats.lock();
        let mut total = CacheStats::default();
        for s in map.values() {
            total.nentries += s.nentries;
            total.hits += s.hits;
            total.misses += s.misses;
        }
        total
    }
}

impl Drop for PipelineRuntime {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            let _ = self.stop();
        }
    }
}

fn io_loop(
    mut slot: LcoreSlot,
    mut pool_local: ofswitch_packet::PoolLocal,
    config: &DataplaneConfig,
    stop: &AtomicBool,
) {
    let clock = MeterClock::new();
    let mut flush_count = 0u64;
    let mut update_count = 0u64;
    debug!(lcore = slot.lcore_id, "io loop entered");
    loop {
        if flush_count == LCORE_IO_FLUSH {
            io_rx_flush(&mut slot.io);
            io_tx_flush(&mut slot.io, &clock);
            flush_count = 0;
        }
        if update_count == UPDATE_TICK {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            update_count = 0;
        }
        io_rx(
            &mut slot.io,
            &mut pool_local,
            config.fifoness,
            config.burst_size_io_rx_read,
            config.burst_size_io_rx_write,
        );
        io_tx(
            &mut slot.io,
            &clock,
            config.burst_size_io_tx_read,
            config.burst_size_io_tx_write,
        );
        flush_count += 1;
        update_count += 1;
    }
    io_rx_flush(&mut slot.io);
    io_tx_flush(&mut slot.io, &clock);
    debug!(lcore = slot.lcore_id, "io loop exited");
}

fn worker_loop(
    mut slot: LcoreSlot,
    kernel: &Kernel,
    config: &DataplaneConfig,
    stop: &AtomicBool,
    stats: &Mutex<HashMap<u32, CacheStats>>,
) {
    let mut w = slot.worker.take().expect("worker role has params");
    let mut cache = FlowCache::new(if config.no_cache { 1 } else { config.cache_entries });
    let mut i = 0u64;
    debug!(lcore = slot.lcore_id, worker = w.worker_id, "worker loop entered");
    loop {
        if i == LCORE_WORKER_FLUSH {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            worker_flush(&mut w);
            stats.lock().insert(w.worker_id, cache.stats());
            i = 0;
        }
        worker_tick(
            &mut w,
            kernel,
            &mut cache,
            config.burst_size_worker_read,
            config.burst_size_worker_write,
        );
        i += 1;
    }
    worker_flush(&mut w);
    stats.lock().insert(w.worker_id, cache.stats());
    debug!(lcore = slot.lcore_id, worker = w.worker_id, "worker loop exited");
}

fn mixed_loop(
    mut slot: LcoreSlot,
    mut pool_local: ofswitch_packet::PoolLocal,
    kernel: &Kernel,
    config: &DataplaneConfig,
    stop: &AtomicBool,
    stats: &Mutex<HashMap<u32, CacheStats>>,
) {
    let clock = MeterClock::new();
    let mut w = slot.worker.take().expect("mixed role has params");
    let mut cache = FlowCache::new(if config.no_cache { 1 } else { config.cache_entries });
    let mut i = 0u64;
    debug!(lcore = slot.lcore_id, worker = w.worker_id, "mixed loop entered");
    loop {
        if i == LCORE_WORKER_FLUSH {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            io_rx_flush(&mut slot.io);
            io_tx_flush(&mut slot.io, &clock);
            worker_flush(&mut w);
            stats.lock().insert(w.worker_id, cache.stats());
            i = 0;
        }
        // Mixed role: rx bursts go straight to the kernel, no rings.
        mixed_rx(
            &mut slot.io,
            &mut pool_local,
            kernel,
            &mut cache,
            &mut w.out,
            config.burst_size_io_rx_read,
            config.burst_size_worker_write,
        );
        io_tx(
            &mut slot.io,
            &clock,
            config.burst_size_io_tx_read,
            config.burst_size_io_tx_write,
        );
        worker_tick(
            &mut w,
            kernel,
            &mut cache,
            config.burst_size_worker_read,
            config.burst_size_worker_write,
        );
        i += 1;
    }
    io_rx_flush(&mut slot.io);
    worker_flush(&mut w);
    io_tx_flush(&mut slot.io, &clock);
    stats.lock().insert(w.worker_id, cache.stats());
    debug!(lcore = slot.lcore_id, "mixed loop exited");
}
