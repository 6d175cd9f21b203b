//! Per-port egress queue scheduling.
//!
//! Each shaped port carries an ordered set of queues. At enqueue a
//! packet tagged with a non-default queue id runs that queue's marker
//! and is dropped when red; at dequeue the scheduler serves priority
//! levels strictly (higher value first) and round-robins among queues
//! sharing a level. The TX loop enqueues a burst and immediately
//! dequeues whatever the scheduler releases, so shaping granularity is
//! the TX flush tick.

use std::collections::{HashMap, VecDeque};

use ofswitch_packet::meta::PktColor;
use ofswitch_packet::Mbuf;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{QosError, QosResult};
use crate::srtcm::{SrTcm, SrTcmConfig};
use crate::trtcm::{TrTcm, TrTcmConfig};

/// Default bound on queued packets per queue.
pub const DEFAULT_QUEUE_DEPTH: usize = 512;

/// Rate model of one egress queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueRate {
    /// RFC 2697 single-rate parameters, bytes and bytes/s.
    SingleRate {
        /// Committed information rate.
        cir: u64,
        /// Committed burst size.
        cbs: u64,
        /// Excess burst size.
        ebs: u64,
    },
    /// Two-rate parameters, bytes and bytes/s.
    TwoRate {
        /// Committed information rate.
        cir: u64,
        /// Committed burst size.
        cbs: u64,
        /// Peak information rate.
        pir: u64,
        /// Peak burst size.
        pbs: u64,
    },
}

/// Configuration of one egress queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue id referenced by set-queue actions.
    pub queue_id: u32,
    /// Priority level; higher values are served first.
    pub priority: u16,
    /// Whether the marker honors an incoming color tag.
    pub color_aware: bool,
    /// Rate parameters.
    pub rate: QueueRate,
}

/// Counter snapshot for one queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Packets accepted into the queue.
    pub enqueued: u64,
    /// Packets released to the driver.
    pub dequeued: u64,
    /// Packets dropped red by the marker.
    pub dropped_red: u64,
    /// Packets dropped because the queue was full.
    pub dropped_overflow: u64,
    /// Bytes released to the driver.
    pub tx_bytes: u64,
}

enum QueueMarker {
    Sr(SrTcm),
    Tr(TrTcm),
}

impl QueueMarker {
    fn check(&mut self, now_ns: u64, len: u64, aware: Option<PktColor>) -> PktColor {
        match (self, aware) {
            (QueueMarker::Sr(m), None) => m.check_blind(now_ns, len),
            (QueueMarker::Sr(m), Some(c)) => m.check_aware(now_ns, len, c),
            (QueueMarker::Tr(m), None) => m.check_blind(now_ns, len),
            (QueueMarker::Tr(m), Some(c)) => m.check_aware(now_ns, len, c),
        }
    }
}

struct SchedQueue {
    config: QueueConfig,
    marker: QueueMarker,
    fifo: VecDeque<Mbuf>,
    stats: QueueStats,
}

/// Strict-priority, intra-level round-robin scheduler for one port.
///
/// Owned by the TX path; never shared between threads.
pub struct PortScheduler {
    queues: Vec<SchedQueue>,
    /// Queue indices sorted by priority, highest first.
    order: Vec<usize>,
    /// Round-robin cursor per priority level.
    cursors: HashMap<u16, usize>,
    max_depth: usize,
}

impl PortScheduler {
    /// Creates an empty scheduler with the given per-queue depth bound.
    pub fn new(max_depth: usize) -> Self {
        Self {
            queues: Vec::new(),
            order: Vec::new(),
            cursors: HashMap::new(),
            max_depth: max_depth.max(1),
        }
    }

    fn rebuild_order(&mut self) {
        let mut idx: Vec<usize> = (0..self.queues.len()).collect();
        idx.sort_by(|&a, &b| {
            self.queues[b]
                .config
                .priority
                .cmp(&self.queues[a].config.priority)
        });
        self.order = idx;
    }

    /// Attaches a queue.
    pub fn add_queue(&mut self, config: QueueConfig) -> QosResult<()> {
        if self.queues.iter().any(|q| q.config.queue_id == config.queue_id) {
            return Err(QosError::QueueExists {
                queue_id: config.queue_id,
            });
        }
        let marker = match config.rate {
            QueueRate::SingleRate { cir, cbs, ebs } => {
                QueueMarker::Sr(SrTcm::new(SrTcmConfig { cir, cbs, ebs })?)
            }
            QueueRate::TwoRate { cir, cbs, pir, pbs } => {
                QueueMarker::Tr(TrTcm::new(TrTcmConfig { cir, cbs, pir, pbs })?)
            }
        };
        debug!(
            queue_id = config.queue_id,
            priority = config.priority,
            "attached egress queue"
        );
        self.queues.push(SchedQueue {
            config,
            marker,
            fifo: VecDeque::new(),
            stats: QueueStats::default(),
        });
        self.rebuild_order();
        Ok(())
    }

    /// Detaches a queue, freeing anything still queued.
    pub fn remove_queue(&mut self, queue_id: u32) -> QosResult<()> {
        let idx = self
            .queues
            .iter()
            .position(|q| q.config.queue_id == queue_id)
            .ok_or(QosError::QueueNotFound { queue_id })?;
        self.queues.remove(idx);
        self.cursors.clear();
        self.rebuild_order();
        Ok(())
    }

    /// Number of attached queues.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Total packets currently queued.
    pub fn backlog(&self) -> usize {
        self.queues.iter().map(|q| q.fifo.len()).sum()
    }

    fn queue_index(&self, queue_id: u32) -> usize {
        if queue_id == 0 {
            return 0;
        }
        self.queues
            .iter()
            .position(|q| q.config.queue_id == queue_id)
            .unwrap_or(0)
    }

    /// Offers one packet. Packets with a non-default queue id run the
    /// queue marker first; red packets and overflow are dropped (the
    /// mbuf is freed by the drop). Returns `true` when accepted.
    pub fn enqueue(&mut self, now_ns: u64, mut m: Mbuf) -> bool {
        if self.queues.is_empty() {
            return false;
        }
        let queue_id = m.meta().queue_id;
        let idx = self.queue_index(queue_id);
        let q = &mut self.queues[idx];
        if queue_id != 0 {
            let aware = if q.config.color_aware {
                Some(m.meta().color)
            } else {
                None
            };
            let color = q.marker.check(now_ns, m.len() as u64, aware);
            m.meta_mut().color = color;
            if color == PktColor::Red {
                q.stats.dropped_red += 1;
                return false;
            }
        }
        if q.fifo.len() >= self.max_depth {
            q.stats.dropped_overflow += 1;
            return false;
        }
        q.stats.enqueued += 1;
        q.fifo.push_back(m);
        true
    }

    /// Releases up to `max` packets in strict-priority order, round-robin
    /// within each priority level, appending them to `out`.
    pub fn dequeue(&mut self, max: usize, out: &mut Vec<Mbuf>) -> usize {
        let mut released = 0;
        let mut level_start = 0;
        while level_start < self.order.len() && released < max {
            let level = self.queues[self.order[level_start]].config.priority;
            let mut level_end = level_start;
            while level_end < self.order.len()
                && self.queues[self.order[level_end]].config.priority == level
            {
                level_end += 1;
            }
            let width = level_end - level_start;
            let cursor = self.cursors.entry(level).or_insert(0);
            let mut idle = 0;
            while released < max && idle < width {
                let pos = level_start + (*cursor % width);
                *cursor = (*cursor + 1) % width;
                let q = &mut self.queues[self.order[pos]];
                match q.fifo.pop_front() {
                    Some(m) => {
                        q.stats.dequeued += 1;
                        q.stats.tx_bytes += m.len() as u64;
                        out.push(m);
                        released += 1;
                        idle = 0;
                    }
                    None => idle += 1,
                }
            }
            level_start = level_end;
        }
        released
    }

    /// Per-queue counters, in attachment order.
    pub fn stats(&self) -> Vec<(u32, QueueStats)> {
        self.queues
            .iter()
            .map(|q| (q.config.queue_id, q.stats.clone()))
            .collect()
    }
}
