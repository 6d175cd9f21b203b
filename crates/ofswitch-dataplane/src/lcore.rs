//! Per-lcore state.
//!
//! Each pinned thread owns one slot: its role, the rx queues and tx
//! ports it services, its ring endpoints, and the pending-output arrays
//! that batch packets between flush ticks. Slots are built once by the
//! runtime and moved into their threads; cross-core traffic flows only
//! through the rings.

use std::collections::HashMap;
use std::sync::Arc;

use ofswitch_ofproto::Port;
use ofswitch_packet::Mbuf;
use serde::{Deserialize, Serialize};

use crate::ring::{RingConsumer, RingProducer};

/// What a logical core does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LcoreRole {
    /// Not participating.
    Disabled,
    /// RX/TX against drivers and rings.
    Io,
    /// Match-and-action.
    Worker,
    /// Both on one core; RX bursts bypass the rings.
    IoWorker,
}

/// One rx queue an I/O lcore polls.
pub struct RxQueueBinding {
    /// The port to receive from.
    pub port: Arc<Port>,
    /// Driver queue index.
    pub queue: u16,
}

/// Producer side toward one worker, with its pending batch.
pub struct IoRxOut {
    /// Ring into the worker.
    pub ring: RingProducer,
    /// Packets accumulated toward the next burst enqueue.
    pub pending: Vec<Mbuf>,
    /// Set when a partial batch is waiting for the flush tick.
    pub flush: bool,
}

/// TX state for one port owned by an I/O lcore.
pub struct TxPortParams {
    /// The egress port.
    pub port: Arc<Port>,
    /// One consumer ring per worker.
    pub rings: Vec<RingConsumer>,
    /// Packets accumulated toward the next driver burst.
    pub pending: Vec<Mbuf>,
    /// Set when a partial batch is waiting for the flush tick.
    pub flush: bool,
}

/// I/O-side state of one lcore.
#[derive(Default)]
pub struct IoParams {
    /// RX queues this lcore polls.
    pub rx: Vec<RxQueueBinding>,
    /// Per-worker dispatch state, indexed by worker id.
    pub rx_out: Vec<IoRxOut>,
    /// TX ports this lcore drains.
    pub tx: Vec<TxPortParams>,
}

/// Worker-side egress state toward one port.
pub struct WorkerOut {
    /// Ring toward the I/O lcore owning the port's TX.
    pub ring: RingProducer,
    /// Packets accumulated toward the next burst enqueue.
    pub pending: Vec<Mbuf>,
    /// Set when a partial batch is waiting for the flush tick.
    pub flush: bool,
}

/// Worker-side state of one lcore.
pub struct WorkerParams {
    /// Dense worker id, assigned in lcore order.
    pub worker_id: u32,
    /// One input ring per I/O lcore.
    pub rings_in: Vec<RingConsumer>,
    /// Egress state keyed by dataplane port index.
    pub out: HashMap<u32, WorkerOut>,
}

/// The complete state handed to one pipeline thread.
pub struct LcoreSlot {
    /// Logical core to pin to.
    pub lcore_id: usize,
    /// The role this slot runs.
    pub role: LcoreRole,
    /// I/O state; empty for pure workers.
    pub io: IoParams,
    /// Worker state; `None` for pure I/O lcores.
    pub worker: Option<WorkerParams>,
}

/// Requested layout for one lcore, resolved by the runtime into a
/// [`LcoreSlot`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcoreAssignment {
    /// Logical core id.
    pub lcore_id: usize,
    /// Role to run.
    pub role: LcoreRole,
    /// (dataplane port index, queue) pairs to poll; I/O roles only.
    pub rx_queues: Vec<(u32, u16)>,
    /// Dataplane port indices whose TX this lcore owns; I/O roles only.
    pub tx_ports: Vec<u32>,
}

/// Assigns dense worker ids in ascending lcore order.
pub fn assign_worker_ids(assignments: &[LcoreAssignment]) -> HashMap<usize, u32> {
    let mut ids = HashMap::new();
    let mut next = 0u32;
    for a in assignments {
        if matches!(a.role, LcoreRole::Worker | LcoreRole::IoWorker) {
            ids.insert(a.lcore_id, next);
            next += 1;
        }
    }
    ids
}

/// Picks the I/O lcore with the fewest rx queues for a new binding;
/// used when a port has no explicit placement.
pub fn least_loaded_io(assignments: &[LcoreAssignment]) -> Option<usize> {
    assignments
        .iter()
        .filter(|a| matches!(a.role, LcoreRole::Io | LcoreRole::IoWorker))
        .min_by_key(|a| a.rx_queues.len())
        .map(|a| a.lcore_id)
}
