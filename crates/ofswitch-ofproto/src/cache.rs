//! Per-worker flow cache.
//!
//! Maps a packet fingerprint to the action plan resolved for the last
//! packet that looked the same. The cache is unsynchronized: each worker
//! owns one and nothing else touches it. Validity is tied to the flowdb
//! generation — a probe carrying a newer generation empties the cache
//! before looking, and workers additionally purge on the flush tick.

use std::collections::HashMap;
use std::sync::Arc;

use ofswitch_packet::headers::ETH_HLEN;
use ofswitch_packet::Mbuf;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::flow::{Action, FlowEntry, Instruction};

/// Bytes of packet data the fingerprint covers: the Ethernet header and
/// the first two payload bytes.
pub const FINGERPRINT_LEN: usize = ETH_HLEN + 2;

/// Default bound on cached plans per worker.
pub const DEFAULT_CACHE_ENTRIES: usize = 65536;

/// Computes the cache fingerprint: a 64-bit hash over the frame's first
/// [`FINGERPRINT_LEN`] bytes seeded with the ingress port.
#[inline]
pub fn fingerprint(m: &Mbuf) -> u64 {
    let hlen = FINGERPRINT_LEN.min(m.len());
    xxh3_64_with_seed(&m.data()[..hlen], m.meta().in_port as u64)
}

/// One step of a materialized plan, in OpenFlow instruction-execution
/// order.
#[derive(Debug, Clone)]
pub enum PlanOp {
    /// Run the meter; may drop or remark.
    Meter(u32),
    /// Apply these actions now.
    Apply(Vec<Action>),
    /// Empty the pending action set.
    ClearSet,
    /// Merge these actions into the pending action set.
    WriteSet(Vec<Action>),
    /// Update the metadata register.
    WriteMetadata {
        /// New bits.
        value: u64,
        /// Bits to touch.
        mask: u64,
    },
    /// Continue in a later table.
    Goto(u8),
}

/// A materialized, cacheable execution plan for one flow entry.
#[derive(Debug)]
pub struct ActionPlan {
    /// The entry the plan was built from; counters live there.
    pub entry: Arc<FlowEntry>,
    /// Steps in execution order.
    pub ops: Vec<PlanOp>,
}

impl ActionPlan {
    /// Flattens an entry's instructions into execution order: meter,
    /// apply-actions, clear/write of the action set, metadata, goto.
    pub fn materialize(entry: Arc<FlowEntry>) -> Self {
        let mut meter = Vec::new();
        let mut apply = Vec::new();
        let mut set_ops = Vec::new();
        let mut metadata = Vec::new();
        let mut goto = Vec::new();
        for ins in &entry.instructions {
            match ins {
                Instruction::Meter(id) => meter.push(PlanOp::Meter(*id)),
                Instruction::ApplyActions(actions) => apply.push(PlanOp::Apply(actions.clone())),
                Instruction::ClearActions => set_ops.push(PlanOp::ClearSet),
                Instruction::WriteActions(actions) => {
                    set_ops.push(PlanOp::WriteSet(actions.clone()))
                }
                Instruction::WriteMetadata { value, mask } => metadata.push(PlanOp::WriteMetadata {
                    value: *value,
                    mask: *mask,
                }),
                Instruction::GotoTable(t) => goto.push(PlanOp::Goto(*t)),
            }
        }
        let mut ops = meter;
        ops.extend(apply);
        ops.extend(set_ops);
        ops.extend(metadata);
        ops.extend(goto);
        Self { entry, ops }
    }
}

/// Cache hit/miss counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CacheStats {
    /// Plans currently cached.
    pub nentries: u64,
    /// Probe hits.
    pub hits: u64,
    /// Probe misses.
    pub misses: u64,
}

struct CacheSlot {
    plan: Arc<ActionPlan>,
}

/// The per-worker cache.
pub struct FlowCache {
    map: HashMap<u64, CacheSlot>,
    generation: u64,
    hits: u64,
    misses: u64,
    max_entries: usize,
}

impl FlowCache {
    /// Creates a cache bounded to `max_entries` plans.
    pub fn new(max_entries: usize) -> Self {
        Self {
            map: HashMap::new(),
            generation: 0,
            hits: 0,
            misses: 0,
            max_entries: max_entries.max(1),
        }
    }

    /// Probes the cache. `generation` is the flowdb generation observed
    /// for this batch; content cached under an older generation is
    /// discarded before the probe.
    pub fn lookup(&mut self, fp: u64, generation: u64) -> Option<Arc<ActionPlan>> {
        if generation != self.generation {
            self.map.clear();
            self.generation = generation;
        }
        match self.map.get(&fp) {
            Some(slot) => {
                self.hits += 1;
                Some(Arc::clone(&slot.plan))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Stores a freshly materialized plan. A full cache drops the new
    /// plan rather than evicting: short-lived churn must not wipe hot
    /// entries.
    pub fn insert(&mut self, fp: u64, generation: u64, plan: Arc<ActionPlan>) {
        if generation != self.generation {
            self.map.clear();
            self.generation = generation;
        }
        if self.map.len() >= self.max_entries {
            return;
        }
        self.map.insert(fp, CacheSlot { plan });
    }

    /// Empties the cache; called from the worker flush tick when the
    /// flowdb generation moved.
    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            nentries: self.map.len() as u64,
            hits: self.hits,
            misses: self.misses,
        }
    }
}
