//! OpenFlow group table.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{OfprotoError, OfprotoResult};
use crate::flow::Action;

/// Group semantics per OpenFlow 1.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupType {
    /// Execute every bucket on a copy of the packet.
    All,
    /// Execute one bucket chosen by the packet's flow hash.
    Select,
    /// Execute the single bucket.
    Indirect,
    /// Execute the first live bucket.
    FastFailover,
}

/// One action bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    /// Relative weight for select groups.
    pub weight: u16,
    /// Port whose liveness gates this bucket; fast-failover only.
    pub watch_port: Option<u32>,
    /// Actions executed when the bucket runs.
    pub actions: Vec<Action>,
}

/// One group definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    /// Group id.
    pub group_id: u32,
    /// Bucket selection semantics.
    pub kind: GroupType,
    /// The buckets, in definition order.
    pub buckets: Vec<Bucket>,
}

impl Group {
    /// Picks the bucket a select group uses for a packet with the given
    /// flow hash. Weighted by bucket weight; zero-weight buckets are
    /// skipped.
    pub fn select_bucket(&self, flow_hash: u64) -> Option<&Bucket> {
        let total: u64 = self.buckets.iter().map(|b| b.weight.max(1) as u64).sum();
        if total == 0 {
            return None;
        }
        let mut point = flow_hash % total;
        for bucket in &self.buckets {
            let w = bucket.weight.max(1) as u64;
            if point < w {
                return Some(bucket);
            }
            point -= w;
        }
        None
    }
}

/// Group table keyed by group id.
#[derive(Default)]
pub struct GroupTable {
    groups: DashMap<u32, Arc<Group>>,
}

impl GroupTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a group; fails when the id is taken.
    pub fn add(&self, group: Group) -> OfprotoResult<()> {
        if self.groups.contains_key(&group.group_id) {
            return Err(OfprotoError::GroupExists(group.group_id));
        }
        self.groups.insert(group.group_id, Arc::new(group));
        Ok(())
    }

    /// Replaces a group definition.
    pub fn modify(&self, group: Group) -> OfprotoResult<()> {
        if !self.groups.contains_key(&group.group_id) {
            return Err(OfprotoError::GroupNotFound(group.group_id));
        }
        self.groups.insert(group.group_id, Arc::new(group));
        Ok(())
    }

    /// Removes a group.
    pub fn delete(&self, group_id: u32) -> OfprotoResult<()> {
        self.groups
            .remove(&group_id)
            .map(|_| ())
            .ok_or(OfprotoError::GroupNotFound(group_id))
    }

    /// Looks a group up for execution.
    pub fn lookup(&self, group_id: u32) -> Option<Arc<Group>> {
        self.groups.get(&group_id).map(|g| Arc::clone(g.value()))
    }

    /// Number of groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// True when no groups exist.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
