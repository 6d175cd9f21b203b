//! The per-bridge flow database.
//!
//! A fixed array of priority-ordered flow tables behind one
//! reader-writer lock. Workers hold the read lock for the duration of
//! one batch; configuration-plane writers take the write lock and bump
//! the generation counter, which tells workers to purge their caches at
//! the next flush tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ofswitch_packet::Mbuf;
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::debug;

use crate::error::{OfprotoError, OfprotoResult};
use crate::flow::{FlowEntry, FlowMatch};
use crate::ofp::N_FLOW_TABLES;

/// One numbered flow table; entries stay sorted by descending priority.
#[derive(Default)]
pub struct FlowTable {
    entries: Vec<Arc<FlowEntry>>,
}

impl FlowTable {
    /// Highest-priority entry matching the packet.
    pub fn lookup(&self, m: &Mbuf) -> Option<Arc<FlowEntry>> {
        self.entries
            .iter()
            .find(|e| e.fmatch.matches(m))
            .map(Arc::clone)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Read guard over the whole database; held per worker batch.
pub struct FlowDbRead<'a> {
    tables: RwLockReadGuard<'a, Vec<FlowTable>>,
}

impl FlowDbRead<'_> {
    /// Looks up the packet in one table.
    pub fn lookup(&self, table_id: u8, m: &Mbuf) -> Option<Arc<FlowEntry>> {
        self.tables.get(table_id as usize)?.lookup(m)
    }
}

/// The flow database.
pub struct FlowDb {
    tables: RwLock<Vec<FlowTable>>,
    generation: AtomicU64,
}

impl Default for FlowDb {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowDb {
    /// Creates the database with its fixed set of empty tables.
    pub fn new() -> Self {
        let tables = (0..N_FLOW_TABLES).map(|_| FlowTable::default()).collect();
        Self {
            tables: RwLock::new(tables),
            generation: AtomicU64::new(0),
        }
    }

    /// Current change generation. Workers compare this against the
    /// value they cached to decide whether to purge.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Takes the read lock for one batch of lookups.
    pub fn read(&self) -> FlowDbRead<'_> {
        FlowDbRead {
            tables: self.tables.read(),
        }
    }

    /// Inserts a flow entry, keeping the table priority-sorted. An entry
    /// with an identical match and priority is replaced.
    pub fn add_flow(&self, table_id: u8, entry: FlowEntry) -> OfprotoResult<()> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(table_id as usize)
            .ok_or(OfprotoError::TableOutOfRange(table_id))?;
        if let Some(pos) = table
            .entries
            .iter()
            .position(|e| e.priority == entry.priority && e.fmatch == entry.fmatch)
        {
            table.entries[pos] = Arc::new(entry);
        } else {
            let pos = table
                .entries
                .partition_point(|e| e.priority >= entry.priority);
            table.entries.insert(pos, Arc::new(entry));
        }
        drop(tables);
        self.bump();
        debug!(table_id, "flow added");
        Ok(())
    }

    /// Removes the entry with the exact match and priority.
    pub fn delete_flow(&self, table_id: u8, fmatch: &FlowMatch, priority: u16) -> OfprotoResult<()> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(table_id as usize)
            .ok_or(OfprotoError::TableOutOfRange(table_id))?;
        let pos = table
            .entries
            .iter()
            .position(|e| e.priority == priority && &e.fmatch == fmatch)
            .ok_or(OfprotoError::FlowNotFound { table_id })?;
        table.entries.remove(pos);
        drop(tables);
        self.bump();
        Ok(())
    }

    /// Empties every table.
    pub fn clear(&self) {
        let mut tables = self.tables.write();
        for table in tables.iter_mut() {
            table.entries.clear();
        }
        drop(tables);
        self.bump();
    }

    /// Total entries across all tables.
    pub fn flow_count(&self) -> usize {
        self.tables.read().iter().map(|t| t.len()).sum()
    }
}
