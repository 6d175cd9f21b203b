//! Bounded packet-buffer pools.
//!
//! One pool is created per NUMA socket before the pipeline threads
//! start. The shared free list is mutex-guarded; the hot path allocates
//! through a per-core [`PoolLocal`] cache that refills in batches, so the
//! lock is taken once per batch rather than once per packet. Allocation
//! never blocks: an empty pool yields `None` and the RX burst simply
//! receives fewer packets. Freeing always succeeds; dropping an [`Mbuf`]
//! returns its buffer here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::mbuf::{Mbuf, MBUF_CAPACITY};

/// Configuration for one buffer pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// NUMA socket this pool serves.
    pub socket_id: u32,
    /// Number of buffers in the pool.
    pub capacity: usize,
    /// Buffers a per-core cache holds between refills.
    pub cache_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            socket_id: 0,
            capacity: 16384,
            cache_size: 256,
        }
    }
}

/// Counters describing pool usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Buffers handed out since creation.
    pub allocated: u64,
    /// Buffers returned since creation.
    pub freed: u64,
    /// Allocation attempts that found the pool empty.
    pub exhausted: u64,
    /// Buffers currently held by the pipeline.
    pub in_use: u64,
}

struct PoolShared {
    socket_id: u32,
    free: Mutex<Vec<BytesMut>>,
    allocated: AtomicU64,
    freed: AtomicU64,
    exhausted: AtomicU64,
}

impl PoolShared {
    fn take_batch(&self, out: &mut Vec<BytesMut>, want: usize) -> usize {
        let mut free = self.free.lock();
        let n = want.min(free.len());
        let start = free.len() - n;
        out.extend(free.drain(start..));
        n
    }

    fn put_back(&self, buf: BytesMut) {
        self.free.lock().push(buf);
        self.freed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns a freed buffer to its pool; carried inside every pooled mbuf.
pub(crate) struct Recycler {
    shared: Arc<PoolShared>,
}

impl Recycler {
    pub(crate) fn give_back(self, buf: BytesMut) {
        self.shared.put_back(buf);
    }
}

/// A bounded, per-socket packet buffer pool.
pub struct MbufPool {
    shared: Arc<PoolShared>,
    cache_size: usize,
}

impl MbufPool {
    /// Creates the pool and pre-allocates every buffer.
    pub fn new(config: PoolConfig) -> Self {
        let mut free = Vec::with_capacity(config.capacity);
        for _ in 0..config.capacity {
            free.push(BytesMut::zeroed(MBUF_CAPACITY));
        }
        debug!(
            socket = config.socket_id,
            capacity = config.capacity,
            "created mbuf pool"
        );
        Self {
            shared: Arc::new(PoolShared {
                socket_id: config.socket_id,
                free: Mutex::new(free),
                allocated: AtomicU64::new(0),
                freed: AtomicU64::new(0),
                exhausted: AtomicU64::new(0),
            }),
            cache_size: config.cache_size.max(1),
        }
    }

    /// NUMA socket this pool serves.
    pub fn socket_id(&self) -> u32 {
        self.shared.socket_id
    }

    /// Creates a per-core allocation cache over this pool.
    pub fn local(&self) -> PoolLocal {
        PoolLocal {
            shared: Arc::clone(&self.shared),
            cache: Vec::with_capacity(self.cache_size),
            cache_size: self.cache_size,
        }
    }

    /// Allocates directly from the shared free list, bypassing any
    /// per-core cache. Configuration-plane use only.
    pub fn alloc(&self) -> Option<Mbuf> {
        let buf = self.shared.free.lock().pop();
        match buf {
            Some(buf) => {
                self.shared.allocated.fetch_add(1, Ordering::Relaxed);
                Some(Mbuf::from_pool(
                    buf,
                    Recycler {
                        shared: Arc::clone(&self.shared),
                    },
                ))
            }
            None => {
                self.shared.exhausted.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Snapshot of the usage counters. Readers accept torn-but-monotonic
    /// values; the pipeline is not quiesced.
    pub fn stats(&self) -> PoolStats {
        let allocated = self.shared.allocated.load(Ordering::Relaxed);
        let freed = self.shared.freed.load(Ordering::Relaxed);
        PoolStats {
            allocated,
            freed,
            exhausted: self.shared.exhausted.load(Ordering::Relaxed),
            in_use: allocated.saturating_sub(freed),
        }
    }
}

/// Per-core allocation cache.
///
/// Not `Sync`: each lcore owns exactly one. Frees do not pass through the
/// cache because an mbuf may be dropped by a different thread than the
/// one that allocated it; they go straight to the shared list.
pub struct PoolLocal {
    shared: Arc<PoolShared>,
    cache: Vec<BytesMut>,
    cache_size: usize,
}

impl PoolLocal {
    /// Allocates one mbuf, refilling the local cache from the shared
    /// list when empty. Returns `None` when the pool is exhausted.
    pub fn alloc(&mut self) -> Option<Mbuf> {
        if self.cache.is_empty() {
            let got = self.shared.take_batch(&mut self.cache, self.cache_size);
            if got == 0 {
                self.shared.exhausted.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }
        let buf = self.cache.pop().expect("refilled above");
        self.shared.allocated.fetch_add(1, Ordering::Relaxed);
        Some(Mbuf::from_pool(
            buf,
            Recycler {
                shared: Arc::clone(&self.shared),
            },
        ))
    }
}

impl Drop for PoolLocal {
    fn drop(&mut self) {
        // Return unused cached buffers so the pool stays whole.
        let mut free = self.shared.free.lock();
        free.append(&mut self.cache);
    }
}
