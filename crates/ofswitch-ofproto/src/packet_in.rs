//! Bounded packet-in queue toward the OpenFlow agent.
//!
//! The workers push controller-destined packets here without blocking;
//! the agent drains them in bounded batches. When the queue is full the
//! packet is dropped and counted, never the worker stalled.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Why a packet was punted to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketInReason {
    /// No flow entry matched.
    NoMatch,
    /// An output-to-controller action fired.
    Action,
    /// A TTL decrement hit zero.
    InvalidTtl,
}

/// One controller-bound packet.
#[derive(Debug, Clone)]
pub struct PacketIn {
    /// Why it was punted.
    pub reason: PacketInReason,
    /// Ingress dataplane port index.
    pub in_port: u32,
    /// Table that produced the punt.
    pub table_id: u8,
    /// Cookie of the matching entry, when one existed.
    pub cookie: u64,
    /// Frame bytes.
    pub data: Vec<u8>,
}

/// Queue counters.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PacketInStats {
    /// Packets accepted into the queue.
    pub enqueued: u64,
    /// Packets dropped because the queue was full.
    pub dropped: u64,
}

/// The bounded agent channel.
pub struct PacketInQueue {
    tx: SyncSender<PacketIn>,
    rx: Mutex<Receiver<PacketIn>>,
    max_batches: usize,
    enqueued: AtomicU64,
    dropped: AtomicU64,
}

/// Default queue capacity.
pub const DEFAULT_CHANNELQ_SIZE: u16 = 1000;
/// Default drain batch bound.
pub const DEFAULT_CHANNELQ_MAX_BATCHES: u16 = 16;

impl PacketInQueue {
    /// Creates a queue holding up to `size` packets, drained at most
    /// `max_batches` at a time.
    pub fn new(size: u16, max_batches: u16) -> Self {
        let (tx, rx) = sync_channel(size.max(1) as usize);
        Self {
            tx,
            rx: Mutex::new(rx),
            max_batches: max_batches.max(1) as usize,
            enqueued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Non-blocking push; returns whether the packet was queued.
    pub fn push(&self, pkt: PacketIn) -> bool {
        match self.tx.try_send(pkt) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Drains up to the configured batch bound.
    pub fn drain(&self) -> Vec<PacketIn> {
        let rx = self.rx.lock();
        let mut out = Vec::new();
        while out.len() < self.max_batches {
            match rx.try_recv() {
                Ok(pkt) => out.push(pkt),
                Err(_) => break,
            }
        }
        out
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PacketInStats {
        PacketInStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for PacketInQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNELQ_SIZE, DEFAULT_CHANNELQ_MAX_BATCHES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt() -> PacketIn {
        PacketIn {
            reason: PacketInReason::NoMatch,
            in_port: 1,
            table_id: 0,
            cookie: 0,
            data: vec![0; 60],
        }
    }

    #[test]
    fn test_push_and_drain() {
        let q = PacketInQueue::new(8, 4);
        for _ in 0..6 {
            assert!(q.push(pkt()));
        }
        let batch = q.drain();
        assert_eq!(batch.len(), 4);
        let batch = q.drain();
        assert_eq!(batch.len(), 2);
        assert!(q.drain().is_empty());
    }

    #[test]
    fn test_full_queue_drops() {
        let q = PacketInQueue::new(2, 4);
        assert!(q.push(pkt()));
        assert!(q.push(pkt()));
        assert!(!q.push(pkt()));
        let stats = q.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.dropped, 1);
    }
}
