//! Lockless single-producer/single-consumer packet rings.
//!
//! One ring connects exactly one producing thread to one consuming
//! thread; the endpoint types are not clonable and their methods take
//! `&mut self`, so the single-producer/single-consumer property is a
//! compile-time fact, with debug-build thread assertions as a second
//! line. Capacity is a power of two; indices wrap through a mask.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ofswitch_packet::Mbuf;

use crate::error::{DataplaneError, DataplaneResult};

struct RingShared {
    mask: usize,
    slots: Box<[UnsafeCell<Option<Mbuf>>]>,
    /// Next slot the producer writes.
    tail: AtomicUsize,
    /// Next slot the consumer reads.
    head: AtomicUsize,
    #[cfg(debug_assertions)]
    producer_thread: AtomicUsize,
    #[cfg(debug_assertions)]
    consumer_thread: AtomicUsize,
}

// The endpoints guarantee exclusive slot access per side.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

#[cfg(debug_assertions)]
fn thread_token() -> usize {
    use std::sync::atomic::AtomicUsize as Counter;
    static NEXT: Counter = Counter::new(1);
    thread_local! {
        static TOKEN: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TOKEN.with(|t| *t)
}

impl RingShared {
    #[cfg(debug_assertions)]
    fn assert_side(&self, slot: &AtomicUsize) {
        let me = thread_token();
        match slot.compare_exchange(0, me, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => {}
            Err(owner) => debug_assert_eq!(owner, me, "ring endpoint moved between threads"),
        }
    }
}

/// The producing endpoint.
pub struct RingProducer {
    ring: Arc<RingShared>,
}

/// The consuming endpoint.
pub struct RingConsumer {
    ring: Arc<RingShared>,
}

/// Creates a ring of the given power-of-two capacity.
pub fn ring(capacity: usize) -> DataplaneResult<(RingProducer, RingConsumer)> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(DataplaneError::BadRingSize(capacity));
    }
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(None))
        .collect::<Vec<_>>()
        .into_boxed_slice();
    let shared = Arc::new(RingShared {
        mask: capacity - 1,
        slots,
        tail: AtomicUsize::new(0),
        head: AtomicUsize::new(0),
        #[cfg(debug_assertions)]
        producer_thread: AtomicUsize::new(0),
        #[cfg(debug_assertions)]
        consumer_thread: AtomicUsize::new(0),
    });
    Ok((
        RingProducer {
            ring: Arc::clone(&shared),
        },
        RingConsumer { ring: shared },
    ))
}

impl RingProducer {
    /// Free slots at this instant, from the producer's view.
    pub fn free_space(&self) -> usize {
        let r = &self.ring;
        let tail = r.tail.load(Ordering::Relaxed);
        let head = r.head.load(Ordering::Acquire);
        r.mask + 1 - (tail - head)
    }

    fn push_n(&mut self, pkts: &mut Vec<Mbuf>, n: usize) {
        let r = &self.ring;
        let mut tail = r.tail.load(Ordering::Relaxed);
        for m in pkts.drain(..n) {
            let slot = &r.slots[tail & r.mask];
            unsafe { *slot.get() = Some(m) };
            tail += 1;
        }
        r.tail.store(tail, Ordering::Release);
    }

    /// Enqueues as many packets as fit, removing them from the front of
    /// `pkts`. Whatever remains is the caller's to free.
    pub fn enqueue_burst(&mut self, pkts: &mut Vec<Mbuf>) -> usize {
        #[cfg(debug_assertions)]
        self.ring.assert_side(&self.ring.producer_thread);
        let n = self.free_space().min(pkts.len());
        if n > 0 {
            self.push_n(pkts, n);
        }
        n
    }

    /// All-or-nothing enqueue: either every packet is queued or `pkts`
    /// is returned untouched.
    pub fn enqueue_bulk(&mut self, pkts: &mut Vec<Mbuf>) -> bool {
        #[cfg(debug_assertions)]
        self.ring.assert_side(&self.ring.producer_thread);
        if self.free_space() < pkts.len() {
            return false;
        }
        let n = pkts.len();
        self.push_n(pkts, n);
        true
    }
}

impl RingConsumer {
    /// Packets available at this instant, from the consumer's view.
    pub fn available(&self) -> usize {
        let r = &self.ring;
        let head = r.head.load(Ordering::Relaxed);
        let tail = r.tail.load(Ordering::Acquire);
        tail - head
    }

    /// Dequeues up to `max` packets into `out`; returns the count.
    pub fn dequeue_burst(&mut self, out: &mut Vec<Mbuf>, max: usize) -> usize {
        #[cfg(debug_assertions)]
        self.ring.assert_side(&self.ring.consumer_thread);
        let r = &self.ring;
        let mut head = r.head.load(Ordering::Relaxed);
        let tail = r.tail.load(Ordering::Acquire);
        let n = (tail - head).min(max);
        for _ in 0..n {
            let slot = &r.slots[head & r.mask];
            let m = unsafe { (*slot.get()).take() };
            if let Some(m) = m {
                out.push(m);
            }
            head += 1;
        }
        r.head.store(head, Ordering::Release);
        n
    }
}
