//! In-memory paired device.
//!
//! Two loopback ports form a wire: what one transmits the other
//! receives. Link state, MTU and offload capabilities are settable,
//! which makes this back-end the test harness for the whole pipeline;
//! it honors the same burst contract as the OS-level back-ends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use dashmap::DashMap;
use ofswitch_packet::{Mbuf, PoolLocal};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{DriverError, DriverResult};
use crate::registry::SlotAllocator;
use crate::{
    DriverKind, DriverStats, InterfaceConfig, LinkCallback, LinkStatus, NetDriver, PortId,
};

/// Packets one loopback wire buffers before partial TX kicks in.
pub const LOOPBACK_WIRE_DEPTH: usize = 1024;

#[derive(Default)]
struct Counters {
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    tx_dropped: AtomicU64,
}

struct LoopPort {
    device: String,
    peer: Mutex<Option<PortId>>,
    rxq: Mutex<VecDeque<Mbuf>>,
    started: AtomicBool,
    link_up: AtomicBool,
    promisc: AtomicBool,
    mtu: AtomicU32,
    offload_caps: AtomicU32,
    hwaddr: [u8; 6],
    counters: Counters,
    callback: Mutex<Option<LinkCallback>>,
}

/// The in-memory back-end.
#[derive(Default)]
pub struct LoopbackDriver {
    slots: SlotAllocator,
    ports: DashMap<PortId, LoopPort>,
}

impl LoopbackDriver {
    /// Creates an empty loopback back-end.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects two configured ports as a wire, both directions.
    pub fn pair(&self, a: PortId, b: PortId) -> DriverResult<()> {
        {
            let pa = self.ports.get(&a).ok_or(DriverError::PortNotFound(a))?;
            *pa.peer.lock() = Some(b);
        }
        let pb = self.ports.get(&b).ok_or(DriverError::PortNotFound(b))?;
        *pb.peer.lock() = Some(a);
        Ok(())
    }

    /// Forces the link state of one port, firing any registered
    /// callback on a transition.
    pub fn set_link(&self, port: PortId, up: bool) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        let was = p.link_up.swap(up, Ordering::SeqCst);
        if was != up {
            let status = LinkStatus {
                up,
                speed_mbps: 10_000,
                full_duplex: true,
            };
            let cb = p.callback.lock().clone();
            drop(p);
            if let Some(cb) = cb {
                cb(port, status);
            }
        }
        Ok(())
    }

    /// Declares TX offload capabilities for one port.
    pub fn set_offload_caps(&self, port: PortId, caps: u32) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        p.offload_caps.store(caps, Ordering::SeqCst);
        Ok(())
    }

    /// Injects one packet into a port's receive queue, as if the wire
    /// delivered it.
    pub fn inject(&self, port: PortId, m: Mbuf) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        p.rxq.lock().push_back(m);
        Ok(())
    }

    /// Drains every packet pending on a port's receive queue; test
    /// observation helper.
    pub fn drain(&self, port: PortId) -> DriverResult<Vec<Mbuf>> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        let mut q = p.rxq.lock();
        Ok(q.drain(..).collect())
    }
}

impl NetDriver for LoopbackDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Loopback
    }

    fn configure(&self, config: &InterfaceConfig) -> DriverResult<PortId> {
        let port = self.slots.alloc()?;
        let hwaddr = [0x02, 0x10, 0x00, 0x00, 0x00, port as u8];
        self.ports.insert(
            port,
            LoopPort {
                device: config.device.clone(),
                peer: Mutex::new(None),
                rxq: Mutex::new(VecDeque::new()),
                started: AtomicBool::new(false),
                link_up: AtomicBool::new(true),
                promisc: AtomicBool::new(config.promiscuous),
                mtu: AtomicU32::new(config.mtu),
                offload_caps: AtomicU32::new(0),
                hwaddr,
                counters: Counters::default(),
                callback: Mutex::new(None),
            },
        );
        debug!(port, device = %config.device, "configured loopback port");
        Ok(port)
    }

    fn unconfigure(&self, port: PortId) -> DriverResult<()> {
        let (_, removed) = self
            .ports
            .remove(&port)
            .ok_or(DriverError::PortNotFound(port))?;
        // Unlink the peer so it stops delivering into a dead queue.
        if let Some(peer) = *removed.peer.lock() {
            if let Some(p) = self.ports.get(&peer) {
                *p.peer.lock() = None;
            }
        }
        debug!(port, device = %removed.device, "unconfigured loopback port");
        self.slots.free(port)
    }

    fn start(&self, port: PortId) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        p.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self, port: PortId) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        p.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn rx_burst(
        &self,
        port: PortId,
        _queue: u16,
        _pool: &mut PoolLocal,
        out: &mut Vec<Mbuf>,
        max: usize,
    ) -> usize {
        let p = match self.ports.get(&port) {
            Some(p) => p,
            None => return 0,
        };
        if !p.started.load(Ordering::Relaxed) {
            return 0;
        }
        let mut q = p.rxq.lock();
        let n = max.min(q.len());
        for _ in 0..n {
            let m = q.pop_front().expect("len checked");
            p.counters.rx_packets.fetch_add(1, Ordering::Relaxed);
            p.counters
                .rx_bytes
                .fetch_add(m.len() as u64, Ordering::Relaxed);
            out.push(m);
        }
        n
    }

    fn tx_burst(&self, port: PortId, _queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
        let peer = {
            let p = match self.ports.get(&port) {
                Some(p) => p,
                None => return 0,
            };
            if !p.started.load(Ordering::Relaxed) || !p.link_up.load(Ordering::Relaxed) {
                return 0;
            }
            let peer = match *p.peer.lock() {
                Some(peer) => peer,
                None => return 0,
            };
            peer
        };
        let (delivered, bytes) = {
            let dst = match self.ports.get(&peer) {
                Some(dst) => dst,
                None => return 0,
            };
            let mut q = dst.rxq.lock();
            let room = LOOPBACK_WIRE_DEPTH.saturating_sub(q.len());
            let n = room.min(pkts.len());
            let mut bytes = 0u64;
            for m in pkts.drain(..n) {
                bytes += m.len() as u64;
                q.push_back(m);
            }
            (n, bytes)
        };
        if let Some(p) = self.ports.get(&port) {
            p.counters
                .tx_packets
                .fetch_add(delivered as u64, Ordering::Relaxed);
            p.counters.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
            p.counters
                .tx_dropped
                .fetch_add(pkts.len() as u64, Ordering::Relaxed);
        }
        delivered
    }

    fn link_status(&self, port: PortId) -> DriverResult<LinkStatus> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        Ok(LinkStatus {
            up: p.link_up.load(Ordering::Relaxed),
            speed_mbps: 10_000,
            full_duplex: true,
        })
    }

    fn stats(&self, port: PortId) -> DriverResult<DriverStats> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        Ok(DriverStats {
            rx_packets: p.counters.rx_packets.load(Ordering::Relaxed),
            tx_packets: p.counters.tx_packets.load(Ordering::Relaxed),
            rx_bytes: p.counters.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: p.counters.tx_bytes.load(Ordering::Relaxed),
            rx_errors: 0,
            tx_errors: 0,
            rx_dropped: 0,
            tx_dropped: p.counters.tx_dropped.load(Ordering::Relaxed),
        })
    }

    fn set_mtu(&self, port: PortId, mtu: u32) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        p.mtu.store(mtu, Ordering::SeqCst);
        Ok(())
    }

    fn set_promiscuous(&self, port: PortId, on: bool) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        p.promisc.store(on, Ordering::SeqCst);
        Ok(())
    }

    fn hwaddr(&self, port: PortId) -> DriverResult<[u8; 6]> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        Ok(p.hwaddr)
    }

    fn tx_offload_caps(&self, port: PortId) -> u32 {
        self.ports
            .get(&port)
            .map(|p| p.offload_caps.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    fn set_link_callback(&self, port: PortId, cb: LinkCallback) -> DriverResult<()> {
        let p = self.ports.get(&port).ok_or(DriverError::PortNotFound(port))?;
        *p.callback.lock() = Some(cb);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofswitch_packet::{MbufPool, PoolConfig};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn wire() -> (LoopbackDriver, PortId, PortId) {
        let drv = LoopbackDriver::new();
        let a = drv.configure(&InterfaceConfig::default()).unwrap();
        let b = drv.configure(&InterfaceConfig::default()).unwrap();
        drv.pair(a, b).unwrap();
        drv.start(a).unwrap();
        drv.start(b).unwrap();
        (drv, a, b)
    }

    fn pool_local() -> PoolLocal {
        MbufPool::new(PoolConfig {
            socket_id: 0,
            capacity: 32,
            cache_size: 8,
        })
        .local()
    }

    #[test]
    fn test_tx_reaches_peer() {
        let (drv, a, b) = wire();
        let mut pkts = vec![Mbuf::from_slice(&[1u8; 64]), Mbuf::from_slice(&[2u8; 64])];
        assert_eq!(drv.tx_burst(a, 0, &mut pkts), 2);
        assert!(pkts.is_empty());

        let mut pool = pool_local();
        let mut out = Vec::new();
        assert_eq!(drv.rx_burst(b, 0, &mut pool, &mut out, 8), 2);
        assert_eq!(out[0].data()[0], 1);
        assert_eq!(out[1].data()[0], 2);
    }

    #[test]
    fn test_tx_down_link_sends_nothing() {
        let (drv, a, _b) = wire();
        drv.set_link(a, false).unwrap();
        let mut pkts = vec![Mbuf::from_slice(&[0u8; 64])];
        assert_eq!(drv.tx_burst(a, 0, &mut pkts), 0);
        // Unsent packet stays with the caller.
        assert_eq!(pkts.len(), 1);
    }

    #[test]
    fn test_rx_before_start_is_empty() {
        let drv = LoopbackDriver::new();
        let a = drv.configure(&InterfaceConfig::default()).unwrap();
        drv.inject(a, Mbuf::from_slice(&[0u8; 64])).unwrap();
        let mut pool = pool_local();
        let mut out = Vec::new();
        assert_eq!(drv.rx_burst(a, 0, &mut pool, &mut out, 8), 0);
    }

    #[test]
    fn test_link_callback_fires_on_transition() {
        let (drv, a, _b) = wire();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        drv.set_link_callback(
            a,
            Arc::new(move |_, status| {
                if !status.up {
                    h.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .unwrap();
        drv.set_link(a, false).unwrap();
        drv.set_link(a, false).unwrap(); // no transition, no callback
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unconfigure_releases_slot() {
        let (drv, a, b) = wire();
        drv.unconfigure(a).unwrap();
        assert!(matches!(
            drv.link_status(a),
            Err(DriverError::PortNotFound(_))
        ));
        // Peer keeps working but transmits into the void.
        let mut pkts = vec![Mbuf::from_slice(&[0u8; 64])];
        assert_eq!(drv.tx_burst(b, 0, &mut pkts), 0);
        // Slot is reusable.
        let c = drv.configure(&InterfaceConfig::default()).unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_wire_depth_partial_tx() {
        let (drv, a, _b) = wire();
        let mut pkts: Vec<Mbuf> = (0..LOOPBACK_WIRE_DEPTH + 10)
            .map(|_| Mbuf::from_slice(&[0u8; 60]))
            .collect();
        let sent = drv.tx_burst(a, 0, &mut pkts);
        assert_eq!(sent, LOOPBACK_WIRE_DEPTH);
        assert_eq!(pkts.len(), 10);
        assert_eq!(drv.stats(a).unwrap().tx_dropped, 10);
    }

    #[test]
    fn test_counters() {
        let (drv, a, b) = wire();
        let mut pkts = vec![Mbuf::from_slice(&[9u8; 100])];
        drv.tx_burst(a, 0, &mut pkts);
        let mut pool = pool_local();
        let mut out = Vec::new();
        drv.rx_burst(b, 0, &mut pool, &mut out, 4);
        assert_eq!(drv.stats(a).unwrap().tx_packets, 1);
        assert_eq!(drv.stats(a).unwrap().tx_bytes, 100);
        assert_eq!(drv.stats(b).unwrap().rx_packets, 1);
        assert_eq!(drv.stats(b).unwrap().rx_bytes, 100);
    }
}
