//! Switch ports and the global port table.
//!
//! A port is the bridge-facing face of an interface: it carries the
//! OpenFlow port number, config/state masks, counters, and the optional
//! egress policer and queue scheduler. The global [`PortTable`] maps the
//! dataplane port index (the mbuf `in_port` value) to the port; hot-path
//! readers seeing an empty slot drop the packet.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ofswitch_qos::{Policer, PortScheduler};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bridge::Bridge;
use crate::error::{OfprotoError, OfprotoResult};
use crate::interface::Interface;
use crate::ofp::{OFPPC_NO_FWD, OFPPC_NO_RECV, OFPPS_LINK_DOWN, OFPPS_LIVE};

/// Port counters; written by the owning I/O thread, snapshotted by the
/// configuration plane.
#[derive(Default)]
pub struct PortCounters {
    /// Packets received.
    pub rx_packets: AtomicU64,
    /// Bytes received.
    pub rx_bytes: AtomicU64,
    /// Packets dropped on the receive side.
    pub rx_dropped: AtomicU64,
    /// Packets transmitted.
    pub tx_packets: AtomicU64,
    /// Bytes transmitted.
    pub tx_bytes: AtomicU64,
    /// Packets dropped on the transmit side.
    pub tx_dropped: AtomicU64,
}

/// Snapshot form of [`PortCounters`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PortStats {
    /// Packets received.
    pub rx_packets: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Packets dropped on the receive side.
    pub rx_dropped: u64,
    /// Packets transmitted.
    pub tx_packets: u64,
    /// Bytes transmitted.
    pub tx_bytes: u64,
    /// Packets dropped on the transmit side.
    pub tx_dropped: u64,
}

/// One switch port.
pub struct Port {
    name: String,
    /// Global dataplane index; the mbuf `in_port` value.
    index: u32,
    of_port_no: AtomicU32,
    config: AtomicU32,
    state: AtomicU32,
    interface: RwLock<Option<Arc<Interface>>>,
    bridge: RwLock<Weak<Bridge>>,
    policer: RwLock<Option<Arc<Policer>>>,
    scheduler: Mutex<Option<PortScheduler>>,
    counters: PortCounters,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("of_port_no", &self.of_port_no.load(Ordering::Relaxed))
            .finish()
    }
}

impl Port {
    fn new(name: &str, index: u32) -> Self {
        Self {
            name: name.to_string(),
            index,
            of_port_no: AtomicU32::new(0),
            config: AtomicU32::new(0),
            state: AtomicU32::new(OFPPS_LINK_DOWN),
            interface: RwLock::new(None),
            bridge: RwLock::new(Weak::new()),
            policer: RwLock::new(None),
            scheduler: Mutex::new(None),
            counters: PortCounters::default(),
        }
    }

    /// Object name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Global dataplane index.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// OpenFlow port number on the owning bridge; 0 when unattached.
    #[inline]
    pub fn of_port_no(&self) -> u32 {
        self.of_port_no.load(Ordering::Relaxed)
    }

    pub(crate) fn set_of_port_no(&self, no: u32) {
        self.of_port_no.store(no, Ordering::Relaxed);
    }

    /// OFPPC config mask.
    #[inline]
    pub fn config_bits(&self) -> u32 {
        self.config.load(Ordering::Relaxed)
    }

    /// Replaces the OFPPC config mask.
    pub fn set_config_bits(&self, bits: u32) {
        self.config.store(bits, Ordering::Relaxed);
    }

    /// OFPPS state mask.
    #[inline]
    pub fn state_bits(&self) -> u32 {
        self.state.load(Ordering::Relaxed)
    }

    /// Records a link transition, keeping the LIVE bit coherent.
    pub fn set_link_up(&self, up: bool) {
        let mut bits = self.state.load(Ordering::Relaxed);
        if up {
            bits &= !OFPPS_LINK_DOWN;
            bits |= OFPPS_LIVE;
        } else {
            bits |= OFPPS_LINK_DOWN;
            bits &= !OFPPS_LIVE;
        }
        self.state.store(bits, Ordering::Relaxed);
        debug!(port = %self.name, up, "port link state");
    }

    /// True when the port may receive.
    #[inline]
    pub fn may_recv(&self) -> bool {
        self.config_bits() & OFPPC_NO_RECV == 0
    }

    /// True when the port may forward: not configured NO_FWD and the
    /// link is present.
    #[inline]
    pub fn may_forward(&self) -> bool {
        self.config_bits() & OFPPC_NO_FWD == 0 && self.state_bits() & OFPPS_LINK_DOWN == 0
    }

    /// True for fast-failover liveness.
    #[inline]
    pub fn is_live(&self) -> bool {
        self.state_bits() & OFPPS_LIVE != 0
    }

    /// Binds (or replaces) the owned interface.
    pub fn set_interface(&self, iface: Option<Arc<Interface>>) {
        *self.interface.write() = iface;
    }

    /// The owned interface.
    pub fn interface(&self) -> Option<Arc<Interface>> {
        self.interface.read().clone()
    }

    pub(crate) fn set_bridge(&self, bridge: Weak<Bridge>) {
        *self.bridge.write() = bridge;
    }

    /// The owning bridge, when attached.
    pub fn bridge(&self) -> Option<Arc<Bridge>> {
        self.bridge.read().upgrade()
    }

    /// Installs or clears the egress policer.
    pub fn set_policer(&self, policer: Option<Arc<Policer>>) {
        *self.policer.write() = policer;
    }

    /// The egress policer, when one is installed.
    pub fn policer(&self) -> Option<Arc<Policer>> {
        self.policer.read().clone()
    }

    /// Installs or clears the egress scheduler. Exclusive to the TX
    /// path afterwards.
    pub fn set_scheduler(&self, sched: Option<PortScheduler>) {
        *self.scheduler.lock() = sched;
    }

    /// Runs `f` with the scheduler when one is installed.
    pub fn with_scheduler<R>(&self, f: impl FnOnce(&mut PortScheduler) -> R) -> Option<R> {
        let mut guard = self.scheduler.lock();
        guard.as_mut().map(f)
    }

    /// Counter block for the hot path.
    #[inline]
    pub fn counters(&self) -> &PortCounters {
        &self.counters
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PortStats {
        PortStats {
            rx_packets: self.counters.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.counters.rx_bytes.load(Ordering::Relaxed),
            rx_dropped: self.counters.rx_dropped.load(Ordering::Relaxed),
            tx_packets: self.counters.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.counters.tx_bytes.load(Ordering::Relaxed),
            tx_dropped: self.counters.tx_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Global table mapping dataplane port indices to ports.
pub struct PortTable {
    slots: RwLock<Vec<Option<Arc<Port>>>>,
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new(ofswitch_driver::MAX_PORTS)
    }
}

impl PortTable {
    /// Creates a table with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(vec![None; capacity]),
        }
    }

    /// Creates a port in the lowest free slot.
    pub fn create(&self, name: &str) -> OfprotoResult<Arc<Port>> {
        let mut slots = self.slots.write();
        let idx = slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(OfprotoError::Driver(ofswitch_driver::DriverError::NoFreePorts))?;
        let port = Arc::new(Port::new(name, idx as u32));
        slots[idx] = Some(Arc::clone(&port));
        Ok(port)
    }

    /// Releases a slot; the port object lives on while referenced.
    pub fn remove(&self, index: u32) -> OfprotoResult<()> {
        let mut slots = self.slots.write();
        match slots.get_mut(index as usize) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                Ok(())
            }
            _ => Err(OfprotoError::PortNotFound(index)),
        }
    }

    /// Hot-path lookup; `None` means drop the packet.
    #[inline]
    pub fn get(&self, index: u32) -> Option<Arc<Port>> {
        self.slots.read().get(index as usize)?.clone()
    }

    /// Every occupied slot.
    pub fn iter_ports(&self) -> Vec<Arc<Port>> {
        self.slots.read().iter().flatten().cloned().collect()
    }
}
