//! Bridges: the OpenFlow datapath objects.
//!
//! A bridge holds its ports (by OpenFlow port number, non-owning), the
//! flow database, group and meter tables, the learning table, and the
//! packet-in queue. Destruction order is bridge, then ports, then
//! interfaces; the datastore enforces it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use ofswitch_qos::MeterTable;
use tracing::info;

use crate::error::{OfprotoError, OfprotoResult};
use crate::flowdb::FlowDb;
use crate::group::GroupTable;
use crate::l2::L2Table;
use crate::ofp::OFPP_MAX;
use crate::packet_in::PacketInQueue;
use crate::port::Port;

/// One OpenFlow datapath.
pub struct Bridge {
    name: String,
    dpid: u64,
    /// Ports keyed by OpenFlow port number.
    pub ports: DashMap<u32, Arc<Port>>,
    /// The flow database.
    pub flowdb: FlowDb,
    /// Group table.
    pub groups: GroupTable,
    /// Meter table.
    pub meters: MeterTable,
    /// MAC learning table for NORMAL/standalone forwarding.
    pub l2: L2Table,
    /// Controller-bound packet queue.
    pub packet_in: PacketInQueue,
    standalone: AtomicBool,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("name", &self.name)
            .field("dpid", &self.dpid)
            .field("ports", &self.ports.len())
            .finish()
    }
}

impl Bridge {
    /// Creates a bridge with empty tables. New bridges run standalone
    /// until a controller takes over.
    pub fn new(name: &str, dpid: u64, packet_in: PacketInQueue) -> Arc<Self> {
        info!(name, dpid, "bridge created");
        Arc::new(Self {
            name: name.to_string(),
            dpid,
            ports: DashMap::new(),
            flowdb: FlowDb::new(),
            groups: GroupTable::new(),
            meters: MeterTable::new(),
            l2: L2Table::default(),
            packet_in,
            standalone: AtomicBool::new(true),
        })
    }

    /// Object name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Datapath id.
    pub fn dpid(&self) -> u64 {
        self.dpid
    }

    /// True while no controller drives the bridge; packets then follow
    /// learning-bridge semantics.
    #[inline]
    pub fn is_standalone(&self) -> bool {
        self.standalone.load(Ordering::Relaxed)
    }

    /// Switches between standalone and controller-driven forwarding.
    pub fn set_standalone(&self, on: bool) {
        self.standalone.store(on, Ordering::Relaxed);
    }

    /// Attaches a port under `number`; 0 picks the lowest free number.
    /// Returns the number assigned.
    pub fn attach_port(self: &Arc<Self>, port: &Arc<Port>, number: u32) -> OfprotoResult<u32> {
        let number = if number == 0 {
            let mut n = 1;
            while self.ports.contains_key(&n) && n <= OFPP_MAX {
                n += 1;
            }
            n
        } else {
            number
        };
        if number > OFPP_MAX {
            return Err(OfprotoError::PortNumberTaken(number));
        }
        if self.ports.contains_key(&number) {
            return Err(OfprotoError::PortNumberTaken(number));
        }
        port.set_of_port_no(number);
        port.set_bridge(Arc::downgrade(self));
        self.ports.insert(number, Arc::clone(port));
        info!(bridge = %self.name, port = %port.name(), number, "port attached");
        Ok(number)
    }

    /// Detaches the port with the given OpenFlow number.
    pub fn detach_port(&self, number: u32) -> OfprotoResult<Arc<Port>> {
        let (_, port) = self
            .ports
            .remove(&number)
            .ok_or(OfprotoError::PortNotFound(number))?;
        port.set_of_port_no(0);
        port.set_bridge(std::sync::Weak::new());
        self.l2.purge_port(number);
        info!(bridge = %self.name, port = %port.name(), number, "port detached");
        Ok(port)
    }

    /// Port by OpenFlow number.
    #[inline]
    pub fn port_by_number(&self, number: u32) -> Option<Arc<Port>> {
        self.ports.get(&number).map(|p| Arc::clone(p.value()))
    }

    /// Attached port count.
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortTable;

    fn bridge() -> Arc<Bridge> {
        Bridge::new("br0", 0x1, PacketInQueue::default())
    }

    #[test]
    fn test_attach_auto_number() {
        let b = bridge();
        let t = PortTable::new(4);
        let p1 = t.create("p1").unwrap();
        let p2 = t.create("p2").unwrap();
        assert_eq!(b.attach_port(&p1, 0).unwrap(), 1);
        assert_eq!(b.attach_port(&p2, 0).unwrap(), 2);
        assert_eq!(p1.of_port_no(), 1);
        assert!(p1.bridge().is_some());
    }

    #[test]
    fn test_attach_explicit_number_conflict() {
        let b = bridge();
        let t = PortTable::new(4);
        let p1 = t.create("p1").unwrap();
        let p2 = t.create("p2").unwrap();
        b.attach_port(&p1, 65535).unwrap();
        assert!(matches!(
            b.attach_port(&p2, 65535),
            Err(OfprotoError::PortNumberTaken(65535))
        ));
    }

    #[test]
    fn test_detach_clears_backref() {
        let b = bridge();
        let t = PortTable::new(4);
        let p = t.create("p1").unwrap();
        let n = b.attach_port(&p, 0).unwrap();
        let detached = b.detach_port(n).unwrap();
        assert_eq!(detached.of_port_no(), 0);
        assert!(detached.bridge().is_none());
        assert!(matches!(
            b.detach_port(n),
            Err(OfprotoError::PortNotFound(_))
        ));
    }

    #[test]
    fn test_new_bridge_is_standalone() {
        let b = bridge();
        assert!(b.is_standalone());
        b.set_standalone(false);
        assert!(!b.is_standalone());
    }
}
