//! The configuration datastore.
//!
//! Owns every shadowed object store, the interpreter state machine, and
//! the bindings that apply committed configuration to the live core
//! (interfaces, ports, bridges). Operations are idempotent and
//! transactional at the object level: create fails closed, config
//! restores previous values on failure, destroy is refused while the
//! object is referenced.

use std::collections::HashMap;
use std::sync::Arc;

use ofswitch_driver::{InterfaceConfig, NetDriver};
use ofswitch_ofproto::{Bridge, Interface, PacketInQueue, Port, PortTable};
use ofswitch_qos::{Policer, PolicerActionKind, PolicerConfig, PortScheduler, QueueConfig};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{DatastoreError, DatastoreResult, ErrorKind};
use crate::interp::InterpState;
use crate::object::{ObjectMap, Which};
use crate::objects::{
    AgentAttrs, BridgeAttrs, FailMode, InterfaceAttrs, InterfaceType, PolicerActionAttrs,
    PolicerActionType, PolicerAttrs, PortAttrs, QueueAttrs, QueueColor,
};

/// Per-queue depth of the egress schedulers built from queue objects.
const SCHED_QUEUE_DEPTH: usize = 512;

/// Back-end driver instances shared by every interface of their type.
pub struct Drivers {
    /// The in-memory pair back-end; always present.
    pub loopback: Arc<ofswitch_driver::LoopbackDriver>,
    #[cfg(target_os = "linux")]
    /// The raw-socket back-end.
    pub rawsock: Arc<ofswitch_driver::rawsock::RawSockDriver>,
    #[cfg(target_os = "linux")]
    /// The AF_PACKET fanout back-end.
    pub phy: Arc<ofswitch_driver::phy::PhyDriver>,
}

impl Default for Drivers {
    fn default() -> Self {
        Self {
            loopback: Arc::new(ofswitch_driver::LoopbackDriver::new()),
            #[cfg(target_os = "linux")]
            rawsock: Arc::new(ofswitch_driver::rawsock::RawSockDriver::new()),
            #[cfg(target_os = "linux")]
            phy: Arc::new(ofswitch_driver::phy::PhyDriver::new()),
        }
    }
}

impl Drivers {
    fn for_kind(&self, kind: InterfaceType) -> DatastoreResult<Arc<dyn NetDriver>> {
        match kind {
            InterfaceType::Loopback => Ok(Arc::clone(&self.loopback) as Arc<dyn NetDriver>),
            #[cfg(target_os = "linux")]
            InterfaceType::EthernetRawsock => {
                Ok(Arc::clone(&self.rawsock) as Arc<dyn NetDriver>)
            }
            #[cfg(target_os = "linux")]
            InterfaceType::EthernetDpdkPhy => Ok(Arc::clone(&self.phy) as Arc<dyn NetDriver>),
            #[cfg(not(target_os = "linux"))]
            _ => Err(DatastoreError::new(
                ErrorKind::PosixApiError,
                "interface type unavailable on this platform.",
            )),
        }
    }
}

#[derive(Default)]
struct LiveState {
    interfaces: HashMap<String, Arc<Interface>>,
    ports: HashMap<String, Arc<Port>>,
    bridges: HashMap<String, Arc<Bridge>>,
}

/// The datastore.
pub struct Datastore {
    state: Mutex<InterpState>,
    pub(crate) interfaces: Mutex<ObjectMap<InterfaceAttrs>>,
    pub(crate) ports: Mutex<ObjectMap<PortAttrs>>,
    pub(crate) queues: Mutex<ObjectMap<QueueAttrs>>,
    pub(crate) policers: Mutex<ObjectMap<PolicerAttrs>>,
    pub(crate) policer_actions: Mutex<ObjectMap<PolicerActionAttrs>>,
    pub(crate) bridges: Mutex<ObjectMap<BridgeAttrs>>,
    pub(crate) agents: Mutex<ObjectMap<AgentAttrs>>,
    port_table: Arc<PortTable>,
    drivers: Drivers,
    live: Mutex<LiveState>,
}

impl Datastore {
    /// Creates an empty datastore over the given port table.
    pub fn new(port_table: Arc<PortTable>, drivers: Drivers) -> Self {
        Self {
            state: Mutex::new(InterpState::AutoCommit),
            interfaces: Mutex::new(ObjectMap::new("interface")),
            ports: Mutex::new(ObjectMap::new("port")),
            queues: Mutex::new(ObjectMap::new("queue")),
            policers: Mutex::new(ObjectMap::new("policer")),
            policer_actions: Mutex::new(ObjectMap::new("policer-action")),
            bridges: Mutex::new(ObjectMap::new("bridge")),
            agents: Mutex::new(ObjectMap::new("agent")),
            port_table,
            drivers,
            live: Mutex::new(LiveState::default()),
        }
    }

    /// Current interpreter state.
    pub fn state(&self) -> InterpState {
        *self.state.lock()
    }

    /// The global port table the pipeline reads.
    pub fn port_table(&self) -> &Arc<PortTable> {
        &self.port_table
    }

    /// Back-end driver set; tests reach the loopback through this.
    pub fn drivers(&self) -> &Drivers {
        &self.drivers
    }

    /// Live bridge handle for an enabled bridge.
    pub fn live_bridge(&self, name: &str) -> Option<Arc<Bridge>> {
        self.live.lock().bridges.get(name).cloned()
    }

    /// Live port handle for an enabled port.
    pub fn live_port(&self, name: &str) -> Option<Arc<Port>> {
        self.live.lock().ports.get(name).cloned()
    }

    /// Live interface handle for an enabled interface.
    pub fn live_interface(&self, name: &str) -> Option<Arc<Interface>> {
        self.live.lock().interfaces.get(name).cloned()
    }

    fn auto_commit(&self) -> bool {
        !self.state().is_deferred()
    }

    /// Recomputes every `used_by` set from the effective attributes.
    fn recompute_usage(&self) {
        let mut interfaces = self.interfaces.lock();
        let mut queues = self.queues.lock();
        let mut policers = self.policers.lock();
        let mut policer_actions = self.policer_actions.lock();
        let mut ports = self.ports.lock();
        let bridges = self.bridges.lock();

        for name in interfaces.names() {
            let _ = interfaces.get_mut(&name).map(|o| o.used_by.clear());
        }
        for name in queues.names() {
            let _ = queues.get_mut(&name).map(|o| o.used_by.clear());
        }
        for name in policers.names() {
            let _ = policers.get_mut(&name).map(|o| o.used_by.clear());
        }
        for name in policer_actions.names() {
            let _ = policer_actions.get_mut(&name).map(|o| o.used_by.clear());
        }
        for name in ports.names() {
            let _ = ports.get_mut(&name).map(|o| o.used_by.clear());
        }

        let port_refs: Vec<(String, PortAttrs)> = ports
            .iter()
            .filter_map(|(n, o)| o.effective().cloned().map(|a| (n.clone(), a)))
            .collect();
        for (pname, attrs) in &port_refs {
            if let Some(ifname) = &attrs.interface {
                let _ = interfaces.set_used_by(ifname, pname, true);
            }
            if let Some(pol) = &attrs.policer {
                let _ = policers.set_used_by(pol, pname, true);
            }
            for q in &attrs.queues {
                let _ = queues.set_used_by(q, pname, true);
            }
        }
        let policer_refs: Vec<(String, PolicerAttrs)> = policers
            .iter()
            .filter_map(|(n, o)| o.effective().cloned().map(|a| (n.clone(), a)))
            .collect();
        for (pname, attrs) in &policer_refs {
            for a in &attrs.actions {
                let _ = policer_actions.set_used_by(a, pname, true);
            }
        }
        for (bname, obj) in bridges.iter() {
            if let Some(attrs) = obj.effective() {
                for pname in attrs.ports.keys() {
                    let _ = ports.set_used_by(pname, bname, true);
                }
            }
        }
    }

    fn get_json<A: serde::Serialize + Clone + serde::de::DeserializeOwned>(
        map: &ObjectMap<A>,
        state: InterpState,
        name: &str,
        which: Which,
    ) -> DatastoreResult<serde_json::Value> {
        let obj = map.get(name)?;
        match which {
            Which::Modified => match &obj.modified {
                Some(a) => Ok(serde_json::to_value(a).expect("attrs serialize")),
                None => Err(DatastoreError::new(
                    ErrorKind::InvalidObject,
                    "Not set modified.",
                )),
            },
            Which::Current => {
                if state == InterpState::Atomic && obj.modified.is_some() {
                    return Err(DatastoreError::new(
                        ErrorKind::InvalidObject,
                        "Not set current.",
                    ));
                }
                match &obj.current {
                    Some(a) => Ok(serde_json::to_value(a).expect("attrs serialize")),
                    None => Err(DatastoreError::new(
                        ErrorKind::InvalidObject,
                        "Not set current.",
                    )),
                }
            }
        }
    }

    // -----------------------------------------------------------------
    // interface
    // -----------------------------------------------------------------

    /// Creates an interface object.
    pub fn interface_create(&self, name: &str, attrs: InterfaceAttrs) -> DatastoreResult<()> {
        attrs.validate()?;
        self.interfaces.lock().create(name, attrs)?;
        if self.auto_commit() {
            self.interfaces.lock().get_mut(name)?.promote();
        }
        self.recompute_usage();
        Ok(())
    }

    /// Edits an interface; in auto-commit the edit is validated and
    /// promoted immediately, and an enabled interface's device follows.
    pub fn interface_config(
        &self,
        name: &str,
        f: impl FnOnce(&mut InterfaceAttrs) -> DatastoreResult<()>,
    ) -> DatastoreResult<()> {
        {
            let mut map = self.interfaces.lock();
            map.modify(name, |a| {
                f(a)?;
                a.validate()
            })?;
            if self.auto_commit() {
                map.get_mut(name)?.promote();
            }
        }
        if self.auto_commit() {
            self.apply_interface(name)?;
        }
        self.recompute_usage();
        Ok(())
    }

    /// Destroys an interface; refused while a port references it.
    pub fn interface_destroy(&self, name: &str) -> DatastoreResult<()> {
        let enabled = {
            let map = self.interfaces.lock();
            map.get(name)?.enabled
        };
        if enabled {
            self.interface_disable(name)?;
        }
        self.interfaces.lock().destroy(name)?;
        self.recompute_usage();
        Ok(())
    }

    /// Brings the device up: configures it on its back-end.
    pub fn interface_enable(&self, name: &str) -> DatastoreResult<()> {
        let attrs = {
            let map = self.interfaces.lock();
            let obj = map.get(name)?;
            if obj.enabled {
                return Ok(()); // idempotent
            }
            obj.effective()
                .cloned()
                .ok_or_else(|| DatastoreError::new(ErrorKind::InvalidObject, "no attributes."))?
        };
        let driver = self.drivers.for_kind(attrs.kind)?;
        let iface = Interface::attach(
            name,
            driver,
            InterfaceConfig {
                device: attrs.device.clone(),
                mtu: attrs.mtu,
                promiscuous: true,
                rx_queues: 1,
            },
        )
        .map_err(|e| DatastoreError::new(ErrorKind::PosixApiError, e.to_string()))?;
        iface
            .start()
            .map_err(|e| DatastoreError::new(ErrorKind::PosixApiError, e.to_string()))?;
        self.live
            .lock()
            .interfaces
            .insert(name.to_string(), iface);
        self.interfaces.lock().get_mut(name)?.enabled = true;
        info!(name, "interface enabled");
        Ok(())
    }

    /// Brings the device down and releases it.
    pub fn interface_disable(&self, name: &str) -> DatastoreResult<()> {
        {
            let map = self.interfaces.lock();
            let obj = map.get(name)?;
            if !obj.enabled {
                return Ok(());
            }
        }
        if let Some(iface) = self.live.lock().interfaces.remove(name) {
            if let Err(e) = iface.detach() {
                warn!(name, error = %e, "interface detach failed");
            }
        }
        self.interfaces.lock().get_mut(name)?.enabled = false;
        Ok(())
    }

    fn apply_interface(&self, name: &str) -> DatastoreResult<()> {
        let (enabled, attrs) = {
            let map = self.interfaces.lock();
            let obj = map.get(name)?;
            (obj.enabled, obj.current.clone())
        };
        if !enabled {
            return Ok(());
        }
        let Some(attrs) = attrs else { return Ok(()) };
        if let Some(iface) = self.live_interface(name) {
            iface
                .set_mtu(attrs.mtu)
                .map_err(|e| DatastoreError::new(ErrorKind::PosixApiError, e.to_string()))?;
        }
        Ok(())
    }

    /// Reads an interface attribute set.
    pub fn interface_get(&self, name: &str, which: Which) -> DatastoreResult<serde_json::Value> {
        Self::get_json(&self.interfaces.lock(), self.state(), name, which)
    }

    // -----------------------------------------------------------------
    // queue / policer-action / policer
    // -----------------------------------------------------------------

    /// Creates a queue object.
    pub fn queue_create(&self, name: &str, attrs: QueueAttrs) -> DatastoreResult<()> {
        attrs.validate()?;
        self.queues.lock().create(name, attrs)?;
        if self.auto_commit() {
            self.queues.lock().get_mut(name)?.promote();
        }
        Ok(())
    }

    /// Edits a queue object.
    pub fn queue_config(
        &self,
        name: &str,
        f: impl FnOnce(&mut QueueAttrs) -> DatastoreResult<()>,
    ) -> DatastoreResult<()> {
        let mut map = self.queues.lock();
        map.modify(name, |a| {
            f(a)?;
            a.validate()
        })?;
        if self.auto_commit() {
            map.get_mut(name)?.promote();
        }
        Ok(())
    }

    /// Destroys a queue; refused while a port references it.
    pub fn queue_destroy(&self, name: &str) -> DatastoreResult<()> {
        self.queues.lock().destroy(name)?;
        self.recompute_usage();
        Ok(())
    }

    /// Reads a queue attribute set.
    pub fn queue_get(&self, name: &str, which: Which) -> DatastoreResult<serde_json::Value> {
        Self::get_json(&self.queues.lock(), self.state(), name, which)
    }

    /// Marks a queue administratively enabled. The scheduler state is
    /// built when an owning port comes up.
    pub fn queue_enable(&self, name: &str) -> DatastoreResult<()> {
        self.queues.lock().get_mut(name)?.enabled = true;
        Ok(())
    }

    /// Marks a queue administratively disabled.
    pub fn queue_disable(&self, name: &str) -> DatastoreResult<()> {
        self.queues.lock().get_mut(name)?.enabled = false;
        Ok(())
    }

    /// Creates a policer-action object.
    pub fn policer_action_create(
        &self,
        name: &str,
        attrs: PolicerActionAttrs,
    ) -> DatastoreResult<()> {
        self.policer_actions.lock().create(name, attrs)?;
        if self.auto_commit() {
            self.policer_actions.lock().get_mut(name)?.promote();
        }
        Ok(())
    }

    /// Edits a policer-action object.
    pub fn policer_action_config(
        &self,
        name: &str,
        f: impl FnOnce(&mut PolicerActionAttrs) -> DatastoreResult<()>,
    ) -> DatastoreResult<()> {
        let mut map = self.policer_actions.lock();
        map.modify(name, f)?;
        if self.auto_commit() {
            map.get_mut(name)?.promote();
        }
        Ok(())
    }

    /// Destroys a policer-action; refused while a policer references it.
    pub fn policer_action_destroy(&self, name: &str) -> DatastoreResult<()> {
        self.policer_actions.lock().destroy(name)?;
        self.recompute_usage();
        Ok(())
    }

    /// Marks a policer-action enabled.
    pub fn policer_action_enable(&self, name: &str) -> DatastoreResult<()> {
        self.policer_actions.lock().get_mut(name)?.enabled = true;
        Ok(())
    }

    /// Marks a policer-action disabled; refused while referenced.
    pub fn policer_action_disable(&self, name: &str) -> DatastoreResult<()> {
        {
            let map = self.policer_actions.lock();
            if map.get(name)?.is_used() {
                return Err(DatastoreError::in_use(name));
            }
        }
        self.policer_actions.lock().get_mut(name)?.enabled = false;
        Ok(())
    }

    /// Reads a policer-action attribute set.
    pub fn policer_action_get(
        &self,
        name: &str,
        which: Which,
    ) -> DatastoreResult<serde_json::Value> {
        Self::get_json(&self.policer_actions.lock(), self.state(), name, which)
    }

    /// Creates a policer object; its actions must exist.
    pub fn policer_create(&self, name: &str, attrs: PolicerAttrs) -> DatastoreResult<()> {
        attrs.validate()?;
        {
            let actions = self.policer_actions.lock();
            for a in &attrs.actions {
                actions.get(a)?;
            }
        }
        self.policers.lock().create(name, attrs)?;
        if self.auto_commit() {
            self.policers.lock().get_mut(name)?.promote();
        }
        self.recompute_usage();
        Ok(())
    }

    /// Edits a policer object.
    pub fn policer_config(
        &self,
        name: &str,
        f: impl FnOnce(&mut PolicerAttrs) -> DatastoreResult<()>,
    ) -> DatastoreResult<()> {
        {
            let mut map = self.policers.lock();
            map.modify(name, |a| {
                f(a)?;
                a.validate()
            })?;
            if self.auto_commit() {
                map.get_mut(name)?.promote();
            }
        }
        self.recompute_usage();
        Ok(())
    }

    /// Destroys a policer; refused while a port references it.
    pub fn policer_destroy(&self, name: &str) -> DatastoreResult<()> {
        self.policers.lock().destroy(name)?;
        self.recompute_usage();
        Ok(())
    }

    /// Marks a policer enabled.
    pub fn policer_enable(&self, name: &str) -> DatastoreResult<()> {
        self.policers.lock().get_mut(name)?.enabled = true;
        Ok(())
    }

    /// Marks a policer disabled; refused while a port references it.
    pub fn policer_disable(&self, name: &str) -> DatastoreResult<()> {
        {
            let map = self.policers.lock();
            if map.get(name)?.is_used() {
                return Err(DatastoreError::in_use(name));
            }
        }
        self.policers.lock().get_mut(name)?.enabled = false;
        Ok(())
    }

    /// Reads a policer attribute set.
    pub fn policer_get(&self, name: &str, which: Which) -> DatastoreResult<serde_json::Value> {
        Self::get_json(&self.policers.lock(), self.state(), name, which)
    }

    // -----------------------------------------------------------------
    // port
    // -----------------------------------------------------------------

    /// Creates a port object; its references must exist.
    pub fn port_create(&self, name: &str, attrs: PortAttrs) -> DatastoreResult<()> {
        self.check_port_refs(&attrs)?;
        self.ports.lock().create(name, attrs)?;
        if self.auto_commit() {
            self.ports.lock().get_mut(name)?.promote();
        }
        self.recompute_usage();
        Ok(())
    }

    fn check_port_refs(&self, attrs: &PortAttrs) -> DatastoreResult<()> {
        if let Some(ifname) = &attrs.interface {
            self.interfaces.lock().get(ifname)?;
        }
        if let Some(pol) = &attrs.policer {
            self.policers.lock().get(pol)?;
        }
        {
            let queues = self.queues.lock();
            for q in &attrs.queues {
                queues.get(q)?;
            }
        }
        Ok(())
    }

    /// Edits a port object.
    pub fn port_config(
        &self,
        name: &str,
        f: impl FnOnce(&mut PortAttrs) -> DatastoreResult<()>,
    ) -> DatastoreResult<()> {
        {
            let mut map = self.ports.lock();
            map.modify(name, f)?;
        }
        // Validate references against the pending attrs; on failure the
        // pending edit is rolled back so current stays intact.
        let pending = {
            let map = self.ports.lock();
            map.get(name)?.modified.clone()
        };
        if let Some(attrs) = &pending {
            if let Err(e) = self.check_port_refs(attrs) {
                self.ports.lock().get_mut(name)?.discard();
                return Err(e);
            }
        }
        if self.auto_commit() {
            self.ports.lock().get_mut(name)?.promote();
            self.apply_port(name)?;
        }
        self.recompute_usage();
        Ok(())
    }

    /// Destroys a port; refused while a bridge references it.
    pub fn port_destroy(&self, name: &str) -> DatastoreResult<()> {
        let enabled = {
            let map = self.ports.lock();
            map.get(name)?.enabled
        };
        if enabled {
            self.port_disable(name)?;
        }
        self.ports.lock().destroy(name)?;
        self.recompute_usage();
        Ok(())
    }

    /// Builds the live port: table slot, interface binding, policer and
    /// scheduler.
    pub fn port_enable(&self, name: &str) -> DatastoreResult<()> {
        let attrs = {
            let map = self.ports.lock();
            let obj = map.get(name)?;
            if obj.enabled {
                return Ok(());
            }
            obj.effective()
                .cloned()
                .ok_or_else(|| DatastoreError::new(ErrorKind::InvalidObject, "no attributes."))?
        };
        let port = self
            .port_table
            .create(name)
            .map_err(|e| DatastoreError::new(ErrorKind::NoMemory, e.to_string()))?;
        if let Err(e) = self.wire_port(&port, &attrs) {
            let _ = self.port_table.remove(port.index());
            return Err(e);
        }
        self.live.lock().ports.insert(name.to_string(), port);
        self.ports.lock().get_mut(name)?.enabled = true;
        info!(name, "port enabled");
        Ok(())
    }

    fn wire_port(&self, port: &Arc<Port>, attrs: &PortAttrs) -> DatastoreResult<()> {
        if let Some(ifname) = &attrs.interface {
            let iface = self.live_interface(ifname).ok_or_else(|| {
                DatastoreError::new(
                    ErrorKind::NotOperational,
                    format!("interface {ifname} is not enabled."),
                )
            })?;
            let up = iface.link_status().map(|s| s.up).unwrap_or(false);
            port.set_interface(Some(Arc::clone(&iface)));
            port.set_link_up(up);
            // Link transitions drive the OpenFlow state bits.
            let weak = Arc::downgrade(port);
            let _ = iface.set_link_callback(Arc::new(move |_, status| {
                if let Some(port) = weak.upgrade() {
                    port.set_link_up(status.up);
                }
            }));
        }
        if let Some(polname) = &attrs.policer {
            port.set_policer(Some(Arc::new(self.build_policer(polname)?)));
        }
        if !attrs.queues.is_empty() {
            port.set_scheduler(Some(self.build_scheduler(&attrs.queues)?));
        }
        Ok(())
    }

    fn build_policer(&self, name: &str) -> DatastoreResult<Policer> {
        let attrs = {
            let map = self.policers.lock();
            map.get(name)?
                .effective()
                .cloned()
                .ok_or_else(|| DatastoreError::new(ErrorKind::InvalidObject, "no attributes."))?
        };
        let mut chain = Vec::new();
        {
            let actions = self.policer_actions.lock();
            for aname in &attrs.actions {
                let a = actions.get(aname)?.effective().cloned().ok_or_else(|| {
                    DatastoreError::new(ErrorKind::InvalidObject, "no attributes.")
                })?;
                match a.kind {
                    PolicerActionType::Discard => chain.push(PolicerActionKind::Discard),
                }
            }
        }
        Policer::new(PolicerConfig {
            bandwidth_limit: attrs.bandwidth_limit,
            burst_size_limit: attrs.burst_size_limit,
            bandwidth_percent: attrs.bandwidth_percent,
            actions: chain,
        })
        .map_err(|e| DatastoreError::new(ErrorKind::OutOfRange, e.to_string()))
    }

    fn build_scheduler(&self, queue_names: &[String]) -> DatastoreResult<PortScheduler> {
        let mut sched = PortScheduler::new(SCHED_QUEUE_DEPTH);
        let queues = self.queues.lock();
        for (idx, qname) in queue_names.iter().enumerate() {
            let attrs = queues.get(qname)?.effective().cloned().ok_or_else(|| {
                DatastoreError::new(ErrorKind::InvalidObject, "no attributes.")
            })?;
            sched
                .add_queue(QueueConfig {
                    queue_id: idx as u32 + 1,
                    priority: attrs.priority,
                    color_aware: attrs.color == QueueColor::Aware,
                    rate: attrs.to_rate(),
                })
                .map_err(|e| DatastoreError::new(ErrorKind::OutOfRange, e.to_string()))?;
        }
        Ok(sched)
    }

    /// Tears the live port down.
    pub fn port_disable(&self, name: &str) -> DatastoreResult<()> {
        {
            let map = self.ports.lock();
            if !map.get(name)?.enabled {
                return Ok(());
            }
        }
        if let Some(port) = self.live.lock().ports.remove(name) {
            if let Some(bridge) = port.bridge() {
                let _ = bridge.detach_port(port.of_port_no());
            }
            let _ = self.port_table.remove(port.index());
        }
        self.ports.lock().get_mut(name)?.enabled = false;
        Ok(())
    }

    fn apply_port(&self, name: &str) -> DatastoreResult<()> {
        let (enabled, attrs) = {
            let map = self.ports.lock();
            let obj = map.get(name)?;
            (obj.enabled, obj.current.clone())
        };
        if !enabled {
            return Ok(());
        }
        let Some(attrs) = attrs else { return Ok(()) };
        if let Some(port) = self.live_port(name) {
            self.wire_port(&port, &attrs)?;
            if attrs.interface.is_none() {
                port.set_interface(None);
            }
            if attrs.policer.is_none() {
                port.set_policer(None);
            }
            if attrs.queues.is_empty() {
                port.set_scheduler(None);
            }
        }
        Ok(())
    }

    /// Reads a port attribute set.
    pub fn port_get(&self, name: &str, which: Which) -> DatastoreResult<serde_json::Value> {
        Self::get_json(&self.ports.lock(), self.state(), name, which)
    }

    // -----------------------------------------------------------------
    // bridge / agent
    // -----------------------------------------------------------------

    /// Creates a bridge object; referenced ports must exist.
    pub fn bridge_create(&self, name: &str, attrs: BridgeAttrs) -> DatastoreResult<()> {
        {
            let ports = self.ports.lock();
            for pname in attrs.ports.keys() {
                ports.get(pname)?;
            }
        }
        self.bridges.lock().create(name, attrs)?;
        if self.auto_commit() {
            self.bridges.lock().get_mut(name)?.promote();
        }
        self.recompute_usage();
        Ok(())
    }

    /// Edits a bridge object.
    pub fn bridge_config(
        &self,
        name: &str,
        f: impl FnOnce(&mut BridgeAttrs) -> DatastoreResult<()>,
    ) -> DatastoreResult<()> {
        {
            let mut map = self.bridges.lock();
            map.modify(name, f)?;
            if self.auto_commit() {
                map.get_mut(name)?.promote();
            }
        }
        if self.auto_commit() {
            self.apply_bridge(name)?;
        }
        self.recompute_usage();
        Ok(())
    }

    /// Destroys a bridge, releasing its ports from use.
    pub fn bridge_destroy(&self, name: &str) -> DatastoreResult<()> {
        let enabled = {
            let map = self.bridges.lock();
            map.get(name)?.enabled
        };
        if enabled {
            self.bridge_disable(name)?;
        }
        self.bridges.lock().destroy(name)?;
        self.recompute_usage();
        Ok(())
    }

    /// Builds the live bridge and attaches its enabled ports.
    pub fn bridge_enable(&self, name: &str) -> DatastoreResult<()> {
        let attrs = {
            let map = self.bridges.lock();
            let obj = map.get(name)?;
            if obj.enabled {
                return Ok(());
            }
            obj.effective()
                .cloned()
                .ok_or_else(|| DatastoreError::new(ErrorKind::InvalidObject, "no attributes."))?
        };
        let agent = self
            .agents
            .lock()
            .iter()
            .next()
            .and_then(|(_, o)| o.effective().cloned())
            .unwrap_or_default();
        let bridge = Bridge::new(
            name,
            attrs.dpid,
            PacketInQueue::new(agent.channelq_size, agent.channelq_max_batches),
        );
        bridge.set_standalone(attrs.fail_mode == FailMode::Standalone);
        for (pname, &number) in &attrs.ports {
            let Some(port) = self.live_port(pname) else {
                warn!(bridge = name, port = %pname, "port not enabled, skipping attach");
                continue;
            };
            bridge
                .attach_port(&port, number)
                .map_err(|e| DatastoreError::new(ErrorKind::NotOperational, e.to_string()))?;
        }
        self.live.lock().bridges.insert(name.to_string(), bridge);
        self.bridges.lock().get_mut(name)?.enabled = true;
        info!(name, "bridge enabled");
        Ok(())
    }

    /// Tears the live bridge down, detaching every port.
    pub fn bridge_disable(&self, name: &str) -> DatastoreResult<()> {
        {
            let map = self.bridges.lock();
            if !map.get(name)?.enabled {
                return Ok(());
            }
        }
        if let Some(bridge) = self.live.lock().bridges.remove(name) {
            let numbers: Vec<u32> = bridge.ports.iter().map(|e| *e.key()).collect();
            for n in numbers {
                let _ = bridge.detach_port(n);
            }
        }
        self.bridges.lock().get_mut(name)?.enabled = false;
        Ok(())
    }

    fn apply_bridge(&self, name: &str) -> DatastoreResult<()> {
        let (enabled, attrs) = {
            let map = self.bridges.lock();
            let obj = map.get(name)?;
            (obj.enabled, obj.current.clone())
        };
        if !enabled {
            return Ok(());
        }
        let Some(attrs) = attrs else { return Ok(()) };
        if let Some(bridge) = self.live_bridge(name) {
            bridge.set_standalone(attrs.fail_mode == FailMode::Standalone);
            // Attach newly-listed ports; detach removed ones.
            let attached: Vec<(u32, String)> = bridge
                .ports
                .iter()
                .map(|e| (*e.key(), e.value().name().to_string()))
                .collect();
            for (number, pname) in &attached {
                if !attrs.ports.contains_key(pname) {
                    let _ = bridge.detach_port(*number);
                }
            }
            for (pname, &number) in &attrs.ports {
                if attached.iter().any(|(_, n)| n == pname) {
                    continue;
                }
                if let Some(port) = self.live_port(pname) {
                    let _ = bridge.attach_port(&port, number);
                }
            }
        }
        Ok(())
    }

    /// Reads a bridge attribute set.
    pub fn bridge_get(&self, name: &str, which: Which) -> DatastoreResult<serde_json::Value> {
        Self::get_json(&self.bridges.lock(), self.state(), name, which)
    }

    /// Creates an agent object.
    pub fn agent_create(&self, name: &str, attrs: AgentAttrs) -> DatastoreResult<()> {
        self.agents.lock().create(name, attrs)?;
        if self.auto_commit() {
            self.agents.lock().get_mut(name)?.promote();
        }
        Ok(())
    }

    /// Edits the agent channel bounds. Takes effect for bridges enabled
    /// afterwards.
    pub fn agent_config(
        &self,
        name: &str,
        f: impl FnOnce(&mut AgentAttrs) -> DatastoreResult<()>,
    ) -> DatastoreResult<()> {
        let mut map = self.agents.lock();
        map.modify(name, f)?;
        if self.auto_commit() {
            map.get_mut(name)?.promote();
        }
        Ok(())
    }

    /// Destroys an agent object.
    pub fn agent_destroy(&self, name: &str) -> DatastoreResult<()> {
        self.agents.lock().destroy(name)?;
        Ok(())
    }

    /// Reads an agent attribute set.
    pub fn agent_get(&self, name: &str, which: Which) -> DatastoreResult<serde_json::Value> {
        Self::get_json(&self.agents.lock(), self.state(), name, which)
    }

    // -----------------------------------------------------------------
    // transactions
    // -----------------------------------------------------------------

    fn set_state(&self, s: InterpState) {
        *self.state.lock() = s;
    }

    pub(crate) fn set_interp(&self, s: InterpState) {
        self.set_state(s);
    }

    /// Enters the ATOMIC editing session.
    pub fn begin_atomic(&self) -> DatastoreResult<()> {
        let mut state = self.state.lock();
        if *state != InterpState::AutoCommit {
            return Err(DatastoreError::new(
                ErrorKind::DatastoreInterpError,
                format!("cannot begin atomic from {:?}.", *state),
            ));
        }
        *state = InterpState::Atomic;
        Ok(())
    }

    /// Enters the DRYRUN session; edits stay in the shadow.
    pub fn begin_dryrun(&self) -> DatastoreResult<()> {
        let mut state = self.state.lock();
        if *state != InterpState::AutoCommit {
            return Err(DatastoreError::new(
                ErrorKind::DatastoreInterpError,
                format!("cannot begin dryrun from {:?}.", *state),
            ));
        }
        *state = InterpState::Dryrun;
        Ok(())
    }

    /// Ends the DRYRUN session, discarding every shadow edit.
    pub fn end_dryrun(&self) -> DatastoreResult<()> {
        if self.state() != InterpState::Dryrun {
            return Err(DatastoreError::new(
                ErrorKind::DatastoreInterpError,
                "not in dryrun.",
            ));
        }
        self.discard_all();
        self.set_state(InterpState::AutoCommit);
        Ok(())
    }

    fn promote_all(&self) {
        self.interfaces.lock().promote_all();
        self.ports.lock().promote_all();
        self.queues.lock().promote_all();
        self.policers.lock().promote_all();
        self.policer_actions.lock().promote_all();
        self.bridges.lock().promote_all();
        self.agents.lock().promote_all();
    }

    fn discard_all(&self) {
        self.interfaces.lock().discard_all();
        self.ports.lock().discard_all();
        self.queues.lock().discard_all();
        self.policers.lock().discard_all();
        self.policer_actions.lock().discard_all();
        self.bridges.lock().discard_all();
        self.agents.lock().discard_all();
    }

    fn validate_pending(&self) -> DatastoreResult<()> {
        for (_, obj) in self.interfaces.lock().iter() {
            if let Some(a) = &obj.modified {
                a.validate()?;
            }
        }
        for (_, obj) in self.queues.lock().iter() {
            if let Some(a) = &obj.modified {
                a.validate()?;
            }
        }
        for (_, obj) in self.policers.lock().iter() {
            if let Some(a) = &obj.modified {
                a.validate()?;
            }
        }
        Ok(())
    }

    /// Commits the ATOMIC session: validate, promote, apply to the live
    /// core. Failure leaves the shadows intact in `COMMIT_FAILURE`.
    pub fn commit(&self) -> DatastoreResult<()> {
        if self.state() != InterpState::Atomic {
            return Err(DatastoreError::new(
                ErrorKind::DatastoreInterpError,
                "not in atomic.",
            ));
        }
        self.set_state(InterpState::Commiting);
        if let Err(e) = self.validate_pending() {
            self.set_state(InterpState::CommitFailure);
            return Err(e);
        }
        self.promote_all();
        self.recompute_usage();
        // Re-apply every enabled object's committed attributes. The
        // guards must drop before apply re-locks the same maps.
        let iface_names = self.interfaces.lock().names();
        for name in iface_names {
            let _ = self.apply_interface(&name);
        }
        let port_names = self.ports.lock().names();
        for name in port_names {
            let _ = self.apply_port(&name);
        }
        let bridge_names = self.bridges.lock().names();
        for name in bridge_names {
            let _ = self.apply_bridge(&name);
        }
        self.set_state(InterpState::Commited);
        self.set_state(InterpState::AutoCommit);
        info!("configuration committed");
        Ok(())
    }

    /// Aborts the ATOMIC session, discarding every shadow edit.
    pub fn abort(&self) -> DatastoreResult<()> {
        if self.state() != InterpState::Atomic && self.state() != InterpState::CommitFailure {
            return Err(DatastoreError::new(
                ErrorKind::DatastoreInterpError,
                "not in atomic.",
            ));
        }
        self.set_state(InterpState::Aborting);
        self.discard_all();
        self.recompute_usage();
        self.set_state(InterpState::Aborted);
        self.set_state(InterpState::AutoCommit);
        info!("configuration aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::InterfaceType;

    fn ds() -> Datastore {
        Datastore::new(Arc::new(PortTable::new(16)), Drivers::default())
    }

    fn loop_iface(name: &str) -> InterfaceAttrs {
        InterfaceAttrs {
            kind: InterfaceType::Loopback,
            device: name.to_string(),
            mtu: 1500,
            ip_addr: None,
        }
    }

    #[test]
    fn test_create_is_auto_committed() {
        let d = ds();
        d.interface_create("if0", loop_iface("lo0")).unwrap();
        let v = d.interface_get("if0", Which::Current).unwrap();
        assert_eq!(v["mtu"], 1500);
    }

    #[test]
    fn test_create_duplicate_fails_closed() {
        let d = ds();
        d.interface_create("if0", loop_iface("lo0")).unwrap();
        let err = d.interface_create("if0", loop_iface("lo1")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::AlreadyExists);
        let v = d.interface_get("if0", Which::Current).unwrap();
        assert_eq!(v["device"], "lo0");
    }

    #[test]
    fn test_invalid_mtu_rejected_before_store() {
        let d = ds();
        let mut a = loop_iface("lo0");
        a.mtu = 63;
        let err = d.interface_create("if0", a).unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfRange);
        assert!(d.interface_get("if0", Which::Current).is_err());
    }

    #[test]
    fn test_config_failure_restores_previous() {
        let d = ds();
        d.interface_create("if0", loop_iface("lo0")).unwrap();
        let err = d
            .interface_config("if0", |a| {
                a.mtu = 20;
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::OutOfRange);
        let v = d.interface_get("if0", Which::Current).unwrap();
        assert_eq!(v["mtu"], 1500);
    }

    #[test]
    fn test_config_idempotent() {
        let d = ds();
        d.interface_create("if0", loop_iface("lo0")).unwrap();
        for _ in 0..2 {
            d.interface_config("if0", |a| {
                a.mtu = 9000;
                Ok(())
            })
            .unwrap();
        }
        let v = d.interface_get("if0", Which::Current).unwrap();
        assert_eq!(v["mtu"], 9000);
    }

    #[test]
    fn test_atomic_config_abort() {
        let d = ds();
        d.interface_create("if0", loop_iface("eth0")).unwrap();
        d.port_create(
            "p1",
            PortAttrs {
                interface: Some("if0".into()),
                ..Default::default()
            },
        )
        .unwrap();
        d.interface_create("if1", loop_iface("eth1")).unwrap();

        d.begin_atomic().unwrap();
        d.port_config("p1", |a| {
            a.interface = Some("if1".into());
            Ok(())
        })
        .unwrap();
        // Modified shows the new ref.
        let m = d.port_get("p1", Which::Modified).unwrap();
        assert_eq!(m["interface"], "if1");
        // Current is masked during the transaction.
        let err = d.port_get("p1", Which::Current).unwrap_err();
        assert_eq!(err.message, "Not set current.");

        d.abort().unwrap();
        let c = d.port_get("p1", Which::Current).unwrap();
        assert_eq!(c["interface"], "if0");
        assert_eq!(d.state(), InterpState::AutoCommit);
    }

    #[test]
    fn test_atomic_commit_promotes() {
        let d = ds();
        d.interface_create("if0", loop_iface("eth0")).unwrap();
        d.begin_atomic().unwrap();
        d.interface_config("if0", |a| {
            a.mtu = 9000;
            Ok(())
        })
        .unwrap();
        d.commit().unwrap();
        let v = d.interface_get("if0", Which::Current).unwrap();
        assert_eq!(v["mtu"], 9000);
        assert_eq!(d.state(), InterpState::AutoCommit);
    }

    #[test]
    fn test_dryrun_isolation() {
        let d = ds();
        d.interface_create("if0", loop_iface("eth0")).unwrap();
        d.begin_dryrun().unwrap();
        d.interface_config("if0", |a| {
            a.mtu = 9000;
            Ok(())
        })
        .unwrap();
        // The dryrun shadow holds the edit.
        let m = d.interface_get("if0", Which::Modified).unwrap();
        assert_eq!(m["mtu"], 9000);
        // The live view still reports the committed value.
        let c = d.interface_get("if0", Which::Current).unwrap();
        assert_eq!(c["mtu"], 1500);
        d.end_dryrun().unwrap();
        let c = d.interface_get("if0", Which::Current).unwrap();
        assert_eq!(c["mtu"], 1500);
        assert!(d.interface_get("if0", Which::Modified).is_err());
    }

    #[test]
    fn test_destroy_in_use_chain() {
        let d = ds();
        d.interface_create("if0", loop_iface("eth0")).unwrap();
        d.port_create(
            "p1",
            PortAttrs {
                interface: Some("if0".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let mut bridge = BridgeAttrs::default();
        bridge.ports.insert("p1".into(), 65535);
        d.bridge_create("br0", bridge).unwrap();

        // Port held by the bridge.
        let err = d.port_destroy("p1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotOperational);
        assert_eq!(err.message, "name = :p1: is used.");
        // Interface held by the port.
        let err = d.interface_destroy("if0").unwrap_err();
        assert_eq!(err.message, "name = :if0: is used.");

        // Bridge first, then port, then interface.
        d.bridge_destroy("br0").unwrap();
        d.port_destroy("p1").unwrap();
        d.interface_destroy("if0").unwrap();
    }

    #[test]
    fn test_create_destroy_create_equivalent() {
        let d = ds();
        d.interface_create("if0", loop_iface("eth0")).unwrap();
        let before = d.interface_get("if0", Which::Current).unwrap();
        d.interface_destroy("if0").unwrap();
        d.interface_create("if0", loop_iface("eth0")).unwrap();
        let after = d.interface_get("if0", Which::Current).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_port_missing_interface_ref() {
        let d = ds();
        let err = d
            .port_create(
                "p1",
                PortAttrs {
                    interface: Some("ghost".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(d.port_get("p1", Which::Current).is_err());
    }

    #[test]
    fn test_enable_chain_builds_live_objects() {
        let d = ds();
        d.interface_create("if0", loop_iface("wire0")).unwrap();
        d.interface_enable("if0").unwrap();
        assert!(d.live_interface("if0").is_some());

        d.port_create(
            "p1",
            PortAttrs {
                interface: Some("if0".into()),
                ..Default::default()
            },
        )
        .unwrap();
        d.port_enable("p1").unwrap();
        let live = d.live_port("p1").unwrap();
        assert!(live.interface().is_some());

        let mut battrs = BridgeAttrs::default();
        battrs.ports.insert("p1".into(), 1);
        d.bridge_create("br0", battrs).unwrap();
        d.bridge_enable("br0").unwrap();
        let bridge = d.live_bridge("br0").unwrap();
        assert_eq!(bridge.port_count(), 1);
        assert!(live.bridge().is_some());

        // Disable unwinds.
        d.bridge_disable("br0").unwrap();
        assert!(live.bridge().is_none());
        d.port_disable("p1").unwrap();
        assert!(d.live_port("p1").is_none());
        d.interface_disable("if0").unwrap();
        assert!(d.live_interface("if0").is_none());
    }

    #[test]
    fn test_port_enable_with_policer_and_queues() {
        let d = ds();
        d.policer_action_create("pa1", PolicerActionAttrs::default())
            .unwrap();
        d.policer_create(
            "pol1",
            PolicerAttrs {
                actions: vec!["pa1".into()],
                bandwidth_limit: 1000,
                burst_size_limit: 1500,
                bandwidth_percent: 0,
            },
        )
        .unwrap();
        d.queue_create("q1", QueueAttrs::default()).unwrap();
        d.interface_create("if0", loop_iface("wire0")).unwrap();
        d.interface_enable("if0").unwrap();
        d.port_create(
            "p1",
            PortAttrs {
                interface: Some("if0".into()),
                policer: Some("pol1".into()),
                queues: vec!["q1".into()],
                ..Default::default()
            },
        )
        .unwrap();
        d.port_enable("p1").unwrap();
        let live = d.live_port("p1").unwrap();
        assert!(live.policer().is_some());
        assert_eq!(live.with_scheduler(|s| s.queue_count()), Some(1));

        // The policer-action is pinned by the policer.
        let err = d.policer_action_destroy("pa1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotOperational);
    }

    #[test]
    fn test_commit_from_wrong_state() {
        let d = ds();
        let err = d.commit().unwrap_err();
        assert_eq!(err.kind, ErrorKind::DatastoreInterpError);
        let err = d.abort().unwrap_err();
        assert_eq!(err.kind, ErrorKind::DatastoreInterpError);
    }
}
