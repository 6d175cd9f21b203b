//! Configuration snapshots.
//!
//! The committed attribute sets of every object serialize into one
//! document: JSON for the human-readable save file, bincode for the
//! binary snapshot rollback restores from. Loading a snapshot into a
//! fresh datastore reproduces the same observable configuration.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::datastore::Datastore;
use crate::error::{DatastoreError, DatastoreResult, ErrorKind};
use crate::interp::InterpState;
use crate::objects::{
    AgentAttrs, BridgeAttrs, InterfaceAttrs, PolicerActionAttrs, PolicerAttrs, PortAttrs,
    QueueAttrs,
};

/// The serialized configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Interfaces by name.
    pub interfaces: BTreeMap<String, InterfaceAttrs>,
    /// Ports by name.
    pub ports: BTreeMap<String, PortAttrs>,
    /// Queues by name.
    pub queues: BTreeMap<String, QueueAttrs>,
    /// Policers by name.
    pub policers: BTreeMap<String, PolicerAttrs>,
    /// Policer actions by name.
    pub policer_actions: BTreeMap<String, PolicerActionAttrs>,
    /// Bridges by name.
    pub bridges: BTreeMap<String, BridgeAttrs>,
    /// Agents by name.
    pub agents: BTreeMap<String, AgentAttrs>,
}

impl Datastore {
    /// Captures the committed configuration.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            interfaces: self.interfaces.lock().current_attrs(),
            ports: self.ports.lock().current_attrs(),
            queues: self.queues.lock().current_attrs(),
            policers: self.policers.lock().current_attrs(),
            policer_actions: self.policer_actions.lock().current_attrs(),
            bridges: self.bridges.lock().current_attrs(),
            agents: self.agents.lock().current_attrs(),
        }
    }

    /// Replaces the whole configuration from a snapshot. Live objects
    /// are not rebuilt; enable is an explicit operation.
    pub fn restore(&self, snap: Snapshot) {
        self.interfaces.lock().restore(snap.interfaces);
        self.ports.lock().restore(snap.ports);
        self.queues.lock().restore(snap.queues);
        self.policers.lock().restore(snap.policers);
        self.policer_actions.lock().restore(snap.policer_actions);
        self.bridges.lock().restore(snap.bridges);
        self.agents.lock().restore(snap.agents);
    }

    /// Writes the committed configuration as JSON.
    pub fn save_json(&self, path: &Path) -> DatastoreResult<()> {
        let snap = self.snapshot();
        let text = serde_json::to_string_pretty(&snap)
            .map_err(|e| DatastoreError::new(ErrorKind::PosixApiError, e.to_string()))?;
        std::fs::write(path, text)
            .map_err(|e| DatastoreError::new(ErrorKind::PosixApiError, e.to_string()))?;
        info!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Loads a JSON configuration, replacing the committed state.
    pub fn load_json(&self, path: &Path) -> DatastoreResult<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| DatastoreError::new(ErrorKind::PosixApiError, e.to_string()))?;
        let snap: Snapshot = serde_json::from_str(&text)
            .map_err(|e| DatastoreError::new(ErrorKind::InvalidArgs, e.to_string()))?;
        self.restore(snap);
        Ok(())
    }

    /// Writes the binary snapshot rollback uses.
    pub fn save_binary(&self, path: &Path) -> DatastoreResult<()> {
        let snap = self.snapshot();
        let bytes = bincode::serialize(&snap)
            .map_err(|e| DatastoreError::new(ErrorKind::PosixApiError, e.to_string()))?;
        std::fs::write(path, bytes)
            .map_err(|e| DatastoreError::new(ErrorKind::PosixApiError, e.to_string()))?;
        Ok(())
    }

    /// Rollback under force: restores the committed configuration from
    /// the binary snapshot on disk, discarding every pending edit.
    pub fn rollback(&self, path: &Path) -> DatastoreResult<()> {
        let bytes = std::fs::read(path)
            .map_err(|e| DatastoreError::new(ErrorKind::PosixApiError, e.to_string()))?;
        let snap: Snapshot = bincode::deserialize(&bytes)
            .map_err(|e| DatastoreError::new(ErrorKind::InvalidArgs, e.to_string()))?;
        self.set_interp(InterpState::Rollbacking);
        self.restore(snap);
        self.set_interp(InterpState::Rollbacked);
        self.set_interp(InterpState::AutoCommit);
        info!(path = %path.display(), "configuration rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::Drivers;
    use crate::object::Which;
    use crate::objects::InterfaceType;
    use ofswitch_ofproto::PortTable;
    use std::sync::Arc;

    fn ds() -> Datastore {
        Datastore::new(Arc::new(PortTable::new(8)), Drivers::default())
    }

    fn populate(d: &Datastore) {
        d.interface_create(
            "if0",
            InterfaceAttrs {
                kind: InterfaceType::Loopback,
                device: "wire0".into(),
                mtu: 9000,
                ip_addr: None,
            },
        )
        .unwrap();
        d.queue_create("q1", QueueAttrs::default()).unwrap();
        d.port_create(
            "p1",
            PortAttrs {
                interface: Some("if0".into()),
                queues: vec!["q1".into()],
                ..Default::default()
            },
        )
        .unwrap();
    }

    #[test]
    fn test_snapshot_roundtrip_json() {
        let d = ds();
        populate(&d);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.json");
        d.save_json(&path).unwrap();

        let fresh = ds();
        fresh.load_json(&path).unwrap();
        assert_eq!(d.snapshot(), fresh.snapshot());
        let v = fresh.interface_get("if0", Which::Current).unwrap();
        assert_eq!(v["mtu"], 9000);
    }

    #[test]
    fn test_rollback_restores_from_binary() {
        let d = ds();
        populate(&d);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf.bin");
        d.save_binary(&path).unwrap();

        // Diverge: change mtu, then roll back.
        d.interface_config("if0", |a| {
            a.mtu = 1500;
            Ok(())
        })
        .unwrap();
        assert_eq!(
            d.interface_get("if0", Which::Current).unwrap()["mtu"],
            1500
        );
        d.rollback(&path).unwrap();
        assert_eq!(
            d.interface_get("if0", Which::Current).unwrap()["mtu"],
            9000
        );
    }

    #[test]
    fn test_rollback_missing_file() {
        let d = ds();
        let err = d.rollback(Path::new("/nonexistent/conf.bin")).unwrap_err();
        assert_eq!(err.kind, ErrorKind::PosixApiError);
    }

    #[test]
    fn test_snapshot_excludes_pending() {
        let d = ds();
        populate(&d);
        d.begin_atomic().unwrap();
        d.interface_config("if0", |a| {
            a.mtu = 1280;
            Ok(())
        })
        .unwrap();
        let snap = d.snapshot();
        assert_eq!(snap.interfaces["if0"].mtu, 9000);
        d.abort().unwrap();
    }
}
