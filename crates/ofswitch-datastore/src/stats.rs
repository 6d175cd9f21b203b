//! Stats serialization: flat field-value JSON per object. Counters the
//! underlying driver cannot supply arrive as `u64::MAX` and are passed
//! through unchanged.

use serde_json::{json, Value};

use crate::datastore::Datastore;
use crate::error::{DatastoreError, DatastoreResult, ErrorKind};

impl Datastore {
    /// Port stats: pipeline counters plus the driver's view.
    pub fn port_stats(&self, name: &str) -> DatastoreResult<Value> {
        self.ports.lock().get(name)?;
        let live = self.live_port(name).ok_or_else(|| {
            DatastoreError::new(
                ErrorKind::NotOperational,
                format!("port {name} is not enabled."),
            )
        })?;
        let s = live.stats();
        let mut out = json!({
            "name": name,
            "port-number": live.of_port_no(),
            "rx-packets": s.rx_packets,
            "rx-bytes": s.rx_bytes,
            "rx-dropped": s.rx_dropped,
            "tx-packets": s.tx_packets,
            "tx-bytes": s.tx_bytes,
            "tx-dropped": s.tx_dropped,
        });
        if let Some(iface) = live.interface() {
            if let Ok(d) = iface.stats() {
                out["device-rx-packets"] = json!(d.rx_packets);
                out["device-tx-packets"] = json!(d.tx_packets);
                out["device-rx-errors"] = json!(d.rx_errors);
                out["device-tx-errors"] = json!(d.tx_errors);
                out["device-rx-dropped"] = json!(d.rx_dropped);
                out["device-tx-dropped"] = json!(d.tx_dropped);
            }
        }
        Ok(out)
    }

    /// Queue stats, resolved through the port whose scheduler hosts the
    /// queue.
    pub fn queue_stats(&self, name: &str) -> DatastoreResult<Value> {
        self.queues.lock().get(name)?;
        // Find the enabled port referencing this queue and the queue id
        // its attachment position implies.
        let holder: Option<(String, u32)> = {
            let ports = self.ports.lock();
            let found = ports.iter().find_map(|(pname, obj)| {
                obj.effective().and_then(|attrs| {
                    attrs
                        .queues
                        .iter()
                        .position(|q| q == name)
                        .map(|idx| (pname.clone(), idx as u32 + 1))
                })
            });
            found
        };
        let Some((pname, queue_id)) = holder else {
            return Err(DatastoreError::new(
                ErrorKind::NotOperational,
                format!("queue {name} is not attached to a port."),
            ));
        };
        let live = self.live_port(&pname).ok_or_else(|| {
            DatastoreError::new(
                ErrorKind::NotOperational,
                format!("port {pname} is not enabled."),
            )
        })?;
        let stats = live
            .with_scheduler(|s| s.stats())
            .unwrap_or_default()
            .into_iter()
            .find(|(id, _)| *id == queue_id);
        let Some((_, s)) = stats else {
            return Err(DatastoreError::new(
                ErrorKind::NotOperational,
                format!("queue {name} has no scheduler state."),
            ));
        };
        Ok(json!({
            "name": name,
            "port": pname,
            "queue-id": queue_id,
            "enqueued": s.enqueued,
            "dequeued": s.dequeued,
            "dropped-red": s.dropped_red,
            "dropped-overflow": s.dropped_overflow,
            "tx-bytes": s.tx_bytes,
        }))
    }

    /// Policer stats.
    pub fn policer_stats(&self, name: &str) -> DatastoreResult<Value> {
        self.policers.lock().get(name)?;
        let holder: Option<String> = {
            let ports = self.ports.lock();
            let found = ports.iter().find_map(|(pname, obj)| {
                obj.effective().and_then(|attrs| {
                    if attrs.policer.as_deref() == Some(name) {
                        Some(pname.clone())
                    } else {
                        None
                    }
                })
            });
            found
        };
        let Some(pname) = holder else {
            return Err(DatastoreError::new(
                ErrorKind::NotOperational,
                format!("policer {name} is not attached to a port."),
            ));
        };
        let live = self.live_port(&pname).ok_or_else(|| {
            DatastoreError::new(
                ErrorKind::NotOperational,
                format!("port {pname} is not enabled."),
            )
        })?;
        let s = live
            .policer()
            .map(|p| p.stats())
            .unwrap_or_default();
        Ok(json!({
            "name": name,
            "port": pname,
            "passed": s.passed,
            "dropped": s.dropped,
        }))
    }

    /// Bridge stats: flow, group and meter table sizes plus the
    /// packet-in queue counters.
    pub fn bridge_stats(&self, name: &str) -> DatastoreResult<Value> {
        self.bridges.lock().get(name)?;
        let live = self.live_bridge(name).ok_or_else(|| {
            DatastoreError::new(
                ErrorKind::NotOperational,
                format!("bridge {name} is not enabled."),
            )
        })?;
        let pin = live.packet_in.stats();
        Ok(json!({
            "name": name,
            "dpid": live.dpid(),
            "ports": live.port_count(),
            "flows": live.flowdb.flow_count(),
            "groups": live.groups.len(),
            "meters": live.meters.len(),
            "packet-in-enqueued": pin.enqueued,
            "packet-in-dropped": pin.dropped,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::Drivers;
    use crate::objects::{BridgeAttrs, InterfaceAttrs, InterfaceType, PortAttrs, QueueAttrs};
    use ofswitch_ofproto::PortTable;
    use std::sync::Arc;

    fn ds() -> Datastore {
        Datastore::new(Arc::new(PortTable::new(16)), Drivers::default())
    }

    fn setup_port(d: &Datastore) {
        d.interface_create(
            "if0",
            InterfaceAttrs {
                kind: InterfaceType::Loopback,
                device: "wire0".into(),
                mtu: 1500,
                ip_addr: None,
            },
        )
        .unwrap();
        d.interface_enable("if0").unwrap();
        d.port_create(
            "p1",
            PortAttrs {
                interface: Some("if0".into()),
                ..Default::default()
            },
        )
        .unwrap();
        d.port_enable("p1").unwrap();
    }

    #[test]
    fn test_port_stats_shape() {
        let d = ds();
        setup_port(&d);
        let v = d.port_stats("p1").unwrap();
        assert_eq!(v["name"], "p1");
        assert_eq!(v["rx-packets"], 0);
        assert_eq!(v["tx-dropped"], 0);
    }

    #[test]
    fn test_port_stats_requires_enable() {
        let d = ds();
        d.port_create("p1", PortAttrs::default()).unwrap();
        let err = d.port_stats("p1").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotOperational);
    }

    #[test]
    fn test_queue_stats_through_port() {
        let d = ds();
        d.queue_create("q1", QueueAttrs::default()).unwrap();
        d.interface_create(
            "if0",
            InterfaceAttrs {
                kind: InterfaceType::Loopback,
                device: "wire0".into(),
                mtu: 1500,
                ip_addr: None,
            },
        )
        .unwrap();
        d.interface_enable("if0").unwrap();
        d.port_create(
            "p1",
            PortAttrs {
                interface: Some("if0".into()),
                queues: vec!["q1".into()],
                ..Default::default()
            },
        )
        .unwrap();
        d.port_enable("p1").unwrap();
        let v = d.queue_stats("q1").unwrap();
        assert_eq!(v["queue-id"], 1);
        assert_eq!(v["port"], "p1");
    }

    #[test]
    fn test_bridge_stats_shape() {
        let d = ds();
        setup_port(&d);
        let mut battrs = BridgeAttrs::default();
        battrs.ports.insert("p1".into(), 1);
        d.bridge_create("br0", battrs).unwrap();
        d.bridge_enable("br0").unwrap();
        let v = d.bridge_stats("br0").unwrap();
        assert_eq!(v["ports"], 1);
        assert_eq!(v["flows"], 0);
    }
}
