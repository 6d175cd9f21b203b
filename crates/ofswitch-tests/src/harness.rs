//! Shared scaffolding for the integration scenarios.
//!
//! Builds a two-port switch over the loopback back-end: packets are
//! injected into a switch port's receive queue through the driver and
//! captured on a shadow port wired to the egress side.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ofswitch_datastore::{Datastore, Drivers};
use ofswitch_driver::{InterfaceConfig, NetDriver, PortId};
use ofswitch_ofproto::PortTable;
use ofswitch_packet::headers::{ETHERTYPE_IP, IPPROTO_TCP};
use ofswitch_packet::Mbuf;

/// A two-port switch fixture.
pub struct Switch {
    /// The datastore driving the fixture.
    pub datastore: Arc<Datastore>,
    /// The shared port table.
    pub ports: Arc<PortTable>,
    /// Driver port id of switch port A (inject here).
    pub drv_a: PortId,
    /// Driver port id of switch port B.
    pub drv_b: PortId,
    /// Driver port id of the capture port wired to B's egress.
    pub capture_b: PortId,
}

impl Switch {
    /// Builds interfaces, ports and a bridge, all enabled, with a
    /// capture port behind switch port B.
    pub fn new() -> Self {
        let ports = Arc::new(PortTable::new(16));
        let datastore = Arc::new(Datastore::new(Arc::clone(&ports), Drivers::default()));

        for (ifname, dev) in [("if-a", "wire-a"), ("if-b", "wire-b")] {
            datastore
                .interface_create(
                    ifname,
                    ofswitch_datastore::objects::InterfaceAttrs {
                        kind: ofswitch_datastore::objects::InterfaceType::Loopback,
                        device: dev.into(),
                        mtu: 1500,
                        ip_addr: None,
                    },
                )
                .unwrap();
            datastore.interface_enable(ifname).unwrap();
        }
        for (pname, ifname) in [("port-a", "if-a"), ("port-b", "if-b")] {
            datastore
                .port_create(
                    pname,
                    ofswitch_datastore::objects::PortAttrs {
                        interface: Some(ifname.into()),
                        ..Default::default()
                    },
                )
                .unwrap();
            datastore.port_enable(pname).unwrap();
        }
        let mut battrs = ofswitch_datastore::objects::BridgeAttrs::default();
        battrs.ports.insert("port-a".into(), 1);
        battrs.ports.insert("port-b".into(), 2);
        datastore.bridge_create("br0", battrs).unwrap();
        datastore.bridge_enable("br0").unwrap();

        let drv_a = datastore
            .live_interface("if-a")
            .unwrap()
            .port_id();
        let drv_b = datastore
            .live_interface("if-b")
            .unwrap()
            .port_id();

        // Capture port behind B.
        let loopback = Arc::clone(&datastore.drivers().loopback);
        let capture_b = loopback
            .configure(&InterfaceConfig {
                device: "capture-b".into(),
                ..Default::default()
            })
            .unwrap();
        loopback.start(capture_b).unwrap();
        loopback.pair(drv_b, capture_b).unwrap();

        Self {
            datastore,
            ports,
            drv_a,
            drv_b,
            capture_b,
        }
    }

    /// The live bridge handle.
    pub fn bridge(&self) -> Arc<ofswitch_ofproto::Bridge> {
        self.datastore.live_bridge("br0").unwrap()
    }

    /// Dataplane index of a live port.
    pub fn port_index(&self, name: &str) -> u32 {
        self.datastore.live_port(name).unwrap().index()
    }

    /// Injects one frame into switch port A's receive side.
    pub fn inject_a(&self, frame: &[u8]) {
        self.datastore
            .drivers()
            .loopback
            .inject(self.drv_a, Mbuf::from_slice(frame))
            .unwrap();
    }

    /// Drains frames captured behind switch port B, polling until
    /// `want` arrive or the timeout passes.
    pub fn capture_from_b(&self, want: usize, timeout: Duration) -> Vec<Mbuf> {
        let loopback = &self.datastore.drivers().loopback;
        let mut got = Vec::new();
        let deadline = Instant::now() + timeout;
        while got.len() < want && Instant::now() < deadline {
            got.extend(loopback.drain(self.capture_b).unwrap());
            if got.len() < want {
                std::thread::sleep(Duration::from_millis(5));
            }
        }
        got
    }
}

impl Default for Switch {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a TCP/IPv4 frame with distinguishable addressing; `seq` lands
/// in the TCP sequence field so ordering is observable.
pub fn tcp_frame(src_mac_tail: u8, sport: u16, dport: u16, seq: u32) -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(&[0x02, 0, 0, 0, 0, 0xbb]);
    f.extend_from_slice(&[0x02, 0, 0, 0, 0, src_mac_tail]);
    f.extend_from_slice(&ETHERTYPE_IP.to_be_bytes());
    f.push(0x45);
    f.push(0);
    f.extend_from_slice(&40u16.to_be_bytes());
    f.extend_from_slice(&[0, 0, 0, 0]);
    f.push(64);
    f.push(IPPROTO_TCP);
    f.extend_from_slice(&[0, 0]);
    f.extend_from_slice(&0x0a000001u32.to_be_bytes());
    f.extend_from_slice(&0x0a000002u32.to_be_bytes());
    f.extend_from_slice(&sport.to_be_bytes());
    f.extend_from_slice(&dport.to_be_bytes());
    f.extend_from_slice(&seq.to_be_bytes());
    f.extend_from_slice(&[0u8; 4]);
    f.push(0x50);
    f.push(0x10);
    f.extend_from_slice(&[0xff, 0xff, 0, 0, 0, 0]);
    f
}

/// Reads back the sequence number stamped by [`tcp_frame`].
pub fn frame_seq(m: &Mbuf) -> u32 {
    let d = m.data();
    u32::from_be_bytes([d[38], d[39], d[40], d[41]])
}
