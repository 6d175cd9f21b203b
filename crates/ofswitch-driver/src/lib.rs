#![warn(missing_docs)]

//! ofswitch driver subsystem.
//!
//! One capability trait, [`NetDriver`], fronts every back-end: Linux raw
//! sockets, AF_PACKET with fanout queues (the physical-NIC analogue),
//! BSD BPF devices, and an in-memory loopback pair used by tests. The
//! pipeline never branches on back-end identity; ports carry capability
//! bits instead.

pub mod error;
pub mod loopback;
pub mod registry;

#[cfg(target_os = "linux")]
pub(crate) mod linux;
#[cfg(target_os = "linux")]
pub mod phy;
#[cfg(target_os = "linux")]
pub mod rawsock;

#[cfg(any(
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "macos"
))]
pub mod bpf;

use std::sync::Arc;

use ofswitch_packet::{Mbuf, PoolLocal};
use serde::{Deserialize, Serialize};

pub use error::{DriverError, DriverResult};
pub use loopback::LoopbackDriver;

/// Driver-scoped port identifier.
pub type PortId = u32;

/// Most ports one back-end instance manages.
pub const MAX_PORTS: usize = 256;

/// Which back-end an interface is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverKind {
    /// AF_PACKET with per-queue fanout sockets; the physical-NIC path.
    EthernetPhy,
    /// Plain non-blocking raw socket.
    RawSocket,
    /// BSD BPF device.
    Bpf,
    /// In-memory paired device for tests.
    Loopback,
}

/// Parameters a back-end needs to bring up one interface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// OS device name ("eth0") or loopback label.
    pub device: String,
    /// Initial MTU.
    pub mtu: u32,
    /// Enable promiscuous mode at start.
    pub promiscuous: bool,
    /// RX queues to open; fanout back-ends only, others use one.
    pub rx_queues: u16,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            mtu: 1500,
            promiscuous: true,
            rx_queues: 1,
        }
    }
}

/// Link state reported by a back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    /// Carrier present.
    pub up: bool,
    /// Negotiated speed in Mbps; 0 when unknown.
    pub speed_mbps: u32,
    /// Full duplex; raw sockets report true.
    pub full_duplex: bool,
}

impl LinkStatus {
    /// A down link with no speed information.
    pub const DOWN: LinkStatus = LinkStatus {
        up: false,
        speed_mbps: 0,
        full_duplex: false,
    };
}

/// Counters a back-end exposes for one port. `u64::MAX` marks a counter
/// the back-end cannot provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStats {
    /// Packets received.
    pub rx_packets: u64,
    /// Packets transmitted.
    pub tx_packets: u64,
    /// Bytes received.
    pub rx_bytes: u64,
    /// Bytes transmitted.
    pub tx_bytes: u64,
    /// Receive errors.
    pub rx_errors: u64,
    /// Transmit errors.
    pub tx_errors: u64,
    /// Packets dropped on receive.
    pub rx_dropped: u64,
    /// Packets dropped on transmit.
    pub tx_dropped: u64,
}

impl Default for DriverStats {
    fn default() -> Self {
        Self {
            rx_packets: 0,
            tx_packets: 0,
            rx_bytes: 0,
            tx_bytes: 0,
            rx_errors: 0,
            tx_errors: 0,
            rx_dropped: 0,
            tx_dropped: 0,
        }
    }
}

/// Callback invoked on link-state transitions by back-ends that support
/// notification (or by the poll timer for the others).
pub type LinkCallback = Arc<dyn Fn(PortId, LinkStatus) + Send + Sync>;

/// The unified back-end contract.
///
/// Burst RX never blocks; an empty queue returns 0. Burst TX consumes
/// the packets it managed to send from the front of the slice and leaves
/// the rest for the caller to free and account as drops.
pub trait NetDriver: Send + Sync {
    /// Which back-end this is.
    fn kind(&self) -> DriverKind;

    /// Brings up one interface and returns its port id.
    fn configure(&self, config: &InterfaceConfig) -> DriverResult<PortId>;

    /// Tears an interface down and releases its slot.
    fn unconfigure(&self, port: PortId) -> DriverResult<()>;

    /// Administratively enables the port.
    fn start(&self, port: PortId) -> DriverResult<()>;

    /// Administratively disables the port.
    fn stop(&self, port: PortId) -> DriverResult<()>;

    /// Receives up to `max` packets into `out`, allocating from `pool`.
    /// Returns the number received; 0 when nothing is pending or the
    /// pool is exhausted.
    fn rx_burst(
        &self,
        port: PortId,
        queue: u16,
        pool: &mut PoolLocal,
        out: &mut Vec<Mbuf>,
        max: usize,
    ) -> usize;

    /// Transmits packets from the front of `pkts`, removing the ones it
    /// sent. Returns the count sent; whatever remains is the caller's to
    /// free and count as `tx_dropped`.
    fn tx_burst(&self, port: PortId, queue: u16, pkts: &mut Vec<Mbuf>) -> usize;

    /// Current link state.
    fn link_status(&self, port: PortId) -> DriverResult<LinkStatus>;

    /// Counter snapshot.
    fn stats(&self, port: PortId) -> DriverResult<DriverStats>;

    /// Changes the MTU; back-ends may return `Unsupported`, which the
    /// port layer treats as warn-only.
    fn set_mtu(&self, port: PortId, mtu: u32) -> DriverResult<()>;

    /// Toggles promiscuous mode.
    fn set_promiscuous(&self, port: PortId, on: bool) -> DriverResult<()>;

    /// Hardware address of the underlying device.
    fn hwaddr(&self, port: PortId) -> DriverResult<[u8; 6]>;

    /// TX checksum-offload capability bits (`TX_OFFLOAD_*` from the
    /// packet crate); 0 means every checksum is computed in software.
    fn tx_offload_caps(&self, _port: PortId) -> u32 {
        0
    }

    /// Registers a link-transition callback. Back-ends without
    /// notification support report `Unsupported` and rely on
    /// [`NetDriver::poll_link`].
    fn set_link_callback(&self, _port: PortId, _cb: LinkCallback) -> DriverResult<()> {
        Err(DriverError::Unsupported("link callbacks"))
    }

    /// Re-reads the link state and fires the registered callback when it
    /// changed. Called from the management poll timer for back-ends
    /// without interrupts.
    fn poll_link(&self, _port: PortId) {}
}
