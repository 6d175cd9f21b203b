//! Driver-level interface binding.
//!
//! An interface ties one configured back-end device to the switch
//! model. The port that owns it is its only owner; everything else
//! reaches the interface through the port.

use std::sync::Arc;

use ofswitch_driver::{
    DriverKind, DriverResult, DriverStats, InterfaceConfig, LinkCallback, LinkStatus, NetDriver,
    PortId,
};
use ofswitch_packet::{Mbuf, PoolLocal, MAX_PACKET_SZ, MIN_MTU};
use tracing::{info, warn};

use crate::error::{OfprotoError, OfprotoResult};

/// One attached device.
pub struct Interface {
    name: String,
    config: InterfaceConfig,
    driver: Arc<dyn NetDriver>,
    port_id: PortId,
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("device", &self.config.device)
            .field("port_id", &self.port_id)
            .finish()
    }
}

impl Interface {
    /// Configures the device on its back-end. The MTU must already be
    /// inside `[MIN_MTU, MAX_PACKET_SZ]`.
    pub fn attach(
        name: &str,
        driver: Arc<dyn NetDriver>,
        config: InterfaceConfig,
    ) -> OfprotoResult<Arc<Self>> {
        if config.mtu < MIN_MTU || config.mtu as usize > MAX_PACKET_SZ {
            return Err(OfprotoError::Driver(
                ofswitch_driver::DriverError::MtuOutOfRange {
                    mtu: config.mtu,
                    min: MIN_MTU,
                    max: MAX_PACKET_SZ as u32,
                },
            ));
        }
        let port_id = driver.configure(&config)?;
        info!(name, device = %config.device, port_id, "interface attached");
        Ok(Arc::new(Self {
            name: name.to_string(),
            config,
            driver,
            port_id,
        }))
    }

    /// Stops and unconfigures the device, releasing its slot.
    pub fn detach(&self) -> OfprotoResult<()> {
        let _ = self.driver.stop(self.port_id);
        self.driver.unconfigure(self.port_id)?;
        info!(name = %self.name, "interface detached");
        Ok(())
    }

    /// Object name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration the device was brought up with.
    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    /// Back-end kind.
    pub fn kind(&self) -> DriverKind {
        self.driver.kind()
    }

    /// Driver-scoped port id.
    pub fn port_id(&self) -> PortId {
        self.port_id
    }

    /// Brings the device up.
    pub fn start(&self) -> DriverResult<()> {
        self.driver.start(self.port_id)
    }

    /// Brings the device down.
    pub fn stop(&self) -> DriverResult<()> {
        self.driver.stop(self.port_id)
    }

    /// Burst receive; see [`NetDriver::rx_burst`].
    #[inline]
    pub fn rx_burst(
        &self,
        queue: u16,
        pool: &mut PoolLocal,
        out: &mut Vec<Mbuf>,
        max: usize,
    ) -> usize {
        self.driver.rx_burst(self.port_id, queue, pool, out, max)
    }

    /// Burst transmit; see [`NetDriver::tx_burst`].
    #[inline]
    pub fn tx_burst(&self, queue: u16, pkts: &mut Vec<Mbuf>) -> usize {
        self.driver.tx_burst(self.port_id, queue, pkts)
    }

    /// Current link state.
    pub fn link_status(&self) -> DriverResult<LinkStatus> {
        self.driver.link_status(self.port_id)
    }

    /// Driver counters.
    pub fn stats(&self) -> DriverResult<DriverStats> {
        self.driver.stats(self.port_id)
    }

    /// Changes the MTU. A back-end refusal is warn-only, matching the
    /// port bring-up contract.
    pub fn set_mtu(&self, mtu: u32) -> OfprotoResult<()> {
        if mtu < MIN_MTU || mtu as usize > MAX_PACKET_SZ {
            return Err(OfprotoError::Driver(
                ofswitch_driver::DriverError::MtuOutOfRange {
                    mtu,
                    min: MIN_MTU,
                    max: MAX_PACKET_SZ as u32,
                },
            ));
        }
        if let Err(e) = self.driver.set_mtu(self.port_id, mtu) {
            warn!(name = %self.name, mtu, error = %e, "device refused MTU change");
        }
        Ok(())
    }

    /// Toggles promiscuous mode.
    pub fn set_promiscuous(&self, on: bool) -> DriverResult<()> {
        self.driver.set_promiscuous(self.port_id, on)
    }

    /// Device hardware address.
    pub fn hwaddr(&self) -> DriverResult<[u8; 6]> {
        self.driver.hwaddr(self.port_id)
    }

    /// TX offload capability bits.
    #[inline]
    pub fn tx_offload_caps(&self) -> u32 {
        self.driver.tx_offload_caps(self.port_id)
    }

    /// Registers a link callback when the back-end supports it.
    pub fn set_link_callback(&self, cb: LinkCallback) -> DriverResult<()> {
        self.driver.set_link_callback(self.port_id, cb)
    }

    /// Drives link polling for callback-less back-ends.
    pub fn poll_link(&self) {
        self.driver.poll_link(self.port_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofswitch_driver::LoopbackDriver;

    fn loop_iface(mtu: u32) -> OfprotoResult<Arc<Interface>> {
        let driver = Arc::new(LoopbackDriver::new());
        Interface::attach(
            "if0",
            driver,
            InterfaceConfig {
                device: "loop0".into(),
                mtu,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_mtu_bounds() {
        assert!(loop_iface(63).is_err());
        assert!(loop_iface(64).is_ok());
        assert!(loop_iface(MAX_PACKET_SZ as u32).is_ok());
        assert!(loop_iface(MAX_PACKET_SZ as u32 + 1).is_err());
    }

    #[test]
    fn test_attach_detach() {
        let iface = loop_iface(1500).unwrap();
        assert_eq!(iface.name(), "if0");
        iface.start().unwrap();
        assert!(iface.link_status().unwrap().up);
        iface.detach().unwrap();
    }

    #[test]
    fn test_set_mtu_validates_range() {
        let iface = loop_iface(1500).unwrap();
        assert!(iface.set_mtu(63).is_err());
        assert!(iface.set_mtu(9000).is_ok());
    }
}
