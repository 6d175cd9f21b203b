//! Attribute schemas for every configurable object.

use serde::{Deserialize, Serialize};

use crate::error::{DatastoreError, DatastoreResult};
use ofswitch_packet::{MAX_PACKET_SZ, MIN_MTU};

/// Interface back-end selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceType {
    /// Physical port over the fanout packet back-end.
    #[serde(rename = "ethernet-dpdk-phy")]
    EthernetDpdkPhy,
    /// Plain raw socket.
    #[serde(rename = "ethernet-rawsock")]
    EthernetRawsock,
    /// In-memory pair; tests and bring-up.
    #[serde(rename = "loopback")]
    Loopback,
}

/// `interface` object attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceAttrs {
    /// Back-end type.
    #[serde(rename = "type")]
    pub kind: InterfaceType,
    /// OS device name or PCI address.
    pub device: String,
    /// MTU in bytes.
    pub mtu: u32,
    /// Optional address, carried for the management plane.
    #[serde(rename = "ip-addr", default)]
    pub ip_addr: Option<String>,
}

impl Default for InterfaceAttrs {
    fn default() -> Self {
        Self {
            kind: InterfaceType::EthernetRawsock,
            device: String::new(),
            mtu: 1500,
            ip_addr: None,
        }
    }
}

impl InterfaceAttrs {
    /// Bounds checks; MTU must fit the pipeline's frame limits.
    pub fn validate(&self) -> DatastoreResult<()> {
        if self.mtu < MIN_MTU || self.mtu as usize > MAX_PACKET_SZ {
            return Err(DatastoreError::out_of_range("mtu", self.mtu));
        }
        Ok(())
    }
}

/// `port` object attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PortAttrs {
    /// OpenFlow port number on the bridge; 0 requests automatic
    /// assignment.
    #[serde(rename = "port-number", default)]
    pub port_number: u32,
    /// Owned interface reference.
    #[serde(default)]
    pub interface: Option<String>,
    /// Optional egress policer reference.
    #[serde(default)]
    pub policer: Option<String>,
    /// Egress queue references, in queue-id order.
    #[serde(default)]
    pub queues: Vec<String>,
}

/// Queue rate model selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueType {
    /// RFC 2697 single-rate.
    #[serde(rename = "single-rate")]
    SingleRate,
    /// Two-rate.
    #[serde(rename = "two-rate")]
    TwoRate,
}

/// Color handling of a queue's marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueColor {
    /// Honor the incoming color.
    #[serde(rename = "color-aware")]
    Aware,
    /// Ignore the incoming color.
    #[serde(rename = "color-blind")]
    Blind,
}

/// `queue` object attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueAttrs {
    /// Rate model.
    #[serde(rename = "type")]
    pub kind: QueueType,
    /// Priority level; higher is served first.
    pub priority: u16,
    /// Color awareness.
    pub color: QueueColor,
    /// Committed burst size, bytes.
    #[serde(rename = "committed-burst-size")]
    pub committed_burst_size: u64,
    /// Committed information rate, bytes per second.
    #[serde(rename = "committed-information-rate")]
    pub committed_information_rate: u64,
    /// Excess burst size, bytes; single-rate only.
    #[serde(rename = "excess-burst-size", default)]
    pub excess_burst_size: u64,
    /// Peak burst size, bytes; two-rate only.
    #[serde(rename = "peak-burst-size", default)]
    pub peak_burst_size: u64,
    /// Peak information rate, bytes per second; two-rate only.
    #[serde(rename = "peak-information-rate", default)]
    pub peak_information_rate: u64,
}

impl Default for QueueAttrs {
    fn default() -> Self {
        Self {
            kind: QueueType::SingleRate,
            priority: 0,
            color: QueueColor::Blind,
            committed_burst_size: 1500,
            committed_information_rate: 1_500_000,
            excess_burst_size: 1500,
            peak_burst_size: 0,
            peak_information_rate: 0,
        }
    }
}

impl QueueAttrs {
    /// Rate sanity: the rates the markers will refuse are refused here
    /// first with the boundary error kind.
    pub fn validate(&self) -> DatastoreResult<()> {
        if self.committed_information_rate == 0 {
            return Err(DatastoreError::out_of_range(
                "committed-information-rate",
                0,
            ));
        }
        match self.kind {
            QueueType::SingleRate => {
                if self.committed_burst_size == 0 && self.excess_burst_size == 0 {
                    return Err(DatastoreError::out_of_range("committed-burst-size", 0));
                }
            }
            QueueType::TwoRate => {
                if self.peak_information_rate < self.committed_information_rate {
                    return Err(DatastoreError::out_of_range(
                        "peak-information-rate",
                        self.peak_information_rate,
                    ));
                }
                if self.peak_burst_size == 0 || self.committed_burst_size == 0 {
                    return Err(DatastoreError::out_of_range("peak-burst-size", 0));
                }
            }
        }
        Ok(())
    }

    /// The scheduler-facing rate parameters.
    pub fn to_rate(&self) -> ofswitch_qos::QueueRate {
        match self.kind {
            QueueType::SingleRate => ofswitch_qos::QueueRate::SingleRate {
                cir: self.committed_information_rate,
                cbs: self.committed_burst_size,
                ebs: self.excess_burst_size,
            },
            QueueType::TwoRate => ofswitch_qos::QueueRate::TwoRate {
                cir: self.committed_information_rate,
                cbs: self.committed_burst_size,
                pir: self.peak_information_rate,
                pbs: self.peak_burst_size,
            },
        }
    }
}

/// `policer-action` type selector; discard is the only action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicerActionType {
    /// Drop red packets.
    #[serde(rename = "discard")]
    Discard,
}

/// `policer-action` object attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicerActionAttrs {
    /// Action behavior.
    #[serde(rename = "type")]
    pub kind: PolicerActionType,
}

impl Default for PolicerActionAttrs {
    fn default() -> Self {
        Self {
            kind: PolicerActionType::Discard,
        }
    }
}

/// `policer` object attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicerAttrs {
    /// Action chain references.
    #[serde(default)]
    pub actions: Vec<String>,
    /// Committed rate, kilobits per second.
    #[serde(rename = "bandwidth-limit")]
    pub bandwidth_limit: u64,
    /// Burst tolerance, bytes.
    #[serde(rename = "burst-size-limit")]
    pub burst_size_limit: u64,
    /// Relative share of port bandwidth.
    #[serde(rename = "bandwidth-percent", default)]
    pub bandwidth_percent: u8,
}

impl Default for PolicerAttrs {
    fn default() -> Self {
        Self {
            actions: Vec::new(),
            bandwidth_limit: 1_000_000,
            burst_size_limit: 1500,
            bandwidth_percent: 0,
        }
    }
}

impl PolicerAttrs {
    /// Bounds checks.
    pub fn validate(&self) -> DatastoreResult<()> {
        if self.bandwidth_limit == 0 {
            return Err(DatastoreError::out_of_range("bandwidth-limit", 0));
        }
        if self.burst_size_limit == 0 {
            return Err(DatastoreError::out_of_range("burst-size-limit", 0));
        }
        if self.bandwidth_percent > 100 {
            return Err(DatastoreError::out_of_range(
                "bandwidth-percent",
                self.bandwidth_percent,
            ));
        }
        Ok(())
    }
}

/// Bridge fail mode while no controller is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailMode {
    /// Keep forwarding with learning-bridge semantics.
    #[serde(rename = "standalone")]
    Standalone,
    /// Stop forwarding.
    #[serde(rename = "secure")]
    Secure,
}

/// `bridge` object attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeAttrs {
    /// Datapath id.
    #[serde(default)]
    pub dpid: u64,
    /// Attached ports: port object name to OpenFlow port number
    /// (0 = auto).
    #[serde(default)]
    pub ports: std::collections::BTreeMap<String, u32>,
    /// Behavior without a controller.
    #[serde(rename = "fail-mode")]
    pub fail_mode: FailMode,
}

impl Default for BridgeAttrs {
    fn default() -> Self {
        Self {
            dpid: 0,
            ports: std::collections::BTreeMap::new(),
            fail_mode: FailMode::Standalone,
        }
    }
}

/// `agent` object attributes: the OpenFlow channel queue bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAttrs {
    /// Packet-in queue capacity.
    #[serde(rename = "channelq-size")]
    pub channelq_size: u16,
    /// Largest batch one drain returns.
    #[serde(rename = "channelq-max-batches")]
    pub channelq_max_batches: u16,
}

impl Default for AgentAttrs {
    fn default() -> Self {
        Self {
            channelq_size: ofswitch_ofproto::packet_in::DEFAULT_CHANNELQ_SIZE,
            channelq_max_batches: ofswitch_ofproto::packet_in::DEFAULT_CHANNELQ_MAX_BATCHES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_mtu_bounds() {
        let mut a = InterfaceAttrs::default();
        a.mtu = 63;
        assert!(a.validate().is_err());
        a.mtu = 64;
        assert!(a.validate().is_ok());
        a.mtu = MAX_PACKET_SZ as u32;
        assert!(a.validate().is_ok());
        a.mtu = MAX_PACKET_SZ as u32 + 1;
        assert!(a.validate().is_err());
    }

    #[test]
    fn test_queue_two_rate_validation() {
        let a = QueueAttrs {
            kind: QueueType::TwoRate,
            committed_information_rate: 2000,
            peak_information_rate: 1000,
            peak_burst_size: 100,
            ..Default::default()
        };
        assert!(a.validate().is_err());
        let a = QueueAttrs {
            kind: QueueType::TwoRate,
            committed_information_rate: 1000,
            peak_information_rate: 2000,
            peak_burst_size: 100,
            committed_burst_size: 100,
            ..Default::default()
        };
        assert!(a.validate().is_ok());
    }

    #[test]
    fn test_policer_validation() {
        let mut a = PolicerAttrs::default();
        assert!(a.validate().is_ok());
        a.bandwidth_percent = 101;
        assert!(a.validate().is_err());
    }

    #[test]
    fn test_serde_field_names() {
        let a = InterfaceAttrs {
            kind: InterfaceType::EthernetDpdkPhy,
            device: "0000:01:00.0".into(),
            mtu: 1500,
            ip_addr: None,
        };
        let j = serde_json::to_value(&a).unwrap();
        assert_eq!(j["type"], "ethernet-dpdk-phy");
        assert!(j.get("mtu").is_some());

        let q = QueueAttrs::default();
        let j = serde_json::to_value(&q).unwrap();
        assert!(j.get("committed-burst-size").is_some());
        assert_eq!(j["type"], "single-rate");
        assert_eq!(j["color"], "color-blind");
    }
}
