//! Per-packet metadata carried in the mbuf private area.
//!
//! The metadata block is the pipeline's per-packet scratch: parsed header
//! offsets, ethertype, queue/color tags, and the checksum-recompute mask.
//! It travels with the mbuf across rings so no per-packet state lives
//! outside the buffer.

use serde::{Deserialize, Serialize};

/// Recompute the IPv4 header checksum before transmit.
pub const CSUM_RECALC_IPV4: u32 = 1 << 0;
/// Recompute the TCP checksum before transmit.
pub const CSUM_RECALC_TCP: u32 = 1 << 1;
/// Recompute the UDP checksum before transmit.
pub const CSUM_RECALC_UDP: u32 = 1 << 2;
/// Recompute the SCTP CRC32c before transmit.
pub const CSUM_RECALC_SCTP: u32 = 1 << 3;
/// Recompute the ICMP/ICMPv6 checksum before transmit.
pub const CSUM_RECALC_ICMP: u32 = 1 << 4;
/// Mask covering every checksum-recompute request bit.
pub const CSUM_RECALC_MASK: u32 = CSUM_RECALC_IPV4
    | CSUM_RECALC_TCP
    | CSUM_RECALC_UDP
    | CSUM_RECALC_SCTP
    | CSUM_RECALC_ICMP;

/// Egress port supports IPv4 header checksum offload.
pub const TX_OFFLOAD_IPV4: u32 = 1 << 0;
/// Egress port supports TCP checksum offload.
pub const TX_OFFLOAD_TCP: u32 = 1 << 1;
/// Egress port supports UDP checksum offload.
pub const TX_OFFLOAD_UDP: u32 = 1 << 2;
/// Egress port supports SCTP CRC offload.
pub const TX_OFFLOAD_SCTP: u32 = 1 << 3;
/// Egress port supports VLAN tag insertion.
pub const TX_OFFLOAD_VLAN: u32 = 1 << 4;

/// Three-color marker result attached to a packet by a meter, queue
/// check, or policer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PktColor {
    /// Conforming traffic.
    Green,
    /// Exceeding the committed rate but within the excess/peak budget.
    Yellow,
    /// Out of profile; policers drop red packets.
    Red,
}

impl Default for PktColor {
    fn default() -> Self {
        PktColor::Green
    }
}

/// Parsed header layout and pipeline scratch for one packet.
///
/// Offsets are relative to the start of packet data. `u16::MAX` in an
/// offset slot would be ambiguous for jumbo frames, so absent layers are
/// `None`.
#[derive(Debug, Clone, Default)]
pub struct PktMeta {
    /// OpenFlow port number the packet arrived on.
    pub in_port: u32,
    /// Offset of the Ethernet header (0 unless the frame was adjusted).
    pub l2_off: u16,
    /// Offset of the L3 header, when one was classified.
    pub l3_off: Option<u16>,
    /// Offset of the L4 header, when one was classified.
    pub l4_off: Option<u16>,
    /// Ethertype after any VLAN tags.
    pub ether_type: u16,
    /// IP protocol / next header of the innermost classified L3 layer.
    pub l4_proto: u8,
    /// Number of VLAN tags in front of the L3 header (0, 1 or 2).
    pub vlan_depth: u8,
    /// True when an MPLS label stack follows the L2 header.
    pub has_mpls: bool,
    /// Egress queue id selected by a set-queue action; 0 is the default
    /// (unshaped) queue.
    pub queue_id: u32,
    /// Color assigned on the egress path.
    pub color: PktColor,
    /// Set when the pipeline decided to drop this packet.
    pub drop: bool,
    /// CSUM_RECALC_* bits; consumed by TX finalization.
    pub csum_flags: u32,
    /// TX_OFFLOAD_* request bits handed to the egress driver when the
    /// port finishes checksums in hardware.
    pub tx_offload: u32,
    /// OpenFlow pipeline metadata register.
    pub metadata: u64,
    /// Logical tunnel id register.
    pub tunnel_id: u64,
    /// Worker that processed the packet; diagnostics only.
    pub worker_id: u32,
}

impl PktMeta {
    /// Resets the scratch for reuse, keeping nothing from the previous
    /// packet.
    pub fn reset(&mut self) {
        *self = PktMeta::default();
    }

    /// True when any checksum recompute bit is set.
    #[inline]
    pub fn needs_csum(&self) -> bool {
        self.csum_flags & CSUM_RECALC_MASK != 0
    }

    /// Marks every checksum covering layer `l4_proto` for recompute.
    /// Called by set-field actions that touch addresses or ports.
    pub fn mark_l3_dirty(&mut self) {
        self.csum_flags |= CSUM_RECALC_IPV4;
        match self.l4_proto {
            super::headers::IPPROTO_TCP => self.csum_flags |= CSUM_RECALC_TCP,
            super::headers::IPPROTO_UDP => self.csum_flags |= CSUM_RECALC_UDP,
            super::headers::IPPROTO_SCTP => self.csum_flags |= CSUM_RECALC_SCTP,
            super::headers::IPPROTO_ICMP | super::headers::IPPROTO_ICMPV6 => {
                self.csum_flags |= CSUM_RECALC_ICMP
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_meta_is_clean() {
        let meta = PktMeta::default();
        assert_eq!(meta.queue_id, 0);
        assert_eq!(meta.color, PktColor::Green);
        assert!(!meta.drop);
        assert!(!meta.needs_csum());
        assert_eq!(meta.l3_off, None);
    }

    #[test]
    fn test_reset_clears_scratch() {
        let mut meta = PktMeta {
            in_port: 4,
            queue_id: 9,
            drop: true,
            csum_flags: CSUM_RECALC_IPV4,
            ..Default::default()
        };
        meta.reset();
        assert_eq!(meta.in_port, 0);
        assert_eq!(meta.queue_id, 0);
        assert!(!meta.drop);
        assert!(!meta.needs_csum());
    }

    #[test]
    fn test_mark_l3_dirty_tcp() {
        let mut meta = PktMeta {
            l4_proto: super::super::headers::IPPROTO_TCP,
            ..Default::default()
        };
        meta.mark_l3_dirty();
        assert_ne!(meta.csum_flags & CSUM_RECALC_IPV4, 0);
        assert_ne!(meta.csum_flags & CSUM_RECALC_TCP, 0);
        assert_eq!(meta.csum_flags & CSUM_RECALC_UDP, 0);
    }

    #[test]
    fn test_mark_l3_dirty_plain_ip() {
        let mut meta = PktMeta {
            l4_proto: 89, // OSPF, no L4 checksum of ours
            ..Default::default()
        };
        meta.mark_l3_dirty();
        assert_eq!(meta.csum_flags, CSUM_RECALC_IPV4);
    }
}
