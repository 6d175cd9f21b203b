//! Flow entries: match fields, actions, instructions.

use std::sync::atomic::{AtomicU64, Ordering};

use ofswitch_packet::headers::{
    self, ETHERTYPE_IP, ETHERTYPE_IPV6, ETHERTYPE_MPLS, ETHERTYPE_MPLS_MCAST,
};
use ofswitch_packet::Mbuf;
use serde::{Deserialize, Serialize};

/// Match-field subset with per-field masks where OpenFlow allows them.
/// `None` wildcards the field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowMatch {
    /// Ingress port.
    pub in_port: Option<u32>,
    /// Destination MAC with mask.
    pub eth_dst: Option<([u8; 6], [u8; 6])>,
    /// Source MAC with mask.
    pub eth_src: Option<([u8; 6], [u8; 6])>,
    /// Ethertype after VLAN tags.
    pub eth_type: Option<u16>,
    /// Outermost VLAN id.
    pub vlan_vid: Option<u16>,
    /// Outermost VLAN priority.
    pub vlan_pcp: Option<u8>,
    /// IPv4 source with mask.
    pub ipv4_src: Option<(u32, u32)>,
    /// IPv4 destination with mask.
    pub ipv4_dst: Option<(u32, u32)>,
    /// IPv6 source with mask.
    pub ipv6_src: Option<([u8; 16], [u8; 16])>,
    /// IPv6 destination with mask.
    pub ipv6_dst: Option<([u8; 16], [u8; 16])>,
    /// IP protocol / next header.
    pub ip_proto: Option<u8>,
    /// IP DSCP.
    pub ip_dscp: Option<u8>,
    /// L4 source port.
    pub l4_src: Option<u16>,
    /// L4 destination port.
    pub l4_dst: Option<u16>,
    /// Top MPLS label.
    pub mpls_label: Option<u32>,
    /// Top MPLS traffic class.
    pub mpls_tc: Option<u8>,
    /// MPLS bottom-of-stack bit.
    pub mpls_bos: Option<bool>,
    /// Pipeline metadata with mask.
    pub metadata: Option<(u64, u64)>,
    /// Tunnel id with mask.
    pub tunnel_id: Option<(u64, u64)>,
}

fn mac_matches(want: &([u8; 6], [u8; 6]), have: [u8; 6]) -> bool {
    let (value, mask) = want;
    (0..6).all(|i| have[i] & mask[i] == value[i] & mask[i])
}

fn v6_matches(want: &([u8; 16], [u8; 16]), have: [u8; 16]) -> bool {
    let (value, mask) = want;
    (0..16).all(|i| have[i] & mask[i] == value[i] & mask[i])
}

impl FlowMatch {
    /// True when every present field matches the classified packet.
    pub fn matches(&self, m: &Mbuf) -> bool {
        let meta = m.meta();
        if let Some(p) = self.in_port {
            if meta.in_port != p {
                return false;
            }
        }
        if let Some(ref want) = self.eth_dst {
            if !mac_matches(want, headers::eth_dst(m)) {
                return false;
            }
        }
        if let Some(ref want) = self.eth_src {
            if !mac_matches(want, headers::eth_src(m)) {
                return false;
            }
        }
        if let Some(t) = self.eth_type {
            if meta.ether_type != t {
                return false;
            }
        }
        if let Some(vid) = self.vlan_vid {
            if headers::vlan_vid(m) != Some(vid) {
                return false;
            }
        }
        if let Some(pcp) = self.vlan_pcp {
            if headers::vlan_pcp(m) != Some(pcp) {
                return false;
            }
        }
        if let Some((value, mask)) = self.ipv4_src {
            match headers::ipv4_src(m) {
                Some(a) if meta.ether_type == ETHERTYPE_IP && a & mask == value & mask => {}
                _ => return false,
            }
        }
        if let Some((value, mask)) = self.ipv4_dst {
            match headers::ipv4_dst(m) {
                Some(a) if meta.ether_type == ETHERTYPE_IP && a & mask == value & mask => {}
                _ => return false,
            }
        }
        if let Some(ref want) = self.ipv6_src {
            match headers::ipv6_src(m) {
                Some(a) if meta.ether_type == ETHERTYPE_IPV6 && v6_matches(want, a) => {}
                _ => return false,
            }
        }
        if let Some(ref want) = self.ipv6_dst {
            match headers::ipv6_dst(m) {
                Some(a) if meta.ether_type == ETHERTYPE_IPV6 && v6_matches(want, a) => {}
                _ => return false,
            }
        }
        if let Some(proto) = self.ip_proto {
            if meta.l3_off.is_none() || meta.l4_proto != proto {
                return false;
            }
        }
        if let Some(dscp) = self.ip_dscp {
            let have = match meta.ether_type {
                ETHERTYPE_IP => headers::ipv4_dscp(m),
                ETHERTYPE_IPV6 => headers::ipv6_dscp(m),
                _ => None,
            };
            if have != Some(dscp) {
                return false;
            }
        }
        if let Some(p) = self.l4_src {
            if headers::l4_src_port(m) != Some(p) {
                return false;
            }
        }
        if let Some(p) = self.l4_dst {
            if headers::l4_dst_port(m) != Some(p) {
                return false;
            }
        }
        if self.mpls_label.is_some() || self.mpls_tc.is_some() || self.mpls_bos.is_some() {
            if !matches!(meta.ether_type, ETHERTYPE_MPLS | ETHERTYPE_MPLS_MCAST) {
                return false;
            }
            if let Some(label) = self.mpls_label {
                if headers::mpls_label(m) != Some(label) {
                    return false;
                }
            }
            if let Some(tc) = self.mpls_tc {
                if headers::mpls_tc(m) != Some(tc) {
                    return false;
                }
            }
            if let Some(bos) = self.mpls_bos {
                if headers::mpls_bos(m) != Some(bos) {
                    return false;
                }
            }
        }
        if let Some((value, mask)) = self.metadata {
            if meta.metadata & mask != value & mask {
                return false;
            }
        }
        if let Some((value, mask)) = self.tunnel_id {
            if meta.tunnel_id & mask != value & mask {
                return false;
            }
        }
        true
    }
}

/// One settable field; the 12-tuple plus tunnel and metadata registers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SetField {
    /// Destination MAC.
    EthDst([u8; 6]),
    /// Source MAC.
    EthSrc([u8; 6]),
    /// Outermost VLAN id.
    VlanVid(u16),
    /// Outermost VLAN priority.
    VlanPcp(u8),
    /// IPv4 source.
    Ipv4Src(u32),
    /// IPv4 destination.
    Ipv4Dst(u32),
    /// IPv6 source.
    Ipv6Src([u8; 16]),
    /// IPv6 destination.
    Ipv6Dst([u8; 16]),
    /// IP DSCP.
    IpDscp(u8),
    /// L4 source port.
    L4Src(u16),
    /// L4 destination port.
    L4Dst(u16),
    /// Top MPLS label.
    MplsLabel(u32),
    /// Top MPLS traffic class.
    MplsTc(u8),
    /// Pipeline metadata register.
    Metadata(u64),
    /// Tunnel id register.
    TunnelId(u64),
}

/// One OpenFlow action.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Action {
    /// Emit on a port; reserved numbers included.
    Output(u32),
    /// Process through a group.
    Group(u32),
    /// Push an 802.1Q tag with the given TPID.
    PushVlan(u16),
    /// Pop the outermost 802.1Q tag.
    PopVlan,
    /// Push an MPLS entry with the given ethertype.
    PushMpls(u16),
    /// Pop the top MPLS entry, restoring the given ethertype.
    PopMpls(u16),
    /// Push a provider-backbone header.
    PushPbb(u16),
    /// Pop the provider-backbone header.
    PopPbb,
    /// Select the egress queue.
    SetQueue(u32),
    /// Rewrite one field.
    SetField(SetField),
    /// Decrement the IP TTL, dropping at zero.
    DecNwTtl,
    /// Set the IP TTL.
    SetNwTtl(u8),
    /// Copy TTL outward (IP to MPLS).
    CopyTtlOut,
    /// Copy TTL inward (MPLS to IP).
    CopyTtlIn,
    /// Decrement the MPLS TTL.
    DecMplsTtl,
    /// Set the MPLS TTL.
    SetMplsTtl(u8),
}

/// One OpenFlow instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    /// Run the packet through a meter first.
    Meter(u32),
    /// Apply the actions immediately, in order.
    ApplyActions(Vec<Action>),
    /// Merge actions into the pending action set.
    WriteActions(Vec<Action>),
    /// Empty the pending action set.
    ClearActions,
    /// Update the metadata register under a mask.
    WriteMetadata {
        /// New metadata bits.
        value: u64,
        /// Which bits to update.
        mask: u64,
    },
    /// Continue matching in a later table.
    GotoTable(u8),
}

/// One flow entry. Counters are atomics because workers bump them while
/// holding only the flowtable read lock.
#[derive(Debug)]
pub struct FlowEntry {
    /// Match priority; higher wins.
    pub priority: u16,
    /// Controller-assigned cookie.
    pub cookie: u64,
    /// Match fields.
    pub fmatch: FlowMatch,
    /// Instruction list.
    pub instructions: Vec<Instruction>,
    /// Packets that matched this entry.
    pub packet_count: AtomicU64,
    /// Bytes that matched this entry.
    pub byte_count: AtomicU64,
}

impl FlowEntry {
    /// Creates an entry with zeroed counters.
    pub fn new(priority: u16, fmatch: FlowMatch, instructions: Vec<Instruction>) -> Self {
        Self {
            priority,
            cookie: 0,
            fmatch,
            instructions,
            packet_count: AtomicU64::new(0),
            byte_count: AtomicU64::new(0),
        }
    }

    /// Bumps the match counters for one packet.
    #[inline]
    pub fn account(&self, bytes: u64) {
        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count.fetch_add(bytes, Ordering::Relaxed);
    }
}
