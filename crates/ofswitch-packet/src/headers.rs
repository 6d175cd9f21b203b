//! Header classification and field access.
//!
//! [`classify`] walks one frame front to back and records layer offsets
//! in the mbuf metadata. The accessors below read and write individual
//! fields at those offsets; they are the only place the pipeline touches
//! raw header bytes, so the set-field executor and the checksum engine
//! share one view of the layout.

use crate::mbuf::Mbuf;
use crate::meta::PktMeta;

/// IPv4.
pub const ETHERTYPE_IP: u16 = 0x0800;
/// ARP.
pub const ETHERTYPE_ARP: u16 = 0x0806;
/// 802.1Q VLAN.
pub const ETHERTYPE_VLAN: u16 = 0x8100;
/// 802.1ad provider tag (QinQ outer).
pub const ETHERTYPE_QINQ: u16 = 0x88a8;
/// IPv6.
pub const ETHERTYPE_IPV6: u16 = 0x86dd;
/// MPLS unicast.
pub const ETHERTYPE_MPLS: u16 = 0x8847;
/// MPLS multicast.
pub const ETHERTYPE_MPLS_MCAST: u16 = 0x8848;
/// 802.1ah provider backbone bridging.
pub const ETHERTYPE_PBB: u16 = 0x88e7;

/// ICMP.
pub const IPPROTO_ICMP: u8 = 1;
/// TCP.
pub const IPPROTO_TCP: u8 = 6;
/// UDP.
pub const IPPROTO_UDP: u8 = 17;
/// ICMPv6.
pub const IPPROTO_ICMPV6: u8 = 58;
/// SCTP.
pub const IPPROTO_SCTP: u8 = 132;

/// Ethernet header length.
pub const ETH_HLEN: usize = 14;
/// One VLAN tag.
pub const VLAN_HLEN: usize = 4;
/// One MPLS label stack entry.
pub const MPLS_HLEN: usize = 4;
/// IPv6 fixed header length.
pub const IPV6_HLEN: usize = 40;

/// Reads a big-endian u16 at `off`.
#[inline]
pub fn be16(data: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([data[off], data[off + 1]])
}

/// Reads a big-endian u32 at `off`.
#[inline]
pub fn be32(data: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

/// Writes a big-endian u16 at `off`.
#[inline]
pub fn put_be16(data: &mut [u8], off: usize, v: u16) {
    data[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

/// Writes a big-endian u32 at `off`.
#[inline]
pub fn put_be32(data: &mut [u8], off: usize, v: u32) {
    data[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

/// Offset of the first byte after the L2 header and its VLAN tags.
#[inline]
pub fn l2_payload_off(meta: &PktMeta) -> usize {
    ETH_HLEN + VLAN_HLEN * meta.vlan_depth as usize
}

fn classify_ipv6(data: &[u8], l3: usize, meta: &mut PktMeta) {
    if data.len() < l3 + IPV6_HLEN {
        return;
    }
    meta.l3_off = Some(l3 as u16);
    let mut next = data[l3 + 6];
    let mut off = l3 + IPV6_HLEN;
    // Walk the common extension headers to find the upper layer.
    loop {
        match next {
            0 | 43 | 60 => {
                // hop-by-hop, routing, destination options
                if data.len() < off + 8 {
                    return;
                }
                let ext_len = 8 + data[off + 1] as usize * 8;
                next = data[off];
                off += ext_len;
            }
            44 => {
                // fragment header is fixed size
                if data.len() < off + 8 {
                    return;
                }
                next = data[off];
                off += 8;
            }
            51 => {
                // authentication header length unit is 4 bytes
                if data.len() < off + 8 {
                    return;
                }
                let ext_len = (data[off + 1] as usize + 2) * 4;
                next = data[off];
                off += ext_len;
            }
            _ => break,
        }
        if off > data.len() {
            return;
        }
    }
    meta.l4_proto = next;
    if off < data.len() {
        meta.l4_off = Some(off as u16);
    }
}

fn classify_ipv4(data: &[u8], l3: usize, meta: &mut PktMeta) {
    if data.len() < l3 + 20 {
        return;
    }
    let ihl = (data[l3] & 0x0f) as usize * 4;
    if ihl < 20 || data.len() < l3 + ihl {
        return;
    }
    meta.l3_off = Some(l3 as u16);
    meta.l4_proto = data[l3 + 9];
    let frag = be16(data, l3 + 6) & 0x1fff;
    // L4 header only exists in the first fragment.
    if frag == 0 && l3 + ihl < data.len() {
        meta.l4_off = Some((l3 + ihl) as u16);
    }
}

/// Parses one frame and fills the metadata offsets. Short or truncated
/// frames are tolerated; absent layers stay `None`.
pub fn classify(m: &mut Mbuf) {
    let in_port = m.meta().in_port;
    let worker_id = m.meta().worker_id;
    let meta = m.meta_mut();
    meta.reset();
    meta.in_port = in_port;
    meta.worker_id = worker_id;

    // Borrow dance: parse against an immutable view, then store.
    let mut parsed = std::mem::take(m.meta_mut());
    let data = m.data();

    if data.len() >= ETH_HLEN {
        let mut ety = be16(data, 12);
        let mut off = ETH_HLEN;
        while (ety == ETHERTYPE_VLAN || ety == ETHERTYPE_QINQ)
            && parsed.vlan_depth < 2
            && data.len() >= off + VLAN_HLEN
        {
            parsed.vlan_depth += 1;
            ety = be16(data, off + 2);
            off += VLAN_HLEN;
        }
        parsed.ether_type = ety;
        match ety {
            ETHERTYPE_IP => classify_ipv4(data, off, &mut parsed),
            ETHERTYPE_IPV6 => classify_ipv6(data, off, &mut parsed),
            ETHERTYPE_MPLS | ETHERTYPE_MPLS_MCAST => {
                if data.len() >= off + MPLS_HLEN {
                    parsed.has_mpls = true;
                }
            }
            _ => {}
        }
    }
    *m.meta_mut() = parsed;
}

/// Re-parses a frame whose headers were just rewritten (push/pop),
/// preserving the pipeline registers and egress scratch that
/// [`classify`] would reset.
pub fn reclassify(m: &mut Mbuf) {
    let meta = m.meta();
    let queue_id = meta.queue_id;
    let color = meta.color;
    let csum_flags = meta.csum_flags;
    let metadata = meta.metadata;
    let tunnel_id = meta.tunnel_id;
    classify(m);
    let meta = m.meta_mut();
    meta.queue_id = queue_id;
    meta.color = color;
    meta.csum_flags = csum_flags;
    meta.metadata = metadata;
    meta.tunnel_id = tunnel_id;
}

// ---------------------------------------------------------------------
// Ethernet
// ---------------------------------------------------------------------

/// Destination MAC.
pub fn eth_dst(m: &Mbuf) -> [u8; 6] {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&m.data()[0..6]);
    mac
}

/// Source MAC.
pub fn eth_src(m: &Mbuf) -> [u8; 6] {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&m.data()[6..12]);
    mac
}

/// Overwrites the destination MAC.
pub fn set_eth_dst(m: &mut Mbuf, mac: &[u8; 6]) {
    m.data_mut()[0..6].copy_from_slice(mac);
}

/// Overwrites the source MAC.
pub fn set_eth_src(m: &mut Mbuf, mac: &[u8; 6]) {
    m.data_mut()[6..12].copy_from_slice(mac);
}

// ---------------------------------------------------------------------
// VLAN (outermost tag)
// ---------------------------------------------------------------------

/// VLAN id of the outermost tag, when present.
pub fn vlan_vid(m: &Mbuf) -> Option<u16> {
    if m.meta().vlan_depth == 0 {
        return None;
    }
    Some(be16(m.data(), ETH_HLEN) & 0x0fff)
}

/// Priority bits of the outermost tag, when present.
pub fn vlan_pcp(m: &Mbuf) -> Option<u8> {
    if m.meta().vlan_depth == 0 {
        return None;
    }
    Some((m.data()[ETH_HLEN] >> 5) & 0x7)
}

/// Sets the VLAN id of the outermost tag.
pub fn set_vlan_vid(m: &mut Mbuf, vid: u16) {
    if m.meta().vlan_depth == 0 {
        return;
    }
    let tci = (be16(m.data(), ETH_HLEN) & !0x0fff) | (vid & 0x0fff);
    put_be16(m.data_mut(), ETH_HLEN, tci);
}

/// Sets the priority bits of the outermost tag.
pub fn set_vlan_pcp(m: &mut Mbuf, pcp: u8) {
    if m.meta().vlan_depth == 0 {
        return;
    }
    let tci = (be16(m.data(), ETH_HLEN) & 0x1fff) | ((pcp as u16 & 0x7) << 13);
    put_be16(m.data_mut(), ETH_HLEN, tci);
}

// ---------------------------------------------------------------------
// MPLS (top of stack)
// ---------------------------------------------------------------------

/// MPLS label of the top stack entry.
pub fn mpls_label(m: &Mbuf) -> Option<u32> {
    if !m.meta().has_mpls {
        return None;
    }
    let off = l2_payload_off(m.meta());
    Some(be32(m.data(), off) >> 12)
}

/// MPLS traffic class of the top stack entry.
pub fn mpls_tc(m: &Mbuf) -> Option<u8> {
    if !m.meta().has_mpls {
        return None;
    }
    let off = l2_payload_off(m.meta());
    Some(((be32(m.data(), off) >> 9) & 0x7) as u8)
}

/// MPLS bottom-of-stack bit.
pub fn mpls_bos(m: &Mbuf) -> Option<bool> {
    if !m.meta().has_mpls {
        return None;
    }
    let off = l2_payload_off(m.meta());
    Some((be32(m.data(), off) >> 8) & 0x1 != 0)
}

/// MPLS TTL of the top stack entry.
pub fn mpls_ttl(m: &Mbuf) -> Option<u8> {
    if !m.meta().has_mpls {
        return None;
    }
    let off = l2_payload_off(m.meta());
    Some((be32(m.data(), off) & 0xff) as u8)
}

/// Rewrites the whole top MPLS stack entry with the given pieces.
pub fn set_mpls_entry(m: &mut Mbuf, label: u32, tc: u8, bos: bool, ttl: u8) {
    if !m.meta().has_mpls {
        return;
    }
    let off = l2_payload_off(m.meta());
    let word = (label & 0xfffff) << 12
        | ((tc as u32 & 0x7) << 9)
        | ((bos as u32) << 8)
        | ttl as u32;
    put_be32(m.data_mut(), off, word);
}

/// Sets only the label bits of the top entry.
pub fn set_mpls_label(m: &mut Mbuf, label: u32) {
    if !m.meta().has_mpls {
        return;
    }
    let off = l2_payload_off(m.meta());
    let word = (be32(m.data(), off) & 0xfff) | ((label & 0xfffff) << 12);
    put_be32(m.data_mut(), off, word);
}

/// Sets only the traffic-class bits of the top entry.
pub fn set_mpls_tc(m: &mut Mbuf, tc: u8) {
    if !m.meta().has_mpls {
        return;
    }
    let off = l2_payload_off(m.meta());
    let word = (be32(m.data(), off) & !(0x7 << 9)) | ((tc as u32 & 0x7) << 9);
    put_be32(m.data_mut(), off, word);
}

/// Sets only the TTL byte of the top entry.
pub fn set_mpls_ttl(m: &mut Mbuf, ttl: u8) {
    if !m.meta().has_mpls {
        return;
    }
    let off = l2_payload_off(m.meta());
    let word = (be32(m.data(), off) & !0xff) | ttl as u32;
    put_be32(m.data_mut(), off, word);
}

// ---------------------------------------------------------------------
// IPv4
// ---------------------------------------------------------------------

/// IPv4 source address, host byte order.
pub fn ipv4_src(m: &Mbuf) -> Option<u32> {
    let l3 = m.meta().l3_off? as usize;
    Some(be32(m.data(), l3 + 12))
}

/// IPv4 destination address, host byte order.
pub fn ipv4_dst(m: &Mbuf) -> Option<u32> {
    let l3 = m.meta().l3_off? as usize;
    Some(be32(m.data(), l3 + 16))
}

/// IPv4 time-to-live.
pub fn ipv4_ttl(m: &Mbuf) -> Option<u8> {
    let l3 = m.meta().l3_off? as usize;
    Some(m.data()[l3 + 8])
}

/// IPv4 DSCP (upper six bits of the TOS byte).
pub fn ipv4_dscp(m: &Mbuf) -> Option<u8> {
    let l3 = m.meta().l3_off? as usize;
    Some(m.data()[l3 + 1] >> 2)
}

/// Sets the IPv4 source address.
pub fn set_ipv4_src(m: &mut Mbuf, addr: u32) {
    if let Some(l3) = m.meta().l3_off {
        put_be32(m.data_mut(), l3 as usize + 12, addr);
    }
}

/// Sets the IPv4 destination address.
pub fn set_ipv4_dst(m: &mut Mbuf, addr: u32) {
    if let Some(l3) = m.meta().l3_off {
        put_be32(m.data_mut(), l3 as usize + 16, addr);
    }
}

/// Sets the IPv4 TTL.
pub fn set_ipv4_ttl(m: &mut Mbuf, ttl: u8) {
    if let Some(l3) = m.meta().l3_off {
        m.data_mut()[l3 as usize + 8] = ttl;
    }
}

/// Sets the IPv4 DSCP, preserving the ECN bits.
pub fn set_ipv4_dscp(m: &mut Mbuf, dscp: u8) {
    if let Some(l3) = m.meta().l3_off {
        let off = l3 as usize + 1;
        let ecn = m.data()[off] & 0x3;
        m.data_mut()[off] = (dscp << 2) | ecn;
    }
}

// ---------------------------------------------------------------------
// IPv6
// ---------------------------------------------------------------------

/// IPv6 source address.
pub fn ipv6_src(m: &Mbuf) -> Option<[u8; 16]> {
    let l3 = m.meta().l3_off? as usize;
    let mut a = [0u8; 16];
    a.copy_from_slice(&m.data()[l3 + 8..l3 + 24]);
    Some(a)
}

/// IPv6 destination address.
pub fn ipv6_dst(m: &Mbuf) -> Option<[u8; 16]> {
    let l3 = m.meta().l3_off? as usize;
    let mut a = [0u8; 16];
    a.copy_from_slice(&m.data()[l3 + 24..l3 + 40]);
    Some(a)
}

/// IPv6 hop limit.
pub fn ipv6_hop_limit(m: &Mbuf) -> Option<u8> {
    let l3 = m.meta().l3_off? as usize;
    Some(m.data()[l3 + 7])
}

/// Sets the IPv6 source address.
pub fn set_ipv6_src(m: &mut Mbuf, addr: &[u8; 16]) {
    if let Some(l3) = m.meta().l3_off {
        let l3 = l3 as usize;
        m.data_mut()[l3 + 8..l3 + 24].copy_from_slice(addr);
    }
}

/// Sets the IPv6 destination address.
pub fn set_ipv6_dst(m: &mut Mbuf, addr: &[u8; 16]) {
    if let Some(l3) = m.meta().l3_off {
        let l3 = l3 as usize;
        m.data_mut()[l3 + 24..l3 + 40].copy_from_slice(addr);
    }
}

/// IPv6 DSCP (upper six bits of the traffic class).
pub fn ipv6_dscp(m: &Mbuf) -> Option<u8> {
    let l3 = m.meta().l3_off? as usize;
    let tc = ((m.data()[l3] & 0x0f) << 4) | (m.data()[l3 + 1] >> 4);
    Some(tc >> 2)
}

/// Sets the IPv6 hop limit.
pub fn set_ipv6_hop_limit(m: &mut Mbuf, hl: u8) {
    if let Some(l3) = m.meta().l3_off {
        m.data_mut()[l3 as usize + 7] = hl;
    }
}

/// Sets the IPv6 DSCP inside the traffic-class field.
pub fn set_ipv6_dscp(m: &mut Mbuf, dscp: u8) {
    if let Some(l3) = m.meta().l3_off {
        let l3 = l3 as usize;
        // Traffic class straddles bytes 0 and 1.
        let tc = ((m.data()[l3] & 0x0f) << 4) | (m.data()[l3 + 1] >> 4);
        let tc = (dscp << 2) | (tc & 0x3);
        let b0 = (m.data()[l3] & 0xf0) | (tc >> 4);
        let b1 = (m.data()[l3 + 1] & 0x0f) | (tc << 4);
        let data = m.data_mut();
        data[l3] = b0;
        data[l3 + 1] = b1;
    }
}

// ---------------------------------------------------------------------
// L4
// ---------------------------------------------------------------------

/// L4 source port (TCP/UDP/SCTP).
pub fn l4_src_port(m: &Mbuf) -> Option<u16> {
    let l4 = m.meta().l4_off? as usize;
    if m.data().len() < l4 + 4 {
        return None;
    }
    Some(be16(m.data(), l4))
}

/// L4 destination port (TCP/UDP/SCTP).
pub fn l4_dst_port(m: &Mbuf) -> Option<u16> {
    let l4 = m.meta().l4_off? as usize;
    if m.data().len() < l4 + 4 {
        return None;
    }
    Some(be16(m.data(), l4 + 2))
}

/// Sets the L4 source port.
pub fn set_l4_src_port(m: &mut Mbuf, port: u16) {
    if let Some(l4) = m.meta().l4_off {
        let l4 = l4 as usize;
        if m.data().len() >= l4 + 4 {
            put_be16(m.data_mut(), l4, port);
        }
    }
}

/// Sets the L4 destination port.
pub fn set_l4_dst_port(m: &mut Mbuf, port: u16) {
    if let Some(l4) = m.meta().l4_off {
        let l4 = l4 as usize;
        if m.data().len() >= l4 + 4 {
            put_be16(m.data_mut(), l4 + 2, port);
        }
    }
}

/// Builds an Ethernet/IPv4/TCP frame; shared by parser and checksum
/// tests.
#[cfg(test)]
pub(crate) fn tcp4_frame(src: u32, dst: u32, sport: u16, dport: u16) -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(&[0x02, 0, 0, 0, 0, 2]); // dst mac
    f.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]); // src mac
    f.extend_from_slice(&ETHERTYPE_IP.to_be_bytes());
    // IPv4: 20-byte header, 20-byte TCP, no payload
    f.push(0x45);
    f.push(0);
    f.extend_from_slice(&40u16.to_be_bytes());
    f.extend_from_slice(&[0, 0, 0, 0]); // id, flags+frag
    f.push(64); // ttl
    f.push(IPPROTO_TCP);
    f.extend_from_slice(&[0, 0]); // checksum
    f.extend_from_slice(&src.to_be_bytes());
    f.extend_from_slice(&dst.to_be_bytes());
    // TCP
    f.extend_from_slice(&sport.to_be_bytes());
    f.extend_from_slice(&dport.to_be_bytes());
    f.extend_from_slice(&[0; 8]); // seq, ack
    f.push(0x50); // data offset 5
    f.push(0x10); // ACK
    f.extend_from_slice(&[0xff, 0xff, 0, 0, 0, 0]); // win, csum, urg
    f
}
