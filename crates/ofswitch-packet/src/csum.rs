//! Checksum engine for the TX path.
//!
//! Software recomputation of IPv4 header checksums, pseudo-header based
//! TCP/UDP checksums over IPv4 and IPv6, CRC32c for SCTP (RFC 3309), and
//! ICMP/ICMPv6 body checksums. [`finalize_tx`] is the single entry point:
//! it pads runt frames to 60 bytes and then either requests hardware
//! offload from the egress port or computes everything here.

use crate::error::{PacketError, PacketResult};
use crate::headers::{
    be16, ETHERTYPE_IP, ETHERTYPE_IPV6, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_SCTP, IPPROTO_TCP,
    IPPROTO_UDP, IPV6_HLEN,
};
use crate::mbuf::Mbuf;
use crate::meta::{
    CSUM_RECALC_MASK, TX_OFFLOAD_IPV4, TX_OFFLOAD_SCTP, TX_OFFLOAD_TCP, TX_OFFLOAD_UDP,
    TX_OFFLOAD_VLAN,
};

/// Accumulates the 16-bit one's-complement sum of `data` into `sum`.
fn sum16(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for w in &mut chunks {
        sum += u16::from_be_bytes([w[0], w[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    sum
}

/// Folds the carry bits and complements, mapping 0 to 0xffff.
fn fold_complement(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    let csum = !(sum as u16);
    if csum == 0 {
        0xffff
    } else {
        csum
    }
}

/// One's-complement checksum of an IPv4 header (checksum field must be
/// zeroed by the caller).
pub fn ipv4_header_csum(hdr: &[u8]) -> u16 {
    fold_complement(sum16(hdr, 0))
}

fn pseudo_v4_sum(data: &[u8], l3: usize, l4_len: u16, proto: u8) -> u32 {
    let mut sum = sum16(&data[l3 + 12..l3 + 20], 0);
    sum += proto as u32;
    sum += l4_len as u32;
    sum
}

fn pseudo_v6_sum(data: &[u8], l3: usize, l4_len: u32, proto: u8) -> u32 {
    let mut sum = sum16(&data[l3 + 8..l3 + 40], 0);
    sum += l4_len >> 16;
    sum += l4_len & 0xffff;
    sum += proto as u32;
    sum
}

const fn crc32c_table() -> [u32; 256] {
    // Castagnoli polynomial, reflected.
    let poly: u32 = 0x82f63b78;
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ poly } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static CRC32C_TABLE: [u32; 256] = crc32c_table();

/// CRC32c over `data`, continuing from `crc` (start with `0xffff_ffff`).
pub fn crc32c(mut crc: u32, data: &[u8]) -> u32 {
    for &b in data {
        crc = (crc >> 8) ^ CRC32C_TABLE[((crc ^ b as u32) & 0xff) as usize];
    }
    crc
}

struct L4Layout {
    l3: usize,
    l4: usize,
    l4_len: usize,
}

fn layout(m: &Mbuf) -> PacketResult<L4Layout> {
    let meta = m.meta();
    let l3 = meta.l3_off.ok_or(PacketError::MissingHeader("l3"))? as usize;
    let l4 = meta.l4_off.ok_or(PacketError::MissingHeader("l4"))? as usize;
    let data = m.data();
    let declared = match meta.ether_type {
        ETHERTYPE_IP => {
            let tlen = be16(data, l3 + 2) as usize;
            tlen.saturating_sub(l4 - l3)
        }
        ETHERTYPE_IPV6 => {
            let plen = be16(data, l3 + 4) as usize;
            plen.saturating_sub(l4 - l3 - IPV6_HLEN)
        }
        _ => 0,
    };
    // Never trust the header length past the actual buffer.
    let l4_len = declared.min(data.len().saturating_sub(l4));
    Ok(L4Layout { l3, l4, l4_len })
}

fn write_l4_csum(m: &mut Mbuf, csum_off: usize, csum: u16) {
    let data = m.data_mut();
    data[csum_off..csum_off + 2].copy_from_slice(&csum.to_be_bytes());
}

fn update_l4_csum(m: &mut Mbuf, pseudo: bool) -> PacketResult<()> {
    let lay = layout(m)?;
    let proto = m.meta().l4_proto;
    let ether_type = m.meta().ether_type;
    let csum_off = match proto {
        IPPROTO_TCP => lay.l4 + 16,
        IPPROTO_UDP => lay.l4 + 6,
        IPPROTO_ICMP | IPPROTO_ICMPV6 => lay.l4 + 2,
        _ => return Ok(()),
    };
    if m.data().len() < csum_off + 2 {
        return Err(PacketError::ShortPacket {
            context: "l4 checksum",
            needed: csum_off + 2,
            available: m.data().len(),
        });
    }
    write_l4_csum(m, csum_off, 0);
    let data = m.data();
    let mut sum = 0u32;
    if pseudo {
        sum = match ether_type {
            ETHERTYPE_IP => pseudo_v4_sum(data, lay.l3, lay.l4_len as u16, proto),
            ETHERTYPE_IPV6 => pseudo_v6_sum(data, lay.l3, lay.l4_len as u32, proto),
            _ => 0,
        };
    }
    sum = sum16(&data[lay.l4..lay.l4 + lay.l4_len], sum);
    let csum = fold_complement(sum);
    write_l4_csum(m, csum_off, csum);
    Ok(())
}

fn update_sctp_csum(m: &mut Mbuf) -> PacketResult<()> {
    let lay = layout(m)?;
    if m.data().len() < lay.l4 + 12 {
        return Err(PacketError::ShortPacket {
            context: "sctp checksum",
            needed: lay.l4 + 12,
            available: m.data().len(),
        });
    }
    {
        let data = m.data_mut();
        data[lay.l4 + 8..lay.l4 + 12].fill(0);
    }
    let data = m.data();
    let crc = !crc32c(0xffff_ffff, &data[lay.l4..lay.l4 + lay.l4_len]);
    // SCTP transmits the CRC in byte-swapped (little endian) order.
    let data = m.data_mut();
    data[lay.l4 + 8..lay.l4 + 12].copy_from_slice(&crc.to_le_bytes());
    Ok(())
}

/// Recomputes the IPv4 header checksum in place.
pub fn update_ipv4_header_csum(m: &mut Mbuf) -> PacketResult<()> {
    let l3 = m.meta().l3_off.ok_or(PacketError::MissingHeader("ipv4"))? as usize;
    let ihl = ((m.data()[l3] & 0x0f) as usize) * 4;
    if m.data().len() < l3 + ihl {
        return Err(PacketError::ShortPacket {
            context: "ipv4 header",
            needed: l3 + ihl,
            available: m.data().len(),
        });
    }
    {
        let data = m.data_mut();
        data[l3 + 10] = 0;
        data[l3 + 11] = 0;
    }
    let csum = ipv4_header_csum(&m.data()[l3..l3 + ihl]);
    let data = m.data_mut();
    data[l3 + 10..l3 + 12].copy_from_slice(&csum.to_be_bytes());
    Ok(())
}

/// Recomputes the IPv4 header checksum and whichever L4 checksum the
/// packet carries.
pub fn update_ipv4_checksums(m: &mut Mbuf) -> PacketResult<()> {
    update_ipv4_header_csum(m)?;
    match m.meta().l4_proto {
        IPPROTO_TCP | IPPROTO_UDP => update_l4_csum(m, true),
        IPPROTO_SCTP => update_sctp_csum(m),
        // ICMP over IPv4 has no pseudo header.
        IPPROTO_ICMP => update_l4_csum(m, false),
        _ => Ok(()),
    }
}

/// Recomputes the L4 checksum of an IPv6 packet. All IPv6 upper-layer
/// checksums, ICMPv6 included, cover the IPv6 pseudo header.
pub fn update_ipv6_checksums(m: &mut Mbuf) -> PacketResult<()> {
    match m.meta().l4_proto {
        IPPROTO_TCP | IPPROTO_UDP | IPPROTO_ICMPV6 => update_l4_csum(m, true),
        IPPROTO_SCTP => update_sctp_csum(m),
        _ => Ok(()),
    }
}

/// Prepares one packet for transmit: pad runts to the 60-byte minimum,
/// then satisfy any pending checksum-recompute request either by setting
/// offload request bits for the egress port (`offload_caps` advertises
/// what the port can finish) or by computing in software here.
pub fn finalize_tx(m: &mut Mbuf, offload_caps: u32) -> PacketResult<()> {
    m.pad_to_min()?;
    if !m.meta().needs_csum() {
        return Ok(());
    }
    let ether_type = m.meta().ether_type;
    let wants_hw = match ether_type {
        ETHERTYPE_IP => match m.meta().l4_proto {
            IPPROTO_TCP => offload_caps & (TX_OFFLOAD_IPV4 | TX_OFFLOAD_TCP)
                == (TX_OFFLOAD_IPV4 | TX_OFFLOAD_TCP),
            IPPROTO_UDP => offload_caps & (TX_OFFLOAD_IPV4 | TX_OFFLOAD_UDP)
                == (TX_OFFLOAD_IPV4 | TX_OFFLOAD_UDP),
            IPPROTO_SCTP => offload_caps & (TX_OFFLOAD_IPV4 | TX_OFFLOAD_SCTP)
                == (TX_OFFLOAD_IPV4 | TX_OFFLOAD_SCTP),
            _ => offload_caps & TX_OFFLOAD_IPV4 != 0 && m.meta().l4_proto != IPPROTO_ICMP,
        },
        ETHERTYPE_IPV6 => match m.meta().l4_proto {
            IPPROTO_TCP => offload_caps & TX_OFFLOAD_TCP != 0,
            IPPROTO_UDP => offload_caps & TX_OFFLOAD_UDP != 0,
            IPPROTO_SCTP => offload_caps & TX_OFFLOAD_SCTP != 0,
            _ => false,
        },
        _ => false,
    };
    if wants_hw {
        let mut tx = 0u32;
        if ether_type == ETHERTYPE_IP {
            tx |= TX_OFFLOAD_IPV4;
        }
        match m.meta().l4_proto {
            IPPROTO_TCP => tx |= TX_OFFLOAD_TCP,
            IPPROTO_UDP => tx |= TX_OFFLOAD_UDP,
            IPPROTO_SCTP => tx |= TX_OFFLOAD_SCTP,
            _ => {}
        }
        if m.meta().vlan_depth > 0 {
            tx |= TX_OFFLOAD_VLAN;
        }
        m.meta_mut().tx_offload = tx;
    } else {
        match ether_type {
            ETHERTYPE_IP => update_ipv4_checksums(m)?,
            ETHERTYPE_IPV6 => update_ipv6_checksums(m)?,
            _ => {}
        }
    }
    m.meta_mut().csum_flags &= !CSUM_RECALC_MASK;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{classify, tcp4_frame};
    use crate::meta::CSUM_RECALC_IPV4;

    /// Verifies a region whose one's-complement sum (checksum included)
    /// must fold to zero.
    fn verify_sum(data: &[u8], extra: u32) -> bool {
        let mut sum = sum16(data, extra);
        while sum >> 16 != 0 {
            sum = (sum >> 16) + (sum & 0xffff);
        }
        sum as u16 == 0xffff
    }

    #[test]
    fn test_known_ipv4_header_checksum() {
        // Example header from RFC 1071 discussions; checksum field zeroed.
        let hdr: [u8; 20] = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(ipv4_header_csum(&hdr), 0xb861);
    }

    #[test]
    fn test_update_ipv4_header_csum_verifies() {
        let frame = tcp4_frame(0x0a000001, 0x0a000002, 5000, 443);
        let mut m = Mbuf::from_slice(&frame);
        classify(&mut m);
        update_ipv4_header_csum(&mut m).unwrap();
        let l3 = m.meta().l3_off.unwrap() as usize;
        assert!(verify_sum(&m.data()[l3..l3 + 20], 0));
    }

    #[test]
    fn test_tcp_checksum_verifies_with_pseudo_header() {
        let frame = tcp4_frame(0x0a000001, 0x0a000002, 5000, 443);
        let mut m = Mbuf::from_slice(&frame);
        classify(&mut m);
        update_ipv4_checksums(&mut m).unwrap();
        let l3 = m.meta().l3_off.unwrap() as usize;
        let l4 = m.meta().l4_off.unwrap() as usize;
        let pseudo = pseudo_v4_sum(m.data(), l3, 20, IPPROTO_TCP);
        assert!(verify_sum(&m.data()[l4..l4 + 20], pseudo));
    }

    #[test]
    fn test_crc32c_known_vector() {
        // RFC 3720 test vector: 32 bytes of zeros.
        let crc = !crc32c(0xffff_ffff, &[0u8; 32]);
        assert_eq!(crc, 0xaa36918a);

        // "123456789" standard check value.
        let crc = !crc32c(0xffff_ffff, b"123456789");
        assert_eq!(crc, 0xe3069283);
    }

    #[test]
    fn test_finalize_pads_runt() {
        let mut m = Mbuf::from_slice(&[0xabu8; 59]);
        classify(&mut m);
        finalize_tx(&mut m, 0).unwrap();
        assert_eq!(m.len(), 60);
        assert_eq!(m.data()[59], 0);
    }

    #[test]
    fn test_finalize_software_path_clears_request() {
        let frame = tcp4_frame(1, 2, 3, 4);
        let mut m = Mbuf::from_slice(&frame);
        classify(&mut m);
        m.meta_mut().mark_l3_dirty();
        assert!(m.meta().needs_csum());
        finalize_tx(&mut m, 0).unwrap();
        assert!(!m.meta().needs_csum());
        assert_eq!(m.meta().tx_offload, 0);
    }

    #[test]
    fn test_finalize_offload_path_sets_request_bits() {
        let frame = tcp4_frame(1, 2, 3, 4);
        let mut m = Mbuf::from_slice(&frame);
        classify(&mut m);
        m.meta_mut().csum_flags |= CSUM_RECALC_IPV4;
        m.meta_mut().mark_l3_dirty();
        finalize_tx(&mut m, TX_OFFLOAD_IPV4 | TX_OFFLOAD_TCP).unwrap();
        assert_ne!(m.meta().tx_offload & TX_OFFLOAD_IPV4, 0);
        assert_ne!(m.meta().tx_offload & TX_OFFLOAD_TCP, 0);
        assert!(!m.meta().needs_csum());
    }

    proptest::proptest! {
        /// A computed IPv4 header checksum always verifies.
        #[test]
        fn prop_ipv4_header_checksum_verifies(mut hdr in proptest::collection::vec(0u8..=255, 20)) {
            hdr[0] = 0x45;
            hdr[10] = 0;
            hdr[11] = 0;
            let csum = ipv4_header_csum(&hdr);
            hdr[10..12].copy_from_slice(&csum.to_be_bytes());
            proptest::prop_assert!(verify_sum(&hdr, 0));
        }

        /// CRC32c over a split buffer equals the CRC over the whole.
        #[test]
        fn prop_crc32c_streams(data in proptest::collection::vec(0u8..=255, 0..256), split in 0usize..256) {
            let split = split.min(data.len());
            let whole = crc32c(0xffff_ffff, &data);
            let staged = crc32c(crc32c(0xffff_ffff, &data[..split]), &data[split..]);
            proptest::prop_assert_eq!(whole, staged);
        }
    }

    #[test]
    fn test_udp_ipv6_checksum() {
        let mut f = Vec::new();
        f.extend_from_slice(&[0u8; 12]);
        f.extend_from_slice(&crate::headers::ETHERTYPE_IPV6.to_be_bytes());
        f.push(0x60);
        f.extend_from_slice(&[0, 0, 0]);
        f.extend_from_slice(&12u16.to_be_bytes()); // payload: 8 udp + 4 data
        f.push(IPPROTO_UDP);
        f.push(64);
        f.extend_from_slice(&[3u8; 16]);
        f.extend_from_slice(&[4u8; 16]);
        f.extend_from_slice(&53u16.to_be_bytes());
        f.extend_from_slice(&1053u16.to_be_bytes());
        f.extend_from_slice(&12u16.to_be_bytes());
        f.extend_from_slice(&[0, 0]); // checksum
        f.extend_from_slice(&[1, 2, 3, 4]);
        let mut m = Mbuf::from_slice(&f);
        classify(&mut m);
        update_ipv6_checksums(&mut m).unwrap();
        let l3 = m.meta().l3_off.unwrap() as usize;
        let l4 = m.meta().l4_off.unwrap() as usize;
        let pseudo = pseudo_v6_sum(m.data(), l3, 12, IPPROTO_UDP);
        assert!(verify_sum(&m.data()[l4..l4 + 12], pseudo));
    }
}
