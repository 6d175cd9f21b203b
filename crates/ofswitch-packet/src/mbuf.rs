//! Packet buffer (mbuf).
//!
//! An mbuf owns one contiguous buffer with a headroom region for prepend
//! operations, the packet payload, and a typed metadata block. Ownership
//! is linear: an mbuf moves across rings, the producer losing it when the
//! enqueue returns and the consumer gaining it at dequeue. Dropping the
//! mbuf returns the buffer to its pool.

use bytes::BytesMut;

use crate::error::{PacketError, PacketResult};
use crate::meta::PktMeta;
use crate::pool::Recycler;
use crate::{MAX_PACKET_SZ, MIN_FRAME_SZ, PKT_HEADROOM};

/// Total capacity of one mbuf buffer.
pub const MBUF_CAPACITY: usize = PKT_HEADROOM + MAX_PACKET_SZ;

/// A packet buffer with headroom, payload, and pipeline metadata.
pub struct Mbuf {
    buf: BytesMut,
    head: usize,
    len: usize,
    meta: PktMeta,
    recycle: Option<Recycler>,
}

impl std::fmt::Debug for Mbuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mbuf")
            .field("head", &self.head)
            .field("len", &self.len)
            .field("in_port", &self.meta.in_port)
            .field("pooled", &self.recycle.is_some())
            .finish()
    }
}

impl Mbuf {
    pub(crate) fn from_pool(buf: BytesMut, recycle: Recycler) -> Self {
        debug_assert!(buf.len() >= MBUF_CAPACITY);
        Self {
            buf,
            head: PKT_HEADROOM,
            len: 0,
            meta: PktMeta::default(),
            recycle: Some(recycle),
        }
    }

    /// Creates a standalone mbuf holding a copy of `payload`.
    ///
    /// Standalone mbufs do not belong to a pool; their buffer is freed by
    /// the allocator on drop. Used by tests and by packet-out injection.
    pub fn from_slice(payload: &[u8]) -> Self {
        let mut buf = BytesMut::zeroed(MBUF_CAPACITY);
        let len = payload.len().min(MAX_PACKET_SZ);
        buf[PKT_HEADROOM..PKT_HEADROOM + len].copy_from_slice(&payload[..len]);
        Self {
            buf,
            head: PKT_HEADROOM,
            len,
            meta: PktMeta::default(),
            recycle: None,
        }
    }

    /// Packet length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the packet holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes available in front of the packet data.
    #[inline]
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Bytes available after the packet data.
    #[inline]
    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.head - self.len
    }

    /// Packet data.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf[self.head..self.head + self.len]
    }

    /// Mutable packet data.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..self.head + self.len]
    }

    /// Pipeline metadata.
    #[inline]
    pub fn meta(&self) -> &PktMeta {
        &self.meta
    }

    /// Mutable pipeline metadata.
    #[inline]
    pub fn meta_mut(&mut self) -> &mut PktMeta {
        &mut self.meta
    }

    /// Grows the packet at the front by `n` bytes and returns the new
    /// region, for VLAN/MPLS/PBB push.
    pub fn prepend(&mut self, n: usize) -> PacketResult<&mut [u8]> {
        if n > self.head {
            return Err(PacketError::NoHeadroom {
                needed: n,
                available: self.head,
            });
        }
        self.head -= n;
        self.len += n;
        Ok(&mut self.buf[self.head..self.head + n])
    }

    /// Grows the packet at the tail by `n` bytes and returns the new
    /// region.
    pub fn append(&mut self, n: usize) -> PacketResult<&mut [u8]> {
        let tail = self.tailroom();
        if n > tail {
            return Err(PacketError::NoTailroom {
                needed: n,
                available: tail,
            });
        }
        let start = self.head + self.len;
        self.len += n;
        Ok(&mut self.buf[start..start + n])
    }

    /// Removes `n` bytes from the front, for VLAN/MPLS pop.
    pub fn adj(&mut self, n: usize) -> PacketResult<()> {
        if n > self.len {
            return Err(PacketError::Truncated {
                requested: n,
                length: self.len,
            });
        }
        self.head += n;
        self.len -= n;
        Ok(())
    }

    /// Removes `n` bytes from the tail.
    pub fn trim(&mut self, n: usize) -> PacketResult<()> {
        if n > self.len {
            return Err(PacketError::Truncated {
                requested: n,
                length: self.len,
            });
        }
        self.len -= n;
        Ok(())
    }

    /// Zero-pads the packet up to the minimum Ethernet frame size.
    /// No-op for frames already at or above 60 bytes.
    pub fn pad_to_min(&mut self) -> PacketResult<()> {
        if self.len >= MIN_FRAME_SZ {
            return Ok(());
        }
        let missing = MIN_FRAME_SZ - self.len;
        let region = self.append(missing)?;
        region.fill(0);
        Ok(())
    }

    /// Replaces the payload, resetting the headroom to its initial size.
    pub fn set_data(&mut self, payload: &[u8]) -> PacketResult<()> {
        if payload.len() > self.buf.len() - PKT_HEADROOM {
            return Err(PacketError::NoTailroom {
                needed: payload.len(),
                available: self.buf.len() - PKT_HEADROOM,
            });
        }
        self.head = PKT_HEADROOM;
        self.len = payload.len();
        self.buf[self.head..self.head + self.len].copy_from_slice(payload);
        Ok(())
    }

    /// Copies this packet (data and metadata) into a fresh standalone
    /// mbuf. Multicast output and packet-in both hand independent copies
    /// downstream so no two threads ever share a mutable buffer.
    pub fn copy(&self) -> Mbuf {
        let mut m = Mbuf::from_slice(self.data());
        m.meta = self.meta.clone();
        m
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        if let Some(recycle) = self.recycle.take() {
            recycle.give_back(std::mem::take(&mut self.buf));
        }
    }
}
