//! Error types for the packet subsystem.

use thiserror::Error;

/// Result type alias for packet operations.
pub type PacketResult<T> = Result<T, PacketError>;

/// Error variants for packet buffer and parsing operations.
#[derive(Debug, Error)]
pub enum PacketError {
    /// Not enough headroom left for a prepend operation.
    #[error("No headroom: need {needed} bytes, have {available}")]
    NoHeadroom {
        /// Bytes the prepend needed.
        needed: usize,
        /// Bytes of headroom left.
        available: usize,
    },

    /// Not enough tailroom left for an append operation.
    #[error("No tailroom: need {needed} bytes, have {available}")]
    NoTailroom {
        /// Bytes the append needed.
        needed: usize,
        /// Bytes of tailroom left.
        available: usize,
    },

    /// Attempted to remove more bytes than the packet holds.
    #[error("Truncated packet: tried to remove {requested} of {length} bytes")]
    Truncated {
        /// Bytes requested for removal.
        requested: usize,
        /// Current packet length.
        length: usize,
    },

    /// The buffer pool has no free buffers.
    #[error("Buffer pool exhausted")]
    PoolExhausted,

    /// The packet is too short to contain the expected header.
    #[error("Short packet: {context} needs {needed} bytes, have {available}")]
    ShortPacket {
        /// Which header was being parsed.
        context: &'static str,
        /// Bytes the header needs.
        needed: usize,
        /// Bytes remaining in the packet.
        available: usize,
    },

    /// Checksum recomputation was requested for a packet without the
    /// required parsed header.
    #[error("Missing parsed header for checksum: {0}")]
    MissingHeader(&'static str),
}
