//! Error types for the protocol subsystem.

use thiserror::Error;

/// Result type alias for protocol operations.
pub type OfprotoResult<T> = Result<T, OfprotoError>;

/// Error variants for flowtable, group and switch-model operations.
#[derive(Debug, Error)]
pub enum OfprotoError {
    /// The table id is outside the pipeline's range.
    #[error("Table {0} out of range")]
    TableOutOfRange(u8),

    /// No flow entry with the given match and priority exists.
    #[error("Flow entry not found in table {table_id}")]
    FlowNotFound {
        /// Table searched.
        table_id: u8,
    },

    /// The group id is already present.
    #[error("Group {0} already exists")]
    GroupExists(u32),

    /// The group id is not present.
    #[error("Group {0} not found")]
    GroupNotFound(u32),

    /// An OpenFlow port number is not attached to the bridge.
    #[error("Port {0} not attached to bridge")]
    PortNotFound(u32),

    /// The OpenFlow port number is already taken on the bridge.
    #[error("Port number {0} already in use on bridge")]
    PortNumberTaken(u32),

    /// Driver-level failure.
    #[error(transparent)]
    Driver(#[from] ofswitch_driver::DriverError),

    /// QoS-level failure.
    #[error(transparent)]
    Qos(#[from] ofswitch_qos::QosError),

    /// Packet-level failure.
    #[error(transparent)]
    Packet(#[from] ofswitch_packet::PacketError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            format!("{}", OfprotoError::GroupNotFound(7)),
            "Group 7 not found"
        );
        assert_eq!(
            format!("{}", OfprotoError::TableOutOfRange(99)),
            "Table 99 out of range"
        );
    }
}
