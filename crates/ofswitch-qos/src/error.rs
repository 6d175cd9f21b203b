//! Error types for the QoS subsystem.

use thiserror::Error;

/// Result type alias for QoS operations.
pub type QosResult<T> = Result<T, QosError>;

/// Error variants for marker, meter, policer and scheduler operations.
#[derive(Debug, Error)]
pub enum QosError {
    /// A rate parameter was zero or otherwise unusable.
    #[error("Invalid rate: {reason}")]
    InvalidRate {
        /// What was wrong with the parameters.
        reason: String,
    },

    /// A meter id is already present in the table.
    #[error("Meter {meter_id} already exists")]
    MeterExists {
        /// The colliding meter id.
        meter_id: u32,
    },

    /// The meter id is not present in the table.
    #[error("Meter {meter_id} not found")]
    MeterNotFound {
        /// The missing meter id.
        meter_id: u32,
    },

    /// A meter carried more bands than the implementation supports.
    #[error("Too many bands: {count} exceeds the {max} band limit")]
    TooManyBands {
        /// Bands requested.
        count: usize,
        /// Supported maximum.
        max: usize,
    },

    /// The referenced queue id is not attached to the port.
    #[error("Queue {queue_id} not found on port")]
    QueueNotFound {
        /// The missing queue id.
        queue_id: u32,
    },

    /// A queue id is already attached to the port.
    #[error("Queue {queue_id} already attached")]
    QueueExists {
        /// The colliding queue id.
        queue_id: u32,
    },
}
