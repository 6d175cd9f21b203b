//! Error types for the dataplane runtime.

use thiserror::Error;

/// Result type alias for dataplane operations.
pub type DataplaneResult<T> = Result<T, DataplaneError>;

/// Error variants for ring and runtime construction.
#[derive(Debug, Error)]
pub enum DataplaneError {
    /// Ring capacities must be powers of two.
    #[error("Ring size {0} is not a power of two")]
    BadRingSize(usize),

    /// The lcore set contains no usable role for the work requested.
    #[error("Invalid lcore layout: {reason}")]
    BadLayout {
        /// What was wrong.
        reason: String,
    },

    /// Thread spawn failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The runtime is already stopped.
    #[error("Runtime already stopped")]
    AlreadyStopped,
}
