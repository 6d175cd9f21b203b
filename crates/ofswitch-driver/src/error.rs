//! Error types for the driver subsystem.

use thiserror::Error;

use crate::PortId;

/// Result type alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Error variants for driver operations.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An OS call failed; carries the call name and errno.
    #[error("{call} failed on {device}: errno {errno}")]
    Syscall {
        /// The failing call.
        call: &'static str,
        /// The device involved.
        device: String,
        /// The errno value.
        errno: i32,
    },

    /// The port id is not registered with this driver.
    #[error("Port {0} not found")]
    PortNotFound(PortId),

    /// The named device does not exist or cannot be used.
    #[error("Invalid device {device}: {reason}")]
    InvalidDevice {
        /// The device name.
        device: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Every port slot is taken.
    #[error("No free port slots")]
    NoFreePorts,

    /// The backend does not implement the requested operation.
    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    /// The MTU is outside the device's accepted range.
    #[error("MTU {mtu} out of range [{min}, {max}]")]
    MtuOutOfRange {
        /// Requested MTU.
        mtu: u32,
        /// Smallest accepted value.
        min: u32,
        /// Largest accepted value.
        max: u32,
    },
}

impl DriverError {
    /// Captures the current errno for a failed `call` on `device`.
    pub fn last_os(call: &'static str, device: &str) -> Self {
        DriverError::Syscall {
            call,
            device: device.to_string(),
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}
