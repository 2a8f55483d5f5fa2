//! Error types for the hardware abstraction layer

use thiserror::Error;

/// Result type for HAL operations
pub type Result<T> = core::result::Result<T, HalError>;

/// Errors surfaced by hardware drivers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HalError {
    /// Access outside the device address space
    #[error("Address range {addr:#010x}+{len} exceeds device size {size:#010x}")]
    OutOfRange {
        /// Start address of the rejected access
        addr: u32,
        /// Length of the rejected access
        len: usize,
        /// Device size in bytes
        size: u32,
    },

    /// The device failed to complete the operation
    #[error("Hardware fault: {reason}")]
    HardwareFault {
        /// Driver-reported reason
        reason: String,
    },
}

impl HalError {
    /// Create an out-of-range error
    pub fn out_of_range(addr: u32, len: usize, size: u32) -> Self {
        Self::OutOfRange { addr, len, size }
    }

    /// Create a hardware fault error
    pub fn hardware_fault(reason: impl Into<String>) -> Self {
        Self::HardwareFault {
            reason: reason.into(),
        }
    }
}
