//! Error types for the bus protocol stack

use thiserror::Error;

/// Result type for bus operations
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur on the Matrix Bus
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Could not claim the bus within the backoff budget
    #[error("Bus busy: claim failed after {attempts} attempts")]
    Busy {
        /// Claim attempts made before giving up
        attempts: u8,
    },

    /// Target never asserted or never released ACK
    #[error("ACK timeout after {waited_us}us")]
    AckTimeout {
        /// Time spent waiting
        waited_us: u64,
    },

    /// Expected clock edge never arrived
    #[error("Clock timeout after {waited_us}us")]
    ClockTimeout {
        /// Time spent waiting
        waited_us: u64,
    },

    /// Header frame did not carry the magic byte
    #[error("Frame magic mismatch: expected {expected:#04x}, found {found:#04x}")]
    MagicMismatch {
        /// Required magic byte
        expected: u8,
        /// Byte found in the header frame
        found: u8,
    },

    /// Payload exceeds what the transport can carry
    #[error("Payload of {len} bytes exceeds limit {max}")]
    PayloadTooLarge {
        /// Offered payload length
        len: usize,
        /// Transport limit
        max: usize,
    },

    /// Multi-frame sequence, length, or checksum violation
    #[error("Protocol error: {reason}")]
    Protocol {
        /// What the receive state machine rejected
        reason: String,
    },

    /// A bounded wait elapsed without the expected event
    #[error("Timed out after {waited_ms}ms")]
    Timeout {
        /// Time spent waiting
        waited_ms: u64,
    },
}

impl BusError {
    /// Create a protocol error
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }
}
