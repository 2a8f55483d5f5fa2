//! Error types for the neuron storage layer

use thiserror::Error;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in the neuron store and cache
#[derive(Error, Debug)]
pub enum StoreError {
    /// Neuron index outside the table
    #[error("Neuron {index} out of range (max: {max})")]
    OutOfRange {
        /// Index that was out of range
        index: u16,
        /// Highest valid index
        max: u16,
    },

    /// Record bytes violate the persistent layout
    #[error("Invalid neuron record: {reason}")]
    InvalidRecord {
        /// Reason the record was rejected
        reason: String,
    },

    /// Synapse list exceeds the record's fixed capacity
    #[error("Synapse count {count} exceeds capacity {max}")]
    SynapseOverflow {
        /// Count found in the record
        count: u16,
        /// Fixed per-record capacity
        max: u16,
    },

    /// Table descriptor does not fit the device
    #[error("Table of {neurons} records at {base:#010x} exceeds PSRAM size {size:#010x}")]
    TableOverflow {
        /// Table base address
        base: u32,
        /// Requested capacity in records
        neurons: u16,
        /// Device size in bytes
        size: u32,
    },

    /// Underlying PSRAM driver failure
    #[error("PSRAM error: {source}")]
    Hal {
        #[from]
        /// Source driver error
        source: neurogrid_hal::HalError,
    },
}

impl StoreError {
    /// Create an out-of-range error
    pub fn out_of_range(index: u16, max: u16) -> Self {
        Self::OutOfRange { index, max }
    }

    /// Create an invalid record error
    pub fn invalid_record(reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StoreError::out_of_range(1024, 1023);
        assert!(format!("{}", err).contains("1024"));

        let err = StoreError::invalid_record("threshold below zero");
        assert!(format!("{}", err).contains("threshold below zero"));
    }
}
