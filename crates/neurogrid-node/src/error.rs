//! Error types for the node core

use neurogrid_bus::BusError;
use neurogrid_store::StoreError;
use thiserror::Error;

/// Result type for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors that can occur in the execution engine and dispatcher
#[derive(Error, Debug)]
pub enum NodeError {
    /// Neuron storage failure
    #[error("Store error: {source}")]
    Store {
        #[from]
        /// Source storage error
        source: StoreError,
    },

    /// Bus protocol failure
    #[error("Bus error: {source}")]
    Bus {
        #[from]
        /// Source bus error
        source: BusError,
    },

    /// Local neuron ID outside the loaded table
    #[error("Neuron {id} out of range (loaded: {count})")]
    NeuronOutOfRange {
        /// Requested local ID
        id: u16,
        /// Neurons currently loaded
        count: u16,
    },

    /// Operation not legal in the engine's current state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        /// Operation that was attempted
        operation: &'static str,
        /// State the engine was in
        state: &'static str,
    },

    /// Command code the dispatcher does not recognize
    #[error("Unknown command {code:#04x} from node {sender}")]
    UnknownCommand {
        /// Rejected command code
        code: u8,
        /// Sender's node ID
        sender: u8,
    },
}

impl NodeError {
    /// Create an invalid state error
    pub fn invalid_state(operation: &'static str, state: &'static str) -> Self {
        Self::InvalidState { operation, state }
    }
}
