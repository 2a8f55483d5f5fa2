//! NeuroGrid node firmware core
//!
//! Ties the protocol engine, the neuron store, and the LIF execution
//! engine together into one owned root object per device ([`Node`]), plus
//! the controller-side orchestration ([`Controller`]) that discovers
//! nodes, deploys neuron tables, and drives start/stop.
//!
//! Concurrency model: a single cooperative foreground task (the main loop
//! calling [`Node::service`]) and one interrupt handler bound to the ATTN
//! falling edge. The spike FIFO and the one-slot response mailbox are the
//! only objects shared between the two contexts.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod controller;
pub mod engine;
pub mod error;
pub mod mailbox;
pub mod node;
pub mod spike;

pub use controller::Controller;
pub use engine::{EngineState, EngineStats, LifEngine, FLUSH_INTERVAL_STEPS};
pub use error::{NodeError, Result};
pub use mailbox::ResponseSlot;
pub use node::{LedChannel, Node, NullPeripherals, Peripherals, STAGING_ADDR, TABLE_BASE_ADDR};
pub use spike::{SpikeEvent, SpikeQueue, SPIKE_QUEUE_CAPACITY, SPIKE_WIRE_SIZE};
