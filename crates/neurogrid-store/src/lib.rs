//! PSRAM-backed neuron storage for NeuroGrid nodes
//!
//! A node streams its Leaky-Integrate-and-Fire network out of external
//! PSRAM: the persistent table holds bit-exact 256-byte neuron records, and
//! a small write-back LRU cache keeps the working set resident on chip.
//! This crate owns the record layout, the packed synapse encoding, the
//! table bookkeeping, and the cache.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod error;
pub mod neuron;
pub mod store;

pub use cache::{CacheStats, NeuronCache, CACHE_CAPACITY};
pub use error::{Result, StoreError};
pub use neuron::{
    decode_weight, encode_weight, flags, GlobalNeuronId, Neuron, Synapse,
    MAX_SYNAPSES_PER_NEURON, NEURON_RECORD_SIZE, TABLE_END_ID,
};
pub use store::{NeuronStore, TableInfo, MAX_NEURONS_PER_NODE};
