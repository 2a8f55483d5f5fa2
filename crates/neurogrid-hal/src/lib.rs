//! Hardware abstraction seams for NeuroGrid nodes
//!
//! The protocol engine, neuron store, and execution engine are written
//! against the three traits in this crate: a flat byte-addressed PSRAM
//! driver, a per-pin GPIO controller, and a monotonic microsecond clock.
//! Board bring-up supplies the real implementations; the host-side doubles
//! (`MemoryPsram`, `SimClock`) back the test suites.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod error;
pub mod gpio;
pub mod psram;

pub use clock::{MonotonicClock, SimClock};
pub use error::{HalError, Result};
pub use gpio::{Gpio, Level, PinDir};
pub use psram::{MemoryPsram, PsramDriver, PSRAM_SIZE};
