//! Matrix Bus protocol engine
//!
//! The cluster backplane is a multi-master parallel bus: a 5-bit address
//! select, a 16-bit data bus, and three control lines (ATTN/ACK/CLK), all
//! bidirectional and idle-high. This crate implements the full protocol
//! stack over the GPIO seam:
//!
//! - [`phy`]: pin-level single-frame send/receive, broadcast, and the
//!   claim/backoff collision avoidance
//! - [`engine`]: targeted writes, pings with a matching history, and
//!   topology discovery
//! - [`multiframe`]: the length/sequence/checksum transport for payloads
//!   larger than one word
//!
//! Layering is by trait: everything above the PHY is generic over
//! [`FrameLink`], so protocol logic runs unchanged against the pin driver
//! or a host-side loopback.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod link;
pub mod multiframe;
pub mod phy;

pub use command::{addr, cmd, HEADER_MAGIC, PING_PAYLOAD};
pub use config::{BusPins, BusTimings};
pub use engine::{MatrixBus, PingDisposition, PingTracker, PING_HISTORY_CAPACITY};
pub use error::{BusError, Result};
pub use link::{FrameLink, Inbound, Message};
pub use multiframe::{
    send_payload, xor_checksum, CompletedTransfer, MultiFrameRx, RxOutcome,
    MULTIFRAME_BUFFER_SIZE, MULTIFRAME_TIMEOUT_MS,
};
pub use phy::BusPhy;
