//! Frame-level seam between the PHY and the protocol layers

use crate::error::Result;

/// One decoded targeted message: two frames on the wire, header then payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message {
    /// Node ID carried in the header frame
    pub sender: u8,
    /// Command byte (high byte of the payload frame)
    pub command: u8,
    /// Data byte (low byte of the payload frame)
    pub data: u8,
}

/// What the receive path latched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Targeted two-frame message, acknowledged at the PHY
    Message(Message),
    /// Broadcast word, latched without handshake
    Broadcast {
        /// Command byte
        command: u8,
        /// Data byte
        data: u8,
    },
}

/// One-message transmission service
///
/// [`crate::phy::BusPhy`] implements this at pin level; host tests wire
/// protocol stacks together with an in-memory loopback implementation.
pub trait FrameLink {
    /// This node's bus address
    fn node_id(&self) -> u8;

    /// Send one targeted message
    fn send(&mut self, target: u8, command: u8, data: u8) -> Result<()>;

    /// Send one broadcast word
    fn broadcast(&mut self, command: u8, data: u8) -> Result<()>;

    /// Drain one inbound message queued outside the interrupt path
    ///
    /// The pin-level link always returns `None`: inbound traffic arrives
    /// through the ATTN interrupt. Loopback links queue peer responses
    /// here so that foreground poll loops can dispatch them.
    fn poll_inbound(&mut self) -> Option<Message> {
        None
    }
}
