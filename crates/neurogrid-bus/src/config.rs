//! Bus pin assignment and timing parameters

/// GPIO pin numbers of the 24 bus lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusPins {
    /// Attention line, asserted low to claim the bus
    pub attn: u8,
    /// Acknowledge line, asserted low by the addressed target
    pub ack: u8,
    /// Clock line, driven by the initiator
    pub clk: u8,
    /// 5-bit address select, LSB first
    pub addr: [u8; 5],
    /// 16-bit data bus, LSB first
    pub data: [u8; 16],
}

impl Default for BusPins {
    fn default() -> Self {
        Self {
            data: [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15],
            addr: [16, 17, 18, 19, 20],
            attn: 21,
            ack: 22,
            clk: 23,
        }
    }
}

/// Timing parameters, written once at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTimings {
    /// Clock-high hold between frames, microseconds
    pub clock_high_us: u64,
    /// Clock-low hold for the target's latch, microseconds
    pub clock_low_us: u64,
    /// Bound on every ACK wait, milliseconds
    pub ack_timeout_ms: u64,
    /// Initial claim backoff, microseconds
    pub backoff_base_us: u64,
    /// Broadcast word hold, milliseconds
    pub broadcast_hold_ms: u64,
    /// Validity window of a recorded ping, milliseconds
    pub ping_response_wait_ms: u64,
    /// Pause between discovery pings to successive nodes, milliseconds
    pub ping_node_delay_ms: u64,
}

impl Default for BusTimings {
    fn default() -> Self {
        Self {
            clock_high_us: 100,
            clock_low_us: 50,
            ack_timeout_ms: 10,
            backoff_base_us: 50,
            broadcast_hold_ms: 10,
            ping_response_wait_ms: 1500,
            ping_node_delay_ms: 10,
        }
    }
}
