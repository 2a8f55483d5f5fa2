//! Pin-level framing for the Matrix Bus
//!
//! One targeted message is exactly two 16-bit frames: a header frame
//! (magic in the high byte, sender ID in the low byte) and a payload frame
//! (command high, data low). The initiator claims ATTN, drives the address
//! select, and clocks each frame out with a falling-edge latch; the
//! addressed target holds ACK low for the duration and releases it when
//! the last frame has been taken. Broadcasts elide the handshake entirely:
//! one combined word is held on the bus and latched by every listener on
//! the ATTN rising edge.
//!
//! Every failure path ends in [`BusPhy::release`], so the idle invariant
//! (all 24 lines configured as inputs) is restored within one transaction
//! boundary.

use crate::{
    command::{addr, HEADER_MAGIC},
    config::{BusPins, BusTimings},
    error::{BusError, Result},
    link::{FrameLink, Inbound, Message},
};
use neurogrid_hal::{Gpio, Level, MonotonicClock, PinDir};
use rand::{rngs::SmallRng, Rng, SeedableRng};

/// Claim attempts before surfacing `Busy`
const MAX_CLAIM_ATTEMPTS: u8 = 10;

/// Ceiling on the doubling claim backoff
const BACKOFF_CAP_US: u64 = 10_000;

/// Settle delay between the ATTN edge and the address sample
const RX_SETTLE_US: u64 = 5;

/// Pin-level bus endpoint
pub struct BusPhy<G: Gpio, C: MonotonicClock> {
    gpio: G,
    clock: C,
    pins: BusPins,
    timings: BusTimings,
    node_id: u8,
    rng: SmallRng,
    transaction_active: bool,
    handler_busy: bool,
}

impl<G: Gpio, C: MonotonicClock> BusPhy<G, C> {
    /// Bring the bus interface up in the idle state
    ///
    /// All lines go to input with pulls disabled (the backplane carries
    /// its own), and the ATTN falling-edge interrupt is unmasked. The
    /// backoff jitter generator is seeded from the node ID and boot time.
    pub fn new(mut gpio: G, clock: C, pins: BusPins, timings: BusTimings, node_id: u8) -> Self {
        for pin in Self::all_pins(&pins) {
            gpio.set_dir(pin, PinDir::Input);
            gpio.disable_pulls(pin);
        }
        gpio.enable_falling_interrupt(pins.attn);

        let seed = (node_id as u64).wrapping_mul(1000).wrapping_add(clock.now_us());
        Self {
            gpio,
            clock,
            pins,
            timings,
            node_id,
            rng: SmallRng::seed_from_u64(seed),
            transaction_active: false,
            handler_busy: false,
        }
    }

    fn all_pins(pins: &BusPins) -> impl Iterator<Item = u8> + '_ {
        pins.data
            .iter()
            .chain(pins.addr.iter())
            .copied()
            .chain([pins.attn, pins.ack, pins.clk])
    }

    /// True while the ISR body is running; checked by the re-entry guard
    pub fn handler_busy(&self) -> bool {
        self.handler_busy
    }

    /// True while this node is initiating a transaction
    pub fn transaction_active(&self) -> bool {
        self.transaction_active
    }

    /// Send one targeted message
    pub fn send_message(&mut self, target: u8, command: u8, data: u8) -> Result<()> {
        self.claim()?;
        let result = self.send_frames(target, command, data);
        self.release();
        if let Err(ref err) = result {
            log::debug!("Send to {} failed: {}", target, err);
        }
        result
    }

    /// Send one broadcast word: no ACK, no CLK, no retry
    pub fn send_broadcast(&mut self, command: u8, data: u8) -> Result<()> {
        self.claim()?;
        self.drive_addr(addr::BROADCAST);
        self.drive_data((command as u16) << 8 | data as u16);
        self.clock.delay_us(self.timings.broadcast_hold_ms * 1000);
        self.release();
        Ok(())
    }

    /// ISR body for the ATTN falling edge
    ///
    /// Performs the entire targeted receive or broadcast latch
    /// synchronously and releases ACK before returning, so the caller may
    /// initiate transmissions while dispatching the result. Returns
    /// `Ok(None)` when the frame is not addressed to this node, on
    /// re-entry, or while this node itself holds the bus.
    pub fn on_attn(&mut self) -> Result<Option<Inbound>> {
        if self.handler_busy || self.transaction_active {
            return Ok(None);
        }
        self.handler_busy = true;
        let result = self.receive();
        self.restore_rx_idle();
        self.handler_busy = false;
        result
    }

    fn receive(&mut self) -> Result<Option<Inbound>> {
        self.clock.delay_us(RX_SETTLE_US);
        let target = self.read_addr();
        if target == addr::BROADCAST {
            return self.receive_broadcast().map(Some);
        }
        if target != self.node_id {
            return Ok(None);
        }
        self.receive_targeted().map(Some)
    }

    fn receive_targeted(&mut self) -> Result<Inbound> {
        for &pin in self.pins.data.iter() {
            self.gpio.set_dir(pin, PinDir::Input);
        }
        self.gpio.set_dir(self.pins.ack, PinDir::Output);
        self.gpio.set_level(self.pins.ack, Level::Low);

        let clk_timeout_us = self.timings.ack_timeout_ms * 1000;

        // Frame 1: header, latched on the falling edge
        self.wait_for_level(self.pins.clk, Level::Low, clk_timeout_us)
            .map_err(|waited_us| BusError::ClockTimeout { waited_us })?;
        let header = self.read_data();
        let magic = (header >> 8) as u8;
        if magic != HEADER_MAGIC {
            return Err(BusError::MagicMismatch {
                expected: HEADER_MAGIC,
                found: magic,
            });
        }
        let sender = header as u8;

        // Frame 2 arrives after the clock returns high
        self.wait_for_level(self.pins.clk, Level::High, clk_timeout_us)
            .map_err(|waited_us| BusError::ClockTimeout { waited_us })?;
        self.wait_for_level(self.pins.clk, Level::Low, clk_timeout_us)
            .map_err(|waited_us| BusError::ClockTimeout { waited_us })?;
        let payload = self.read_data();

        Ok(Inbound::Message(Message {
            sender,
            command: (payload >> 8) as u8,
            data: payload as u8,
        }))
    }

    fn receive_broadcast(&mut self) -> Result<Inbound> {
        // Sample while the initiator holds the word; the value at the ATTN
        // rising edge is the latched one
        let timeout_us = self.timings.broadcast_hold_ms * 2 * 1000;
        let start = self.clock.now_us();
        let mut word = self.read_data();
        while self.gpio.get_level(self.pins.attn).is_low() {
            let waited = self.clock.now_us() - start;
            if waited > timeout_us {
                return Err(BusError::Timeout {
                    waited_ms: waited / 1000,
                });
            }
            word = self.read_data();
        }
        Ok(Inbound::Broadcast {
            command: (word >> 8) as u8,
            data: word as u8,
        })
    }

    /// Claim the bus, doubling the jittered backoff on each failure
    fn claim(&mut self) -> Result<()> {
        let mut backoff = self.timings.backoff_base_us;
        for attempt in 0..MAX_CLAIM_ATTEMPTS {
            if self.gpio.get_level(self.pins.attn).is_high() {
                self.gpio.disable_falling_interrupt(self.pins.attn);
                self.transaction_active = true;
                self.gpio.set_dir(self.pins.attn, PinDir::Output);
                self.gpio.set_level(self.pins.attn, Level::Low);
                if attempt > 0 {
                    log::debug!("Bus claimed after {} attempts", attempt + 1);
                }
                return Ok(());
            }
            let jitter = self.rng.gen_range(0..=backoff / 2);
            self.clock.delay_us(backoff + jitter);
            backoff = (backoff * 2).min(BACKOFF_CAP_US);
        }
        Err(BusError::Busy {
            attempts: MAX_CLAIM_ATTEMPTS,
        })
    }

    fn send_frames(&mut self, target: u8, command: u8, data: u8) -> Result<()> {
        self.gpio.set_dir(self.pins.clk, PinDir::Output);
        self.gpio.set_level(self.pins.clk, Level::High);
        self.drive_addr(target);

        let header = (HEADER_MAGIC as u16) << 8 | self.node_id as u16;
        let payload = (command as u16) << 8 | data as u16;
        self.send_frame(header, false)?;
        self.send_frame(payload, true)?;

        // CLK stays low until the target signals completion
        self.wait_for_level(self.pins.ack, Level::High, self.timings.ack_timeout_ms * 1000)
            .map_err(|waited_us| BusError::AckTimeout { waited_us })
    }

    fn send_frame(&mut self, word: u16, last: bool) -> Result<()> {
        self.drive_data(word);
        self.wait_for_level(self.pins.ack, Level::Low, self.timings.ack_timeout_ms * 1000)
            .map_err(|waited_us| BusError::AckTimeout { waited_us })?;

        // Target latches on this falling edge
        self.gpio.set_level(self.pins.clk, Level::Low);
        self.clock.delay_us(self.timings.clock_low_us);
        if !last {
            self.gpio.set_level(self.pins.clk, Level::High);
            self.clock.delay_us(self.timings.clock_high_us);
        }
        Ok(())
    }

    /// Return every line to input and unmask the ATTN interrupt
    fn release(&mut self) {
        // ATTN first: listeners latch broadcasts on its rising edge while
        // the remaining lines are still driven
        self.gpio.set_dir(self.pins.attn, PinDir::Input);
        self.gpio.set_dir(self.pins.clk, PinDir::Input);
        for &pin in self.pins.addr.iter() {
            self.gpio.set_dir(pin, PinDir::Input);
        }
        for &pin in self.pins.data.iter() {
            self.gpio.set_dir(pin, PinDir::Input);
        }
        self.transaction_active = false;
        self.gpio.enable_falling_interrupt(self.pins.attn);
    }

    /// Drop the lines a receive may have driven
    fn restore_rx_idle(&mut self) {
        self.gpio.set_dir(self.pins.ack, PinDir::Input);
    }

    fn wait_for_level(
        &self,
        pin: u8,
        level: Level,
        timeout_us: u64,
    ) -> core::result::Result<(), u64> {
        let start = self.clock.now_us();
        loop {
            if self.gpio.get_level(pin) == level {
                return Ok(());
            }
            let waited = self.clock.now_us().saturating_sub(start);
            if waited > timeout_us {
                return Err(waited);
            }
            core::hint::spin_loop();
        }
    }

    fn drive_addr(&mut self, value: u8) {
        for (bit, &pin) in self.pins.addr.iter().enumerate() {
            self.gpio.set_dir(pin, PinDir::Output);
            self.gpio.set_level(pin, Level::from_bit(value >> bit & 1 != 0));
        }
    }

    fn read_addr(&self) -> u8 {
        self.pins
            .addr
            .iter()
            .enumerate()
            .fold(0u8, |acc, (bit, &pin)| {
                acc | (self.gpio.get_level(pin).is_high() as u8) << bit
            })
    }

    fn drive_data(&mut self, word: u16) {
        for (bit, &pin) in self.pins.data.iter().enumerate() {
            self.gpio.set_dir(pin, PinDir::Output);
            self.gpio.set_level(pin, Level::from_bit(word >> bit & 1 != 0));
        }
    }

    fn read_data(&self) -> u16 {
        self.pins
            .data
            .iter()
            .enumerate()
            .fold(0u16, |acc, (bit, &pin)| {
                acc | (self.gpio.get_level(pin).is_high() as u16) << bit
            })
    }
}

impl<G: Gpio, C: MonotonicClock> FrameLink for BusPhy<G, C> {
    fn node_id(&self) -> u8 {
        self.node_id
    }

    fn send(&mut self, target: u8, command: u8, data: u8) -> Result<()> {
        self.send_message(target, command, data)
    }

    fn broadcast(&mut self, command: u8, data: u8) -> Result<()> {
        self.send_broadcast(command, data)
    }
}
