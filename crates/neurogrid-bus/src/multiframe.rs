//! Multi-frame transport for payloads larger than one word
//!
//! Four command codes carry the protocol: `FRAME_START` (user command in
//! the data byte), a raw 16-bit length word, then for every two payload
//! bytes a `FRAME_DATA` marker with the sequence number followed by a raw
//! data word, and finally `FRAME_END` with an XOR checksum. The length and
//! data words travel as ordinary two-frame messages whose payload word is
//! reinterpreted as raw bytes.
//!
//! The transport is at-most-once: any sequence, length, or checksum
//! violation drops the transfer and returns the receiver to idle. The
//! sender learns of loss only by absence of an application-level reply.

use crate::{
    command::cmd,
    error::{BusError, Result},
    link::{FrameLink, Message},
};
use heapless::Vec;

/// Reassembly buffer size; transfers longer than this are rejected
pub const MULTIFRAME_BUFFER_SIZE: usize = 2048;

/// Per-transfer staleness bound
pub const MULTIFRAME_TIMEOUT_MS: u64 = 2000;

/// XOR checksum over a payload
pub fn xor_checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0, |acc, b| acc ^ b)
}

/// Send `payload` to `target` under `user_command`
pub fn send_payload<L: FrameLink>(
    link: &mut L,
    target: u8,
    user_command: u8,
    payload: &[u8],
) -> Result<()> {
    if payload.len() > u16::MAX as usize {
        return Err(BusError::PayloadTooLarge {
            len: payload.len(),
            max: u16::MAX as usize,
        });
    }

    link.send(target, cmd::FRAME_START, user_command)?;

    let len = payload.len() as u16;
    link.send(target, (len >> 8) as u8, len as u8)?;

    let mut seq: u8 = 0;
    for pair in payload.chunks(2) {
        link.send(target, cmd::FRAME_DATA, seq)?;
        let hi = pair[0];
        let lo = pair.get(1).copied().unwrap_or(0);
        link.send(target, hi, lo)?;
        seq = seq.wrapping_add(1);
    }

    link.send(target, cmd::FRAME_END, xor_checksum(payload))?;
    log::debug!(
        "Sent {}-byte transfer to {} (command {:#04x})",
        payload.len(),
        target,
        user_command
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    ExpectLength,
    ExpectDataMarker,
    ExpectDataWord,
}

/// Outcome of feeding one inbound message to the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxOutcome {
    /// Not transport traffic; dispatch the message normally
    NotMine,
    /// Consumed by an in-progress transfer
    Consumed,
    /// A transfer finished; read it via [`MultiFrameRx::payload`]
    Complete(CompletedTransfer),
}

/// Identity of a finished transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedTransfer {
    /// Node that sent the transfer
    pub source: u8,
    /// User command from the `FRAME_START` frame
    pub command: u8,
    /// Payload length in bytes
    pub len: usize,
}

/// Receive state machine, one per node
///
/// The in-flight window is 1: a single transfer is reassembled at a time,
/// and frames from other senders pass through while one is in progress.
#[derive(Debug, Default)]
pub struct MultiFrameRx {
    state: RxState,
    source: u8,
    command: u8,
    expected_len: usize,
    seq: u8,
    buf: Vec<u8, MULTIFRAME_BUFFER_SIZE>,
    started_at_us: u64,
}

impl Default for RxState {
    fn default() -> Self {
        RxState::Idle
    }
}

impl MultiFrameRx {
    /// Create an idle receiver
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no transfer is in progress
    pub fn is_idle(&self) -> bool {
        self.state == RxState::Idle
    }

    /// Payload of the last completed transfer
    ///
    /// Valid from a `Complete` outcome until the next `FRAME_START`.
    pub fn payload(&self) -> &[u8] {
        &self.buf
    }

    /// Drop the transfer if it has been sitting longer than the bound
    pub fn check_timeout(&mut self, now_us: u64) -> bool {
        if self.state != RxState::Idle
            && now_us.saturating_sub(self.started_at_us) > MULTIFRAME_TIMEOUT_MS * 1000
        {
            log::warn!(
                "Transfer from {} stalled; dropping {} of {} bytes",
                self.source,
                self.buf.len(),
                self.expected_len
            );
            self.reset();
            return true;
        }
        false
    }

    fn reset(&mut self) {
        self.state = RxState::Idle;
        self.buf.clear();
    }

    fn fail(&mut self, reason: String) -> BusError {
        self.reset();
        BusError::Protocol { reason }
    }

    /// Feed one inbound message through the state machine
    pub fn on_message(&mut self, msg: &Message, now_us: u64) -> Result<RxOutcome> {
        self.check_timeout(now_us);

        if self.state != RxState::Idle && msg.sender != self.source {
            // Window is 1: a second initiator cannot interleave a transfer
            if matches!(msg.command, cmd::FRAME_START | cmd::FRAME_DATA | cmd::FRAME_END) {
                log::warn!(
                    "Dropping frame from {} during transfer from {}",
                    msg.sender,
                    self.source
                );
                return Ok(RxOutcome::Consumed);
            }
            return Ok(RxOutcome::NotMine);
        }

        match self.state {
            RxState::Idle => match msg.command {
                cmd::FRAME_START => {
                    self.source = msg.sender;
                    self.command = msg.data;
                    self.expected_len = 0;
                    self.seq = 0;
                    self.buf.clear();
                    self.started_at_us = now_us;
                    self.state = RxState::ExpectLength;
                    Ok(RxOutcome::Consumed)
                }
                cmd::FRAME_DATA | cmd::FRAME_END => Err(self.fail(format!(
                    "stray frame command {:#04x} with no transfer in progress",
                    msg.command
                ))),
                _ => Ok(RxOutcome::NotMine),
            },

            RxState::ExpectLength => {
                let len = (msg.command as usize) << 8 | msg.data as usize;
                if len > MULTIFRAME_BUFFER_SIZE {
                    return Err(self.fail(format!(
                        "transfer length {} exceeds buffer size {}",
                        len, MULTIFRAME_BUFFER_SIZE
                    )));
                }
                self.expected_len = len;
                self.state = RxState::ExpectDataMarker;
                Ok(RxOutcome::Consumed)
            }

            RxState::ExpectDataMarker => match msg.command {
                cmd::FRAME_DATA => {
                    if msg.data != self.seq {
                        return Err(self.fail(format!(
                            "sequence gap: expected {}, got {}",
                            self.seq, msg.data
                        )));
                    }
                    self.state = RxState::ExpectDataWord;
                    Ok(RxOutcome::Consumed)
                }
                cmd::FRAME_END => {
                    if self.buf.len() != self.expected_len {
                        return Err(self.fail(format!(
                            "finalized at {} of {} bytes",
                            self.buf.len(),
                            self.expected_len
                        )));
                    }
                    let checksum = xor_checksum(&self.buf);
                    if msg.data != checksum {
                        return Err(self.fail(format!(
                            "checksum mismatch: expected {:#04x}, computed {:#04x}",
                            msg.data, checksum
                        )));
                    }
                    let done = CompletedTransfer {
                        source: self.source,
                        command: self.command,
                        len: self.buf.len(),
                    };
                    self.state = RxState::Idle;
                    log::debug!(
                        "Transfer complete: {} bytes from {} (command {:#04x})",
                        done.len,
                        done.source,
                        done.command
                    );
                    Ok(RxOutcome::Complete(done))
                }
                other => Err(self.fail(format!(
                    "unexpected command {:#04x} mid-transfer",
                    other
                ))),
            },

            RxState::ExpectDataWord => {
                let remaining = self.expected_len - self.buf.len();
                if remaining >= 1 {
                    let _ = self.buf.push(msg.command);
                }
                if remaining >= 2 {
                    let _ = self.buf.push(msg.data);
                }
                self.seq = self.seq.wrapping_add(1);
                self.state = RxState::ExpectDataMarker;
                Ok(RxOutcome::Consumed)
            }
        }
    }
}
