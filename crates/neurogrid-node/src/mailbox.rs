//! One-slot deferred-response mailbox
//!
//! The ISR must never initiate a bus transaction, so any inbound command
//! that requires a reply (ping, status request) parks its response here
//! and the foreground main loop sends it. The slot holds at most one
//! outstanding response; release/acquire ordering makes the ISR's stores
//! visible to the foreground reader.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Single-entry response mailbox shared between ISR and foreground
#[derive(Debug, Default)]
pub struct ResponseSlot {
    pending: AtomicBool,
    packed: AtomicU32,
}

impl ResponseSlot {
    /// Create an empty slot
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            packed: AtomicU32::new(0),
        }
    }

    /// ISR side: park a response if the slot is free
    ///
    /// Returns false when a response is already outstanding; the caller
    /// drops the new one.
    pub fn post(&self, target: u8, command: u8, data: u8) -> bool {
        if self.pending.load(Ordering::Acquire) {
            return false;
        }
        let packed = (target as u32) << 16 | (command as u32) << 8 | data as u32;
        self.packed.store(packed, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
        true
    }

    /// Foreground side: take the outstanding response, freeing the slot
    pub fn take(&self) -> Option<(u8, u8, u8)> {
        if !self.pending.load(Ordering::Acquire) {
            return None;
        }
        let packed = self.packed.load(Ordering::Relaxed);
        self.pending.store(false, Ordering::Release);
        Some(((packed >> 16) as u8, (packed >> 8) as u8, packed as u8))
    }

    /// Whether a response is waiting to be sent
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}
