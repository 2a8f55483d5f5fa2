//! Spike events and the bounded inbound FIFO
//!
//! The queue is the hand-off point between the interrupt-driven receive
//! path (producer) and the engine step (consumer). Push on a full queue
//! drops the event and counts it; there is no priority and no coalescing.

use heapless::Deque;
use neurogrid_store::GlobalNeuronId;

/// Queue capacity of the full-RAM configuration
pub const SPIKE_QUEUE_CAPACITY: usize = 256;

/// Bytes of one spike event on the wire
pub const SPIKE_WIRE_SIZE: usize = 12;

/// One pending spike, addressed by global neuron ID
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpikeEvent {
    /// Global ID naming the neuron this spike is delivered to
    pub target: GlobalNeuronId,
    /// Time the spike was generated, microseconds
    pub timestamp_us: u32,
    /// Event flags (reserved, zero on the wire)
    pub flags: u8,
    /// Signed contribution to the target's membrane potential
    pub value: f32,
}

impl SpikeEvent {
    /// Create a unit spike
    pub fn new(target: GlobalNeuronId, timestamp_us: u32) -> Self {
        Self::with_value(target, timestamp_us, 1.0)
    }

    /// Create a spike carrying an explicit contribution
    pub fn with_value(target: GlobalNeuronId, timestamp_us: u32, value: f32) -> Self {
        Self {
            target,
            timestamp_us,
            flags: 0,
            value,
        }
    }

    /// Wire body for inter-node forwarding:
    /// `[global_id: u32 LE][timestamp_us: u32 LE][value: f32 LE]`
    pub fn to_wire(&self) -> [u8; SPIKE_WIRE_SIZE] {
        let mut bytes = [0u8; SPIKE_WIRE_SIZE];
        bytes[0..4].copy_from_slice(&self.target.raw().to_le_bytes());
        bytes[4..8].copy_from_slice(&self.timestamp_us.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.value.to_le_bytes());
        bytes
    }

    /// Parse a wire body; `None` if the length is wrong
    pub fn from_wire(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SPIKE_WIRE_SIZE {
            return None;
        }
        Some(Self {
            target: GlobalNeuronId::from_raw(u32::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3],
            ])),
            timestamp_us: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            flags: 0,
            value: f32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }
}

/// Bounded FIFO of pending spikes
///
/// Single-writer, single-reader discipline: the ISR pushes, the
/// foreground engine step pops.
#[derive(Debug, Default)]
pub struct SpikeQueue<const N: usize = SPIKE_QUEUE_CAPACITY> {
    ring: Deque<SpikeEvent, N>,
    drops: u32,
}

impl<const N: usize> SpikeQueue<N> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self {
            ring: Deque::new(),
            drops: 0,
        }
    }

    /// Enqueue a spike; on a full queue the event is returned, dropped,
    /// and counted
    pub fn push(&mut self, event: SpikeEvent) -> core::result::Result<(), SpikeEvent> {
        self.ring.push_back(event).map_err(|event| {
            self.drops += 1;
            event
        })
    }

    /// Dequeue the oldest spike
    pub fn pop(&mut self) -> Option<SpikeEvent> {
        self.ring.pop_front()
    }

    /// Spikes currently queued
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Fixed capacity
    pub fn capacity(&self) -> usize {
        N
    }

    /// Events dropped on full-queue pushes since boot
    pub fn drops(&self) -> u32 {
        self.drops
    }
}
