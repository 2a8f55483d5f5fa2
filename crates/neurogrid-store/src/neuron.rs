//! Neuron records and the persistent 256-byte codec
//!
//! The on-PSRAM layout is the interchange format between host tooling and
//! the nodes, so it is fixed bit-for-bit: little-endian words, IEEE-754
//! singles, zero-filled reserved regions. This module is the only place
//! that knows the offsets; everything else goes through
//! [`Neuron::from_bytes`] and [`Neuron::to_bytes`].
//!
//! Record layout (256 bytes):
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 2 | `neuron_id` (`0xFFFF` terminates a table) |
//! | 2 | 2 | `flags` |
//! | 4 | 4 | `membrane_potential` (f32) |
//! | 8 | 4 | `threshold` (f32) |
//! | 12 | 4 | `last_spike_time_us` |
//! | 16 | 2 | `synapse_count` |
//! | 18 | 2 | `synapse_capacity` (informational) |
//! | 20 | 4 | reserved |
//! | 24 | 4 | `leak_rate` (f32, tau in seconds) |
//! | 28 | 4 | `refractory_period_us` |
//! | 32 | 8 | reserved |
//! | 40 | 216 | packed synapses, 4 bytes each |

use crate::error::{Result, StoreError};
use heapless::Vec;

/// Size of one persistent neuron record in bytes
pub const NEURON_RECORD_SIZE: usize = 256;

/// Byte offset of the packed synapse array within a record
const SYNAPSE_OFFSET: usize = 40;

/// Packed synapse entries that fit in the record tail
pub const MAX_SYNAPSES_PER_NEURON: usize = (NEURON_RECORD_SIZE - SYNAPSE_OFFSET) / 4;

/// `neuron_id` value that terminates a table
pub const TABLE_END_ID: u16 = 0xFFFF;

/// Highest valid local neuron ID plus one
const LOCAL_ID_SPACE: u16 = 1024;

/// Neuron flag bits
pub mod flags {
    /// Neuron participates in the timestep scan
    pub const ACTIVE: u16 = 1 << 0;
    /// Neuron's outgoing weight is inhibitory
    pub const INHIBITORY: u16 = 1 << 1;
    /// Neuron accepts external input injection
    pub const INPUT: u16 = 1 << 2;
    /// Neuron's spikes are routed to the output stage
    pub const OUTPUT: u16 = 1 << 3;
    /// Runtime hint: neuron was refractory when last flushed
    pub const REFRACTORY: u16 = 1 << 4;
}

/// Packed 24-bit global neuron identifier: `(node_id << 16) | local_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalNeuronId(u32);

impl GlobalNeuronId {
    /// Pack a node ID and a local ID
    pub const fn new(node_id: u8, local_id: u16) -> Self {
        Self(((node_id as u32) << 16) | local_id as u32)
    }

    /// Build from a raw 24-bit value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & 0x00FF_FFFF)
    }

    /// Raw 24-bit value
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Owning node ID (upper 8 bits)
    pub const fn node_id(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    /// Local ID on the owning node (lower 16 bits)
    pub const fn local_id(&self) -> u16 {
        self.0 as u16
    }
}

/// Decode a weight byte into a synaptic weight
///
/// Bytes below 128 map to `[0, 2]`, bytes above 128 map to `[-2, -0.016]`.
/// Byte 128 is the negative-zero alias and decodes to exactly `0.0`.
pub fn decode_weight(byte: u8) -> f32 {
    if byte < 128 {
        byte as f32 / 63.5
    } else if byte == 128 {
        0.0
    } else {
        -((byte - 128) as f32) / 63.5
    }
}

/// Encode a synaptic weight into a weight byte
///
/// Inverse of [`decode_weight`]; the input is clamped to `[-2, 2]`.
/// Negative magnitudes that round to zero encode as byte 0, so the
/// ambiguous byte 128 is never emitted.
pub fn encode_weight(weight: f32) -> u8 {
    let w = weight.clamp(-2.0, 2.0);
    if w >= 0.0 {
        (libm::roundf(w * 63.5) as i32).min(127) as u8
    } else {
        let q = (libm::roundf(-w * 63.5) as i32).min(127);
        if q == 0 {
            0
        } else {
            (128 + q) as u8
        }
    }
}

/// A directed, weighted connection stored on the receiving neuron
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Synapse {
    /// Global ID naming the peer neuron
    pub source: GlobalNeuronId,
    /// Synaptic weight in `[-2, 2]`
    pub weight: f32,
}

impl Synapse {
    /// Create a synapse
    pub fn new(source: GlobalNeuronId, weight: f32) -> Self {
        Self { source, weight }
    }

    /// Pack into the 4-byte wire word: bits 31..8 source, bits 7..0 weight
    pub fn pack(&self) -> u32 {
        (self.source.raw() << 8) | encode_weight(self.weight) as u32
    }

    /// Unpack from the 4-byte wire word
    pub fn unpack(word: u32) -> Self {
        Self {
            source: GlobalNeuronId::from_raw(word >> 8),
            weight: decode_weight(word as u8),
        }
    }
}

/// One decoded LIF neuron
#[derive(Debug, Clone, PartialEq)]
pub struct Neuron {
    /// Local ID on the owning node (0..1023)
    pub id: u16,
    /// Flag bits, see [`flags`]
    pub flags: u16,
    /// Membrane potential
    pub membrane_potential: f32,
    /// Firing threshold (non-negative)
    pub threshold: f32,
    /// Timestamp of the most recent fire, microseconds
    pub last_spike_time_us: u32,
    /// Stored capacity field, informational only
    pub synapse_capacity: u16,
    /// Leak time constant tau in seconds (non-negative)
    pub leak_rate: f32,
    /// Refractory hold-off after a fire, microseconds
    pub refractory_period_us: u32,
    /// Incoming synapses
    pub synapses: Vec<Synapse, MAX_SYNAPSES_PER_NEURON>,
}

impl Neuron {
    /// Create an active neuron with default dynamics
    pub fn new(id: u16) -> Self {
        Self {
            id,
            flags: flags::ACTIVE,
            membrane_potential: 0.0,
            threshold: 1.0,
            last_spike_time_us: 0,
            synapse_capacity: MAX_SYNAPSES_PER_NEURON as u16,
            leak_rate: 0.0,
            refractory_period_us: 0,
            synapses: Vec::new(),
        }
    }

    /// Parse a persistent record
    pub fn from_bytes(bytes: &[u8; NEURON_RECORD_SIZE]) -> Result<Self> {
        let id = u16::from_le_bytes([bytes[0], bytes[1]]);
        if id >= LOCAL_ID_SPACE {
            return Err(StoreError::invalid_record(format!(
                "neuron_id {:#06x} outside local ID space",
                id
            )));
        }

        let synapse_count = u16::from_le_bytes([bytes[16], bytes[17]]);
        if synapse_count as usize > MAX_SYNAPSES_PER_NEURON {
            return Err(StoreError::SynapseOverflow {
                count: synapse_count,
                max: MAX_SYNAPSES_PER_NEURON as u16,
            });
        }

        let threshold = f32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(StoreError::invalid_record(format!(
                "threshold {} must be finite and non-negative",
                threshold
            )));
        }

        let leak_rate = f32::from_le_bytes([bytes[24], bytes[25], bytes[26], bytes[27]]);
        if !leak_rate.is_finite() || leak_rate < 0.0 {
            return Err(StoreError::invalid_record(format!(
                "leak_rate {} must be finite and non-negative",
                leak_rate
            )));
        }

        let mut synapses = Vec::new();
        for i in 0..synapse_count as usize {
            let at = SYNAPSE_OFFSET + i * 4;
            let word =
                u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
            // Capacity checked above
            let _ = synapses.push(Synapse::unpack(word));
        }

        Ok(Self {
            id,
            flags: u16::from_le_bytes([bytes[2], bytes[3]]),
            membrane_potential: f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            threshold,
            last_spike_time_us: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
            synapse_capacity: u16::from_le_bytes([bytes[18], bytes[19]]),
            leak_rate,
            refractory_period_us: u32::from_le_bytes([bytes[28], bytes[29], bytes[30], bytes[31]]),
            synapses,
        })
    }

    /// Serialize into a persistent record, zero-filling reserved regions
    pub fn to_bytes(&self, bytes: &mut [u8; NEURON_RECORD_SIZE]) -> Result<()> {
        if self.id >= LOCAL_ID_SPACE {
            return Err(StoreError::invalid_record(format!(
                "neuron_id {:#06x} outside local ID space",
                self.id
            )));
        }

        bytes.fill(0);
        bytes[0..2].copy_from_slice(&self.id.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.flags.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.membrane_potential.to_le_bytes());
        bytes[8..12].copy_from_slice(&self.threshold.to_le_bytes());
        bytes[12..16].copy_from_slice(&self.last_spike_time_us.to_le_bytes());
        bytes[16..18].copy_from_slice(&(self.synapses.len() as u16).to_le_bytes());
        bytes[18..20].copy_from_slice(&self.synapse_capacity.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.leak_rate.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.refractory_period_us.to_le_bytes());

        for (i, synapse) in self.synapses.iter().enumerate() {
            let at = SYNAPSE_OFFSET + i * 4;
            bytes[at..at + 4].copy_from_slice(&synapse.pack().to_le_bytes());
        }
        Ok(())
    }

    /// Append an incoming synapse
    pub fn add_synapse(&mut self, synapse: Synapse) -> Result<()> {
        self.synapses.push(synapse).map_err(|_| {
            StoreError::SynapseOverflow {
                count: MAX_SYNAPSES_PER_NEURON as u16 + 1,
                max: MAX_SYNAPSES_PER_NEURON as u16,
            }
        })
    }

    /// Weight of the synapse from `source`, if one exists
    pub fn weight_from(&self, source: GlobalNeuronId) -> Option<f32> {
        self.synapses
            .iter()
            .find(|s| s.source == source)
            .map(|s| s.weight)
    }

    /// End of the refractory hold-off started by the last fire
    pub fn refractory_until_us(&self) -> u32 {
        self.last_spike_time_us
            .saturating_add(self.refractory_period_us)
    }

    /// Whether the neuron participates in the timestep scan
    pub fn is_active(&self) -> bool {
        self.flags & flags::ACTIVE != 0
    }

    /// Whether the neuron is marked inhibitory
    pub fn is_inhibitory(&self) -> bool {
        self.flags & flags::INHIBITORY != 0
    }

    /// Whether the neuron accepts external input injection
    pub fn is_input(&self) -> bool {
        self.flags & flags::INPUT != 0
    }

    /// Update the persisted refractory hint bit
    pub fn set_refractory_hint(&mut self, refractory: bool) {
        if refractory {
            self.flags |= flags::REFRACTORY;
        } else {
            self.flags &= !flags::REFRACTORY;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Hand-built record from the interchange test vector: two synapses,
    /// weight bytes 64 (excitatory) and 192 (inhibitory).
    fn reference_record() -> [u8; NEURON_RECORD_SIZE] {
        let mut bytes = [0u8; NEURON_RECORD_SIZE];
        bytes[0..2].copy_from_slice(&3u16.to_le_bytes());
        bytes[2..4].copy_from_slice(&flags::ACTIVE.to_le_bytes());
        bytes[8..12].copy_from_slice(&1.0f32.to_le_bytes());
        bytes[16..18].copy_from_slice(&2u16.to_le_bytes());
        bytes[18..20].copy_from_slice(&(MAX_SYNAPSES_PER_NEURON as u16).to_le_bytes());
        bytes[24..28].copy_from_slice(&0.1f32.to_le_bytes());
        bytes[28..32].copy_from_slice(&2000u32.to_le_bytes());
        bytes[40..44].copy_from_slice(&((0x0001_0005u32 << 8) | 64).to_le_bytes());
        bytes[44..48].copy_from_slice(&((0x0002_0007u32 << 8) | 192).to_le_bytes());
        bytes
    }

    #[test]
    fn test_parse_reference_record() {
        let bytes = reference_record();
        let neuron = Neuron::from_bytes(&bytes).unwrap();

        assert_eq!(neuron.id, 3);
        assert_eq!(neuron.threshold, 1.0);
        assert_eq!(neuron.leak_rate, 0.1);
        assert_eq!(neuron.refractory_period_us, 2000);
        assert_eq!(neuron.synapses.len(), 2);

        let s0 = neuron.synapses[0];
        assert_eq!(s0.source, GlobalNeuronId::new(1, 5));
        assert!((s0.weight - 64.0 / 63.5).abs() < 1e-6);

        let s1 = neuron.synapses[1];
        assert_eq!(s1.source, GlobalNeuronId::new(2, 7));
        assert!((s1.weight + 64.0 / 63.5).abs() < 1e-6);
    }

    #[test]
    fn test_serialize_reproduces_reference_bytes() {
        let bytes = reference_record();
        let neuron = Neuron::from_bytes(&bytes).unwrap();

        let mut back = [0u8; NEURON_RECORD_SIZE];
        neuron.to_bytes(&mut back).unwrap();
        assert_eq!(back[..], bytes[..]);
    }

    #[test]
    fn test_reserved_regions_zero_filled() {
        let mut neuron = Neuron::new(7);
        neuron.membrane_potential = 0.25;
        let mut bytes = [0xFFu8; NEURON_RECORD_SIZE];
        neuron.to_bytes(&mut bytes).unwrap();

        assert_eq!(&bytes[20..24], &[0, 0, 0, 0]);
        assert_eq!(&bytes[32..40], &[0; 8]);
        // Unused synapse slots are cleared too
        assert_eq!(&bytes[40..64], &[0; 24]);
    }

    #[test]
    fn test_rejects_terminator_and_oversized_ids() {
        let mut bytes = [0u8; NEURON_RECORD_SIZE];
        bytes[0..2].copy_from_slice(&TABLE_END_ID.to_le_bytes());
        assert!(matches!(
            Neuron::from_bytes(&bytes),
            Err(StoreError::InvalidRecord { .. })
        ));

        bytes[0..2].copy_from_slice(&1024u16.to_le_bytes());
        assert!(Neuron::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_rejects_synapse_overflow() {
        let mut bytes = [0u8; NEURON_RECORD_SIZE];
        bytes[16..18].copy_from_slice(&((MAX_SYNAPSES_PER_NEURON as u16 + 1).to_le_bytes()));
        assert!(matches!(
            Neuron::from_bytes(&bytes),
            Err(StoreError::SynapseOverflow { .. })
        ));
    }

    #[test]
    fn test_rejects_negative_dynamics() {
        let mut bytes = [0u8; NEURON_RECORD_SIZE];
        bytes[8..12].copy_from_slice(&(-1.0f32).to_le_bytes());
        assert!(Neuron::from_bytes(&bytes).is_err());

        let mut bytes = [0u8; NEURON_RECORD_SIZE];
        bytes[24..28].copy_from_slice(&(-0.5f32).to_le_bytes());
        assert!(Neuron::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_weight_code_points() {
        assert_eq!(decode_weight(0), 0.0);
        assert!((decode_weight(127) - 2.0).abs() < 0.001);
        assert_eq!(decode_weight(128), 0.0);
        assert!((decode_weight(255) + 2.0).abs() < 0.001);

        assert_eq!(encode_weight(0.0), 0);
        assert_eq!(encode_weight(2.0), 127);
        assert_eq!(encode_weight(-2.0), 255);
        // Out-of-range weights clamp
        assert_eq!(encode_weight(10.0), 127);
        assert_eq!(encode_weight(-10.0), 255);
        // Negative magnitudes rounding to zero avoid the byte-128 alias
        assert_eq!(encode_weight(-0.001), 0);
    }

    #[test]
    fn test_global_id_packing() {
        let id = GlobalNeuronId::new(5, 0x0203);
        assert_eq!(id.raw(), 0x0005_0203);
        assert_eq!(id.node_id(), 5);
        assert_eq!(id.local_id(), 0x0203);
    }

    proptest! {
        #[test]
        fn prop_weight_byte_roundtrip(byte in 0u8..=255) {
            prop_assume!(byte != 128);
            prop_assert_eq!(encode_weight(decode_weight(byte)), byte);
        }

        #[test]
        fn prop_record_roundtrip(
            id in 0u16..1024,
            flag_bits in 0u16..32,
            potential in -10.0f32..10.0,
            threshold in 0.0f32..10.0,
            leak in 0.0f32..1.0,
            refractory in 0u32..1_000_000,
            weights in proptest::collection::vec(0u8..=255, 0..MAX_SYNAPSES_PER_NEURON),
        ) {
            let mut neuron = Neuron::new(id);
            neuron.flags = flag_bits;
            neuron.membrane_potential = potential;
            neuron.threshold = threshold;
            neuron.leak_rate = leak;
            neuron.refractory_period_us = refractory;
            for (i, w) in weights.iter().enumerate() {
                prop_assume!(*w != 128);
                neuron
                    .add_synapse(Synapse::new(
                        GlobalNeuronId::new((i % 16) as u8, i as u16),
                        decode_weight(*w),
                    ))
                    .unwrap();
            }

            let mut bytes = [0u8; NEURON_RECORD_SIZE];
            neuron.to_bytes(&mut bytes).unwrap();
            let back = Neuron::from_bytes(&bytes).unwrap();
            prop_assert_eq!(back, neuron);

            // Second serialize is byte-identical
            let mut bytes2 = [0u8; NEURON_RECORD_SIZE];
            Neuron::from_bytes(&bytes).unwrap().to_bytes(&mut bytes2).unwrap();
            prop_assert_eq!(&bytes2[..], &bytes[..]);
        }
    }
}
