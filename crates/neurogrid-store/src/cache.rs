//! Write-back LRU cache over the neuron store
//!
//! The cache lets a node hold thousands of neurons in PSRAM while keeping
//! only a small working set decoded on chip. It is fully associative and
//! scanned linearly; with the capacities involved a scan beats any index.
//! Dirty entries are written back only on eviction, explicit flush, or
//! engine stop.
//!
//! Aging discipline: every access increments all valid slots' counters
//! (saturating at 255) and zeroes the accessed slot, so the stalest slot
//! carries the largest counter and eviction takes the maximum, lowest slot
//! index on ties.

use crate::{
    error::Result,
    neuron::Neuron,
    store::NeuronStore,
};
use neurogrid_hal::PsramDriver;

/// Working-set capacity of the reference configuration
pub const CACHE_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
struct CacheSlot {
    local_id: u16,
    valid: bool,
    dirty: bool,
    age: u8,
    neuron: Neuron,
}

impl CacheSlot {
    fn empty() -> Self {
        Self {
            local_id: 0,
            valid: false,
            dirty: false,
            age: 0,
            neuron: Neuron::new(0),
        }
    }
}

/// Cache access counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups served from a resident slot
    pub hits: u64,
    /// Lookups that loaded from the store
    pub misses: u64,
    /// Slots reclaimed to make room
    pub evictions: u64,
    /// Valid slots right now
    pub entries_in_use: usize,
}

impl CacheStats {
    /// Fraction of lookups served from the cache
    pub fn hit_rate(&self) -> f32 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f32 / total as f32
        }
    }
}

/// Bounded write-back cache of decoded neurons
pub struct NeuronCache<const N: usize = CACHE_CAPACITY> {
    slots: [CacheSlot; N],
    hits: u64,
    misses: u64,
    evictions: u64,
    inconsistent: bool,
}

impl<const N: usize> NeuronCache<N> {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| CacheSlot::empty()),
            hits: 0,
            misses: 0,
            evictions: 0,
            inconsistent: false,
        }
    }

    /// False once a write-back has failed; resident state may then be
    /// newer than the store with no way to reconcile
    pub fn is_consistent(&self) -> bool {
        !self.inconsistent
    }

    fn find(&self, id: u16) -> Option<usize> {
        self.slots.iter().position(|s| s.valid && s.local_id == id)
    }

    fn touch(&mut self, idx: usize) {
        for slot in self.slots.iter_mut().filter(|s| s.valid) {
            slot.age = slot.age.saturating_add(1);
        }
        self.slots[idx].age = 0;
    }

    fn flush_slot<P: PsramDriver>(
        &mut self,
        store: &mut NeuronStore<P>,
        idx: usize,
    ) -> Result<()> {
        if self.slots[idx].valid && self.slots[idx].dirty {
            let id = self.slots[idx].local_id;
            if let Err(err) = store.write(id, &self.slots[idx].neuron) {
                self.inconsistent = true;
                log::warn!("Write-back of neuron {} failed: {}", id, err);
                return Err(err);
            }
            self.slots[idx].dirty = false;
        }
        Ok(())
    }

    /// Pick a slot for a new entry, evicting the stalest if none is free
    fn allocate<P: PsramDriver>(&mut self, store: &mut NeuronStore<P>) -> Result<usize> {
        if let Some(idx) = self.slots.iter().position(|s| !s.valid) {
            return Ok(idx);
        }

        let mut victim = 0;
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot.age > self.slots[victim].age {
                victim = idx;
            }
        }
        self.flush_slot(store, victim)?;
        self.slots[victim].valid = false;
        self.evictions += 1;
        Ok(victim)
    }

    /// Fetch a mutable handle to neuron `id`, loading it on a miss
    ///
    /// Mutations through the handle must be followed by
    /// [`NeuronCache::mark_dirty`] to be observable in the store.
    pub fn get<P: PsramDriver>(
        &mut self,
        store: &mut NeuronStore<P>,
        id: u16,
    ) -> Result<&mut Neuron> {
        let idx = match self.find(id) {
            Some(idx) => {
                self.hits += 1;
                idx
            }
            None => {
                self.misses += 1;
                let neuron = store.read(id)?;
                let idx = self.allocate(store)?;
                let slot = &mut self.slots[idx];
                slot.local_id = id;
                slot.valid = true;
                slot.dirty = false;
                slot.neuron = neuron;
                idx
            }
        };
        self.touch(idx);
        Ok(&mut self.slots[idx].neuron)
    }

    /// Mark the slot holding `id` dirty; no-op if not resident
    pub fn mark_dirty(&mut self, id: u16) {
        if let Some(idx) = self.find(id) {
            self.slots[idx].dirty = true;
        }
    }

    /// Write back `id` if resident and dirty
    pub fn flush<P: PsramDriver>(&mut self, store: &mut NeuronStore<P>, id: u16) -> Result<()> {
        if let Some(idx) = self.find(id) {
            self.flush_slot(store, idx)?;
        }
        Ok(())
    }

    /// Write back every dirty slot
    pub fn flush_all<P: PsramDriver>(&mut self, store: &mut NeuronStore<P>) -> Result<()> {
        for idx in 0..N {
            self.flush_slot(store, idx)?;
        }
        Ok(())
    }

    /// Write back `id` if dirty, then drop it from the cache
    pub fn invalidate<P: PsramDriver>(
        &mut self,
        store: &mut NeuronStore<P>,
        id: u16,
    ) -> Result<()> {
        if let Some(idx) = self.find(id) {
            self.flush_slot(store, idx)?;
            self.slots[idx].valid = false;
        }
        Ok(())
    }

    /// Flush everything, then empty every slot
    pub fn clear<P: PsramDriver>(&mut self, store: &mut NeuronStore<P>) -> Result<()> {
        self.flush_all(store)?;
        for slot in self.slots.iter_mut() {
            slot.valid = false;
        }
        Ok(())
    }

    /// Access counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            entries_in_use: self.slots.iter().filter(|s| s.valid).count(),
        }
    }
}

impl<const N: usize> Default for NeuronCache<N> {
    fn default() -> Self {
        Self::new()
    }
}
