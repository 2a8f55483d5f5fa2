//! Persistent neuron table in external PSRAM
//!
//! The store is the sole authoritative owner of persistent neuron state: a
//! contiguous run of valid 256-byte records at `base_addr`, terminated by a
//! record whose `neuron_id` is [`TABLE_END_ID`]. The controller stages new
//! tables at an arbitrary PSRAM address and commits them with
//! [`NeuronStore::load_table`].

use crate::{
    error::{Result, StoreError},
    neuron::{Neuron, NEURON_RECORD_SIZE, TABLE_END_ID},
};
use neurogrid_hal::PsramDriver;

/// Largest table a node will accept
pub const MAX_NEURONS_PER_NODE: u16 = 1024;

/// Chunk size for staged table copies
const COPY_CHUNK: usize = 1024;

/// Table descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableInfo {
    /// PSRAM address of record 0
    pub base_addr: u32,
    /// Capacity of the table in records
    pub max_neurons: u16,
    /// Record stride in bytes
    pub entry_size: usize,
    /// Records currently loaded
    pub neuron_count: u16,
}

/// Indexed neuron table over a PSRAM driver
pub struct NeuronStore<P: PsramDriver> {
    psram: P,
    base_addr: u32,
    max_neurons: u16,
    neuron_count: u16,
}

impl<P: PsramDriver> NeuronStore<P> {
    /// Create a store over `psram` with the table at `base_addr`
    ///
    /// Fails if the table region does not fit the device.
    pub fn new(psram: P, base_addr: u32, max_neurons: u16) -> Result<Self> {
        let end = base_addr as u64 + max_neurons as u64 * NEURON_RECORD_SIZE as u64;
        if max_neurons > MAX_NEURONS_PER_NODE || end > psram.capacity() as u64 {
            return Err(StoreError::TableOverflow {
                base: base_addr,
                neurons: max_neurons,
                size: psram.capacity(),
            });
        }
        Ok(Self {
            psram,
            base_addr,
            max_neurons,
            neuron_count: 0,
        })
    }

    /// Table descriptor snapshot
    pub fn info(&self) -> TableInfo {
        TableInfo {
            base_addr: self.base_addr,
            max_neurons: self.max_neurons,
            entry_size: NEURON_RECORD_SIZE,
            neuron_count: self.neuron_count,
        }
    }

    /// Records currently loaded
    pub fn count(&self) -> u16 {
        self.neuron_count
    }

    fn record_addr(&self, id: u16) -> Result<u32> {
        if id >= self.max_neurons {
            return Err(StoreError::out_of_range(id, self.max_neurons.saturating_sub(1)));
        }
        Ok(self.base_addr + id as u32 * NEURON_RECORD_SIZE as u32)
    }

    /// Read and decode the record at local index `id`
    pub fn read(&mut self, id: u16) -> Result<Neuron> {
        let addr = self.record_addr(id)?;
        let mut bytes = [0u8; NEURON_RECORD_SIZE];
        self.psram.read(addr, &mut bytes)?;
        Neuron::from_bytes(&bytes)
    }

    /// Encode and write `neuron` at local index `id`
    pub fn write(&mut self, id: u16, neuron: &Neuron) -> Result<()> {
        let addr = self.record_addr(id)?;
        let mut bytes = [0u8; NEURON_RECORD_SIZE];
        neuron.to_bytes(&mut bytes)?;
        self.psram.write(addr, &bytes)?;
        Ok(())
    }

    /// Commit a staged table: copy `n` records from `source_addr` to the
    /// table base in bounded chunks, then adopt `n` as the live count
    pub fn load_table(&mut self, source_addr: u32, n: u16) -> Result<()> {
        if n > self.max_neurons {
            return Err(StoreError::out_of_range(n, self.max_neurons));
        }

        let total = n as usize * NEURON_RECORD_SIZE;
        let mut chunk = [0u8; COPY_CHUNK];
        let mut copied = 0usize;
        while copied < total {
            let len = (total - copied).min(COPY_CHUNK);
            self.psram.read(source_addr + copied as u32, &mut chunk[..len])?;
            self.psram
                .write(self.base_addr + copied as u32, &chunk[..len])?;
            copied += len;
        }

        self.neuron_count = n;
        log::info!(
            "Loaded table: {} neurons from {:#010x} to {:#010x}",
            n,
            source_addr,
            self.base_addr
        );
        Ok(())
    }

    /// Scan a staged region for the table terminator and report the run
    /// length, bounded by the table capacity
    pub fn scan_table_len(&mut self, addr: u32) -> Result<u16> {
        for i in 0..self.max_neurons {
            let mut id_bytes = [0u8; 2];
            self.psram
                .read(addr + i as u32 * NEURON_RECORD_SIZE as u32, &mut id_bytes)?;
            if u16::from_le_bytes(id_bytes) == TABLE_END_ID {
                return Ok(i);
            }
        }
        Ok(self.max_neurons)
    }

    /// Raw byte read, for staging-area access
    pub fn raw_read(&mut self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.psram.read(addr, buf)?;
        Ok(())
    }

    /// Raw byte write, for staging-area access
    pub fn raw_write(&mut self, addr: u32, buf: &[u8]) -> Result<()> {
        self.psram.write(addr, buf)?;
        Ok(())
    }
}
