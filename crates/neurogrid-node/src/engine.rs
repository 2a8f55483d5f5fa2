//! LIF execution engine
//!
//! The engine owns the per-timestep loop: drain the inbound spike FIFO,
//! scan every loaded neuron for leak and fire, and write dirty state back
//! through the cache on a fixed cadence. It is driven from the foreground
//! main loop with the current monotonic micro-timestamp, roughly once a
//! millisecond.
//!
//! Leak model: exponential decay toward zero, `V *= exp(-dt / (tau * 1e6))`
//! with `tau = leak_rate` seconds. A zero time constant leaves the
//! potential untouched.

use crate::{
    error::{NodeError, Result},
    spike::{SpikeEvent, SpikeQueue},
};
use heapless::Deque;
use neurogrid_hal::PsramDriver;
use neurogrid_store::{flags, NeuronCache, NeuronStore};

/// Steps between periodic cache write-backs
pub const FLUSH_INTERVAL_STEPS: u64 = 100;

/// Potentials this close to zero are clamped to zero
const POTENTIAL_EPSILON: f32 = 0.001;

/// Spikes awaiting forwarding to peer nodes
const OUTBOUND_CAPACITY: usize = 64;

/// Engine lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// Fresh object, no node identity yet
    Uninitialized = 0,
    /// Identity assigned, no network loaded
    Initialized = 1,
    /// Neuron table committed, not running
    Loaded = 2,
    /// Timestep loop live
    Running = 3,
    /// Halted; cache flushed
    Stopped = 4,
}

impl EngineState {
    /// Human-readable state name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Initialized => "Initialized",
            Self::Loaded => "Loaded",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
        }
    }
}

/// Execution counters and current simulated time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Fires produced by the scan
    pub spikes_generated: u64,
    /// Events drained from the inbound FIFO
    pub spikes_received: u64,
    /// Events applied to a local membrane potential
    pub spikes_processed: u64,
    /// Events lost to full queues or unknown targets
    pub spikes_dropped: u64,
    /// Timesteps executed since load
    pub step_count: u64,
    /// Timestamp of the most recent step
    pub current_time_us: u64,
    /// Inbound FIFO depth after the most recent step
    pub queue_depth: usize,
}

/// The per-node spiking network executor
pub struct LifEngine {
    state: EngineState,
    node_id: u8,
    current_time_us: u64,
    prev_step_us: Option<u64>,
    step_count: u64,
    spikes_generated: u64,
    spikes_received: u64,
    spikes_processed: u64,
    dropped: u64,
    last_queue_depth: usize,
    last_queue_drops: u32,
    remote_out: Deque<SpikeEvent, OUTBOUND_CAPACITY>,
}

impl LifEngine {
    /// Create an uninitialized engine
    pub fn new() -> Self {
        Self {
            state: EngineState::Uninitialized,
            node_id: 0,
            current_time_us: 0,
            prev_step_us: None,
            step_count: 0,
            spikes_generated: 0,
            spikes_received: 0,
            spikes_processed: 0,
            dropped: 0,
            last_queue_depth: 0,
            last_queue_drops: 0,
            remote_out: Deque::new(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Assign the node identity
    pub fn init(&mut self, node_id: u8) -> Result<()> {
        if self.state != EngineState::Uninitialized {
            return Err(NodeError::invalid_state("init", self.state.name()));
        }
        self.node_id = node_id;
        self.state = EngineState::Initialized;
        log::info!("Engine initialized for node {}", node_id);
        Ok(())
    }

    /// Commit a staged neuron table and reset the execution counters
    pub fn load_network<P: PsramDriver>(
        &mut self,
        store: &mut NeuronStore<P>,
        cache: &mut NeuronCache,
        source_addr: u32,
        n: u16,
    ) -> Result<()> {
        match self.state {
            EngineState::Uninitialized => {
                return Err(NodeError::invalid_state("load", self.state.name()))
            }
            EngineState::Running => {
                return Err(NodeError::invalid_state("load", self.state.name()))
            }
            _ => {}
        }

        cache.clear(store)?;
        store.load_table(source_addr, n)?;

        self.current_time_us = 0;
        self.prev_step_us = None;
        self.step_count = 0;
        self.spikes_generated = 0;
        self.spikes_received = 0;
        self.spikes_processed = 0;
        self.dropped = 0;
        self.last_queue_depth = 0;
        self.last_queue_drops = 0;
        self.remote_out.clear();
        self.state = EngineState::Loaded;
        Ok(())
    }

    /// Enter the Running state; a no-op when already running
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            EngineState::Running => Ok(()),
            EngineState::Loaded | EngineState::Stopped => {
                self.state = EngineState::Running;
                log::info!("Engine started");
                Ok(())
            }
            _ => Err(NodeError::invalid_state("start", self.state.name())),
        }
    }

    /// Halt and flush the cache; a no-op when already stopped
    pub fn stop<P: PsramDriver>(
        &mut self,
        store: &mut NeuronStore<P>,
        cache: &mut NeuronCache,
    ) -> Result<()> {
        match self.state {
            EngineState::Stopped => Ok(()),
            EngineState::Running | EngineState::Loaded => {
                self.state = EngineState::Stopped;
                log::info!("Engine stopped after {} steps", self.step_count);
                cache.flush_all(store)?;
                Ok(())
            }
            _ => Err(NodeError::invalid_state("stop", self.state.name())),
        }
    }

    /// Add `value` to a local neuron's membrane potential
    pub fn inject<P: PsramDriver>(
        &mut self,
        store: &mut NeuronStore<P>,
        cache: &mut NeuronCache,
        local_id: u16,
        value: f32,
    ) -> Result<()> {
        if !matches!(self.state, EngineState::Loaded | EngineState::Running) {
            return Err(NodeError::invalid_state("inject", self.state.name()));
        }
        if local_id >= store.count() {
            return Err(NodeError::NeuronOutOfRange {
                id: local_id,
                count: store.count(),
            });
        }
        let neuron = cache.get(store, local_id)?;
        neuron.membrane_potential += value;
        cache.mark_dirty(local_id);
        self.spikes_processed += 1;
        Ok(())
    }

    /// Execute one timestep at `now_us`; a no-op unless Running
    pub fn step<P: PsramDriver, const N: usize>(
        &mut self,
        store: &mut NeuronStore<P>,
        cache: &mut NeuronCache,
        queue: &mut SpikeQueue<N>,
        now_us: u64,
    ) -> Result<()> {
        if self.state != EngineState::Running {
            return Ok(());
        }

        let dt_us = self
            .prev_step_us
            .map(|prev| now_us.saturating_sub(prev))
            .unwrap_or(0);
        self.prev_step_us = Some(now_us);
        self.current_time_us = now_us;

        // Drain inbound, bounded by the depth at entry so spikes enqueued
        // by this step's fires wait for the next step
        let pending = queue.len();
        for _ in 0..pending {
            let Some(event) = queue.pop() else { break };
            self.spikes_received += 1;
            if event.target.node_id() == self.node_id {
                if let Err(err) = self.apply_local(store, cache, event) {
                    return self.fault(store, cache, err);
                }
            } else if self.remote_out.push_back(event).is_err() {
                self.dropped += 1;
                log::warn!(
                    "Forward buffer full; dropping spike for node {}",
                    event.target.node_id()
                );
            }
        }

        for local_id in 0..store.count() {
            if let Err(err) = self.process_neuron(store, cache, queue, local_id, now_us, dt_us) {
                return self.fault(store, cache, err);
            }
        }

        self.step_count += 1;
        if self.step_count % FLUSH_INTERVAL_STEPS == 0 {
            if let Err(err) = cache.flush_all(store) {
                return self.fault(store, cache, err.into());
            }
        }

        self.last_queue_depth = queue.len();
        self.last_queue_drops = queue.drops();
        Ok(())
    }

    /// Next spike awaiting forwarding to a peer node
    pub fn take_outbound(&mut self) -> Option<SpikeEvent> {
        self.remote_out.pop_front()
    }

    /// Execution counters
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            spikes_generated: self.spikes_generated,
            spikes_received: self.spikes_received,
            spikes_processed: self.spikes_processed,
            spikes_dropped: self.dropped + self.last_queue_drops as u64,
            step_count: self.step_count,
            current_time_us: self.current_time_us,
            queue_depth: self.last_queue_depth,
        }
    }

    fn apply_local<P: PsramDriver>(
        &mut self,
        store: &mut NeuronStore<P>,
        cache: &mut NeuronCache,
        event: SpikeEvent,
    ) -> Result<()> {
        let local_id = event.target.local_id();
        if local_id >= store.count() {
            self.dropped += 1;
            log::warn!("Dropping spike for unknown local neuron {}", local_id);
            return Ok(());
        }
        let neuron = cache.get(store, local_id)?;
        neuron.membrane_potential += event.value;
        cache.mark_dirty(local_id);
        self.spikes_processed += 1;
        Ok(())
    }

    fn process_neuron<P: PsramDriver, const N: usize>(
        &mut self,
        store: &mut NeuronStore<P>,
        cache: &mut NeuronCache,
        queue: &mut SpikeQueue<N>,
        local_id: u16,
        now_us: u64,
        dt_us: u64,
    ) -> Result<()> {
        let neuron = cache.get(store, local_id)?;
        if !neuron.is_active() {
            return Ok(());
        }

        let now32 = now_us as u32;
        // last_spike_time 0 means the neuron has not fired this run
        if neuron.last_spike_time_us != 0 && now32 < neuron.refractory_until_us() {
            return Ok(());
        }

        let mut dirty = false;
        if neuron.flags & flags::REFRACTORY != 0 {
            neuron.set_refractory_hint(false);
            dirty = true;
        }

        if neuron.leak_rate > 0.0 && dt_us > 0 && neuron.membrane_potential != 0.0 {
            let decay = libm::expf(-(dt_us as f32) / (neuron.leak_rate * 1e6));
            neuron.membrane_potential *= decay;
            dirty = true;
        }
        if neuron.membrane_potential != 0.0 && neuron.membrane_potential.abs() < POTENTIAL_EPSILON
        {
            neuron.membrane_potential = 0.0;
            dirty = true;
        }

        let mut fired = None;
        if neuron.membrane_potential >= neuron.threshold {
            neuron.last_spike_time_us = now32;
            neuron.membrane_potential = 0.0;
            neuron.set_refractory_hint(true);
            dirty = true;
            // Stored direction: each entry names the downstream target
            fired = Some(neuron.synapses.clone());
        }

        if dirty {
            cache.mark_dirty(local_id);
        }

        if let Some(synapses) = fired {
            self.spikes_generated += 1;
            log::debug!("Neuron {} fired at {}us", local_id, now_us);
            for synapse in &synapses {
                let event = SpikeEvent::with_value(synapse.source, now32, synapse.weight);
                if queue.push(event).is_err() {
                    log::warn!(
                        "Spike queue full; dropping spike for {:#08x}",
                        synapse.source.raw()
                    );
                }
            }
        }
        Ok(())
    }

    /// Storage fault while Running: stop, salvage what flushes, propagate
    fn fault<P: PsramDriver>(
        &mut self,
        store: &mut NeuronStore<P>,
        cache: &mut NeuronCache,
        err: NodeError,
    ) -> Result<()> {
        log::error!("Engine fault, stopping: {}", err);
        self.state = EngineState::Stopped;
        if let Err(flush_err) = cache.flush_all(store) {
            log::error!("Flush during fault handling failed: {}", flush_err);
        }
        Err(err)
    }
}

impl Default for LifEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neurogrid_hal::MemoryPsram;
    use neurogrid_store::{GlobalNeuronId, Neuron, Synapse};

    struct Rig {
        store: NeuronStore<MemoryPsram>,
        cache: NeuronCache,
        queue: SpikeQueue<64>,
        engine: LifEngine,
    }

    /// Write the neurons at the table base and commit in place
    fn rig(node_id: u8, neurons: &[Neuron]) -> Rig {
        let mut store =
            NeuronStore::new(MemoryPsram::with_capacity(1 << 20), 0, 128).unwrap();
        for (i, neuron) in neurons.iter().enumerate() {
            store.write(i as u16, neuron).unwrap();
        }
        let mut cache = NeuronCache::new();
        let mut engine = LifEngine::new();
        engine.init(node_id).unwrap();
        engine
            .load_network(&mut store, &mut cache, 0, neurons.len() as u16)
            .unwrap();
        Rig {
            store,
            cache,
            queue: SpikeQueue::new(),
            engine,
        }
    }

    fn lif_neuron(id: u16, threshold: f32, leak: f32, refractory_us: u32) -> Neuron {
        let mut neuron = Neuron::new(id);
        neuron.threshold = threshold;
        neuron.leak_rate = leak;
        neuron.refractory_period_us = refractory_us;
        neuron
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut rig = rig(0, &[lif_neuron(0, 1.0, 0.0, 0)]);
        assert_eq!(rig.engine.state(), EngineState::Loaded);

        rig.engine.start().unwrap();
        assert_eq!(rig.engine.state(), EngineState::Running);
        // Start on Running is a no-op
        rig.engine.start().unwrap();

        rig.engine.stop(&mut rig.store, &mut rig.cache).unwrap();
        assert_eq!(rig.engine.state(), EngineState::Stopped);
        // Stop on Stopped is a no-op
        rig.engine.stop(&mut rig.store, &mut rig.cache).unwrap();

        // Restart after stop
        rig.engine.start().unwrap();
        assert_eq!(rig.engine.state(), EngineState::Running);
    }

    #[test]
    fn test_start_requires_loaded_network() {
        let mut engine = LifEngine::new();
        assert!(matches!(
            engine.start(),
            Err(NodeError::InvalidState { .. })
        ));
        engine.init(0).unwrap();
        assert!(engine.start().is_err());
    }

    #[test]
    fn test_fire_refractory_refire() {
        let mut rig = rig(0, &[lif_neuron(0, 1.0, 0.1, 3000)]);
        rig.engine.start().unwrap();

        // Inject 1.5 and step at t=1000: fires
        rig.engine
            .inject(&mut rig.store, &mut rig.cache, 0, 1.5)
            .unwrap();
        rig.engine
            .step(&mut rig.store, &mut rig.cache, &mut rig.queue, 1000)
            .unwrap();
        assert_eq!(rig.engine.stats().spikes_generated, 1);

        let neuron = rig.cache.get(&mut rig.store, 0).unwrap();
        assert_eq!(neuron.membrane_potential, 0.0);
        assert_eq!(neuron.last_spike_time_us, 1000);
        assert_eq!(neuron.refractory_until_us(), 4000);

        // Still refractory at t=2000: no fire, potential accumulates
        rig.engine
            .inject(&mut rig.store, &mut rig.cache, 0, 1.5)
            .unwrap();
        rig.engine
            .step(&mut rig.store, &mut rig.cache, &mut rig.queue, 2000)
            .unwrap();
        assert_eq!(rig.engine.stats().spikes_generated, 1);

        // Past the hold-off at t=5000: fires again
        rig.engine
            .inject(&mut rig.store, &mut rig.cache, 0, 1.5)
            .unwrap();
        rig.engine
            .step(&mut rig.store, &mut rig.cache, &mut rig.queue, 5000)
            .unwrap();
        assert_eq!(rig.engine.stats().spikes_generated, 2);
    }

    #[test]
    fn test_leak_contracts_toward_zero() {
        let mut rig = rig(0, &[lif_neuron(0, 100.0, 0.1, 0)]);
        rig.engine.start().unwrap();
        rig.engine
            .inject(&mut rig.store, &mut rig.cache, 0, 10.0)
            .unwrap();

        // First step establishes the step clock; no decay yet
        rig.engine
            .step(&mut rig.store, &mut rig.cache, &mut rig.queue, 1000)
            .unwrap();
        let v1 = rig.cache.get(&mut rig.store, 0).unwrap().membrane_potential;
        assert_eq!(v1, 10.0);

        rig.engine
            .step(&mut rig.store, &mut rig.cache, &mut rig.queue, 2000)
            .unwrap();
        let v2 = rig.cache.get(&mut rig.store, 0).unwrap().membrane_potential;
        let expected = 10.0 * (-1000.0f32 / 100_000.0).exp();
        assert!((v2 - expected).abs() < 1e-3);
        assert!(v2 < v1);
    }

    #[test]
    fn test_zero_leak_is_identity() {
        let mut rig = rig(0, &[lif_neuron(0, 100.0, 0.0, 0)]);
        rig.engine.start().unwrap();
        rig.engine
            .inject(&mut rig.store, &mut rig.cache, 0, 10.0)
            .unwrap();
        for t in 1..5u64 {
            rig.engine
                .step(&mut rig.store, &mut rig.cache, &mut rig.queue, t * 1000)
                .unwrap();
        }
        assert_eq!(
            rig.cache.get(&mut rig.store, 0).unwrap().membrane_potential,
            10.0
        );
    }

    #[test]
    fn test_small_potential_clamps_to_zero() {
        let mut rig = rig(0, &[lif_neuron(0, 100.0, 0.001, 0)]);
        rig.engine.start().unwrap();
        rig.engine
            .inject(&mut rig.store, &mut rig.cache, 0, 0.5)
            .unwrap();

        // tau=1ms: each 1ms step decays by e^-1; a few steps cross the clamp
        for t in 1..12u64 {
            rig.engine
                .step(&mut rig.store, &mut rig.cache, &mut rig.queue, t * 1000)
                .unwrap();
        }
        assert_eq!(
            rig.cache.get(&mut rig.store, 0).unwrap().membrane_potential,
            0.0
        );
    }

    #[test]
    fn test_local_spike_chain() {
        // Neuron 0 drives neuron 1 on the same node with weight ~2
        let mut source = lif_neuron(0, 1.0, 0.0, 0);
        source
            .add_synapse(Synapse::new(GlobalNeuronId::new(0, 1), 127.0 / 63.5))
            .unwrap();
        let target = lif_neuron(1, 1.0, 0.0, 0);

        let mut rig = rig(0, &[source, target]);
        rig.engine.start().unwrap();
        rig.engine
            .inject(&mut rig.store, &mut rig.cache, 0, 1.5)
            .unwrap();

        // Step 1: neuron 0 fires, spike queued for neuron 1
        rig.engine
            .step(&mut rig.store, &mut rig.cache, &mut rig.queue, 1000)
            .unwrap();
        assert_eq!(rig.engine.stats().spikes_generated, 1);
        assert_eq!(rig.queue.len(), 1);

        // Step 2: the queued spike lands on neuron 1, which fires in turn
        rig.engine
            .step(&mut rig.store, &mut rig.cache, &mut rig.queue, 2000)
            .unwrap();
        assert_eq!(rig.engine.stats().spikes_generated, 2);
        assert_eq!(rig.engine.stats().spikes_processed, 2); // inject + delivery
    }

    #[test]
    fn test_remote_spike_forwarded() {
        let mut source = lif_neuron(0, 1.0, 0.0, 0);
        source
            .add_synapse(Synapse::new(GlobalNeuronId::new(4, 9), 1.0))
            .unwrap();
        let mut rig = rig(0, &[source]);
        rig.engine.start().unwrap();
        rig.engine
            .inject(&mut rig.store, &mut rig.cache, 0, 2.0)
            .unwrap();

        rig.engine
            .step(&mut rig.store, &mut rig.cache, &mut rig.queue, 1000)
            .unwrap();
        rig.engine
            .step(&mut rig.store, &mut rig.cache, &mut rig.queue, 2000)
            .unwrap();

        let forwarded = rig.engine.take_outbound().unwrap();
        assert_eq!(forwarded.target, GlobalNeuronId::new(4, 9));
        // Weight went through the byte codec on load
        assert!((forwarded.value - 1.0).abs() < 0.01);
        assert!(rig.engine.take_outbound().is_none());
    }

    #[test]
    fn test_inhibitory_weight_lowers_potential() {
        let mut source = lif_neuron(0, 1.0, 0.0, 0);
        source
            .add_synapse(Synapse::new(GlobalNeuronId::new(0, 1), -1.0))
            .unwrap();
        let mut target = lif_neuron(1, 10.0, 0.0, 0);
        target.membrane_potential = 0.0;

        let mut rig = rig(0, &[source, target]);
        rig.engine.start().unwrap();
        rig.engine
            .inject(&mut rig.store, &mut rig.cache, 0, 2.0)
            .unwrap();
        rig.engine
            .step(&mut rig.store, &mut rig.cache, &mut rig.queue, 1000)
            .unwrap();
        rig.engine
            .step(&mut rig.store, &mut rig.cache, &mut rig.queue, 2000)
            .unwrap();

        let v = rig.cache.get(&mut rig.store, 1).unwrap().membrane_potential;
        assert!((v + 1.0).abs() < 0.01);
    }

    #[test]
    fn test_inactive_neuron_skipped() {
        let mut dormant = lif_neuron(0, 0.5, 0.0, 0);
        dormant.flags = 0;
        dormant.membrane_potential = 5.0;
        let mut rig = rig(0, &[dormant]);
        rig.engine.start().unwrap();

        rig.engine
            .step(&mut rig.store, &mut rig.cache, &mut rig.queue, 1000)
            .unwrap();
        assert_eq!(rig.engine.stats().spikes_generated, 0);
    }

    #[test]
    fn test_periodic_flush_persists_state() {
        let mut rig = rig(0, &[lif_neuron(0, 100.0, 0.0, 0)]);
        rig.engine.start().unwrap();
        rig.engine
            .inject(&mut rig.store, &mut rig.cache, 0, 3.0)
            .unwrap();

        for t in 1..=FLUSH_INTERVAL_STEPS {
            rig.engine
                .step(&mut rig.store, &mut rig.cache, &mut rig.queue, t * 1000)
                .unwrap();
        }
        // The periodic flush made the mutation visible in the store
        assert_eq!(rig.store.read(0).unwrap().membrane_potential, 3.0);
    }

    #[test]
    fn test_stop_flushes_cache() {
        let mut rig = rig(0, &[lif_neuron(0, 100.0, 0.0, 0)]);
        rig.engine.start().unwrap();
        rig.engine
            .inject(&mut rig.store, &mut rig.cache, 0, 4.0)
            .unwrap();
        rig.engine.stop(&mut rig.store, &mut rig.cache).unwrap();

        assert_eq!(rig.store.read(0).unwrap().membrane_potential, 4.0);
    }

    #[test]
    fn test_inject_rejects_unknown_neuron() {
        let mut rig = rig(0, &[lif_neuron(0, 1.0, 0.0, 0)]);
        assert!(matches!(
            rig.engine.inject(&mut rig.store, &mut rig.cache, 7, 1.0),
            Err(NodeError::NeuronOutOfRange { id: 7, count: 1 })
        ));
    }

    #[test]
    fn test_spike_for_unknown_target_dropped() {
        let mut rig = rig(0, &[lif_neuron(0, 1.0, 0.0, 0)]);
        rig.engine.start().unwrap();
        rig.queue
            .push(SpikeEvent::new(GlobalNeuronId::new(0, 500), 100))
            .unwrap();

        rig.engine
            .step(&mut rig.store, &mut rig.cache, &mut rig.queue, 1000)
            .unwrap();
        assert_eq!(rig.engine.stats().spikes_dropped, 1);
        assert_eq!(rig.engine.state(), EngineState::Running);
    }
}
