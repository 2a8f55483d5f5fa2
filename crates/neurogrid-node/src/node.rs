//! Node root object and command dispatcher
//!
//! One [`Node`] per device owns the whole firmware state: protocol
//! engine, multi-frame receiver, neuron store, cache, execution engine,
//! spike FIFO, and the deferred-response mailbox. The ATTN interrupt
//! handler dispatches into it through [`Node::handle_inbound`]; the main
//! loop drives [`Node::service`] roughly once a millisecond.
//!
//! The dispatcher never initiates a bus transaction: responses owed to a
//! sender (pong, status) are parked in the mailbox and sent by the next
//! `service` call.

use crate::{
    engine::LifEngine,
    error::NodeError,
    mailbox::ResponseSlot,
    spike::{SpikeEvent, SpikeQueue},
    Result,
};
use neurogrid_bus::{
    addr, cmd, multiframe, BusPhy, BusTimings, CompletedTransfer, FrameLink, Inbound, MatrixBus,
    Message, MultiFrameRx, PingDisposition, RxOutcome,
};
use neurogrid_hal::{Gpio, MonotonicClock, PsramDriver};
use neurogrid_store::{NeuronCache, NeuronStore, MAX_NEURONS_PER_NODE};

/// PSRAM address of the live neuron table
pub const TABLE_BASE_ADDR: u32 = 0x0000_0000;

/// PSRAM address where the controller stages incoming tables
pub const STAGING_ADDR: u32 = 0x0020_0000;

/// LED channels addressable over the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedChannel {
    /// Green channel
    Green,
    /// Red channel
    Red,
    /// Blue channel
    Blue,
}

/// Board peripherals the dispatcher can drive
///
/// The actual PWM and display sinks live outside the core; the default
/// methods discard everything.
pub trait Peripherals {
    /// Set an LED's PWM duty
    fn set_led(&mut self, _channel: LedChannel, _duty: u8) {}

    /// LED controller mode byte
    fn led_control(&mut self, _mode: u8) {}

    /// Emit a status report to the local display/log sink
    fn show_status(&mut self) {}
}

/// Peripherals implementation that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPeripherals;

impl Peripherals for NullPeripherals {}

/// Root object of one compute node
pub struct Node<P: PsramDriver, L: FrameLink, C: MonotonicClock> {
    bus: MatrixBus<L, C>,
    rx: MultiFrameRx,
    store: NeuronStore<P>,
    cache: NeuronCache,
    engine: LifEngine,
    queue: SpikeQueue,
    response: ResponseSlot,
    peripherals: Box<dyn Peripherals>,
    clock: C,
}

impl<P: PsramDriver, L: FrameLink, C: MonotonicClock> Node<P, L, C> {
    /// Bring a node up over its PSRAM, bus link, and clock
    pub fn new(psram: P, link: L, clock: C, timings: BusTimings) -> Result<Self> {
        let node_id = link.node_id();
        let store = NeuronStore::new(psram, TABLE_BASE_ADDR, MAX_NEURONS_PER_NODE)?;
        let mut engine = LifEngine::new();
        engine.init(node_id)?;

        Ok(Self {
            bus: MatrixBus::new(link, clock.clone(), timings),
            rx: MultiFrameRx::new(),
            store,
            cache: NeuronCache::new(),
            engine,
            queue: SpikeQueue::new(),
            response: ResponseSlot::new(),
            peripherals: Box::new(NullPeripherals),
            clock,
        })
    }

    /// Attach board peripherals
    pub fn with_peripherals(mut self, peripherals: Box<dyn Peripherals>) -> Self {
        self.peripherals = peripherals;
        self
    }

    /// This node's bus address
    pub fn node_id(&self) -> u8 {
        self.bus.node_id()
    }

    /// The execution engine, for status inspection
    pub fn engine(&self) -> &LifEngine {
        &self.engine
    }

    /// The neuron store
    pub fn store_mut(&mut self) -> &mut NeuronStore<P> {
        &mut self.store
    }

    /// Inbound spike FIFO depth
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Cache access counters
    pub fn cache_stats(&self) -> neurogrid_store::CacheStats {
        self.cache.stats()
    }

    /// Dispatch one latched bus transmission (ISR context)
    pub fn handle_inbound(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Message(msg) => self.handle_message(msg),
            Inbound::Broadcast { command, data } => self.dispatch(addr::BROADCAST, command, data),
        }
    }

    /// Route one targeted message through the transport, then the dispatcher
    pub fn handle_message(&mut self, msg: Message) {
        let now = self.clock.now_us();
        match self.rx.on_message(&msg, now) {
            Ok(RxOutcome::NotMine) => self.dispatch(msg.sender, msg.command, msg.data),
            Ok(RxOutcome::Consumed) => {}
            Ok(RxOutcome::Complete(done)) => self.finish_transfer(done),
            Err(err) => log::warn!("Transfer from {} dropped: {}", msg.sender, err),
        }
    }

    /// Drain link-queued inbound traffic
    ///
    /// On hardware inbound arrives through the ATTN interrupt and this
    /// returns 0; host loopback links queue messages here instead.
    pub fn poll_inbound(&mut self) -> usize {
        let mut handled = 0;
        while let Some(msg) = self.bus.link_mut().poll_inbound() {
            self.handle_message(msg);
            handled += 1;
        }
        handled
    }

    /// Foreground main-loop tick: send deferred work, then step the engine
    pub fn service(&mut self, now_us: u64) {
        if let Some((target, command, data)) = self.response.take() {
            if let Err(err) = self.bus.write(target, command, data) {
                log::warn!("Deferred response to {} failed: {}", target, err);
            }
        }

        while let Some(event) = self.engine.take_outbound() {
            let target_node = event.target.node_id();
            if let Err(err) = multiframe::send_payload(
                self.bus.link_mut(),
                target_node,
                cmd::SNN_SPIKE,
                &event.to_wire(),
            ) {
                log::warn!("Forwarding spike to node {} failed: {}", target_node, err);
            }
        }

        self.rx.check_timeout(now_us);

        if let Err(err) = self
            .engine
            .step(&mut self.store, &mut self.cache, &mut self.queue, now_us)
        {
            log::error!("Engine step failed: {}", err);
        }
    }

    fn finish_transfer(&mut self, done: CompletedTransfer) {
        match done.command {
            cmd::MEM_WRITE => {
                let payload = self.rx.payload();
                if payload.len() < 4 {
                    log::warn!("MEM_WRITE body too short: {} bytes", payload.len());
                    return;
                }
                let target_addr =
                    u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
                match self.store.raw_write(target_addr, &payload[4..]) {
                    Ok(()) => log::debug!(
                        "Wrote {} bytes to {:#010x}",
                        payload.len() - 4,
                        target_addr
                    ),
                    Err(err) => log::warn!("MEM_WRITE to {:#010x} failed: {}", target_addr, err),
                }
            }
            cmd::SNN_SPIKE => match SpikeEvent::from_wire(self.rx.payload()) {
                Some(event) => {
                    if self.queue.push(event).is_err() {
                        log::warn!("Spike queue full; dropping spike from node {}", done.source);
                    }
                }
                None => log::warn!(
                    "Malformed spike body from {}: {} bytes",
                    done.source,
                    done.len
                ),
            },
            other => log::warn!(
                "{}",
                NodeError::UnknownCommand {
                    code: other,
                    sender: done.source,
                }
            ),
        }
    }

    /// The command dispatcher: `(source, command, data)` to side effects
    fn dispatch(&mut self, source: u8, command: u8, data: u8) {
        match command {
            cmd::GREEN_LED => self.peripherals.set_led(LedChannel::Green, data),
            cmd::RED_LED => self.peripherals.set_led(LedChannel::Red, data),
            cmd::BLUE_LED => self.peripherals.set_led(LedChannel::Blue, data),
            cmd::LED_CONTROL => self.peripherals.led_control(data),
            cmd::STATUS => self.peripherals.show_status(),

            cmd::SNN_LOAD_TABLE => {
                // Count 0 means: find the terminator in the staging area
                let count = if data == 0 {
                    match self.store.scan_table_len(STAGING_ADDR) {
                        Ok(n) => n,
                        Err(err) => {
                            log::warn!("Table scan failed: {}", err);
                            return;
                        }
                    }
                } else {
                    data as u16
                };
                if let Err(err) =
                    self.engine
                        .load_network(&mut self.store, &mut self.cache, STAGING_ADDR, count)
                {
                    log::warn!("Load of {} neurons failed: {}", count, err);
                }
            }
            cmd::SNN_START => {
                if let Err(err) = self.engine.start() {
                    log::warn!("Start rejected: {}", err);
                }
            }
            cmd::SNN_STOP => {
                if let Err(err) = self.engine.stop(&mut self.store, &mut self.cache) {
                    log::warn!("Stop rejected: {}", err);
                }
            }
            cmd::SNN_INPUT_SPIKE => {
                if let Err(err) =
                    self.engine
                        .inject(&mut self.store, &mut self.cache, data as u16, 1.0)
                {
                    log::warn!("Input spike rejected: {}", err);
                }
            }
            cmd::SNN_GET_STATUS => {
                if source == addr::BROADCAST {
                    return;
                }
                if !self
                    .response
                    .post(source, cmd::STATUS, self.engine.state() as u8)
                {
                    log::warn!("Response slot occupied; dropping status reply to {}", source);
                }
            }
            cmd::SNN_SPIKE => {
                // Marker only; the event body arrives as a transfer
                log::debug!("Spike marker from node {}", data);
            }
            cmd::PING => match self.bus.on_ping_frame(source, data) {
                PingDisposition::Matched { .. } | PingDisposition::Unexpected => {}
                PingDisposition::Request => {
                    if source == addr::BROADCAST {
                        return;
                    }
                    if !self.response.post(source, cmd::PING, data) {
                        log::warn!("Response slot occupied; dropping pong to {}", source);
                    }
                }
            },

            other => log::warn!(
                "{}",
                NodeError::UnknownCommand {
                    code: other,
                    sender: source,
                }
            ),
        }
    }
}

impl<P, G, C> Node<P, BusPhy<G, C>, C>
where
    P: PsramDriver,
    G: Gpio,
    C: MonotonicClock,
{
    /// ATTN falling-edge ISR entry: receive and dispatch synchronously
    pub fn on_attn(&mut self) {
        match self.bus.link_mut().on_attn() {
            Ok(Some(inbound)) => self.handle_inbound(inbound),
            Ok(None) => {}
            Err(err) => log::debug!("Receive aborted: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineState;
    use neurogrid_bus::Result as BusResult;
    use neurogrid_hal::{MemoryPsram, SimClock};
    use neurogrid_store::{Neuron, NEURON_RECORD_SIZE};
    use std::collections::VecDeque;

    struct StubLink {
        node_id: u8,
        sent: Vec<(u8, u8, u8)>,
        inbox: VecDeque<Message>,
    }

    impl StubLink {
        fn new(node_id: u8) -> Self {
            Self {
                node_id,
                sent: Vec::new(),
                inbox: VecDeque::new(),
            }
        }
    }

    impl FrameLink for StubLink {
        fn node_id(&self) -> u8 {
            self.node_id
        }

        fn send(&mut self, target: u8, command: u8, data: u8) -> BusResult<()> {
            self.sent.push((target, command, data));
            Ok(())
        }

        fn broadcast(&mut self, command: u8, data: u8) -> BusResult<()> {
            self.sent.push((addr::BROADCAST, command, data));
            Ok(())
        }

        fn poll_inbound(&mut self) -> Option<Message> {
            self.inbox.pop_front()
        }
    }

    fn test_node(node_id: u8) -> Node<MemoryPsram, StubLink, SimClock> {
        Node::new(
            MemoryPsram::new(),
            StubLink::new(node_id),
            SimClock::new(),
            BusTimings::default(),
        )
        .unwrap()
    }

    /// Stage a small table over the raw path and commit it
    fn load_neurons(node: &mut Node<MemoryPsram, StubLink, SimClock>, neurons: &[Neuron]) {
        for (i, neuron) in neurons.iter().enumerate() {
            let mut record = [0u8; NEURON_RECORD_SIZE];
            neuron.to_bytes(&mut record).unwrap();
            node.store_mut()
                .raw_write(STAGING_ADDR + (i * NEURON_RECORD_SIZE) as u32, &record)
                .unwrap();
        }
        node.dispatch(addr::CONTROLLER, cmd::SNN_LOAD_TABLE, neurons.len() as u8);
        assert_eq!(node.engine().state(), EngineState::Loaded);
    }

    fn msg(sender: u8, command: u8, data: u8) -> Message {
        Message {
            sender,
            command,
            data,
        }
    }

    #[test]
    fn test_lifecycle_over_commands() {
        let mut node = test_node(3);
        load_neurons(&mut node, &[Neuron::new(0)]);

        node.handle_message(msg(addr::CONTROLLER, cmd::SNN_START, 0));
        assert_eq!(node.engine().state(), EngineState::Running);

        // Idempotent against repeats
        node.handle_message(msg(addr::CONTROLLER, cmd::SNN_START, 0));
        assert_eq!(node.engine().state(), EngineState::Running);

        node.handle_message(msg(addr::CONTROLLER, cmd::SNN_STOP, 0));
        node.handle_message(msg(addr::CONTROLLER, cmd::SNN_STOP, 0));
        assert_eq!(node.engine().state(), EngineState::Stopped);
    }

    #[test]
    fn test_broadcast_start() {
        let mut node = test_node(3);
        load_neurons(&mut node, &[Neuron::new(0)]);

        node.handle_inbound(Inbound::Broadcast {
            command: cmd::SNN_START,
            data: 0,
        });
        assert_eq!(node.engine().state(), EngineState::Running);
    }

    #[test]
    fn test_input_spike_raises_potential() {
        let mut node = test_node(3);
        let mut neuron = Neuron::new(0);
        neuron.threshold = 10.0;
        load_neurons(&mut node, &[neuron]);
        node.handle_message(msg(addr::CONTROLLER, cmd::SNN_START, 0));

        node.handle_message(msg(addr::CONTROLLER, cmd::SNN_INPUT_SPIKE, 0));
        node.service(1000);

        // Stop flushes the cache; the injection is visible in the store
        node.handle_message(msg(addr::CONTROLLER, cmd::SNN_STOP, 0));
        let flushed = node.store_mut().read(0).unwrap();
        assert_eq!(flushed.membrane_potential, 1.0);
    }

    #[test]
    fn test_ping_request_deferred_then_sent() {
        let mut node = test_node(3);

        node.handle_message(msg(addr::CONTROLLER, cmd::PING, 0xA5));
        // Nothing sent from the dispatch context
        assert!(node.bus.link_mut().sent.is_empty());

        node.service(1000);
        assert_eq!(
            node.bus.link_mut().sent,
            vec![(addr::CONTROLLER, cmd::PING, 0xA5)]
        );
    }

    #[test]
    fn test_status_request_reports_engine_state() {
        let mut node = test_node(3);
        load_neurons(&mut node, &[Neuron::new(0)]);

        node.handle_message(msg(addr::CONTROLLER, cmd::SNN_GET_STATUS, 0));
        node.service(1000);
        assert_eq!(
            node.bus.link_mut().sent,
            vec![(addr::CONTROLLER, cmd::STATUS, EngineState::Loaded as u8)]
        );
    }

    #[test]
    fn test_unknown_command_is_harmless() {
        let mut node = test_node(3);
        node.handle_message(msg(addr::CONTROLLER, 0x00, 0));
        node.handle_message(msg(addr::CONTROLLER, 0x7F, 9));
        assert!(node.bus.link_mut().sent.is_empty());
    }

    #[test]
    fn test_mem_write_transfer_lands_in_psram() {
        let mut node = test_node(3);
        let payload: Vec<u8> = (0..32u8).collect();

        let mut body = vec![0u8; 4];
        body[0..4].copy_from_slice(&0x0010_0000u32.to_le_bytes());
        body.extend_from_slice(&payload);

        // Feed the transfer through the receive state machine
        let mut sender = StubLink::new(addr::CONTROLLER);
        multiframe::send_payload(&mut sender, 3, cmd::MEM_WRITE, &body).unwrap();
        for (_, command, data) in sender.sent {
            node.handle_message(msg(addr::CONTROLLER, command, data));
        }

        let mut back = [0u8; 32];
        node.store_mut().raw_read(0x0010_0000, &mut back).unwrap();
        assert_eq!(back[..], payload[..]);
    }

    #[test]
    fn test_spike_transfer_enqueues_event() {
        let mut node = test_node(3);
        let event = SpikeEvent::new(neurogrid_store::GlobalNeuronId::new(3, 0), 500);

        let mut sender = StubLink::new(5);
        multiframe::send_payload(&mut sender, 3, cmd::SNN_SPIKE, &event.to_wire()).unwrap();
        for (_, command, data) in sender.sent {
            node.handle_message(msg(5, command, data));
        }

        assert_eq!(node.queue_depth(), 1);
    }

    #[test]
    fn test_led_commands_reach_peripherals() {
        use std::cell::RefCell;
        use std::rc::Rc;

        #[derive(Default)]
        struct RecordingLeds {
            calls: Rc<RefCell<Vec<(LedChannel, u8)>>>,
        }
        impl Peripherals for RecordingLeds {
            fn set_led(&mut self, channel: LedChannel, duty: u8) {
                self.calls.borrow_mut().push((channel, duty));
            }
        }

        let calls = Rc::new(RefCell::new(Vec::new()));
        let leds = RecordingLeds {
            calls: calls.clone(),
        };
        let mut node = test_node(3).with_peripherals(Box::new(leds));

        node.handle_message(msg(addr::CONTROLLER, cmd::GREEN_LED, 128));
        node.handle_message(msg(addr::CONTROLLER, cmd::RED_LED, 7));

        assert_eq!(
            *calls.borrow(),
            vec![(LedChannel::Green, 128), (LedChannel::Red, 7)]
        );
    }
}
