//! Targeted writes, ping matching, and topology discovery
//!
//! [`MatrixBus`] layers bookkeeping over a [`FrameLink`]: every ping it
//! sends is recorded in a small history ring, inbound ping responses are
//! matched against that history for round-trip timing, and discovery walks
//! the 16-node address space collecting a liveness bitmap.

use crate::{
    command::{addr, cmd, PING_PAYLOAD},
    config::BusTimings,
    error::Result,
    link::{FrameLink, Message},
};
use heapless::Deque;
use neurogrid_hal::MonotonicClock;

/// Entries kept in the ping history ring
pub const PING_HISTORY_CAPACITY: usize = 20;

/// Per-node poll window during discovery, milliseconds
const DISCOVERY_POLL_MS: u64 = 30;

#[derive(Debug, Clone, Copy)]
struct PingRecord {
    target: u8,
    payload: u8,
    sent_at_us: u64,
    active: bool,
}

/// History of outstanding pings and the responses matched against it
#[derive(Debug, Default)]
pub struct PingTracker {
    history: Deque<PingRecord, PING_HISTORY_CAPACITY>,
    rtt_us: [Option<u64>; 16],
}

impl PingTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            history: Deque::new(),
            rtt_us: [None; 16],
        }
    }

    /// Record a ping just sent to `target`
    pub fn record(&mut self, target: u8, payload: u8, now_us: u64) {
        if self.history.is_full() {
            self.history.pop_front();
        }
        // Capacity just made available
        let _ = self.history.push_back(PingRecord {
            target,
            payload,
            sent_at_us: now_us,
            active: true,
        });
    }

    /// Match an inbound response against the history
    ///
    /// A hit deactivates the entry and returns the round-trip time; a miss
    /// returns `None` and the caller logs the response as unexpected.
    pub fn match_response(
        &mut self,
        sender: u8,
        payload: u8,
        now_us: u64,
        window_us: u64,
    ) -> Option<u64> {
        for record in self.history.iter_mut() {
            if record.active
                && record.target == sender
                && record.payload == payload
                && now_us.saturating_sub(record.sent_at_us) <= window_us
            {
                record.active = false;
                let rtt = now_us - record.sent_at_us;
                if addr::is_node(sender) {
                    self.rtt_us[sender as usize] = Some(rtt);
                }
                return Some(rtt);
            }
        }
        None
    }

    /// Deactivate every entry for `target` and forget its round-trip time
    pub fn invalidate(&mut self, target: u8) {
        for record in self.history.iter_mut().filter(|r| r.target == target) {
            record.active = false;
        }
        if addr::is_node(target) {
            self.rtt_us[target as usize] = None;
        }
    }

    /// Round-trip time of the last matched ping to a node
    pub fn response_time(&self, target: u8) -> Option<u64> {
        if addr::is_node(target) {
            self.rtt_us[target as usize]
        } else {
            None
        }
    }
}

/// How an inbound `PING` frame was classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingDisposition {
    /// Response to one of our outstanding pings
    Matched {
        /// Round-trip time in microseconds
        rtt_us: u64,
    },
    /// A peer is pinging us; a pong is owed
    Request,
    /// Neither; logged and dropped
    Unexpected,
}

/// Bus protocol engine: one per endpoint, layered over the frame link
pub struct MatrixBus<L: FrameLink, C: MonotonicClock> {
    link: L,
    clock: C,
    timings: BusTimings,
    tracker: PingTracker,
}

impl<L: FrameLink, C: MonotonicClock> MatrixBus<L, C> {
    /// Create the engine over a link
    pub fn new(link: L, clock: C, timings: BusTimings) -> Self {
        Self {
            link,
            clock,
            timings,
            tracker: PingTracker::new(),
        }
    }

    /// This endpoint's bus address
    pub fn node_id(&self) -> u8 {
        self.link.node_id()
    }

    /// Access the underlying link (the ISR needs the PHY receive path)
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Configured timings
    pub fn timings(&self) -> &BusTimings {
        &self.timings
    }

    /// Send one targeted message
    pub fn write(&mut self, target: u8, command: u8, data: u8) -> Result<()> {
        self.link.send(target, command, data)
    }

    /// Send one broadcast word
    pub fn broadcast(&mut self, command: u8, data: u8) -> Result<()> {
        self.link.broadcast(command, data)
    }

    /// Record and send a ping to `target`
    pub fn ping(&mut self, target: u8) -> Result<()> {
        self.tracker
            .record(target, PING_PAYLOAD, self.clock.now_us());
        self.link.send(target, cmd::PING, PING_PAYLOAD)
    }

    /// Handle an inbound ping response
    ///
    /// Returns the round-trip time when the response matches an
    /// outstanding ping; an unmatched response is logged as unexpected.
    pub fn ping_response(&mut self, sender: u8, payload: u8) -> Option<u64> {
        let now = self.clock.now_us();
        let window_us = self.timings.ping_response_wait_ms * 1000;
        match self.tracker.match_response(sender, payload, now, window_us) {
            Some(rtt_us) => {
                log::debug!("Ping response from {} in {}us", sender, rtt_us);
                Some(rtt_us)
            }
            None => {
                log::warn!(
                    "Unexpected ping response from {} (payload {:#04x})",
                    sender,
                    payload
                );
                None
            }
        }
    }

    /// Whether an inbound ping response has been matched for `target`
    pub fn ping_satisfied(&self, target: u8) -> bool {
        self.tracker.response_time(target).is_some()
    }

    /// Classify an inbound `PING` frame
    ///
    /// A frame matching an outstanding ping is the response to it; a
    /// fresh frame with the handshake payload is a request this endpoint
    /// should answer; anything else is logged as unexpected.
    pub fn on_ping_frame(&mut self, sender: u8, payload: u8) -> PingDisposition {
        let now = self.clock.now_us();
        let window_us = self.timings.ping_response_wait_ms * 1000;
        if let Some(rtt_us) = self.tracker.match_response(sender, payload, now, window_us) {
            log::debug!("Ping response from {} in {}us", sender, rtt_us);
            return PingDisposition::Matched { rtt_us };
        }
        if payload == PING_PAYLOAD {
            return PingDisposition::Request;
        }
        log::warn!(
            "Unexpected ping response from {} (payload {:#04x})",
            sender,
            payload
        );
        PingDisposition::Unexpected
    }

    /// Scan the node address space and return the liveness bitmap
    ///
    /// For each candidate ID the prior history is invalidated, a ping is
    /// sent, and inbound frames are dispatched while polling for the
    /// matching response.
    pub fn discover(&mut self) -> [bool; 16] {
        let mut active = [false; 16];
        for id in 0..=addr::MAX_NODE_ID {
            self.tracker.invalidate(id);
            if let Err(err) = self.ping(id) {
                log::debug!("Ping to {} not sent: {}", id, err);
                continue;
            }

            let deadline = self.clock.now_us() + DISCOVERY_POLL_MS * 1000;
            while self.clock.now_us() < deadline {
                while let Some(msg) = self.link.poll_inbound() {
                    self.dispatch_polled(msg);
                }
                if self.tracker.response_time(id).is_some() {
                    active[id as usize] = true;
                    break;
                }
            }
            self.clock.delay_us(self.timings.ping_node_delay_ms * 1000);
        }

        log::info!(
            "Discovery complete: {} active nodes",
            active.iter().filter(|&&a| a).count()
        );
        active
    }

    fn dispatch_polled(&mut self, msg: Message) {
        if msg.command == cmd::PING {
            self.ping_response(msg.sender, msg.data);
        } else {
            log::debug!(
                "Dropping non-ping frame from {} during discovery poll ({:#04x})",
                msg.sender,
                msg.command
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BusError;
    use neurogrid_hal::SimClock;
    use std::collections::VecDeque;

    /// Loopback link where a configured set of peers answers pings
    struct EchoLink {
        node_id: u8,
        responders: [bool; 16],
        inbox: VecDeque<Message>,
        sent: Vec<(u8, u8, u8)>,
    }

    impl EchoLink {
        fn new(node_id: u8, responders: &[u8]) -> Self {
            let mut set = [false; 16];
            for &id in responders {
                set[id as usize] = true;
            }
            Self {
                node_id,
                responders: set,
                inbox: VecDeque::new(),
                sent: Vec::new(),
            }
        }
    }

    impl FrameLink for EchoLink {
        fn node_id(&self) -> u8 {
            self.node_id
        }

        fn send(&mut self, target: u8, command: u8, data: u8) -> Result<()> {
            self.sent.push((target, command, data));
            if command == cmd::PING && addr::is_node(target) {
                if self.responders[target as usize] {
                    self.inbox.push_back(Message {
                        sender: target,
                        command: cmd::PING,
                        data,
                    });
                } else {
                    return Err(BusError::AckTimeout { waited_us: 10_000 });
                }
            }
            Ok(())
        }

        fn broadcast(&mut self, _command: u8, _data: u8) -> Result<()> {
            Ok(())
        }

        fn poll_inbound(&mut self) -> Option<Message> {
            self.inbox.pop_front()
        }
    }

    fn controller_bus(responders: &[u8]) -> MatrixBus<EchoLink, SimClock> {
        MatrixBus::new(
            EchoLink::new(addr::CONTROLLER, responders),
            SimClock::with_tick(10),
            BusTimings::default(),
        )
    }

    #[test]
    fn test_ping_round_trip() {
        let mut bus = controller_bus(&[3]);

        bus.ping(3).unwrap();
        let msg = bus.link_mut().poll_inbound().unwrap();
        assert_eq!(msg.sender, 3);

        let rtt = bus.ping_response(msg.sender, msg.data);
        assert!(rtt.is_some());
        assert!(bus.ping_satisfied(3));
    }

    #[test]
    fn test_ping_frame_disposition() {
        let mut bus = controller_bus(&[3]);
        bus.ping(3).unwrap();
        let msg = bus.link_mut().poll_inbound().unwrap();

        assert!(matches!(
            bus.on_ping_frame(msg.sender, msg.data),
            PingDisposition::Matched { .. }
        ));
        // A fresh handshake frame is a request we should answer
        assert_eq!(bus.on_ping_frame(5, PING_PAYLOAD), PingDisposition::Request);
        // Odd payload with no matching history is unexpected
        assert_eq!(bus.on_ping_frame(5, 0x11), PingDisposition::Unexpected);
    }

    #[test]
    fn test_unmatched_response_rejected() {
        let mut bus = controller_bus(&[]);
        assert_eq!(bus.ping_response(5, PING_PAYLOAD), None);
    }

    #[test]
    fn test_response_outside_window_rejected() {
        let mut tracker = PingTracker::new();
        tracker.record(2, PING_PAYLOAD, 0);
        assert_eq!(
            tracker.match_response(2, PING_PAYLOAD, 2_000_000, 1_500_000),
            None
        );
    }

    #[test]
    fn test_invalidate_clears_history() {
        let mut tracker = PingTracker::new();
        tracker.record(2, PING_PAYLOAD, 0);
        tracker.invalidate(2);
        assert_eq!(tracker.match_response(2, PING_PAYLOAD, 100, 1_500_000), None);
        assert_eq!(tracker.response_time(2), None);
    }

    #[test]
    fn test_history_ring_evicts_oldest() {
        let mut tracker = PingTracker::new();
        for i in 0..(PING_HISTORY_CAPACITY as u64 + 4) {
            tracker.record((i % 16) as u8, PING_PAYLOAD, i);
        }
        // The first four records fell off the ring
        assert_eq!(tracker.match_response(0, PING_PAYLOAD, 20, u64::MAX), None);
        // A recent record still matches
        assert!(tracker
            .match_response(5, PING_PAYLOAD, 30, u64::MAX)
            .is_some());
    }

    #[test]
    fn test_discover_bitmap() {
        let mut bus = controller_bus(&[0, 3, 7]);
        let active = bus.discover();

        let expected: Vec<u8> = vec![0, 3, 7];
        for id in 0..16u8 {
            assert_eq!(
                active[id as usize],
                expected.contains(&id),
                "wrong liveness for node {}",
                id
            );
        }
    }

    #[test]
    fn test_discover_pings_every_candidate() {
        let mut bus = controller_bus(&[1]);
        bus.discover();

        let pings: Vec<u8> = bus
            .link_mut()
            .sent
            .iter()
            .filter(|(_, command, _)| *command == cmd::PING)
            .map(|(target, _, _)| *target)
            .collect();
        assert_eq!(pings, (0..16u8).collect::<Vec<_>>());
    }
}
