//! Controller-side cluster orchestration
//!
//! The controller is a bus endpoint like any other; it never runs the
//! execution engine. It discovers nodes, streams serialized neuron tables
//! into each node's staging area with `MEM_WRITE` transfers, commits them
//! with `SNN_LOAD_TABLE`, and drives start/stop/injection. All waiting is
//! cooperative: requests are fire-and-forget and responses are collected
//! by polling, matching the no-blocking-in-dispatch rule on the nodes.

use crate::{
    error::Result,
    node::STAGING_ADDR,
};
use neurogrid_bus::{
    cmd, multiframe, BusTimings, FrameLink, MatrixBus, PingDisposition, MULTIFRAME_BUFFER_SIZE,
};
use neurogrid_hal::MonotonicClock;
use neurogrid_store::{Neuron, StoreError, MAX_NEURONS_PER_NODE, NEURON_RECORD_SIZE, TABLE_END_ID};

/// Records per `MEM_WRITE` transfer, bounded by the reassembly buffer
/// less the 4-byte address prefix
const RECORDS_PER_TRANSFER: usize = (MULTIFRAME_BUFFER_SIZE - 4) / NEURON_RECORD_SIZE;

/// The cluster controller endpoint
pub struct Controller<L: FrameLink, C: MonotonicClock> {
    bus: MatrixBus<L, C>,
    last_status: Option<(u8, u8)>,
}

impl<L: FrameLink, C: MonotonicClock> Controller<L, C> {
    /// Create a controller over a bus link
    pub fn new(link: L, clock: C, timings: BusTimings) -> Self {
        Self {
            bus: MatrixBus::new(link, clock, timings),
            last_status: None,
        }
    }

    /// Scan the address space for live nodes
    pub fn discover(&mut self) -> [bool; 16] {
        self.bus.discover()
    }

    /// Stream a neuron table into `target`'s staging area and commit it
    ///
    /// Records are shipped in staging-address-prefixed `MEM_WRITE`
    /// transfers, followed by the `0xFFFF` terminator record and the
    /// `SNN_LOAD_TABLE` commit. Tables longer than 255 records commit
    /// with count 0, telling the node to scan for the terminator.
    pub fn deploy_network(&mut self, target: u8, neurons: &[Neuron]) -> Result<()> {
        if neurons.len() > MAX_NEURONS_PER_NODE as usize {
            return Err(StoreError::out_of_range(
                neurons.len() as u16,
                MAX_NEURONS_PER_NODE,
            )
            .into());
        }

        let mut offset = 0u32;
        for group in neurons.chunks(RECORDS_PER_TRANSFER) {
            let mut body = Vec::with_capacity(4 + group.len() * NEURON_RECORD_SIZE);
            body.extend_from_slice(&(STAGING_ADDR + offset).to_le_bytes());
            for neuron in group {
                let mut record = [0u8; NEURON_RECORD_SIZE];
                neuron.to_bytes(&mut record)?;
                body.extend_from_slice(&record);
            }
            multiframe::send_payload(self.bus.link_mut(), target, cmd::MEM_WRITE, &body)?;
            offset += (group.len() * NEURON_RECORD_SIZE) as u32;
        }

        let mut body = Vec::with_capacity(4 + NEURON_RECORD_SIZE);
        body.extend_from_slice(&(STAGING_ADDR + offset).to_le_bytes());
        let mut terminator = [0u8; NEURON_RECORD_SIZE];
        terminator[0..2].copy_from_slice(&TABLE_END_ID.to_le_bytes());
        body.extend_from_slice(&terminator);
        multiframe::send_payload(self.bus.link_mut(), target, cmd::MEM_WRITE, &body)?;

        let count_byte = if neurons.len() > u8::MAX as usize {
            0
        } else {
            neurons.len() as u8
        };
        self.bus.write(target, cmd::SNN_LOAD_TABLE, count_byte)?;

        log::info!("Deployed {} neurons to node {}", neurons.len(), target);
        Ok(())
    }

    /// Start one node's engine
    pub fn start(&mut self, target: u8) -> Result<()> {
        self.bus.write(target, cmd::SNN_START, 0)?;
        Ok(())
    }

    /// Start every node at once
    pub fn start_all(&mut self) -> Result<()> {
        self.bus.broadcast(cmd::SNN_START, 0)?;
        Ok(())
    }

    /// Stop one node's engine
    pub fn stop(&mut self, target: u8) -> Result<()> {
        self.bus.write(target, cmd::SNN_STOP, 0)?;
        Ok(())
    }

    /// Stop every node at once
    pub fn stop_all(&mut self) -> Result<()> {
        self.bus.broadcast(cmd::SNN_STOP, 0)?;
        Ok(())
    }

    /// Inject a unit spike into a local neuron on `target`
    pub fn inject_spike(&mut self, target: u8, local_id: u8) -> Result<()> {
        self.bus.write(target, cmd::SNN_INPUT_SPIKE, local_id)?;
        Ok(())
    }

    /// Ask `target` for a deferred status response
    pub fn request_status(&mut self, target: u8) -> Result<()> {
        self.bus.write(target, cmd::SNN_GET_STATUS, 0)?;
        Ok(())
    }

    /// Drain link-queued inbound traffic: match pings, stash status
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        while let Some(msg) = self.bus.link_mut().poll_inbound() {
            handled += 1;
            match msg.command {
                cmd::PING => {
                    if self.bus.on_ping_frame(msg.sender, msg.data) == PingDisposition::Request {
                        // Controller runs foreground-only; answer directly
                        if let Err(err) = self.bus.write(msg.sender, cmd::PING, msg.data) {
                            log::warn!("Pong to {} failed: {}", msg.sender, err);
                        }
                    }
                }
                cmd::STATUS => {
                    self.last_status = Some((msg.sender, msg.data));
                }
                other => {
                    log::debug!("Ignoring {:#04x} from {}", other, msg.sender);
                }
            }
        }
        handled
    }

    /// Take the most recent `(node, engine state)` status response
    pub fn take_status(&mut self) -> Option<(u8, u8)> {
        self.last_status.take()
    }

    /// Whether a ping response has been matched for `target`
    pub fn ping_satisfied(&self, target: u8) -> bool {
        self.bus.ping_satisfied(target)
    }

    /// Send a recorded ping to `target`
    pub fn ping(&mut self, target: u8) -> Result<()> {
        self.bus.ping(target)?;
        Ok(())
    }

    /// Access the underlying protocol engine
    pub fn bus_mut(&mut self) -> &mut MatrixBus<L, C> {
        &mut self.bus
    }
}
