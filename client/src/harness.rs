//! In-process server plus clients joined by latency queues
//!
//! Each [`LocalHarness::step`] moves client traffic that has reached the
//! server into the transport, runs one server tick, then moves server traffic
//! that has reached each client into its [`Replica`]. Both directions use the
//! same one-way delay, and the in-memory transport reports twice that as the
//! round trip so measured playout policies see a realistic link.

use crate::latency::LatencyQueue;
use crate::replica::Replica;
use log::warn;
use server::scheduler::{TickReport, TickScheduler};
use server::simulation::Simulation;
use server::transport::MemoryTransport;
use shared::{decode, encode, ActionRecord, CodecError, Message, ObjectId, PeerId};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

struct LocalClient {
    to_server: LatencyQueue<Vec<u8>>,
    to_client: LatencyQueue<Vec<u8>>,
    replica: Replica,
}

pub struct LocalHarness<S> {
    scheduler: TickScheduler<MemoryTransport, S>,
    clients: BTreeMap<PeerId, LocalClient>,
    one_way_delay: Duration,
}

impl<S: Simulation> LocalHarness<S> {
    pub fn new(scheduler: TickScheduler<MemoryTransport, S>, one_way_delay: Duration) -> Self {
        Self {
            scheduler,
            clients: BTreeMap::new(),
            one_way_delay,
        }
    }

    /// Opens a client. The server sees it on the next step.
    pub fn connect(&mut self) -> PeerId {
        let transport = self.scheduler.transport_mut();
        let peer = transport.connect();
        transport.set_round_trip_time(peer, self.one_way_delay * 2);
        self.clients.insert(
            peer,
            LocalClient {
                to_server: LatencyQueue::new(self.one_way_delay),
                to_client: LatencyQueue::new(self.one_way_delay),
                replica: Replica::new(),
            },
        );
        peer
    }

    /// Drops a client as if its connection timed out.
    pub fn disconnect(&mut self, peer: PeerId) {
        self.clients.remove(&peer);
        self.scheduler.transport_mut().drop_peer(peer);
    }

    pub fn send_action(
        &mut self,
        peer: PeerId,
        object_id: ObjectId,
        action: ActionRecord,
        now: Instant,
    ) -> Result<(), CodecError> {
        let payload = encode(&Message::ControlAction { object_id, action })?;
        if let Some(client) = self.clients.get_mut(&peer) {
            client.to_server.enqueue(payload, now);
        }
        Ok(())
    }

    /// Delivers arrived client traffic, ticks the server once and feeds
    /// arrived server traffic to the replicas.
    pub fn step(&mut self, now: Instant) -> TickReport {
        for (peer, client) in &mut self.clients {
            for payload in client.to_server.drain_ready(now) {
                self.scheduler.transport_mut().deliver(*peer, payload);
            }
        }

        let report = self.scheduler.tick();

        for (peer, client) in &mut self.clients {
            for (_, payload) in self.scheduler.transport_mut().take_sent(*peer) {
                client.to_client.enqueue(payload, now);
            }
            for payload in client.to_client.drain_ready(now) {
                match decode::<Message>(&payload) {
                    Ok(message) => client.replica.handle(message, now),
                    Err(e) => warn!("Dropping malformed message for {}: {}", peer, e),
                }
            }
            client.replica.update(now);
        }
        report
    }

    /// Steps at a fixed interval, advancing a synthetic clock.
    pub fn run_for(&mut self, start: Instant, interval: Duration, steps: usize) -> Instant {
        let mut now = start;
        for _ in 0..steps {
            now += interval;
            self.step(now);
        }
        now
    }

    pub fn replica(&self, peer: PeerId) -> Option<&Replica> {
        self.clients.get(&peer).map(|client| &client.replica)
    }

    pub fn scheduler(&self) -> &TickScheduler<MemoryTransport, S> {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut TickScheduler<MemoryTransport, S> {
        &mut self.scheduler
    }
}
