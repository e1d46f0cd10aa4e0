use super::{Transport, TransportEvent};
use shared::{Channel, PeerId};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Default)]
struct MemoryPeer {
    round_trip: Option<Duration>,
    staged: Vec<(Channel, Vec<u8>)>,
    flushed: Vec<(Channel, Vec<u8>)>,
}

/// In-process transport. The test or harness plays the remote side by
/// connecting peers, delivering payloads and collecting what was flushed.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    next_peer: u64,
    peers: BTreeMap<PeerId, MemoryPeer>,
    events: VecDeque<TransportEvent>,
    flushes: u64,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new peer; the server sees it on its next poll.
    pub fn connect(&mut self) -> PeerId {
        self.next_peer += 1;
        let peer = PeerId(self.next_peer);
        self.peers.insert(peer, MemoryPeer::default());
        self.events.push_back(TransportEvent::Connected(peer));
        peer
    }

    /// Simulates the remote side going away or timing out.
    pub fn drop_peer(&mut self, peer: PeerId) {
        if self.peers.remove(&peer).is_some() {
            self.events.push_back(TransportEvent::Disconnected(peer));
        }
    }

    /// Delivers an inbound payload from `peer`.
    pub fn deliver(&mut self, peer: PeerId, payload: Vec<u8>) {
        if self.peers.contains_key(&peer) {
            self.events.push_back(TransportEvent::Received(peer, payload));
        }
    }

    pub fn set_round_trip_time(&mut self, peer: PeerId, rtt: Duration) {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.round_trip = Some(rtt);
        }
    }

    /// Takes everything flushed to `peer` so far, in send order.
    pub fn take_sent(&mut self, peer: PeerId) -> Vec<(Channel, Vec<u8>)> {
        self.peers
            .get_mut(&peer)
            .map(|state| std::mem::take(&mut state.flushed))
            .unwrap_or_default()
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.peers.contains_key(&peer)
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes
    }
}

impl Transport for MemoryTransport {
    fn poll_events(&mut self, events: &mut Vec<TransportEvent>) {
        events.extend(self.events.drain(..));
    }

    fn send(&mut self, peer: PeerId, payload: Vec<u8>, channel: Channel) {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.staged.push((channel, payload));
        }
    }

    fn flush(&mut self) {
        for state in self.peers.values_mut() {
            let staged = std::mem::take(&mut state.staged);
            state.flushed.extend(staged);
        }
        self.flushes += 1;
    }

    fn round_trip_time(&self, peer: PeerId) -> Option<Duration> {
        self.peers.get(&peer)?.round_trip
    }

    fn disconnect(&mut self, peer: PeerId) {
        self.peers.remove(&peer);
    }
}
