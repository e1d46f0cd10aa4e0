//! Dual-channel peer transport boundary
//!
//! The tick scheduler only ever polls: [`Transport::poll_events`] drains
//! whatever arrived since the last call and returns immediately, so a silent
//! peer can never stall the loop. Liveness timeouts belong to the transport
//! and surface as ordinary [`TransportEvent::Disconnected`] events.

use shared::{Channel, PeerId};
use std::time::Duration;

pub mod memory;
pub mod udp;

pub use memory::MemoryTransport;
pub use udp::UdpTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    Received(PeerId, Vec<u8>),
}

pub trait Transport {
    /// Appends every pending event to `events` without blocking.
    fn poll_events(&mut self, events: &mut Vec<TransportEvent>);

    /// Queues a payload; nothing leaves before [`Transport::flush`].
    fn send(&mut self, peer: PeerId, payload: Vec<u8>, channel: Channel);

    fn flush(&mut self);

    fn round_trip_time(&self, peer: PeerId) -> Option<Duration>;

    /// Drops a peer at the server's request. No disconnect event is raised
    /// for it; the caller performs its own cleanup.
    fn disconnect(&mut self, peer: PeerId);
}
