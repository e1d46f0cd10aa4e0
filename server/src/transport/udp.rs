//! UDP transport: one socket, a receiver task and a sender task
//!
//! The socket tasks only move raw datagrams. Framing, the handshake and the
//! per-peer [`ReliableLink`] state live on the tick side and are driven from
//! [`Transport::poll_events`] and [`Transport::flush`].

use super::{Transport, TransportEvent};
use crate::error::ServerError;
use log::{debug, error, info, warn};
use shared::{
    decode, encode, Channel, Frame, PeerId, ReliableLink, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Datagram = (Vec<u8>, SocketAddr);

struct UdpPeer {
    addr: SocketAddr,
    link: ReliableLink,
}

pub struct UdpTransport {
    local_addr: SocketAddr,
    inbound_rx: mpsc::UnboundedReceiver<Datagram>,
    outbound_tx: mpsc::UnboundedSender<Datagram>,
    peers: HashMap<PeerId, UdpPeer>,
    by_addr: HashMap<SocketAddr, PeerId>,
    next_peer: u64,
    peer_timeout: Duration,
    staged: Vec<Datagram>,
    tasks: Vec<JoinHandle<()>>,
}

impl UdpTransport {
    /// Binds the socket and spawns the network tasks on the current runtime.
    pub async fn bind(addr: &str, peer_timeout: Duration) -> Result<Self, ServerError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!("Listening on {}", local_addr);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let tasks = vec![
            Self::spawn_receiver(Arc::clone(&socket), inbound_tx),
            Self::spawn_sender(socket, outbound_rx),
        ];

        Ok(Self {
            local_addr,
            inbound_rx,
            outbound_tx,
            peers: HashMap::new(),
            by_addr: HashMap::new(),
            next_peer: 0,
            peer_timeout,
            staged: Vec::new(),
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn spawn_receiver(
        socket: Arc<UdpSocket>,
        inbound_tx: mpsc::UnboundedSender<Datagram>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if inbound_tx.send((buffer[..len].to_vec(), addr)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving datagram: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        })
    }

    fn spawn_sender(
        socket: Arc<UdpSocket>,
        mut outbound_rx: mpsc::UnboundedReceiver<Datagram>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some((bytes, addr)) = outbound_rx.recv().await {
                if let Err(e) = socket.send_to(&bytes, addr).await {
                    error!("Failed to send datagram to {}: {}", addr, e);
                }
            }
        })
    }

    fn stage(&mut self, frame: &Frame, addr: SocketAddr) {
        match encode(frame) {
            Ok(bytes) => self.staged.push((bytes, addr)),
            Err(e) => error!("Dropping frame for {}: {}", addr, e),
        }
    }

    fn send_now(&self, frame: &Frame, addr: SocketAddr) {
        match encode(frame) {
            Ok(bytes) => {
                if self.outbound_tx.send((bytes, addr)).is_err() {
                    error!("Sender task is gone; dropping frame for {}", addr);
                }
            }
            Err(e) => error!("Dropping frame for {}: {}", addr, e),
        }
    }

    fn accept(&mut self, addr: SocketAddr, now: Instant, events: &mut Vec<TransportEvent>) {
        self.next_peer += 1;
        let peer = PeerId(self.next_peer);
        self.peers.insert(
            peer,
            UdpPeer {
                addr,
                link: ReliableLink::new(now),
            },
        );
        self.by_addr.insert(addr, peer);
        info!("{} connected from {}", peer, addr);
        self.send_now(&Frame::Welcome, addr);
        events.push(TransportEvent::Connected(peer));
    }

    fn remove(&mut self, peer: PeerId) -> Option<SocketAddr> {
        let removed = self.peers.remove(&peer)?;
        self.by_addr.remove(&removed.addr);
        Some(removed.addr)
    }

    fn handle_datagram(
        &mut self,
        bytes: &[u8],
        addr: SocketAddr,
        now: Instant,
        events: &mut Vec<TransportEvent>,
    ) {
        let frame = match decode::<Frame>(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to decode frame from {}: {}", addr, e);
                return;
            }
        };

        let Some(&peer) = self.by_addr.get(&addr) else {
            match frame {
                Frame::Hello { protocol_version } if protocol_version == PROTOCOL_VERSION => {
                    self.accept(addr, now, events)
                }
                Frame::Hello { protocol_version } => {
                    warn!(
                        "Rejecting {}: protocol version {} (expected {})",
                        addr, protocol_version, PROTOCOL_VERSION
                    );
                    self.send_now(&Frame::Goodbye, addr);
                }
                other => debug!("Ignoring {:?} from unknown address {}", other, addr),
            }
            return;
        };

        match frame {
            // The Welcome was lost; repeat it.
            Frame::Hello { .. } => self.send_now(&Frame::Welcome, addr),
            Frame::Goodbye => {
                info!("{} said goodbye", peer);
                self.remove(peer);
                events.push(TransportEvent::Disconnected(peer));
            }
            frame => {
                let Some(state) = self.peers.get_mut(&peer) else {
                    return;
                };
                let received = state.link.receive(frame, now);
                if let Some(reply) = received.reply {
                    self.send_now(&reply, addr);
                }
                events.extend(
                    received
                        .delivered
                        .into_iter()
                        .map(|payload| TransportEvent::Received(peer, payload)),
                );
            }
        }
    }

    /// Drops peers that went silent or stopped acking reliable frames.
    fn check_links(&mut self, now: Instant, events: &mut Vec<TransportEvent>) {
        let timed_out: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, state)| state.link.is_silent(now, self.peer_timeout))
            .map(|(peer, _)| *peer)
            .collect();
        let overloaded: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, state)| state.link.is_overloaded())
            .map(|(peer, _)| *peer)
            .collect();

        for peer in timed_out {
            if let Some(addr) = self.remove(peer) {
                info!("{} at {} timed out", peer, addr);
                events.push(TransportEvent::Disconnected(peer));
            }
        }
        for peer in overloaded {
            if let Some(addr) = self.remove(peer) {
                warn!("{} at {} left too many frames unacked; dropping", peer, addr);
                self.send_now(&Frame::Goodbye, addr);
                events.push(TransportEvent::Disconnected(peer));
            }
        }
    }
}

impl Transport for UdpTransport {
    fn poll_events(&mut self, events: &mut Vec<TransportEvent>) {
        let now = Instant::now();
        while let Ok((bytes, addr)) = self.inbound_rx.try_recv() {
            self.handle_datagram(&bytes, addr, now, events);
        }
        self.check_links(now, events);
    }

    fn send(&mut self, peer: PeerId, payload: Vec<u8>, channel: Channel) {
        let Some(state) = self.peers.get_mut(&peer) else {
            debug!("Dropping payload for disconnected {}", peer);
            return;
        };
        let addr = state.addr;
        let frame = match channel {
            Channel::Reliable => state.link.reliable(payload, Instant::now()),
            Channel::Unreliable => ReliableLink::unreliable(payload),
        };
        self.stage(&frame, addr);
    }

    fn flush(&mut self) {
        let now = Instant::now();
        let mut control = Vec::new();
        for state in self.peers.values_mut() {
            for frame in state.link.due_retransmits(now) {
                control.push((frame, state.addr));
            }
            if let Some(ping) = state.link.poll_ping(now) {
                control.push((ping, state.addr));
            }
        }
        for (frame, addr) in &control {
            self.stage(frame, *addr);
        }

        for datagram in self.staged.drain(..) {
            if self.outbound_tx.send(datagram).is_err() {
                error!("Sender task is gone; dropping outbound datagrams");
                break;
            }
        }
    }

    fn round_trip_time(&self, peer: PeerId) -> Option<Duration> {
        self.peers.get(&peer)?.link.round_trip_time()
    }

    fn disconnect(&mut self, peer: PeerId) {
        if let Some(addr) = self.remove(peer) {
            info!("Disconnecting {} at {}", peer, addr);
            self.send_now(&Frame::Goodbye, addr);
        }
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
