//! Headless UDP client
//!
//! Mirrors the server transport: a receiver task and a sender task move raw
//! datagrams, and [`Client::pump`] does everything else on the caller's task.
//! With a fake ping configured, frames in both directions pass through a
//! [`LatencyQueue`] holding half the ping each way.

use crate::error::ClientError;
use crate::latency::LatencyQueue;
use crate::replica::Replica;
use log::{debug, error, info, warn};
use shared::{
    decode, encode, ActionRecord, ControlState, Frame, Message, ObjectId, ReliableLink,
    MAX_DATAGRAM_SIZE, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

const HELLO_INTERVAL: Duration = Duration::from_millis(250);
const SERVER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Closed,
}

pub struct Client {
    server_addr: SocketAddr,
    inbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Vec<JoinHandle<()>>,
    link: ReliableLink,
    to_server: LatencyQueue<Frame>,
    from_server: LatencyQueue<Frame>,
    replica: Replica,
    state: ConnectionState,
    refused: bool,
    last_hello: Option<Instant>,
}

impl Client {
    /// Binds a local socket aimed at `server_addr`. No datagram is sent until
    /// the first [`Client::pump`].
    pub async fn new(server_addr: &str, fake_ping: Duration) -> Result<Self, ClientError> {
        let server_addr: SocketAddr = server_addr.parse()?;
        let bind_addr = if server_addr.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        socket.connect(server_addr).await?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            Self::spawn_receiver(Arc::clone(&socket), inbound_tx),
            Self::spawn_sender(socket, outbound_rx),
        ];

        let one_way = fake_ping / 2;
        Ok(Self {
            server_addr,
            inbound_rx,
            outbound_tx,
            tasks,
            link: ReliableLink::new(Instant::now()),
            to_server: LatencyQueue::new(one_way),
            from_server: LatencyQueue::new(one_way),
            replica: Replica::new(),
            state: ConnectionState::Connecting,
            refused: false,
            last_hello: None,
        })
    }

    /// Creates a client and pumps it until the server welcomes or refuses it.
    pub async fn connect(
        server_addr: &str,
        fake_ping: Duration,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut client = Self::new(server_addr, fake_ping).await?;
        info!("Connecting to {}...", client.server_addr);

        let deadline = Instant::now() + timeout;
        loop {
            client.pump(Instant::now());
            match client.state {
                ConnectionState::Connected => {
                    info!("Connected to {}", client.server_addr);
                    return Ok(client);
                }
                ConnectionState::Closed if client.refused => return Err(ClientError::Rejected),
                ConnectionState::Closed => return Err(ClientError::NotConnected),
                ConnectionState::Connecting if Instant::now() >= deadline => {
                    return Err(ClientError::HandshakeTimeout(timeout))
                }
                ConnectionState::Connecting => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    }

    fn spawn_receiver(
        socket: Arc<UdpSocket>,
        inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buffer = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                match socket.recv(&mut buffer).await {
                    Ok(len) => {
                        if inbound_tx.send(buffer[..len].to_vec()).is_err() {
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
        mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if let Err(e) = socket.send(&bytes).await {
                    error!("Failed to send datagram: {}", e);
                }
            }
        })
    }

    /// Moves frames through the latency queues, services the reliable link
    /// and releases due snapshots into the replica. Never blocks.
    pub fn pump(&mut self, now: Instant) {
        while let Ok(bytes) = self.inbound_rx.try_recv() {
            match decode::<Frame>(&bytes) {
                Ok(frame) => self.from_server.enqueue(frame, now),
                Err(e) => warn!("Failed to decode frame from server: {}", e),
            }
        }
        for frame in self.from_server.drain_ready(now) {
            self.handle_frame(frame, now);
        }

        match self.state {
            ConnectionState::Connecting => {
                let due = self
                    .last_hello
                    .map_or(true, |last| now.saturating_duration_since(last) >= HELLO_INTERVAL);
                if due {
                    self.last_hello = Some(now);
                    self.queue(
                        Frame::Hello {
                            protocol_version: PROTOCOL_VERSION,
                        },
                        now,
                    );
                }
            }
            ConnectionState::Connected => {
                for frame in self.link.due_retransmits(now) {
                    self.queue(frame, now);
                }
                if let Some(ping) = self.link.poll_ping(now) {
                    self.queue(ping, now);
                }
                if self.link.is_silent(now, SERVER_TIMEOUT) {
                    warn!("Server went silent; closing");
                    self.state = ConnectionState::Closed;
                } else if self.link.is_overloaded() {
                    warn!("Server stopped acking; closing");
                    self.state = ConnectionState::Closed;
                }
            }
            ConnectionState::Closed => {}
        }

        self.replica.update(now);

        for frame in self.to_server.drain_ready(now) {
            self.transmit(&frame);
        }
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        match frame {
            Frame::Welcome => {
                if self.state == ConnectionState::Connecting {
                    self.state = ConnectionState::Connected;
                    self.link = ReliableLink::new(now);
                }
            }
            Frame::Goodbye => {
                if self.state == ConnectionState::Connecting {
                    self.refused = true;
                }
                warn!("Server closed the connection");
                self.state = ConnectionState::Closed;
            }
            frame if self.state == ConnectionState::Connected => {
                let received = self.link.receive(frame, now);
                if let Some(reply) = received.reply {
                    self.queue(reply, now);
                }
                for payload in received.delivered {
                    match decode::<Message>(&payload) {
                        Ok(message) => self.replica.handle(message, now),
                        Err(e) => warn!("Dropping malformed message: {}", e),
                    }
                }
            }
            other => debug!("Ignoring {:?} before the handshake", other),
        }
    }

    fn queue(&mut self, frame: Frame, now: Instant) {
        self.to_server.enqueue(frame, now);
    }

    fn transmit(&self, frame: &Frame) {
        match encode(frame) {
            Ok(bytes) => {
                if self.outbound_tx.send(bytes).is_err() {
                    error!("Sender task is gone; dropping frame");
                }
            }
            Err(e) => error!("Failed to encode frame: {}", e),
        }
    }

    /// Queues a control action for an owned object over the reliable channel.
    pub fn send_action(
        &mut self,
        object_id: ObjectId,
        action: ActionRecord,
        now: Instant,
    ) -> Result<(), ClientError> {
        if self.state != ConnectionState::Connected {
            return Err(ClientError::NotConnected);
        }
        let payload = encode(&Message::ControlAction { object_id, action })?;
        let frame = self.link.reliable(payload, now);
        self.queue(frame, now);
        Ok(())
    }

    /// Tells the server goodbye, bypassing the latency queue.
    pub fn disconnect(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.transmit(&Frame::Goodbye);
        self.state = ConnectionState::Closed;
        info!("Disconnected from {}", self.server_addr);
    }

    /// Drives the first owned vehicle in a slow weave for `duration`, sending
    /// actions at `input_rate` per second and logging its replicated state.
    pub async fn run(&mut self, duration: Duration, input_rate: u32) -> Result<(), ClientError> {
        let started = Instant::now();
        let mut ticker = interval(Duration::from_secs_f64(1.0 / f64::from(input_rate.max(1))));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sent = ControlState::default();
        let mut inputs: u64 = 0;

        while started.elapsed() < duration {
            ticker.tick().await;
            let now = Instant::now();
            self.pump(now);
            if self.state == ConnectionState::Closed {
                return Err(ClientError::NotConnected);
            }

            let Some(vehicle) = self.replica.owned().next() else {
                continue;
            };
            let t = now.duration_since(started).as_secs_f32();
            let target = ControlState {
                steering_target: ((t * 0.8).sin() * 20.0).round() / 20.0,
                throttle: 0.6,
                brake: 0.0,
            };
            for action in changed_actions(&sent, &target) {
                self.send_action(vehicle, action, now)?;
            }
            sent = target;

            inputs += 1;
            if inputs % u64::from(input_rate.max(1)) == 0 {
                if let Some(object) = self.replica.object(vehicle) {
                    info!(
                        "{} at ({:.1}, {:.1}) heading {:.2}, rtt {:?}, {} objects in view",
                        vehicle,
                        object.state.position[0],
                        object.state.position[2],
                        object.state.heading,
                        self.link.round_trip_time(),
                        self.replica.len()
                    );
                }
            }
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.link.round_trip_time()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Actions needed to move the server's control state from `sent` to `target`.
fn changed_actions(sent: &ControlState, target: &ControlState) -> Vec<ActionRecord> {
    let mut actions = Vec::new();
    if sent.steering_target != target.steering_target {
        actions.push(ActionRecord::Steering(target.steering_target));
    }
    if sent.throttle != target.throttle {
        actions.push(ActionRecord::Throttle(target.throttle));
    }
    if sent.brake != target.brake {
        actions.push(ActionRecord::Brake(target.brake));
    }
    actions
}
