//! Per-peer reliability layer used by the reference UDP transport and client.
//!
//! Reliable payloads are sequenced, acked individually, retransmitted after a
//! timeout derived from the smoothed RTT, and delivered to the application in
//! send order through a reorder buffer. RTT is sampled from first-attempt acks
//! and from ping/pong echoes.
//!
//! Both directions are bounded. Reliable frames more than [`RECEIVE_WINDOW`]
//! ahead of the next expected sequence are dropped unacked, and once more
//! than [`MAX_IN_FLIGHT`] sent frames are waiting for acks the link reports
//! itself overloaded so its owner can drop the peer.

use crate::frame::Frame;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

const INITIAL_RTO: Duration = Duration::from_millis(200);
const MIN_RTO: Duration = Duration::from_millis(30);
const MAX_RTO: Duration = Duration::from_secs(2);
const PING_INTERVAL: Duration = Duration::from_millis(500);

/// Sequence numbers accepted ahead of the next one to deliver.
pub const RECEIVE_WINDOW: u64 = 512;

/// Unacked reliable frames tolerated before the link counts as overloaded.
pub const MAX_IN_FLIGHT: usize = 1024;

#[derive(Debug)]
struct InFlight {
    payload: Vec<u8>,
    last_sent: Instant,
    attempts: u32,
}

/// Payloads released to the application plus an optional frame to send back.
#[derive(Debug, Default)]
pub struct Received {
    pub delivered: Vec<Vec<u8>>,
    pub reply: Option<Frame>,
}

#[derive(Debug)]
pub struct ReliableLink {
    epoch: Instant,
    next_send_seq: u64,
    in_flight: BTreeMap<u64, InFlight>,
    next_recv_seq: u64,
    reorder: BTreeMap<u64, Vec<u8>>,
    out_of_window: u64,
    srtt: Option<Duration>,
    last_heard: Instant,
    last_ping: Option<Instant>,
}

impl ReliableLink {
    pub fn new(now: Instant) -> Self {
        Self {
            epoch: now,
            next_send_seq: 0,
            in_flight: BTreeMap::new(),
            next_recv_seq: 0,
            reorder: BTreeMap::new(),
            out_of_window: 0,
            srtt: None,
            last_heard: now,
            last_ping: None,
        }
    }

    /// Wraps a payload for reliable ordered delivery and tracks it until acked.
    pub fn reliable(&mut self, payload: Vec<u8>, now: Instant) -> Frame {
        let seq = self.next_send_seq;
        self.next_send_seq += 1;
        self.in_flight.insert(
            seq,
            InFlight {
                payload: payload.clone(),
                last_sent: now,
                attempts: 1,
            },
        );
        Frame::Reliable { seq, payload }
    }

    pub fn unreliable(payload: Vec<u8>) -> Frame {
        Frame::Unreliable { payload }
    }

    /// Processes one inbound frame. Handshake frames are the owner's business
    /// and only refresh liveness here.
    pub fn receive(&mut self, frame: Frame, now: Instant) -> Received {
        self.last_heard = now;
        let mut received = Received::default();

        match frame {
            Frame::Reliable { seq, payload } => {
                if seq >= self.next_recv_seq.saturating_add(RECEIVE_WINDOW) {
                    self.out_of_window += 1;
                    return received;
                }
                received.reply = Some(Frame::Ack { seq });
                if seq >= self.next_recv_seq {
                    self.reorder.entry(seq).or_insert(payload);
                }
                while let Some(payload) = self.reorder.remove(&self.next_recv_seq) {
                    received.delivered.push(payload);
                    self.next_recv_seq += 1;
                }
            }
            Frame::Ack { seq } => {
                if let Some(acked) = self.in_flight.remove(&seq) {
                    // Retransmitted frames give ambiguous samples.
                    if acked.attempts == 1 {
                        self.sample_rtt(now.saturating_duration_since(acked.last_sent));
                    }
                }
            }
            Frame::Unreliable { payload } => received.delivered.push(payload),
            Frame::Ping { sent_micros } => received.reply = Some(Frame::Pong { sent_micros }),
            Frame::Pong { sent_micros } => {
                let sent = self.epoch + Duration::from_micros(sent_micros);
                self.sample_rtt(now.saturating_duration_since(sent));
            }
            Frame::Hello { .. } | Frame::Welcome | Frame::Goodbye => {}
        }

        received
    }

    /// Frames whose retransmission timeout has elapsed.
    pub fn due_retransmits(&mut self, now: Instant) -> Vec<Frame> {
        let rto = self.retransmit_timeout();
        let mut frames = Vec::new();
        for (seq, pending) in self.in_flight.iter_mut() {
            if now.saturating_duration_since(pending.last_sent) >= rto {
                pending.last_sent = now;
                pending.attempts += 1;
                frames.push(Frame::Reliable {
                    seq: *seq,
                    payload: pending.payload.clone(),
                });
            }
        }
        frames
    }

    /// Returns a ping when the ping interval has elapsed.
    pub fn poll_ping(&mut self, now: Instant) -> Option<Frame> {
        let due = self
            .last_ping
            .map_or(true, |last| now.saturating_duration_since(last) >= PING_INTERVAL);
        if !due {
            return None;
        }
        self.last_ping = Some(now);
        let sent_micros = now.saturating_duration_since(self.epoch).as_micros() as u64;
        Some(Frame::Ping { sent_micros })
    }

    pub fn round_trip_time(&self) -> Option<Duration> {
        self.srtt
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// True once the peer has left more than [`MAX_IN_FLIGHT`] frames unacked.
    pub fn is_overloaded(&self) -> bool {
        self.in_flight.len() > MAX_IN_FLIGHT
    }

    /// Reliable frames dropped for landing beyond the receive window.
    pub fn out_of_window(&self) -> u64 {
        self.out_of_window
    }

    /// Payloads held back waiting for a gap to fill.
    pub fn buffered(&self) -> usize {
        self.reorder.len()
    }

    pub fn is_silent(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_heard) > timeout
    }

    fn retransmit_timeout(&self) -> Duration {
        match self.srtt {
            Some(srtt) => (srtt * 2).clamp(MIN_RTO, MAX_RTO),
            None => INITIAL_RTO,
        }
    }

    fn sample_rtt(&mut self, sample: Duration) {
        self.srtt = Some(match self.srtt {
            Some(srtt) => (srtt * 7 + sample) / 8,
            None => sample,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_of(frame: &Frame) -> Vec<u8> {
        match frame {
            Frame::Reliable { payload, .. } => payload.clone(),
            other => panic!("expected reliable frame, got {:?}", other),
        }
    }

    #[test]
    fn test_reliable_delivery_is_ordered() {
        let now = Instant::now();
        let mut sender = ReliableLink::new(now);
        let mut receiver = ReliableLink::new(now);

        let a = sender.reliable(vec![1], now);
        let b = sender.reliable(vec![2], now);
        let c = sender.reliable(vec![3], now);

        // b and c arrive before a
        assert!(receiver.receive(b, now).delivered.is_empty());
        assert!(receiver.receive(c, now).delivered.is_empty());
        let received = receiver.receive(a, now);
        assert_eq!(received.delivered, vec![vec![1], vec![2], vec![3]]);
    }

    #[test]
    fn test_duplicate_reliable_is_acked_but_not_redelivered() {
        let now = Instant::now();
        let mut sender = ReliableLink::new(now);
        let mut receiver = ReliableLink::new(now);

        let frame = sender.reliable(vec![7], now);
        assert_eq!(receiver.receive(frame.clone(), now).delivered.len(), 1);

        let again = receiver.receive(frame, now);
        assert!(again.delivered.is_empty());
        assert_eq!(again.reply, Some(Frame::Ack { seq: 0 }));
    }

    #[test]
    fn test_ack_clears_in_flight_and_samples_rtt() {
        let now = Instant::now();
        let mut sender = ReliableLink::new(now);
        let frame = sender.reliable(vec![1], now);
        assert_eq!(sender.in_flight(), 1);

        let seq = match frame {
            Frame::Reliable { seq, .. } => seq,
            _ => unreachable!(),
        };
        sender.receive(Frame::Ack { seq }, now + Duration::from_millis(40));

        assert_eq!(sender.in_flight(), 0);
        assert_eq!(sender.round_trip_time(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_unacked_frames_are_retransmitted_after_timeout() {
        let now = Instant::now();
        let mut sender = ReliableLink::new(now);
        let frame = sender.reliable(vec![5], now);

        assert!(sender.due_retransmits(now + Duration::from_millis(10)).is_empty());

        let resent = sender.due_retransmits(now + INITIAL_RTO);
        assert_eq!(resent.len(), 1);
        assert_eq!(payload_of(&resent[0]), payload_of(&frame));
    }

    #[test]
    fn test_ping_pong_measures_rtt() {
        let now = Instant::now();
        let mut client = ReliableLink::new(now);
        let mut server = ReliableLink::new(now);

        let ping = client.poll_ping(now).unwrap();
        assert!(client.poll_ping(now + Duration::from_millis(1)).is_none());

        let pong = server.receive(ping, now).reply.unwrap();
        client.receive(pong, now + Duration::from_millis(30));

        assert_eq!(client.round_trip_time(), Some(Duration::from_millis(30)));
    }

    #[test]
    fn test_frames_beyond_receive_window_are_dropped() {
        let now = Instant::now();
        let mut receiver = ReliableLink::new(now);

        for k in 1..=1000u64 {
            let received = receiver.receive(
                Frame::Reliable {
                    seq: k * 1000,
                    payload: vec![0; 1024],
                },
                now,
            );
            assert!(received.delivered.is_empty());
            assert!(received.reply.is_none());
        }
        assert_eq!(receiver.buffered(), 0);
        assert_eq!(receiver.out_of_window(), 1000);

        let edge = receiver.receive(
            Frame::Reliable {
                seq: RECEIVE_WINDOW - 1,
                payload: vec![1],
            },
            now,
        );
        assert_eq!(edge.reply, Some(Frame::Ack { seq: RECEIVE_WINDOW - 1 }));
        assert_eq!(receiver.buffered(), 1);
    }

    #[test]
    fn test_unacked_backlog_overloads_link() {
        let now = Instant::now();
        let mut sender = ReliableLink::new(now);
        for _ in 0..MAX_IN_FLIGHT {
            sender.reliable(vec![0], now);
        }
        assert!(!sender.is_overloaded());

        sender.reliable(vec![0], now);
        assert!(sender.is_overloaded());

        sender.receive(Frame::Ack { seq: 0 }, now);
        assert!(!sender.is_overloaded());
    }

    #[test]
    fn test_silence_detection() {
        let now = Instant::now();
        let link = ReliableLink::new(now);
        assert!(!link.is_silent(now + Duration::from_secs(1), Duration::from_secs(5)));
        assert!(link.is_silent(now + Duration::from_secs(6), Duration::from_secs(5)));
    }
}
