use serde::{Deserialize, Serialize};

/// Datagram framing for the reference UDP transport.
///
/// `Hello`/`Welcome`/`Goodbye` drive the connection handshake. `Reliable`
/// frames are acked and retransmitted until acked; `Unreliable` frames are
/// fire-and-forget. `Ping`/`Pong` echo the sender's clock for RTT sampling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Hello { protocol_version: u32 },
    Welcome,
    Goodbye,
    Reliable { seq: u64, payload: Vec<u8> },
    Ack { seq: u64 },
    Unreliable { payload: Vec<u8> },
    Ping { sent_micros: u64 },
    Pong { sent_micros: u64 },
}
