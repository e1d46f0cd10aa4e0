//! Types shared between the tick server and its clients.
//!
//! - [`protocol`]: application messages replicated between server and client
//! - [`frame`]: datagram framing used by the reference UDP transport
//! - [`link`]: per-peer reliability layer (sequencing, acks, RTT)
//! - [`codec`]: bincode encoding with a hard size limit

use serde::{Deserialize, Serialize};
use std::fmt;

pub mod codec;
pub mod frame;
pub mod link;
pub mod protocol;

pub use codec::{decode, encode, CodecError};
pub use frame::Frame;
pub use link::ReliableLink;
pub use protocol::{
    ActionRecord, Channel, ControlState, FieldChange, Message, ObjectKind, ObjectState,
    VehicleSettings,
};

/// Bumped whenever [`Frame`] or [`Message`] change shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default server tick rate in Hz.
pub const DEFAULT_TICK_RATE: u32 = 240;

/// Largest datagram either side will read or write.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Identifier of a simulation object, stable for the object's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u32);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}", self.0)
    }
}

/// Opaque transport-level peer identifier, stable for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}
