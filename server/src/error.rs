use shared::{CodecError, ObjectId, PeerId};
use thiserror::Error;

/// Failures reported back to the caller. Protocol violations from peers are
/// never surfaced here; they are counted and dropped inside the tick.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("{object} is already owned by {owner}")]
    OwnershipConflict { object: ObjectId, owner: PeerId },

    #[error("no session for {0}")]
    UnknownPeer(PeerId),

    #[error("server full ({0} sessions)")]
    ServerFull(usize),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}
