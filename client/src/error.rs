use shared::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid server address: {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("server did not answer within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    #[error("server refused the connection")]
    Rejected,

    #[error("not connected")]
    NotConnected,
}
