use crate::MAX_DATAGRAM_SIZE;
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode: {0}")]
    Encode(bincode::Error),
    #[error("failed to decode: {0}")]
    Decode(bincode::Error),
}

fn options() -> impl Options {
    // Size limit keeps a forged length prefix from allocating unbounded memory.
    bincode::DefaultOptions::new().with_limit(MAX_DATAGRAM_SIZE as u64)
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    options().serialize(value).map_err(CodecError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    options().deserialize(bytes).map_err(CodecError::Decode)
}
