//! Value encoding and deep cloning.
//!
//! The codec is the engine's serializer: it turns models, commands, and
//! results into bytes for snapshots and journal entries, and deep-clones
//! values by round-tripping them. Round-trip cloning is the correct deep copy
//! here: it severs `Arc`/`Rc` sharing that a plain `Clone` would preserve, so
//! a cloned result cannot alias the live model.

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::error::BoxedError;

pub type CodecResult<T> = Result<T, CodecError>;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("value encode failed: {source}")]
    Encode {
        #[source]
        source: BoxedError,
    },
    #[error("value decode failed: {source}")]
    Decode {
        #[source]
        source: BoxedError,
    },
}

impl CodecError {
    pub fn encode(source: impl Into<BoxedError>) -> Self {
        CodecError::Encode {
            source: source.into(),
        }
    }

    pub fn decode(source: impl Into<BoxedError>) -> Self {
        CodecError::Decode {
            source: source.into(),
        }
    }
}

/// Byte encoding strategy for everything the engine persists or clones.
///
/// Implementations must be deterministic: encoding the same value twice
/// yields the same bytes. Replay correctness depends on it.
pub trait Codec: Clone + Send + Sync + 'static {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CodecResult<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CodecResult<T>;

    fn encode_to<T: Serialize + ?Sized, W: Write>(
        &self,
        value: &T,
        mut sink: W,
    ) -> CodecResult<()> {
        let bytes = self.encode(value)?;
        sink.write_all(&bytes).map_err(CodecError::encode)
    }

    fn decode_from<T: DeserializeOwned, R: Read>(&self, mut source: R) -> CodecResult<T> {
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).map_err(CodecError::decode)?;
        self.decode(&bytes)
    }

    /// Deep clone by encode/decode round trip.
    fn deep_clone<T: Serialize + DeserializeOwned>(&self, value: &T) -> CodecResult<T> {
        self.decode(&self.encode(value)?)
    }
}

/// Default codec: JSON via `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CodecResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(CodecError::encode)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> CodecResult<T> {
        serde_json::from_slice(bytes).map_err(CodecError::decode)
    }
}
