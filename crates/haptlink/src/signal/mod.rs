//! Tactile batch codecs.
//!
//! A [`SignalCodec`] turns a [`Batch`] into wire bytes and back. Three
//! strategies exist, picked by [`CodecKind`]:
//!
//! - [`QuantizedCodec`]: the whole batch as one flat array.
//! - [`BlockFramedCodec`]: a [`BlockCodec`] per actuator behind a length table.
//! - [`RemoteCodec`]: ship the batch to the codec service and wait for its answer.

mod batch;
mod block;
mod quantize;
mod remote;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

pub use batch::{Batch, BatchShape};
pub use block::{BlockCodec, BlockFramedCodec, Lz4BlockCodec, pack_blocks, unpack_blocks};
pub use quantize::{QuantizedCodec, SCALE, dequantize, quantize};
pub use remote::{ORIGIN_DECODE, ORIGIN_ENCODE, RemoteCodec, RemoteCodecConfig};

pub(crate) use quantize::{decode_scaled, encode_scaled};

use crate::transport::ChannelError;
use crate::wire::WireError;

#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("payload carries {actual} actuator blocks, expected {expected}")]
    ActuatorMismatch { expected: usize, actual: usize },

    #[error("block codec failed: {0}")]
    Block(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("unknown codec request origin {0}")]
    UnknownOrigin(i32),

    #[error("codec stopped while waiting for a response")]
    Cancelled,

    #[error("no codec response within {0:?}")]
    Timeout(Duration),
}

/// Converts tactile batches to and from wire bytes.
#[async_trait]
pub trait SignalCodec: Send + Sync {
    /// Acquire whatever the codec needs (sockets, for the remote codec).
    fn start(&self) -> Result<(), SignalError> {
        Ok(())
    }

    /// Release resources and abort in-flight requests.
    fn stop(&self) {}

    /// Encode `batch`. An empty batch yields `None`.
    async fn encode(&self, batch: &Batch) -> Result<Option<Bytes>, SignalError>;

    /// Decode `data` into `batch`. On error `batch` keeps its previous contents.
    async fn decode(&self, data: &[u8], batch: &mut Batch) -> Result<(), SignalError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    #[default]
    Quantized,
    Block,
    Remote,
}

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CodecKind::Quantized => "quantized",
            CodecKind::Block => "block",
            CodecKind::Remote => "remote",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_kind_serde_names() {
        assert_eq!(serde_json::to_string(&CodecKind::Block).unwrap(), "\"block\"");
        let kind: CodecKind = serde_json::from_str("\"remote\"").unwrap();
        assert_eq!(kind, CodecKind::Remote);
        assert_eq!(CodecKind::default(), CodecKind::Quantized);
    }

    #[test]
    fn wire_errors_surface_unchanged() {
        let err = SignalError::from(WireError::InvalidLength(-1));
        assert_eq!(err.to_string(), "invalid length prefix: -1");
    }
}
