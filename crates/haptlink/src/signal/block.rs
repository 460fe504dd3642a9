//! Per-actuator block compression with a length-table header.
//!
//! Layout: `[i32 count][i32 len_0 .. len_{count-1}][body_0 .. body_{count-1}]`.

use async_trait::async_trait;
use lz4::block::CompressionMode;
use tokio_util::bytes::Bytes;

use super::quantize::{decode_raw, encode_raw};
use super::{Batch, SignalCodec, SignalError};
use crate::wire::{self, I32_LEN, WireError};

/// Compresses one actuator's samples at a time.
pub trait BlockCodec: Send + Sync {
    fn encode(&self, samples: &[f32]) -> Result<Vec<u8>, SignalError>;

    /// Decode one block. The result may be shorter than the actuator's window.
    fn decode(&self, block: &[u8]) -> Result<Vec<f32>, SignalError>;
}

impl<C: BlockCodec + ?Sized> BlockCodec for std::sync::Arc<C> {
    fn encode(&self, samples: &[f32]) -> Result<Vec<u8>, SignalError> {
        (**self).encode(samples)
    }

    fn decode(&self, block: &[u8]) -> Result<Vec<f32>, SignalError> {
        (**self).decode(block)
    }
}

/// Pack already-encoded blocks behind a count and length table.
pub fn pack_blocks(blocks: &[Vec<u8>]) -> Result<Vec<u8>, WireError> {
    let header = (1 + blocks.len()) * I32_LEN;
    let body: usize = blocks.iter().map(Vec::len).sum();
    let mut out = vec![0u8; header + body];

    let count = i32::try_from(blocks.len()).map_err(|_| WireError::InvalidLength(i64::MAX))?;
    let mut offset = wire::write_i32(&mut out, 0, count)?;
    for block in blocks {
        let len = i32::try_from(block.len()).map_err(|_| WireError::InvalidLength(i64::MAX))?;
        offset = wire::write_i32(&mut out, offset, len)?;
    }
    for block in blocks {
        out[offset..offset + block.len()].copy_from_slice(block);
        offset += block.len();
    }
    Ok(out)
}

/// Split a packed buffer into borrowed block bodies. Trailing bytes are ignored.
pub fn unpack_blocks(data: &[u8]) -> Result<Vec<&[u8]>, WireError> {
    let (count, mut offset) = wire::read_i32(data, 0)?;
    let count = usize::try_from(count).map_err(|_| WireError::InvalidLength(i64::from(count)))?;
    // The length table itself must fit before we size anything from `count`.
    wire::ensure(data.len(), offset, count.saturating_mul(I32_LEN))?;

    let mut lens = Vec::with_capacity(count);
    for _ in 0..count {
        let (len, next) = wire::read_i32(data, offset)?;
        lens.push(usize::try_from(len).map_err(|_| WireError::InvalidLength(i64::from(len)))?);
        offset = next;
    }

    let mut blocks = Vec::with_capacity(count);
    for len in lens {
        let end = wire::ensure(data.len(), offset, len)?;
        blocks.push(&data[offset..end]);
        offset = end;
    }
    Ok(blocks)
}

/// Runs a [`BlockCodec`] over each actuator and frames the results.
///
/// With compression off this is the flat `f32` layout.
pub struct BlockFramedCodec<C> {
    codec: C,
    compression: bool,
}

impl<C: BlockCodec> BlockFramedCodec<C> {
    pub fn new(codec: C, compression: bool) -> Self {
        Self { codec, compression }
    }

    pub fn block_codec(&self) -> &C {
        &self.codec
    }

    /// Encode every actuator window of `batch` into the framed layout.
    pub fn encode_framed(&self, batch: &Batch) -> Result<Vec<u8>, SignalError> {
        let shape = batch.shape();
        let blocks = (0..shape.actuators)
            .map(|actuator| self.codec.encode(batch.actuator(actuator)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(pack_blocks(&blocks)?)
    }

    /// Decode the framed layout into `batch`. Nothing is written unless every block decodes.
    pub fn decode_framed(&self, data: &[u8], batch: &mut Batch) -> Result<(), SignalError> {
        let blocks = unpack_blocks(data)?;
        let expected = batch.shape().actuators;
        if blocks.len() != expected {
            return Err(SignalError::ActuatorMismatch {
                expected,
                actual: blocks.len(),
            });
        }

        let decoded = blocks
            .iter()
            .map(|block| self.codec.decode(block))
            .collect::<Result<Vec<_>, _>>()?;
        for (actuator, samples) in decoded.iter().enumerate() {
            let window = batch.actuator_mut(actuator);
            let n = samples.len().min(window.len());
            window[..n].copy_from_slice(&samples[..n]);
        }
        Ok(())
    }
}

#[async_trait]
impl<C: BlockCodec> SignalCodec for BlockFramedCodec<C> {
    async fn encode(&self, batch: &Batch) -> Result<Option<Bytes>, SignalError> {
        if batch.is_empty() {
            return Ok(None);
        }
        let out = if self.compression {
            self.encode_framed(batch)?
        } else {
            encode_raw(batch.samples())
        };
        Ok(Some(Bytes::from(out)))
    }

    async fn decode(&self, data: &[u8], batch: &mut Batch) -> Result<(), SignalError> {
        if self.compression {
            self.decode_framed(data, batch)
        } else {
            decode_raw(data, batch.samples_mut())
        }
    }
}

/// Samples as native-endian `i16` fixed point, LZ4 block compressed.
#[derive(Debug, Clone, Copy)]
pub struct Lz4BlockCodec {
    max_samples: usize,
}

impl Lz4BlockCodec {
    /// `max_samples` bounds how many samples one block may decompress to.
    pub fn new(max_samples: usize) -> Self {
        Self { max_samples }
    }
}

fn to_i16(value: f32) -> i16 {
    if value.is_nan() {
        return 0;
    }
    (value.clamp(-1.0, 1.0) * f32::from(i16::MAX)).round() as i16
}

impl BlockCodec for Lz4BlockCodec {
    fn encode(&self, samples: &[f32]) -> Result<Vec<u8>, SignalError> {
        let mut raw = Vec::with_capacity(samples.len() * 2);
        for &sample in samples {
            raw.extend_from_slice(&to_i16(sample).to_ne_bytes());
        }
        lz4::block::compress(&raw, Some(CompressionMode::FAST(1)), false)
            .map_err(|e| SignalError::Block(format!("LZ4 compression failed: {e}")))
    }

    fn decode(&self, block: &[u8]) -> Result<Vec<f32>, SignalError> {
        if block.is_empty() {
            return Ok(Vec::new());
        }
        let limit = i32::try_from(self.max_samples * 2)
            .map_err(|_| SignalError::Block(format!("block limit {} too large", self.max_samples)))?;
        let raw = lz4::block::decompress(block, Some(limit))
            .map_err(|e| SignalError::Block(format!("LZ4 decompression failed: {e}")))?;
        if raw.len() % 2 != 0 {
            return Err(SignalError::Block(format!(
                "decompressed block of {} bytes is not whole i16 samples",
                raw.len()
            )));
        }
        Ok(raw
            .chunks_exact(2)
            .map(|pair| f32::from(i16::from_ne_bytes([pair[0], pair[1]])) / f32::from(i16::MAX))
            .collect())
    }
}
