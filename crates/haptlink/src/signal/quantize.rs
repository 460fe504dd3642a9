//! Flat sample layouts: 15-bit fixed point in `i32` slots, or raw `f32`.

use async_trait::async_trait;
use tokio_util::bytes::Bytes;

use super::{Batch, SignalCodec, SignalError};
use crate::wire::{self, I32_LEN};

/// Fixed-point scale, `2^15`.
pub const SCALE: f32 = 32768.0;

/// Map a sample in `[-1, 1]` to fixed point.
///
/// Values at or beyond `±1` land on `±SCALE`, which [`dequantize`] reads back
/// as silence.
pub fn quantize(value: f32) -> i32 {
    if value.is_nan() {
        return 0;
    }
    if value >= 1.0 {
        return SCALE as i32;
    }
    if value <= -1.0 {
        return -(SCALE as i32);
    }
    // Strictly inside the range, never round onto the saturation sentinel.
    let limit = SCALE - 1.0;
    (value * SCALE).round().clamp(-limit, limit) as i32
}

/// Inverse of [`quantize`]. Clamped to `[-1, 1]`; a magnitude of exactly `1.0` is forced to `0.0`.
pub fn dequantize(raw: i32) -> f32 {
    let value = (raw as f32 / SCALE).clamp(-1.0, 1.0);
    if value.abs() == 1.0 { 0.0 } else { value }
}

/// Append every sample as fixed point to `out`.
pub(crate) fn encode_scaled(samples: &[f32], out: &mut Vec<u8>) {
    out.reserve(samples.len() * I32_LEN);
    for &sample in samples {
        out.extend_from_slice(&quantize(sample).to_ne_bytes());
    }
}

/// Fill `samples` from fixed point at the start of `data`.
///
/// Fails before writing anything if `data` is too short.
pub(crate) fn decode_scaled(data: &[u8], samples: &mut [f32]) -> Result<(), SignalError> {
    wire::ensure(data.len(), 0, samples.len() * I32_LEN)?;
    let mut offset = 0;
    for sample in samples.iter_mut() {
        let (raw, next) = wire::read_i32(data, offset)?;
        *sample = dequantize(raw);
        offset = next;
    }
    Ok(())
}

pub(crate) fn encode_raw(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * wire::F32_LEN);
    for &sample in samples {
        out.extend_from_slice(&sample.to_ne_bytes());
    }
    out
}

pub(crate) fn decode_raw(data: &[u8], samples: &mut [f32]) -> Result<(), SignalError> {
    wire::ensure(data.len(), 0, samples.len() * wire::F32_LEN)?;
    let mut offset = 0;
    for sample in samples.iter_mut() {
        let (value, next) = wire::read_f32(data, offset)?;
        *sample = value;
        offset = next;
    }
    Ok(())
}

/// Whole batch as one flat array, fixed point when `compression` is on, raw `f32` otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuantizedCodec {
    compression: bool,
}

impl QuantizedCodec {
    pub fn new(compression: bool) -> Self {
        Self { compression }
    }
}

#[async_trait]
impl SignalCodec for QuantizedCodec {
    async fn encode(&self, batch: &Batch) -> Result<Option<Bytes>, SignalError> {
        if batch.is_empty() {
            return Ok(None);
        }
        let out = if self.compression {
            let mut out = Vec::new();
            encode_scaled(batch.samples(), &mut out);
            out
        } else {
            encode_raw(batch.samples())
        };
        Ok(Some(Bytes::from(out)))
    }

    async fn decode(&self, data: &[u8], batch: &mut Batch) -> Result<(), SignalError> {
        if self.compression {
            decode_scaled(data, batch.samples_mut())
        } else {
            decode_raw(data, batch.samples_mut())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::BatchShape;
    use crate::wire::WireError;

    #[test]
    fn quantize_error_is_within_one_step() {
        let step = 1.0 / SCALE;
        for i in -999..1000 {
            let x = i as f32 / 1000.0;
            let back = dequantize(quantize(x));
            assert!((back - x).abs() <= step, "x={x} back={back}");
        }
        let near = 1.0 - 1e-6;
        assert!((dequantize(quantize(near)) - near).abs() <= step);
        assert!((dequantize(quantize(-near)) + near).abs() <= step);
    }

    #[test]
    fn saturation_reads_back_as_silence() {
        assert_eq!(quantize(1.0), 32768);
        assert_eq!(quantize(-1.0), -32768);
        assert_eq!(quantize(3.5), 32768);
        assert_eq!(dequantize(quantize(1.0)), 0.0);
        assert_eq!(dequantize(quantize(-1.0)), 0.0);
        assert_eq!(dequantize(i32::MAX), 0.0);
        assert_eq!(dequantize(i32::MIN), 0.0);
    }

    #[test]
    fn nan_quantizes_to_zero() {
        assert_eq!(quantize(f32::NAN), 0);
    }

    fn batch() -> Batch {
        let mut batch = Batch::new(BatchShape::new(2, 2, 2));
        batch
            .samples_mut()
            .copy_from_slice(&[0.0, 0.5, -0.5, 0.25, 0.125, -0.75, 0.999, -0.001]);
        batch
    }

    #[tokio::test]
    async fn fixed_point_roundtrip() {
        let codec = QuantizedCodec::new(true);
        let source = batch();
        let bytes = codec.encode(&source).await.unwrap().unwrap();
        assert_eq!(bytes.len(), 8 * I32_LEN);
        assert_eq!(&bytes[4..8], &16384i32.to_ne_bytes());

        let mut decoded = Batch::new(source.shape());
        codec.decode(&bytes, &mut decoded).await.unwrap();
        for (a, b) in source.samples().iter().zip(decoded.samples()) {
            assert!((a - b).abs() <= 1.0 / SCALE);
        }
    }

    #[tokio::test]
    async fn raw_float_roundtrip_is_lossless() {
        let codec = QuantizedCodec::new(false);
        let source = batch();
        let bytes = codec.encode(&source).await.unwrap().unwrap();
        let mut decoded = Batch::new(source.shape());
        codec.decode(&bytes, &mut decoded).await.unwrap();
        assert_eq!(decoded, source);
    }

    #[tokio::test]
    async fn empty_batch_encodes_to_nothing() {
        let codec = QuantizedCodec::new(true);
        let empty = Batch::new(BatchShape::new(0, 4, 8));
        assert!(codec.encode(&empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_input_leaves_batch_untouched() {
        let codec = QuantizedCodec::new(true);
        let mut target = batch();
        let before = target.clone();
        let err = codec.decode(&[0u8; 12], &mut target).await.unwrap_err();
        assert!(matches!(
            err,
            SignalError::Wire(WireError::BufferOverrun { needed: 32, len: 12, .. })
        ));
        assert_eq!(target, before);
    }
}
