//! Fixed-layout binary codec for telemetry payloads.
//!
//! No framing and no byte-order negotiation: both peers run on the same
//! architecture, so every value is written in host byte order. Each function
//! takes a cursor offset and returns the advanced offset; nothing is read or
//! written past the end of the buffer.
//!
//! | Type     | Size | Layout                              |
//! |----------|------|-------------------------------------|
//! | `bool`   | 1    | `0` / `1`                           |
//! | `i32`    | 4    |                                     |
//! | `i64`    | 8    |                                     |
//! | `f32`    | 4    |                                     |
//! | `f64`    | 8    |                                     |
//! | string   | 4+n  | `i32` byte length, UTF-8 bytes      |
//! | bytes    | 4+n  | `i32` byte length, raw bytes        |
//! | `Vec3`   | 12   | `x y z` as `f32`                    |
//! | `Quat`   | 16   | `x y z w` as `f32`                  |

use serde::{Deserialize, Serialize};

pub const BOOL_LEN: usize = 1;
pub const I32_LEN: usize = 4;
pub const I64_LEN: usize = 8;
pub const F32_LEN: usize = 4;
pub const F64_LEN: usize = 8;
pub const VEC3_LEN: usize = 3 * F32_LEN;
pub const QUAT_LEN: usize = 4 * F32_LEN;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("buffer overrun: {needed} bytes at offset {offset} exceed buffer of {len}")]
    BufferOverrun {
        offset: usize,
        needed: usize,
        len: usize,
    },

    #[error("invalid length prefix: {0}")]
    InvalidLength(i64),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, WireError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Rotation quaternion in `x, y, z, w` order.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Self = Self::new(0.0, 0.0, 0.0, 1.0);

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Check that `needed` bytes starting at `offset` fit in a buffer of `len` bytes.
///
/// Returns the end offset of the span.
pub fn ensure(len: usize, offset: usize, needed: usize) -> Result<usize> {
    match offset.checked_add(needed) {
        Some(end) if end <= len => Ok(end),
        _ => Err(WireError::BufferOverrun {
            offset,
            needed,
            len,
        }),
    }
}

macro_rules! primitive {
    ($read:ident, $write:ident, $ty:ty, $len:expr) => {
        pub fn $read(buf: &[u8], offset: usize) -> Result<($ty, usize)> {
            let end = ensure(buf.len(), offset, $len)?;
            let mut raw = [0u8; $len];
            raw.copy_from_slice(&buf[offset..end]);
            Ok((<$ty>::from_ne_bytes(raw), end))
        }

        pub fn $write(buf: &mut [u8], offset: usize, value: $ty) -> Result<usize> {
            let end = ensure(buf.len(), offset, $len)?;
            buf[offset..end].copy_from_slice(&value.to_ne_bytes());
            Ok(end)
        }
    };
}

primitive!(read_i32, write_i32, i32, I32_LEN);
primitive!(read_i64, write_i64, i64, I64_LEN);
primitive!(read_f32, write_f32, f32, F32_LEN);
primitive!(read_f64, write_f64, f64, F64_LEN);

/// Any non-zero byte reads as `true`.
pub fn read_bool(buf: &[u8], offset: usize) -> Result<(bool, usize)> {
    let end = ensure(buf.len(), offset, BOOL_LEN)?;
    Ok((buf[offset] != 0, end))
}

pub fn write_bool(buf: &mut [u8], offset: usize, value: bool) -> Result<usize> {
    let end = ensure(buf.len(), offset, BOOL_LEN)?;
    buf[offset] = u8::from(value);
    Ok(end)
}

/// Read an `i32`-length-prefixed byte field, borrowing the body from `buf`.
pub fn read_bytes(buf: &[u8], offset: usize) -> Result<(&[u8], usize)> {
    let (len, start) = read_i32(buf, offset)?;
    let len = usize::try_from(len).map_err(|_| WireError::InvalidLength(i64::from(len)))?;
    let end = ensure(buf.len(), start, len)?;
    Ok((&buf[start..end], end))
}

pub fn write_bytes(buf: &mut [u8], offset: usize, value: &[u8]) -> Result<usize> {
    let len = i32::try_from(value.len())
        .map_err(|_| WireError::InvalidLength(i64::try_from(value.len()).unwrap_or(i64::MAX)))?;
    // Check the whole field before touching the buffer.
    let end = ensure(buf.len(), offset, I32_LEN + value.len())?;
    let start = write_i32(buf, offset, len)?;
    buf[start..end].copy_from_slice(value);
    Ok(end)
}

pub fn read_string(buf: &[u8], offset: usize) -> Result<(&str, usize)> {
    let (raw, end) = read_bytes(buf, offset)?;
    let value = std::str::from_utf8(raw).map_err(|_| WireError::InvalidUtf8)?;
    Ok((value, end))
}

pub fn write_string(buf: &mut [u8], offset: usize, value: &str) -> Result<usize> {
    write_bytes(buf, offset, value.as_bytes())
}

pub fn read_vec3(buf: &[u8], offset: usize) -> Result<(Vec3, usize)> {
    let end = ensure(buf.len(), offset, VEC3_LEN)?;
    let (x, at) = read_f32(buf, offset)?;
    let (y, at) = read_f32(buf, at)?;
    let (z, _) = read_f32(buf, at)?;
    Ok((Vec3 { x, y, z }, end))
}

pub fn write_vec3(buf: &mut [u8], offset: usize, value: Vec3) -> Result<usize> {
    let end = ensure(buf.len(), offset, VEC3_LEN)?;
    let at = write_f32(buf, offset, value.x)?;
    let at = write_f32(buf, at, value.y)?;
    write_f32(buf, at, value.z)?;
    Ok(end)
}

pub fn read_quat(buf: &[u8], offset: usize) -> Result<(Quat, usize)> {
    let end = ensure(buf.len(), offset, QUAT_LEN)?;
    let (x, at) = read_f32(buf, offset)?;
    let (y, at) = read_f32(buf, at)?;
    let (z, at) = read_f32(buf, at)?;
    let (w, _) = read_f32(buf, at)?;
    Ok((Quat { x, y, z, w }, end))
}

pub fn write_quat(buf: &mut [u8], offset: usize, value: Quat) -> Result<usize> {
    let end = ensure(buf.len(), offset, QUAT_LEN)?;
    let at = write_f32(buf, offset, value.x)?;
    let at = write_f32(buf, at, value.y)?;
    let at = write_f32(buf, at, value.z)?;
    write_f32(buf, at, value.w)?;
    Ok(end)
}
