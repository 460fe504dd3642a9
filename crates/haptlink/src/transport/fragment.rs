//! Datagram fragmentation.
//!
//! Every datagram starts with a 4-byte native-endian `i32` tag: `0` when more
//! chunks of the same payload follow, `1` on the last chunk. Payloads that fit
//! in one datagram travel as a single tag-1 chunk.

use std::io;

use tokio_util::bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const TAG_LEN: usize = 4;
pub const TAG_MORE: i32 = 0;
pub const TAG_LAST: i32 = 1;

/// Bytes a receiver will hold for an unfinished payload before giving up on it.
pub const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

/// One chunk of a payload, as carried by a single datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub is_last: bool,
    pub body: Bytes,
}

impl Fragment {
    pub fn last(body: Bytes) -> Self {
        Self {
            is_last: true,
            body,
        }
    }

    pub fn more(body: Bytes) -> Self {
        Self {
            is_last: false,
            body,
        }
    }

    pub fn tag(&self) -> i32 {
        if self.is_last { TAG_LAST } else { TAG_MORE }
    }
}

/// Split `payload` into fragments no larger than `max_datagram` once tagged.
///
/// Chunks are slices of `payload`; nothing is copied. `max_datagram` must be
/// greater than [`TAG_LEN`].
pub fn split(mut payload: Bytes, max_datagram: usize) -> Vec<Fragment> {
    debug_assert!(max_datagram > TAG_LEN);
    let chunk = max_datagram.saturating_sub(TAG_LEN).max(1);
    if payload.len() <= chunk {
        return vec![Fragment::last(payload)];
    }

    let mut fragments = Vec::with_capacity(payload.len().div_ceil(chunk));
    while payload.len() > chunk {
        fragments.push(Fragment::more(payload.split_to(chunk)));
    }
    fragments.push(Fragment::last(payload));
    fragments
}

/// Encodes and decodes one tagged fragment per datagram.
///
/// Used with `UdpFramed`, which hands the decoder exactly one datagram at a
/// time. The decoder always consumes the whole datagram, including on error,
/// so a bad packet never poisons the next read.
#[derive(Debug, Clone, Copy)]
pub struct FragmentCodec {
    max_datagram: usize,
}

impl FragmentCodec {
    pub fn new(max_datagram: usize) -> Self {
        Self { max_datagram }
    }

    pub fn max_datagram(&self) -> usize {
        self.max_datagram
    }
}

impl Decoder for FragmentCodec {
    type Item = Fragment;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let mut datagram = src.split();

        if datagram.len() > self.max_datagram {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "datagram of {} bytes exceeds buffer size {}",
                    datagram.len(),
                    self.max_datagram
                ),
            ));
        }
        if datagram.len() < TAG_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("datagram of {} bytes is shorter than its tag", datagram.len()),
            ));
        }

        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&datagram[..TAG_LEN]);
        let is_last = match i32::from_ne_bytes(tag) {
            TAG_MORE => false,
            TAG_LAST => true,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown fragment tag {other}"),
                ));
            }
        };

        let body = datagram.split_off(TAG_LEN).freeze();
        Ok(Some(Fragment { is_last, body }))
    }
}

impl Encoder<Fragment> for FragmentCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Fragment, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = TAG_LEN + item.body.len();
        if len > self.max_datagram {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "fragment of {len} bytes exceeds buffer size {}",
                    self.max_datagram
                ),
            ));
        }
        dst.reserve(len);
        dst.put_slice(&item.tag().to_ne_bytes());
        dst.put_slice(&item.body);
        Ok(())
    }
}

/// Rebuilds payloads from a stream of fragments.
///
/// Chunks are concatenated in arrival order; there is no sequence number, so
/// a lost or reordered chunk yields a corrupt payload that higher layers must
/// tolerate.
#[derive(Debug, Default)]
pub struct Reassembler {
    pending: Vec<Bytes>,
    pending_len: usize,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns the full payload when `fragment` is the last chunk.
    pub fn push(&mut self, fragment: Fragment) -> Option<Bytes> {
        if !fragment.is_last {
            if self.pending_len + fragment.body.len() > MAX_PENDING_BYTES {
                tracing::warn!(
                    pending_bytes = self.pending_len,
                    chunks = self.pending.len(),
                    "Discarding unfinished payload"
                );
                self.reset();
            }
            self.pending_len += fragment.body.len();
            self.pending.push(fragment.body);
            return None;
        }

        if self.pending.is_empty() {
            return Some(fragment.body);
        }

        let mut payload = BytesMut::with_capacity(self.pending_len + fragment.body.len());
        for chunk in self.pending.drain(..) {
            payload.put_slice(&chunk);
        }
        payload.put_slice(&fragment.body);
        self.pending_len = 0;
        Some(payload.freeze())
    }

    pub fn pending_len(&self) -> usize {
        self.pending_len
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.pending_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datagram(tag: i32, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_slice(&tag.to_ne_bytes());
        buf.put_slice(body);
        buf
    }

    #[test]
    fn small_payload_is_single_last_fragment() {
        let fragments = split(Bytes::from_static(b"hello"), 16);
        assert_eq!(fragments, vec![Fragment::last(Bytes::from_static(b"hello"))]);
    }

    #[test]
    fn payload_filling_datagram_exactly_is_not_split() {
        let fragments = split(Bytes::from(vec![7u8; 12]), 16);
        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].is_last);
    }

    #[test]
    fn empty_payload_is_single_empty_fragment() {
        let fragments = split(Bytes::new(), 16);
        assert_eq!(fragments, vec![Fragment::last(Bytes::new())]);
    }

    #[test]
    fn split_chunks_respect_max_datagram() {
        let payload: Bytes = (0..100u8).collect::<Vec<_>>().into();
        let fragments = split(payload.clone(), 20);

        assert_eq!(fragments.len(), 7);
        assert!(fragments[..6].iter().all(|f| !f.is_last && f.body.len() == 16));
        assert!(fragments[6].is_last);
        assert_eq!(fragments[6].body.len(), 4);

        let rejoined: Vec<u8> = fragments.iter().flat_map(|f| f.body.to_vec()).collect();
        assert_eq!(rejoined, payload);
    }

    #[test]
    fn codec_encodes_tag_then_body() {
        let mut codec = FragmentCodec::new(16);
        let mut buf = BytesMut::new();
        codec
            .encode(Fragment::more(Bytes::from_static(b"abc")), &mut buf)
            .unwrap();
        assert_eq!(&buf[..], &datagram(TAG_MORE, b"abc")[..]);
    }

    #[test]
    fn codec_rejects_oversized_fragment() {
        let mut codec = FragmentCodec::new(8);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Fragment::last(Bytes::from_static(b"12345")), &mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_decodes_whole_datagram() {
        let mut codec = FragmentCodec::new(64);
        let mut buf = datagram(TAG_LAST, b"payload");
        let fragment = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(fragment, Fragment::last(Bytes::from_static(b"payload")));
        assert!(buf.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn codec_consumes_bad_datagrams() {
        let mut codec = FragmentCodec::new(8);

        let mut short = BytesMut::from(&[1u8, 0][..]);
        assert!(codec.decode(&mut short).is_err());
        assert!(short.is_empty());

        let mut unknown = datagram(7, b"x");
        assert!(codec.decode(&mut unknown).is_err());
        assert!(unknown.is_empty());

        let mut oversized = datagram(TAG_LAST, b"too long");
        assert!(codec.decode(&mut oversized).is_err());
        assert!(oversized.is_empty());
    }

    #[test]
    fn reassembler_passes_single_chunk_through() {
        let mut reassembler = Reassembler::new();
        let body = Bytes::from_static(b"whole");
        let out = reassembler.push(Fragment::last(body.clone())).unwrap();
        assert_eq!(out, body);
        // Zero-copy: same backing storage.
        assert_eq!(out.as_ptr(), body.as_ptr());
    }

    #[test]
    fn reassembler_concatenates_in_arrival_order() {
        let mut reassembler = Reassembler::new();
        assert!(reassembler.push(Fragment::more(Bytes::from_static(b"ab"))).is_none());
        assert!(reassembler.push(Fragment::more(Bytes::from_static(b"cd"))).is_none());
        assert_eq!(reassembler.pending_len(), 4);

        let out = reassembler.push(Fragment::last(Bytes::from_static(b"e"))).unwrap();
        assert_eq!(&out[..], b"abcde");
        assert_eq!(reassembler.pending_len(), 0);

        let next = reassembler.push(Fragment::last(Bytes::from_static(b"z"))).unwrap();
        assert_eq!(&next[..], b"z");
    }

    #[test]
    fn split_then_reassemble_is_identity() {
        let payload: Bytes = (0..1000u32).map(|i| (i * 31 % 251) as u8).collect::<Vec<_>>().into();
        let mut reassembler = Reassembler::new();
        let mut out = None;
        for fragment in split(payload.clone(), 64) {
            out = reassembler.push(fragment);
        }
        assert_eq!(out.unwrap(), payload);
    }
}
