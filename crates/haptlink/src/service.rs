//! The codec service: block compression as a separate process.
//!
//! One socket serves both ends of the link. Every request starts with an
//! `i32` origin: [`ORIGIN_ENCODE`] requests carry fixed-point samples and get
//! a framed block payload back at the encode reply address; [`ORIGIN_DECODE`]
//! requests carry a framed block payload and get fixed-point samples back at
//! the decode reply address. Replies are fragmented like any other payload.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::UdpSocket;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tokio_util::udp::UdpFramed;

use crate::signal::{
    Batch, BatchShape, BlockCodec, BlockFramedCodec, ORIGIN_DECODE, ORIGIN_ENCODE, SignalError,
    decode_scaled, encode_scaled,
};
use crate::transport::{ChannelError, FragmentCodec, Reassembler, TAG_LEN, split};
use crate::wire;

pub struct CodecService<C> {
    socket: UdpSocket,
    local_addr: SocketAddr,
    codec: BlockFramedCodec<C>,
    shape: BatchShape,
    buffer_size: usize,
    encode_reply: SocketAddr,
    decode_reply: SocketAddr,
}

impl<C: BlockCodec> CodecService<C> {
    /// Bind the service socket.
    ///
    /// `actuators × samples` is the size of every batch handled. Replies go
    /// back to the requester until [`with_replies`](Self::with_replies) pins
    /// them.
    pub async fn bind(
        addr: SocketAddr,
        actuators: usize,
        samples: usize,
        buffer_size: usize,
        codec: C,
    ) -> Result<Self, ChannelError> {
        if buffer_size <= TAG_LEN {
            return Err(ChannelError::BufferTooSmall(buffer_size));
        }
        let wrap = |source| ChannelError::Bind { addr, source };
        let socket = UdpSocket::bind(addr).await.map_err(wrap)?;
        let local_addr = socket.local_addr().map_err(wrap)?;
        let unspecified = SocketAddr::new(local_addr.ip(), 0);
        Ok(Self {
            socket,
            local_addr,
            codec: BlockFramedCodec::new(codec, true),
            shape: BatchShape::new(actuators, 1, samples),
            buffer_size,
            encode_reply: unspecified,
            decode_reply: unspecified,
        })
    }

    /// Send encode results to `encode_reply` and decode results to `decode_reply`.
    pub fn with_replies(mut self, encode_reply: SocketAddr, decode_reply: SocketAddr) -> Self {
        self.encode_reply = encode_reply;
        self.decode_reply = decode_reply;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve requests until `cancel` fires. Bad requests are logged and skipped.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            addr = %self.local_addr,
            actuators = self.shape.actuators,
            samples = self.shape.actuator_len(),
            encode_reply = %self.encode_reply,
            decode_reply = %self.decode_reply,
            "Codec service listening"
        );

        let Self {
            socket,
            codec,
            shape,
            buffer_size,
            encode_reply,
            decode_reply,
            ..
        } = self;
        let handler = Handler {
            codec,
            encode_reply,
            decode_reply,
        };
        let mut framed = UdpFramed::new(socket, FragmentCodec::new(buffer_size));
        let mut reassembler = Reassembler::new();
        let mut batch = Batch::new(shape);

        loop {
            let next = tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                next = framed.next() => next,
            };

            let (fragment, peer) = match next {
                Some(Ok(received)) => received,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Dropped datagram");
                    continue;
                }
                None => break,
            };
            let Some(request) = reassembler.push(fragment) else {
                continue;
            };

            let (reply, to) = match handler.handle(&request, &mut batch) {
                Ok((reply, to)) => (reply, resolve(to, peer)),
                Err(e) => {
                    tracing::warn!(error = %e, %peer, len = request.len(), "Rejected codec request");
                    continue;
                }
            };
            tracing::trace!(%peer, %to, len = reply.len(), "Codec reply");
            for fragment in split(reply, buffer_size) {
                if let Err(e) = framed.send((fragment, to)).await {
                    tracing::warn!(error = %e, %to, "Failed to send codec reply");
                    break;
                }
            }
        }

        tracing::info!("Codec service stopped");
    }
}

/// Port 0 means "whoever asked".
fn resolve(configured: SocketAddr, peer: SocketAddr) -> SocketAddr {
    if configured.port() == 0 { peer } else { configured }
}

struct Handler<C> {
    codec: BlockFramedCodec<C>,
    encode_reply: SocketAddr,
    decode_reply: SocketAddr,
}

impl<C: BlockCodec> Handler<C> {
    fn handle(&self, request: &[u8], batch: &mut Batch) -> Result<(Bytes, SocketAddr), SignalError> {
        let (origin, body_at) = wire::read_i32(request, 0)?;
        let body = &request[body_at..];
        match origin {
            ORIGIN_ENCODE => {
                decode_scaled(body, batch.samples_mut())?;
                let framed = self.codec.encode_framed(batch)?;
                Ok((Bytes::from(framed), self.encode_reply))
            }
            ORIGIN_DECODE => {
                batch.clear();
                self.codec.decode_framed(body, batch)?;
                let mut samples = Vec::new();
                encode_scaled(batch.samples(), &mut samples);
                Ok((Bytes::from(samples), self.decode_reply))
            }
            other => Err(SignalError::UnknownOrigin(other)),
        }
    }
}
