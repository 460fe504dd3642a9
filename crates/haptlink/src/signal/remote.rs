//! Codec that delegates to the out-of-process codec service.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{Batch, SignalCodec, SignalError, decode_scaled, encode_scaled};
use crate::transport::{ChannelError, DatagramReceiver, DatagramSender, EndpointConfig, Mailbox};

/// Request origin: a host asking for fixed-point samples to be compressed.
pub const ORIGIN_ENCODE: i32 = 0;
/// Request origin: a peer asking for a compressed payload to be expanded.
pub const ORIGIN_DECODE: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteCodecConfig {
    /// Where requests go (the service's listening address).
    pub request: EndpointConfig,
    /// Where the service sends replies.
    pub response: EndpointConfig,
    /// `None` waits until [`SignalCodec::stop`].
    pub timeout: Option<Duration>,
}

struct Channels {
    sender: DatagramSender,
    receiver: DatagramReceiver,
    cancel: CancellationToken,
}

/// Round-trips every encode/decode through the codec service.
///
/// Requests are `[i32 origin][body]`: encode bodies are fixed-point samples,
/// decode bodies are whatever the service produced on the encode side. Decode
/// replies are fixed-point samples. One request is in flight at a time.
pub struct RemoteCodec {
    config: RemoteCodecConfig,
    runtime: Handle,
    channels: Mutex<Option<Channels>>,
    responses: Mailbox<Bytes>,
    in_flight: tokio::sync::Mutex<()>,
}

impl RemoteCodec {
    pub fn new(config: RemoteCodecConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            channels: Mutex::new(None),
            responses: Mailbox::new(),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Bound reply address while started.
    pub fn response_addr(&self) -> Option<SocketAddr> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.as_ref().and_then(|c| c.receiver.local_addr())
    }

    async fn round_trip(&self, request: Vec<u8>) -> Result<Bytes, SignalError> {
        let _turn = self.in_flight.lock().await;

        let (handle, cancel) = {
            let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
            let channels = channels.as_ref().ok_or(ChannelError::NotStarted)?;
            let handle = channels.sender.handle().ok_or(ChannelError::NotStarted)?;
            (handle, channels.cancel.clone())
        };

        // A reply that arrived after an earlier timeout is not ours.
        self.responses.clear();
        handle.send(request)?;

        let wait = async {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => Err(SignalError::Cancelled),
                response = self.responses.recv() => Ok(response),
            }
        };
        match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| SignalError::Timeout(limit))?,
            None => wait.await,
        }
    }
}

fn request(origin: i32, body_len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + body_len);
    out.extend_from_slice(&origin.to_ne_bytes());
    out
}

#[async_trait]
impl SignalCodec for RemoteCodec {
    fn start(&self) -> Result<(), SignalError> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if channels.is_some() {
            return Err(ChannelError::AlreadyStarted.into());
        }

        let inbox = self.responses.clone();
        let mut receiver = DatagramReceiver::new(
            self.config.response,
            self.runtime.clone(),
            move |payload| {
                if inbox.post(payload) {
                    tracing::debug!("Unclaimed codec response replaced");
                }
            },
        );
        receiver.start()?;
        let mut sender = DatagramSender::new(self.config.request, self.runtime.clone());
        sender.start()?;

        tracing::info!(
            service = %self.config.request.remote,
            reply = ?receiver.local_addr(),
            "Remote codec started"
        );
        *channels = Some(Channels {
            sender,
            receiver,
            cancel: CancellationToken::new(),
        });
        Ok(())
    }

    fn stop(&self) {
        let taken = self
            .channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut channels) = taken {
            channels.cancel.cancel();
            channels.sender.close();
            channels.receiver.close();
            tracing::info!(service = %self.config.request.remote, "Remote codec stopped");
        }
    }

    async fn encode(&self, batch: &Batch) -> Result<Option<Bytes>, SignalError> {
        if batch.is_empty() {
            return Ok(None);
        }
        let mut req = request(ORIGIN_ENCODE, batch.samples().len() * 4);
        encode_scaled(batch.samples(), &mut req);
        let response = self.round_trip(req).await?;
        Ok(Some(response))
    }

    async fn decode(&self, data: &[u8], batch: &mut Batch) -> Result<(), SignalError> {
        let mut req = request(ORIGIN_DECODE, data.len());
        req.extend_from_slice(data);
        let response = self.round_trip(req).await?;
        decode_scaled(&response, batch.samples_mut())
    }
}

impl Drop for RemoteCodec {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::net::UdpSocket;

    use super::*;
    use crate::signal::{BatchShape, quantize};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn codec_against(timeout: Option<Duration>) -> (RemoteCodec, UdpSocket) {
        let service = UdpSocket::bind(loopback()).await.unwrap();
        let config = RemoteCodecConfig {
            request: EndpointConfig::sender(service.local_addr().unwrap(), 1024),
            response: EndpointConfig::receiver(loopback(), 1024),
            timeout,
        };
        let codec = RemoteCodec::new(config, Handle::current());
        codec.start().unwrap();
        (codec, service)
    }

    fn tagged_last(body: &[u8]) -> Vec<u8> {
        let mut out = 1i32.to_ne_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    /// Reads one request (single fragment) and returns `(origin, body)`.
    async fn read_request(service: &UdpSocket) -> (i32, Vec<u8>) {
        let mut buf = vec![0u8; 2048];
        let (n, _) = service.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..4], &1i32.to_ne_bytes(), "single-fragment request");
        let origin = i32::from_ne_bytes(buf[4..8].try_into().unwrap());
        (origin, buf[8..n].to_vec())
    }

    #[tokio::test]
    async fn encode_sends_fixed_point_and_returns_reply() {
        let (codec, service) = codec_against(Some(Duration::from_secs(2))).await;
        let reply_to = codec.response_addr().unwrap();

        let mut batch = Batch::new(BatchShape::new(1, 1, 2));
        batch.samples_mut().copy_from_slice(&[0.5, -0.25]);

        let fake = async {
            let (origin, body) = read_request(&service).await;
            assert_eq!(origin, ORIGIN_ENCODE);
            let mut expected = quantize(0.5).to_ne_bytes().to_vec();
            expected.extend_from_slice(&quantize(-0.25).to_ne_bytes());
            assert_eq!(body, expected);
            service
                .send_to(&tagged_last(b"compressed"), reply_to)
                .await
                .unwrap();
        };
        let (encoded, ()) = tokio::join!(codec.encode(&batch), fake);
        assert_eq!(&encoded.unwrap().unwrap()[..], b"compressed");
    }

    #[tokio::test]
    async fn decode_forwards_payload_and_reads_fixed_point() {
        let (codec, service) = codec_against(Some(Duration::from_secs(2))).await;
        let reply_to = codec.response_addr().unwrap();
        let mut batch = Batch::new(BatchShape::new(1, 1, 2));

        let fake = async {
            let (origin, body) = read_request(&service).await;
            assert_eq!(origin, ORIGIN_DECODE);
            assert_eq!(body, b"opaque");
            let mut reply = 16384i32.to_ne_bytes().to_vec();
            reply.extend_from_slice(&(-8192i32).to_ne_bytes());
            service.send_to(&tagged_last(&reply), reply_to).await.unwrap();
        };
        let (decoded, ()) = tokio::join!(codec.decode(b"opaque", &mut batch), fake);
        decoded.unwrap();
        assert_eq!(batch.samples(), &[0.5, -0.25]);
    }

    #[tokio::test]
    async fn missing_reply_times_out() {
        let (codec, _service) = codec_against(Some(Duration::from_millis(50))).await;
        let batch = Batch::new(BatchShape::new(1, 1, 1));
        let err = codec.encode(&batch).await.unwrap_err();
        assert!(matches!(err, SignalError::Timeout(_)));
    }

    #[tokio::test]
    async fn stop_cancels_waiting_request() {
        let (codec, _service) = codec_against(None).await;
        let codec = Arc::new(codec);

        let waiting = {
            let codec = Arc::clone(&codec);
            tokio::spawn(async move {
                let batch = Batch::new(BatchShape::new(1, 1, 1));
                codec.encode(&batch).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        codec.stop();

        let result = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SignalError::Cancelled)));
    }

    #[tokio::test]
    async fn use_before_start_is_rejected() {
        let config = RemoteCodecConfig {
            request: EndpointConfig::sender("127.0.0.1:9".parse().unwrap(), 64),
            response: EndpointConfig::receiver(loopback(), 64),
            timeout: None,
        };
        let codec = RemoteCodec::new(config, Handle::current());
        let batch = Batch::new(BatchShape::new(1, 1, 1));
        let err = codec.encode(&batch).await.unwrap_err();
        assert!(matches!(err, SignalError::Channel(ChannelError::NotStarted)));
    }
}
