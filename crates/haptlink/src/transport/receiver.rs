//! Datagram receiver with payload reassembly.

use std::net::SocketAddr;

use futures::StreamExt;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tokio_util::udp::UdpFramed;

use super::{ChannelError, EndpointConfig, FragmentCodec, Reassembler};

type OnReceive = Box<dyn FnMut(Bytes) + Send + 'static>;

enum State {
    Idle(OnReceive),
    Running {
        cancel: CancellationToken,
        local_addr: SocketAddr,
    },
    Closed,
}

/// Listens on a local address and delivers each reassembled payload to a callback.
///
/// The callback runs on the receive task and must not block; it normally
/// posts into a [`Mailbox`](super::Mailbox).
pub struct DatagramReceiver {
    config: EndpointConfig,
    runtime: Handle,
    state: State,
}

impl DatagramReceiver {
    pub fn new(
        config: EndpointConfig,
        runtime: Handle,
        on_receive: impl FnMut(Bytes) + Send + 'static,
    ) -> Self {
        Self {
            config,
            runtime,
            state: State::Idle(Box::new(on_receive)),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Bind the local address and spawn the receive loop.
    pub fn start(&mut self) -> Result<(), ChannelError> {
        match self.state {
            State::Running { .. } => return Err(ChannelError::AlreadyStarted),
            State::Closed => return Err(ChannelError::Closed),
            State::Idle(_) => {}
        }
        self.config.check()?;

        let socket = super::bind(self.config.local, &self.runtime)?;
        let local_addr = socket.local_addr().map_err(|source| ChannelError::Bind {
            addr: self.config.local,
            source,
        })?;

        let cancel = CancellationToken::new();
        let State::Idle(on_receive) = std::mem::replace(
            &mut self.state,
            State::Running {
                cancel: cancel.clone(),
                local_addr,
            },
        ) else {
            return Err(ChannelError::AlreadyStarted);
        };

        self.runtime.spawn(receive_loop(
            socket,
            self.config.buffer_size,
            on_receive,
            cancel,
        ));
        tracing::debug!(
            %local_addr,
            buffer_size = self.config.buffer_size,
            "Datagram receiver started"
        );
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    /// Bound address once started. Useful when `local` used port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            State::Running { local_addr, .. } => Some(*local_addr),
            _ => None,
        }
    }

    /// Cancel the receive loop and release the socket.
    pub fn close(&mut self) {
        if let State::Running { cancel, local_addr } =
            std::mem::replace(&mut self.state, State::Closed)
        {
            cancel.cancel();
            tracing::debug!(%local_addr, "Datagram receiver closed");
        }
    }
}

impl Drop for DatagramReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

async fn receive_loop(
    socket: UdpSocket,
    max_datagram: usize,
    mut on_receive: OnReceive,
    cancel: CancellationToken,
) {
    let mut framed = UdpFramed::new(socket, FragmentCodec::new(max_datagram));
    let mut reassembler = Reassembler::new();

    loop {
        let next = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            next = framed.next() => next,
        };

        match next {
            Some(Ok((fragment, peer))) => {
                tracing::trace!(%peer, len = fragment.body.len(), last = fragment.is_last, "Fragment received");
                if let Some(payload) = reassembler.push(fragment) {
                    on_receive(payload);
                }
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Dropped datagram");
            }
            None => break,
        }
    }

    tracing::trace!("Receive loop exiting");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::{DatagramSender, Mailbox};

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn started(buffer_size: usize, mailbox: &Mailbox<Bytes>) -> DatagramReceiver {
        let inbox = mailbox.clone();
        let mut receiver = DatagramReceiver::new(
            EndpointConfig::receiver(loopback(), buffer_size),
            Handle::current(),
            move |payload| {
                inbox.post(payload);
            },
        );
        receiver.start().unwrap();
        receiver
    }

    #[tokio::test]
    async fn delivers_payload_from_sender() {
        let mailbox = Mailbox::new();
        let receiver = started(64, &mailbox).await;

        let remote = receiver.local_addr().unwrap();
        let mut sender = DatagramSender::new(EndpointConfig::sender(remote, 64), Handle::current());
        sender.start().unwrap();
        sender.send(&b"pose"[..]).unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), mailbox.recv())
            .await
            .unwrap();
        assert_eq!(&payload[..], b"pose");
    }

    #[tokio::test]
    async fn malformed_datagrams_do_not_stop_the_loop() {
        let mailbox = Mailbox::new();
        let receiver = started(16, &mailbox).await;
        let remote = receiver.local_addr().unwrap();

        let raw = UdpSocket::bind(loopback()).await.unwrap();
        // Shorter than the tag.
        raw.send_to(&[1, 0], remote).await.unwrap();
        // Unknown tag.
        let mut unknown = 9i32.to_ne_bytes().to_vec();
        unknown.push(0);
        raw.send_to(&unknown, remote).await.unwrap();
        // Larger than the buffer.
        let mut oversized = 1i32.to_ne_bytes().to_vec();
        oversized.extend_from_slice(&[0u8; 32]);
        raw.send_to(&oversized, remote).await.unwrap();
        // Valid.
        let mut valid = 1i32.to_ne_bytes().to_vec();
        valid.extend_from_slice(b"ok");
        raw.send_to(&valid, remote).await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), mailbox.recv())
            .await
            .unwrap();
        assert_eq!(&payload[..], b"ok");
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let held = std::net::UdpSocket::bind(loopback()).unwrap();
        let addr = held.local_addr().unwrap();
        let mut receiver = DatagramReceiver::new(
            EndpointConfig::receiver(addr, 64),
            Handle::current(),
            |_| {},
        );
        assert!(matches!(receiver.start(), Err(ChannelError::Bind { .. })));
        assert!(!receiver.is_running());
    }

    #[tokio::test]
    async fn close_is_final() {
        let mailbox = Mailbox::new();
        let mut receiver = started(64, &mailbox).await;
        assert!(matches!(receiver.start(), Err(ChannelError::AlreadyStarted)));
        receiver.close();
        assert!(receiver.local_addr().is_none());
        assert!(matches!(receiver.start(), Err(ChannelError::Closed)));
    }
}
