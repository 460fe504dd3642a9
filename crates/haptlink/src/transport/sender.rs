//! Fire-and-forget datagram sender.

use std::net::SocketAddr;

use futures::SinkExt;
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tokio_util::udp::UdpFramed;

use super::{ChannelError, EndpointConfig, FragmentCodec, split};

enum State {
    Idle,
    Running {
        tx: mpsc::UnboundedSender<Bytes>,
        cancel: CancellationToken,
        local_addr: SocketAddr,
    },
    Closed,
}

/// Sends payloads to a single destination.
///
/// `send` only enqueues; a writer task on the runtime fragments each payload
/// and writes the chunks back-to-back. Send failures are logged there and
/// never reach the caller.
pub struct DatagramSender {
    config: EndpointConfig,
    runtime: Handle,
    state: State,
}

/// Cloneable enqueue-only view of a running sender, for use from other tasks.
#[derive(Clone)]
pub struct SenderHandle {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl SenderHandle {
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<(), ChannelError> {
        self.tx
            .send(payload.into())
            .map_err(|_| ChannelError::Closed)
    }
}

impl DatagramSender {
    pub fn new(config: EndpointConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            state: State::Idle,
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Open the local socket and spawn the writer task.
    ///
    /// A sender starts at most once; after [`close`](Self::close) build a new one.
    pub fn start(&mut self) -> Result<(), ChannelError> {
        match self.state {
            State::Running { .. } => return Err(ChannelError::AlreadyStarted),
            State::Closed => return Err(ChannelError::Closed),
            State::Idle => {}
        }
        self.config.check()?;

        let socket = super::bind(self.config.local, &self.runtime)?;
        let local_addr = socket.local_addr().map_err(|source| ChannelError::Bind {
            addr: self.config.local,
            source,
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        self.runtime.spawn(write_loop(
            socket,
            self.config.remote,
            self.config.buffer_size,
            rx,
            cancel.clone(),
        ));

        tracing::debug!(
            %local_addr,
            remote = %self.config.remote,
            buffer_size = self.config.buffer_size,
            "Datagram sender started"
        );
        self.state = State::Running {
            tx,
            cancel,
            local_addr,
        };
        Ok(())
    }

    /// Queue `payload` for sending. Returns as soon as it is queued.
    pub fn send(&self, payload: impl Into<Bytes>) -> Result<(), ChannelError> {
        match &self.state {
            State::Running { tx, .. } => tx.send(payload.into()).map_err(|_| ChannelError::Closed),
            State::Idle => Err(ChannelError::NotStarted),
            State::Closed => Err(ChannelError::Closed),
        }
    }

    pub fn handle(&self) -> Option<SenderHandle> {
        match &self.state {
            State::Running { tx, .. } => Some(SenderHandle { tx: tx.clone() }),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, State::Running { .. })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.state {
            State::Running { local_addr, .. } => Some(*local_addr),
            _ => None,
        }
    }

    /// Stop the writer task and release the socket. Payloads still queued are dropped.
    pub fn close(&mut self) {
        if let State::Running { cancel, .. } = std::mem::replace(&mut self.state, State::Closed) {
            cancel.cancel();
            tracing::debug!(remote = %self.config.remote, "Datagram sender closed");
        }
    }
}

impl Drop for DatagramSender {
    fn drop(&mut self) {
        self.close();
    }
}

async fn write_loop(
    socket: UdpSocket,
    remote: SocketAddr,
    max_datagram: usize,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
) {
    let mut framed = UdpFramed::new(socket, FragmentCodec::new(max_datagram));

    loop {
        let payload = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            payload = rx.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        let len = payload.len();
        for fragment in split(payload, max_datagram) {
            if let Err(e) = framed.send((fragment, remote)).await {
                tracing::warn!(error = %e, %remote, payload_len = len, "Failed to send datagram");
                break;
            }
        }
    }

    tracing::trace!(%remote, "Writer task exiting");
}
