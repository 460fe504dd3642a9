//! Video stream: every Nth tick one frame, newest frame wins.

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio_util::bytes::Bytes;

use super::{FrameSink, FrameSource};
use crate::transport::{ChannelError, DatagramReceiver, DatagramSender, EndpointConfig, Mailbox};

/// Renders between [`FrameSink::cleanup`] calls.
pub const CLEANUP_INTERVAL: usize = 1000;

/// What to do with a captured frame that does not fit in one datagram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OversizePolicy {
    /// Split it across datagrams like any other payload.
    #[default]
    Fragment,
    /// Skip the frame.
    Drop,
}

/// Counts ticks modulo `interval`; active on the first tick of each cycle.
#[derive(Debug, Clone, Copy)]
struct Interval {
    every: usize,
    counter: usize,
}

impl Interval {
    fn new(every: usize) -> Self {
        Self {
            every: every.max(1),
            counter: 0,
        }
    }

    fn tick(&mut self) -> bool {
        let active = self.counter == 0;
        self.counter = (self.counter + 1) % self.every;
        active
    }
}

pub struct VideoSender<S> {
    source: S,
    config: EndpointConfig,
    runtime: Handle,
    sender: Option<DatagramSender>,
    interval: Interval,
    policy: OversizePolicy,
}

impl<S: FrameSource> VideoSender<S> {
    pub fn new(
        source: S,
        config: EndpointConfig,
        runtime: Handle,
        interval: usize,
        policy: OversizePolicy,
    ) -> Self {
        Self {
            source,
            config,
            runtime,
            sender: None,
            interval: Interval::new(interval),
            policy,
        }
    }

    pub fn start(&mut self) -> Result<(), ChannelError> {
        if self.is_running() {
            return Err(ChannelError::AlreadyStarted);
        }
        let mut sender = DatagramSender::new(self.config, self.runtime.clone());
        sender.start()?;
        self.sender = Some(sender);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut sender) = self.sender.take() {
            sender.close();
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.as_ref().is_some_and(DatagramSender::is_running)
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Capture and send a frame on active ticks. Returns true if a frame was queued.
    pub fn tick(&mut self) -> bool {
        if !self.interval.tick() {
            return false;
        }
        let Some(sender) = &self.sender else {
            return false;
        };
        let Some(frame) = self.source.capture() else {
            return false;
        };

        if self.policy == OversizePolicy::Drop && frame.len() >= self.config.buffer_size {
            tracing::debug!(
                len = frame.len(),
                buffer_size = self.config.buffer_size,
                "Dropped oversized video frame"
            );
            return false;
        }
        match sender.send(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to queue video frame");
                false
            }
        }
    }
}

pub struct VideoReceiver<K> {
    sink: K,
    config: EndpointConfig,
    runtime: Handle,
    receiver: Option<DatagramReceiver>,
    inbox: Mailbox<Bytes>,
    interval: Interval,
    renders: usize,
}

impl<K: FrameSink> VideoReceiver<K> {
    pub fn new(sink: K, config: EndpointConfig, runtime: Handle, interval: usize) -> Self {
        Self {
            sink,
            config,
            runtime,
            receiver: None,
            inbox: Mailbox::new(),
            interval: Interval::new(interval),
            renders: 0,
        }
    }

    pub fn start(&mut self) -> Result<(), ChannelError> {
        if self.receiver.is_some() {
            return Err(ChannelError::AlreadyStarted);
        }
        let inbox = self.inbox.clone();
        let mut receiver = DatagramReceiver::new(self.config, self.runtime.clone(), move |frame| {
            inbox.post(frame);
        });
        receiver.start()?;
        self.receiver = Some(receiver);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
        }
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.receiver.as_ref().and_then(DatagramReceiver::local_addr)
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Render the newest pending frame on active ticks. Returns true if a frame was rendered.
    pub fn tick(&mut self) -> bool {
        if !self.interval.tick() {
            return false;
        }
        match self.inbox.take() {
            Some(frame) => {
                self.render(&frame);
                true
            }
            None => false,
        }
    }

    fn render(&mut self, frame: &[u8]) {
        self.sink.render(frame);
        self.renders += 1;
        if self.renders >= CLEANUP_INTERVAL {
            self.sink.cleanup();
            self.renders = 0;
        }
    }
}
