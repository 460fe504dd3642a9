//! Tactile stream: rows batched on the sender, replayed row by row on the receiver.
//!
//! Encoding and decoding run on the runtime so a slow codec never stalls the
//! tick. Each side hands batches to its worker through a [`Mailbox`], so a
//! worker that falls behind skips to the newest batch. Finished batches travel
//! back through a second mailbox and are reused, so steady-state streaming
//! allocates no batches.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio_util::bytes::Bytes;
use tokio_util::sync::CancellationToken;

use super::{ActuatorArray, PlaybackBuffer, TactileSource};
use crate::signal::{Batch, BatchShape, SignalCodec, SignalError};
use crate::transport::{
    ChannelError, DatagramReceiver, DatagramSender, EndpointConfig, Mailbox, SenderHandle,
};

/// Mean row magnitude below which an actuator is switched off.
pub const ACTIVATION_THRESHOLD: f32 = 0.01;

type FlushObserver = Box<dyn FnMut(&Batch) + Send>;

/// Samples every detector each tick and sends one encoded batch every `frames` ticks.
pub struct TactileSender<S> {
    detectors: Vec<S>,
    batch: Batch,
    frame: usize,
    codec: Arc<dyn SignalCodec>,
    config: EndpointConfig,
    runtime: Handle,
    sender: Option<DatagramSender>,
    outbox: Mailbox<Batch>,
    spent: Mailbox<Batch>,
    worker: Option<CancellationToken>,
    on_flush: Option<FlushObserver>,
}

impl<S: TactileSource> TactileSender<S> {
    pub fn new(
        detectors: Vec<S>,
        frames: usize,
        taxels: usize,
        codec: Arc<dyn SignalCodec>,
        config: EndpointConfig,
        runtime: Handle,
    ) -> Self {
        let shape = BatchShape::new(detectors.len(), frames.max(1), taxels);
        Self {
            detectors,
            batch: Batch::new(shape),
            frame: 0,
            codec,
            config,
            runtime,
            sender: None,
            outbox: Mailbox::new(),
            spent: Mailbox::new(),
            worker: None,
            on_flush: None,
        }
    }

    /// Observe every completed batch before it is encoded (e.g. for recording).
    pub fn on_flush(mut self, observer: impl FnMut(&Batch) + Send + 'static) -> Self {
        self.on_flush = Some(Box::new(observer));
        self
    }

    pub fn shape(&self) -> BatchShape {
        self.batch.shape()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn start(&mut self) -> Result<(), SignalError> {
        if self.is_running() {
            return Err(ChannelError::AlreadyStarted.into());
        }
        self.codec.start()?;

        let mut sender = DatagramSender::new(self.config, self.runtime.clone());
        if let Err(e) = sender.start() {
            self.codec.stop();
            return Err(e.into());
        }
        let handle = sender.handle().ok_or(ChannelError::NotStarted)?;

        self.outbox.clear();
        let cancel = CancellationToken::new();
        self.runtime.spawn(encode_loop(
            Arc::clone(&self.codec),
            self.outbox.clone(),
            self.spent.clone(),
            handle,
            cancel.clone(),
        ));
        self.sender = Some(sender);
        self.worker = Some(cancel);
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(cancel) = self.worker.take() {
            cancel.cancel();
        }
        if let Some(mut sender) = self.sender.take() {
            sender.close();
            self.codec.stop();
        }
    }

    /// Record one row. Returns true on the tick that completes a batch.
    pub fn tick(&mut self) -> bool {
        for (actuator, detector) in self.detectors.iter_mut().enumerate() {
            self.batch.write_row(actuator, self.frame, detector.sample());
        }
        self.frame += 1;
        if self.frame < self.batch.shape().frames {
            return false;
        }
        self.frame = 0;
        self.flush();
        true
    }

    fn flush(&mut self) {
        if let Some(observer) = self.on_flush.as_mut() {
            observer(&self.batch);
        }
        if !self.is_running() {
            return;
        }
        let out = match self.spent.take() {
            Some(mut out) => {
                out.clone_from(&self.batch);
                out
            }
            None => self.batch.clone(),
        };
        if let Some(unsent) = self.outbox.replace(out) {
            tracing::debug!("Encoder behind, replaced pending tactile batch");
            self.spent.post(unsent);
        }
    }
}

impl<S> Drop for TactileSender<S> {
    fn drop(&mut self) {
        if let Some(cancel) = self.worker.take() {
            cancel.cancel();
        }
        if self.sender.take().is_some() {
            self.codec.stop();
        }
    }
}

async fn encode_loop(
    codec: Arc<dyn SignalCodec>,
    outbox: Mailbox<Batch>,
    spent: Mailbox<Batch>,
    sender: SenderHandle,
    cancel: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            batch = outbox.recv() => batch,
        };

        let result = codec.encode(&batch).await;
        spent.post(batch);
        match result {
            Ok(Some(encoded)) => {
                let len = encoded.len();
                if let Err(e) = sender.send(encoded) {
                    tracing::warn!(error = %e, len, "Failed to queue tactile batch");
                }
            }
            Ok(None) => {}
            Err(SignalError::Cancelled) => break,
            Err(e) => tracing::warn!(error = %e, "Failed to encode tactile batch"),
        }
    }
    tracing::trace!("Tactile encode task exiting");
}

/// Receives encoded batches and drives the actuator array one frame per tick.
pub struct TactileReceiver<A> {
    actuators: A,
    active: Vec<bool>,
    shape: BatchShape,
    codec: Arc<dyn SignalCodec>,
    config: EndpointConfig,
    runtime: Handle,
    receiver: Option<DatagramReceiver>,
    inbox: Mailbox<Bytes>,
    decoded: Mailbox<Batch>,
    recycled: Mailbox<Batch>,
    worker: Option<CancellationToken>,
    playback: PlaybackBuffer,
}

impl<A: ActuatorArray> TactileReceiver<A> {
    pub fn new(
        actuators: A,
        frames: usize,
        taxels: usize,
        codec: Arc<dyn SignalCodec>,
        config: EndpointConfig,
        runtime: Handle,
    ) -> Self {
        let count = actuators.actuator_count();
        Self {
            actuators,
            active: vec![false; count],
            shape: BatchShape::new(count, frames.max(1), taxels),
            codec,
            config,
            runtime,
            receiver: None,
            inbox: Mailbox::new(),
            decoded: Mailbox::new(),
            recycled: Mailbox::new(),
            worker: None,
            playback: PlaybackBuffer::new(),
        }
    }

    pub fn shape(&self) -> BatchShape {
        self.shape
    }

    pub fn actuators(&self) -> &A {
        &self.actuators
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.receiver.as_ref().and_then(DatagramReceiver::local_addr)
    }

    pub fn start(&mut self) -> Result<(), SignalError> {
        if self.worker.is_some() {
            return Err(ChannelError::AlreadyStarted.into());
        }
        self.codec.start()?;

        let inbox = self.inbox.clone();
        let mut receiver = DatagramReceiver::new(self.config, self.runtime.clone(), move |payload| {
            inbox.post(payload);
        });
        if let Err(e) = receiver.start() {
            self.codec.stop();
            return Err(e.into());
        }

        let cancel = CancellationToken::new();
        self.runtime.spawn(decode_loop(
            Arc::clone(&self.codec),
            self.inbox.clone(),
            self.decoded.clone(),
            self.recycled.clone(),
            Batch::new(self.shape),
            cancel.clone(),
        ));
        self.receiver = Some(receiver);
        self.worker = Some(cancel);
        Ok(())
    }

    /// Silence every actuator and release the socket.
    pub fn stop(&mut self) {
        self.actuators.stop_all();
        self.active.fill(false);
        if let Some(cancel) = self.worker.take() {
            cancel.cancel();
        }
        if let Some(mut receiver) = self.receiver.take() {
            receiver.close();
            self.codec.stop();
        }
    }

    /// Queue the newest decoded batch, then play one frame. Returns true if a frame played.
    ///
    /// A queued batch starts playing only after every frame of the current one.
    pub fn tick(&mut self) -> bool {
        if let Some(batch) = self.decoded.take()
            && let Some(unplayed) = self.playback.offer(batch)
        {
            tracing::debug!("Playback behind, replaced pending tactile batch");
            self.recycled.post(unplayed);
        }
        let Some((batch, frame)) = self.playback.advance() else {
            return false;
        };
        let count = batch.shape().actuators.min(self.active.len());
        for actuator in 0..count {
            let intensity = batch.mean_intensity(actuator, frame);
            drive(&mut self.actuators, &mut self.active[actuator], actuator, intensity);
        }
        if let Some(spent) = self.playback.reclaim() {
            self.recycled.post(spent);
        }
        true
    }
}

fn drive<A: ActuatorArray>(actuators: &mut A, active: &mut bool, actuator: usize, intensity: f32) {
    if intensity < ACTIVATION_THRESHOLD {
        if *active {
            actuators.stop(actuator);
            *active = false;
        }
    } else {
        actuators.play(actuator, intensity);
        *active = true;
    }
}

impl<A> Drop for TactileReceiver<A> {
    fn drop(&mut self) {
        if let Some(cancel) = self.worker.take() {
            cancel.cancel();
        }
        if self.receiver.take().is_some() {
            self.codec.stop();
        }
    }
}

async fn decode_loop(
    codec: Arc<dyn SignalCodec>,
    inbox: Mailbox<Bytes>,
    decoded: Mailbox<Batch>,
    recycled: Mailbox<Batch>,
    mut cache: Batch,
    cancel: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            payload = inbox.recv() => payload,
        };

        match codec.decode(&payload, &mut cache).await {
            Ok(()) => {
                let out = match recycled.take() {
                    Some(mut out) => {
                        out.clone_from(&cache);
                        out
                    }
                    None => cache.clone(),
                };
                if let Some(stale) = decoded.replace(out) {
                    recycled.post(stale);
                }
            }
            Err(SignalError::Cancelled) => break,
            Err(e) => {
                tracing::warn!(error = %e, len = payload.len(), "Dropped undecodable tactile batch");
            }
        }
    }
    tracing::trace!("Tactile decode task exiting");
}
