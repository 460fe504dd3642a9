//! Body pose stream: one datagram per tick, newest sample wins.

use tokio::runtime::Handle;
use tokio_util::bytes::Bytes;

use crate::transport::{ChannelError, DatagramReceiver, DatagramSender, EndpointConfig, Mailbox};
use crate::wire::{self, F32_LEN, QUAT_LEN, Quat, VEC3_LEN, Vec3, WireError};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BodyPose {
    pub position: Vec3,
    pub rotation: Quat,
}

/// Timestamp plus a fixed number of body poses.
///
/// The body count is agreed out of band and never sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseSample {
    pub timestamp: f32,
    pub bodies: Vec<BodyPose>,
}

impl PoseSample {
    pub fn new(bodies: usize) -> Self {
        Self {
            timestamp: 0.0,
            bodies: vec![BodyPose::default(); bodies],
        }
    }

    pub fn payload_len(&self) -> usize {
        F32_LEN + self.bodies.len() * (VEC3_LEN + QUAT_LEN)
    }

    /// Serialize into `buf`, returning the bytes written.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        wire::ensure(buf.len(), 0, self.payload_len())?;
        let mut at = wire::write_f32(buf, 0, self.timestamp)?;
        for body in &self.bodies {
            at = wire::write_vec3(buf, at, body.position)?;
            at = wire::write_quat(buf, at, body.rotation)?;
        }
        Ok(at)
    }

    /// Overwrite this sample from `buf`. Leaves `self` untouched on error.
    pub fn decode_from(&mut self, buf: &[u8]) -> Result<(), WireError> {
        wire::ensure(buf.len(), 0, self.payload_len())?;
        let (timestamp, mut at) = wire::read_f32(buf, 0)?;
        self.timestamp = timestamp;
        for body in &mut self.bodies {
            let (position, next) = wire::read_vec3(buf, at)?;
            let (rotation, next) = wire::read_quat(buf, next)?;
            *body = BodyPose { position, rotation };
            at = next;
        }
        Ok(())
    }
}

/// Sends the local pose every tick while started.
pub struct PoseSender {
    config: EndpointConfig,
    runtime: Handle,
    sender: Option<DatagramSender>,
    buffer: Vec<u8>,
}

impl PoseSender {
    pub fn new(config: EndpointConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            sender: None,
            buffer: vec![0; config.buffer_size],
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

    /// Serialize and send `sample`. No-op while stopped.
    pub fn tick(&mut self, sample: &PoseSample) {
        let Some(sender) = &self.sender else {
            return;
        };
        let len = match sample.encode_into(&mut self.buffer) {
            Ok(len) => len,
            Err(e) => {
                tracing::warn!(error = %e, bodies = sample.bodies.len(), "Pose does not fit send buffer");
                return;
            }
        };
        if let Err(e) = sender.send(Bytes::copy_from_slice(&self.buffer[..len])) {
            tracing::warn!(error = %e, "Failed to queue pose");
        }
    }
}

/// Receives remote poses and tracks link liveness.
pub struct PoseReceiver {
    config: EndpointConfig,
    runtime: Handle,
    receiver: Option<DatagramReceiver>,
    inbox: Mailbox<Bytes>,
    sample: PoseSample,
    time_offset: f32,
    timeout_secs: f32,
}

impl PoseReceiver {
    pub fn new(config: EndpointConfig, runtime: Handle, bodies: usize, timeout_secs: f32) -> Self {
        Self {
            config,
            runtime,
            receiver: None,
            inbox: Mailbox::new(),
            sample: PoseSample::new(bodies),
            time_offset: 0.0,
            timeout_secs,
        }
    }

    pub fn start(&mut self) -> Result<(), ChannelError> {
        if self.receiver.is_some() {
            return Err(ChannelError::AlreadyStarted);
        }
        let inbox = self.inbox.clone();
        let mut receiver = DatagramReceiver::new(self.config, self.runtime.clone(), move |payload| {
            inbox.post(payload);
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

    /// True when no pose has arrived since the last tick.
    pub fn is_empty(&self) -> bool {
        self.inbox.is_empty()
    }

    /// Apply the newest pending pose. Returns true if the sample changed.
    pub fn tick(&mut self) -> bool {
        match self.inbox.take() {
            Some(payload) => self.apply_payload(&payload),
            None => false,
        }
    }

    pub(crate) fn apply_payload(&mut self, payload: &[u8]) -> bool {
        match self.sample.decode_from(payload) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, len = payload.len(), "Dropped malformed pose");
                false
            }
        }
    }

    /// Latest pose received.
    pub fn sample(&self) -> &PoseSample {
        &self.sample
    }

    /// Remote timestamp of the latest pose, shifted onto the local clock.
    pub fn last_pose_time(&self) -> f32 {
        self.sample.timestamp + self.time_offset
    }

    pub fn is_timed_out(&self, now: f32) -> bool {
        now - self.last_pose_time() > self.timeout_secs
    }

    /// Align the latest remote timestamp with `now` on the local clock.
    pub fn calibrate_time(&mut self, now: f32) {
        self.time_offset = now - self.sample.timestamp;
    }
}
