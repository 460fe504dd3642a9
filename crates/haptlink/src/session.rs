//! Per-process composition of the three channels.
//!
//! The host streams video and tactile data only while the peer's poses keep
//! arriving; the peer runs all of its channels for its whole lifetime.

use crate::channel::{
    ActuatorArray, FrameSink, FrameSource, PoseReceiver, PoseSample, PoseSender, TactileReceiver,
    TactileSender, TactileSource, VideoReceiver, VideoSender,
};
use crate::signal::SignalError;

/// Outcome of one host tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// No pose this tick and no timeout to act on.
    Waiting,
    /// First pose after being idle; outbound channels were started.
    Connected,
    /// A pose arrived and outbound channels ticked.
    Streaming,
    /// Poses stopped for longer than the timeout; outbound channels were stopped.
    Disconnected,
}

pub struct HostSession<V, T> {
    pose: PoseReceiver,
    video: VideoSender<V>,
    tactile: TactileSender<T>,
    streaming: bool,
}

impl<V: FrameSource, T: TactileSource> HostSession<V, T> {
    pub fn new(pose: PoseReceiver, video: VideoSender<V>, tactile: TactileSender<T>) -> Self {
        Self {
            pose,
            video,
            tactile,
            streaming: false,
        }
    }

    /// Start listening for poses. Outbound channels wait for the first one.
    pub fn start(&mut self) -> Result<(), SignalError> {
        self.pose.start()?;
        Ok(())
    }

    pub fn stop(&mut self) {
        self.pose.stop();
        self.disconnect();
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    pub fn pose(&self) -> &PoseReceiver {
        &self.pose
    }

    pub fn video(&self) -> &VideoSender<V> {
        &self.video
    }

    pub fn tactile(&self) -> &TactileSender<T> {
        &self.tactile
    }

    /// Advance one fixed step; `now` is the local clock in seconds.
    pub fn tick(&mut self, now: f32) -> SessionEvent {
        if self.pose.is_empty() {
            if self.streaming && self.pose.is_timed_out(now) {
                tracing::info!(now, last_pose = self.pose.last_pose_time(), "Peer timed out");
                self.disconnect();
                return SessionEvent::Disconnected;
            }
            return SessionEvent::Waiting;
        }

        self.pose.tick();
        let event = if self.streaming {
            SessionEvent::Streaming
        } else {
            if let Err(e) = self.connect(now) {
                tracing::warn!(error = %e, "Failed to start outbound channels");
                return SessionEvent::Waiting;
            }
            SessionEvent::Connected
        };

        self.video.tick();
        self.tactile.tick();
        event
    }

    fn connect(&mut self, now: f32) -> Result<(), SignalError> {
        self.pose.calibrate_time(now);
        self.video.start()?;
        if let Err(e) = self.tactile.start() {
            self.video.stop();
            return Err(e);
        }
        self.streaming = true;
        tracing::info!(now, "Peer connected");
        Ok(())
    }

    fn disconnect(&mut self) {
        self.video.stop();
        self.tactile.stop();
        self.streaming = false;
    }
}

pub struct PeerSession<K, A> {
    pose: PoseSender,
    video: VideoReceiver<K>,
    tactile: TactileReceiver<A>,
}

impl<K: FrameSink, A: ActuatorArray> PeerSession<K, A> {
    pub fn new(pose: PoseSender, video: VideoReceiver<K>, tactile: TactileReceiver<A>) -> Self {
        Self {
            pose,
            video,
            tactile,
        }
    }

    /// Start every channel. On failure the ones already started are stopped again.
    pub fn start(&mut self) -> Result<(), SignalError> {
        if let Err(e) = self.start_channels() {
            self.stop();
            return Err(e);
        }
        Ok(())
    }

    fn start_channels(&mut self) -> Result<(), SignalError> {
        self.pose.start()?;
        self.video.start()?;
        self.tactile.start()?;
        Ok(())
    }

    pub fn stop(&mut self) {
        self.pose.stop();
        self.video.stop();
        self.tactile.stop();
    }

    pub fn pose(&self) -> &PoseSender {
        &self.pose
    }

    pub fn video(&self) -> &VideoReceiver<K> {
        &self.video
    }

    pub fn tactile(&self) -> &TactileReceiver<A> {
        &self.tactile
    }

    /// Send `pose`, then render and play whatever has arrived.
    pub fn tick(&mut self, pose: &PoseSample) {
        self.pose.tick(pose);
        self.video.tick();
        self.tactile.tick();
    }
}
