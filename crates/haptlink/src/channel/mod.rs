//! Tick-driven channel controllers and the collaborators they drive.
//!
//! Each controller is ticked once per fixed simulation step by its owner. The
//! network side runs on the shared runtime and meets the tick side only
//! through a [`Mailbox`](crate::transport::Mailbox).

mod playback;
mod pose;
mod tactile;
mod video;

use tokio_util::bytes::Bytes;

pub use playback::PlaybackBuffer;
pub use pose::{BodyPose, PoseReceiver, PoseSample, PoseSender};
pub use tactile::{ACTIVATION_THRESHOLD, TactileReceiver, TactileSender};
pub use video::{CLEANUP_INTERVAL, OversizePolicy, VideoReceiver, VideoSender};

/// Produces encoded image frames (e.g. JPEG) on demand.
pub trait FrameSource: Send {
    fn capture(&mut self) -> Option<Bytes>;
}

/// Displays encoded image frames.
pub trait FrameSink: Send {
    fn render(&mut self, frame: &[u8]);

    /// Called after every [`CLEANUP_INTERVAL`] renders to release accumulated resources.
    fn cleanup(&mut self) {}
}

/// One tactile detector; yields one taxel row per tick, or nothing when idle.
pub trait TactileSource: Send {
    fn sample(&mut self) -> Option<&[f32]>;
}

/// The physical actuator array on the receiving side.
pub trait ActuatorArray: Send {
    fn actuator_count(&self) -> usize;

    fn play(&mut self, actuator: usize, intensity: f32);

    fn stop(&mut self, actuator: usize);

    fn stop_all(&mut self);
}
