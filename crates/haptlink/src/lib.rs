//! haptlink: pose, video and tactile streaming between a host and a peer over UDP.

pub mod channel;
pub mod config;
pub mod service;
pub mod session;
pub mod signal;
pub mod transport;
pub mod wire;

pub use channel::{
    ActuatorArray, FrameSink, FrameSource, PoseReceiver, PoseSample, PoseSender, TactileReceiver,
    TactileSender, TactileSource, VideoReceiver, VideoSender,
};
pub use config::{ConfigError, Role, Settings};
pub use service::CodecService;
pub use session::{HostSession, PeerSession, SessionEvent};
pub use signal::{Batch, BatchShape, CodecKind, SignalCodec, SignalError};
pub use transport::{ChannelError, DatagramReceiver, DatagramSender, EndpointConfig};
