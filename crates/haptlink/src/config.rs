//! Deployment settings, loaded from a JSON file.
//!
//! Every field has a default, so a file only needs the values it changes.
//! The host is the side that streams video and tactile data and receives
//! poses; the peer is the other end.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

use crate::channel::{OversizePolicy, PoseSample};
use crate::signal::{
    BlockFramedCodec, CodecKind, Lz4BlockCodec, QuantizedCodec, RemoteCodec, RemoteCodecConfig,
    SignalCodec,
};
use crate::transport::{EndpointConfig, TAG_LEN};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Which end of the link a process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Peer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,

    pub pose_port: u16,
    pub video_port: u16,
    pub tactile_port: u16,

    /// Where the codec service listens.
    pub codec_service: SocketAddr,
    /// Local port the host's codec replies arrive on.
    pub host_codec_reply_port: u16,
    /// Local port the peer's codec replies arrive on.
    pub peer_codec_reply_port: u16,

    pub pose_buffer_size: usize,
    pub video_buffer_size: usize,
    pub tactile_buffer_size: usize,
    pub codec_buffer_size: usize,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            local_ip: LOCALHOST,
            remote_ip: LOCALHOST,
            pose_port: 5100,
            video_port: 5101,
            tactile_port: 5102,
            codec_service: SocketAddr::new(LOCALHOST, 5300),
            host_codec_reply_port: 5301,
            peer_codec_reply_port: 5302,
            pose_buffer_size: 1024,
            video_buffer_size: 60_000,
            tactile_buffer_size: 8192,
            codec_buffer_size: 8192,
        }
    }
}

impl NetworkSettings {
    fn local(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.local_ip, port)
    }

    fn remote(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.remote_ip, port)
    }

    /// Pose arrives at the host.
    pub fn pose_endpoint(&self, role: Role) -> EndpointConfig {
        match role {
            Role::Host => EndpointConfig::receiver(self.local(self.pose_port), self.pose_buffer_size),
            Role::Peer => EndpointConfig::sender(self.remote(self.pose_port), self.pose_buffer_size),
        }
    }

    /// Video leaves the host.
    pub fn video_endpoint(&self, role: Role) -> EndpointConfig {
        match role {
            Role::Host => EndpointConfig::sender(self.remote(self.video_port), self.video_buffer_size),
            Role::Peer => EndpointConfig::receiver(self.local(self.video_port), self.video_buffer_size),
        }
    }

    /// Tactile batches leave the host.
    pub fn tactile_endpoint(&self, role: Role) -> EndpointConfig {
        match role {
            Role::Host => {
                EndpointConfig::sender(self.remote(self.tactile_port), self.tactile_buffer_size)
            }
            Role::Peer => {
                EndpointConfig::receiver(self.local(self.tactile_port), self.tactile_buffer_size)
            }
        }
    }

    pub fn remote_codec(&self, role: Role, timeout: Option<Duration>) -> RemoteCodecConfig {
        let reply_port = match role {
            Role::Host => self.host_codec_reply_port,
            Role::Peer => self.peer_codec_reply_port,
        };
        RemoteCodecConfig {
            request: EndpointConfig::sender(self.codec_service, self.codec_buffer_size),
            response: EndpointConfig::receiver(self.local(reply_port), self.codec_buffer_size),
            timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseSettings {
    /// Bodies per sample; both ends must agree.
    pub bodies: usize,
    pub timeout_secs: f32,
}

impl Default for PoseSettings {
    fn default() -> Self {
        Self {
            bodies: 3,
            timeout_secs: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoSettings {
    /// Send (or render) on one tick out of this many.
    pub interval: usize,
    pub oversize: OversizePolicy,
}

impl Default for VideoSettings {
    fn default() -> Self {
        Self {
            interval: 2,
            oversize: OversizePolicy::Fragment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TactileSettings {
    /// Rows per batch.
    pub frames: usize,
    /// Samples per detector row.
    pub taxels: usize,
    pub compression: bool,
    pub codec: CodecKind,
    /// Remote codec only. `null` waits until the codec is stopped.
    pub response_timeout_ms: Option<u64>,
}

impl Default for TactileSettings {
    fn default() -> Self {
        Self {
            frames: 64,
            taxels: 8,
            compression: false,
            codec: CodecKind::Quantized,
            response_timeout_ms: Some(1000),
        }
    }
}

impl TactileSettings {
    /// Samples one actuator contributes to a batch.
    pub fn samples_per_actuator(&self) -> usize {
        self.frames * self.taxels
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }
}

/// Settings of the standalone codec service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub bind: SocketAddr,
    /// Where encode results go (the host's reply port).
    pub encode_reply: SocketAddr,
    /// Where decode results go (the peer's reply port).
    pub decode_reply: SocketAddr,
    pub actuators: usize,
    pub buffer_size: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(LOCALHOST, 5300),
            encode_reply: SocketAddr::new(LOCALHOST, 5301),
            decode_reply: SocketAddr::new(LOCALHOST, 5302),
            actuators: 3,
            buffer_size: 8192,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub network: NetworkSettings,
    pub pose: PoseSettings,
    pub video: VideoSettings,
    pub tactile: TactileSettings,
    pub service: ServiceSettings,
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        tracing::debug!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let net = &self.network;
        for (name, size) in [
            ("pose_buffer_size", net.pose_buffer_size),
            ("video_buffer_size", net.video_buffer_size),
            ("tactile_buffer_size", net.tactile_buffer_size),
            ("codec_buffer_size", net.codec_buffer_size),
            ("service.buffer_size", self.service.buffer_size),
        ] {
            if size <= TAG_LEN {
                return Err(ConfigError::Invalid(format!(
                    "{name} must exceed {TAG_LEN} bytes, got {size}"
                )));
            }
        }

        let pose_len = PoseSample::new(self.pose.bodies).payload_len();
        if pose_len + TAG_LEN > net.pose_buffer_size {
            return Err(ConfigError::Invalid(format!(
                "pose_buffer_size {} cannot hold {} bodies ({pose_len} bytes)",
                net.pose_buffer_size, self.pose.bodies
            )));
        }
        if self.pose.timeout_secs.is_nan() || self.pose.timeout_secs < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "pose.timeout_secs must be non-negative, got {}",
                self.pose.timeout_secs
            )));
        }
        if self.video.interval == 0 {
            return Err(ConfigError::Invalid("video.interval must be at least 1".into()));
        }
        if self.tactile.frames == 0 || self.tactile.taxels == 0 {
            return Err(ConfigError::Invalid(
                "tactile.frames and tactile.taxels must be at least 1".into(),
            ));
        }
        if self.service.actuators == 0 {
            return Err(ConfigError::Invalid("service.actuators must be at least 1".into()));
        }
        Ok(())
    }

    /// Build the tactile codec selected by `tactile.codec`.
    ///
    /// Without compression every strategy sends flat `f32` samples, so no
    /// service round trip is made.
    pub fn build_codec(&self, role: Role, runtime: Handle) -> Arc<dyn SignalCodec> {
        let tactile = &self.tactile;
        match tactile.codec {
            CodecKind::Quantized => Arc::new(QuantizedCodec::new(tactile.compression)),
            CodecKind::Block => Arc::new(BlockFramedCodec::new(
                Lz4BlockCodec::new(tactile.samples_per_actuator()),
                tactile.compression,
            )),
            CodecKind::Remote if !tactile.compression => Arc::new(QuantizedCodec::new(false)),
            CodecKind::Remote => Arc::new(RemoteCodec::new(
                self.network.remote_codec(role, tactile.response_timeout()),
                runtime,
            )),
        }
    }
}
