//! Best-effort datagram transport.
//!
//! A [`DatagramSender`] splits each payload into tagged fragments and writes
//! them to one destination; a [`DatagramReceiver`] rebuilds payloads and hands
//! them to a callback. Neither side acknowledges, retries, or orders anything.

mod fragment;
mod mailbox;
mod receiver;
mod sender;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

pub use fragment::{
    Fragment, FragmentCodec, MAX_PENDING_BYTES, Reassembler, TAG_LAST, TAG_LEN, TAG_MORE, split,
};
pub use mailbox::Mailbox;
pub use receiver::DatagramReceiver;
pub use sender::{DatagramSender, SenderHandle};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel already started")]
    AlreadyStarted,

    #[error("channel is closed")]
    Closed,

    #[error("channel not started")]
    NotStarted,

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("buffer size {0} leaves no room after the {TAG_LEN}-byte fragment tag")]
    BufferTooSmall(usize),
}

/// Addresses and datagram size for one direction of one channel.
///
/// `buffer_size` is the largest datagram either side handles: senders never
/// emit anything bigger, receivers drop anything bigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointConfig {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub buffer_size: usize,
}

impl EndpointConfig {
    /// Send to `remote` from an ephemeral local port.
    pub fn sender(remote: SocketAddr, buffer_size: usize) -> Self {
        Self {
            local: unspecified(remote),
            remote,
            buffer_size,
        }
    }

    /// Listen on `local`.
    pub fn receiver(local: SocketAddr, buffer_size: usize) -> Self {
        Self {
            local,
            remote: unspecified(local),
            buffer_size,
        }
    }

    fn check(&self) -> Result<(), ChannelError> {
        if self.buffer_size <= TAG_LEN {
            return Err(ChannelError::BufferTooSmall(self.buffer_size));
        }
        Ok(())
    }
}

fn unspecified(like: SocketAddr) -> SocketAddr {
    let ip = match like.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}

/// Bind a UDP socket and register it with the runtime behind `runtime`.
fn bind(
    addr: SocketAddr,
    runtime: &tokio::runtime::Handle,
) -> Result<tokio::net::UdpSocket, ChannelError> {
    let wrap = |source| ChannelError::Bind { addr, source };
    let socket = std::net::UdpSocket::bind(addr).map_err(wrap)?;
    socket.set_nonblocking(true).map_err(wrap)?;
    let _guard = runtime.enter();
    tokio::net::UdpSocket::from_std(socket).map_err(wrap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sender_binds_ephemeral_port_in_same_family() {
        let v4 = EndpointConfig::sender("10.0.0.2:5100".parse().unwrap(), 1024);
        assert_eq!(v4.local, "0.0.0.0:0".parse::<SocketAddr>().unwrap());

        let v6 = EndpointConfig::sender("[::1]:5100".parse().unwrap(), 1024);
        assert_eq!(v6.local, "[::]:0".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn buffer_must_exceed_tag() {
        let config = EndpointConfig::receiver("127.0.0.1:0".parse().unwrap(), TAG_LEN);
        assert!(matches!(config.check(), Err(ChannelError::BufferTooSmall(4))));
        let config = EndpointConfig::receiver("127.0.0.1:0".parse().unwrap(), TAG_LEN + 1);
        assert!(config.check().is_ok());
    }
}
