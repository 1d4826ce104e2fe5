//! Datagram transports.
//!
//! [`DatagramTransport`] is the seam between the membership protocol and the
//! network: plain UDP ([`UdpTransport`]), the session-encrypted wrapper
//! ([`SecureTransport`]) and an in-process fabric for tests ([`memory`]).

use std::net::SocketAddr;
use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::TransportError;

pub use secure::SecureTransport;
pub use udp::{UdpTransport, UdpTransportConfig};

pub mod memory;
mod secure;
mod udp;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub remote_addr: SocketAddr,
    pub data: Vec<u8>,
}

/// Where a datagram goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Unicast(SocketAddr),
    /// The transport's configured multicast group.
    Multicast,
}

#[async_trait]
pub trait DatagramTransport: Send + Sync {
    /// Every datagram received from now on. Received bytes are delivered
    /// unmodified by plain transports and only after decryption by secure ones.
    fn incoming(&self) -> broadcast::Receiver<Datagram>;

    /// Sends `data` as one datagram. Payloads above
    /// [`DatagramTransport::max_payload`] are rejected, never truncated.
    async fn send(&self, destination: Destination, data: &[u8]) -> Result<(), TransportError>;

    fn local_addr(&self) -> Result<SocketAddr, TransportError>;

    /// Largest payload a single [`DatagramTransport::send`] accepts.
    fn max_payload(&self) -> usize;

    /// Stops receiving and releases the socket. Idempotent.
    async fn shutdown(&self) -> Result<(), TransportError>;
}
