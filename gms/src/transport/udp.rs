use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::backoff::{Pause, ReceiveBackoff};
use crate::config::{DEFAULT_CHANNEL_BUFFER_SIZE, MAX_UDP_PACKET_SIZE};
use crate::error::TransportError;
use crate::transport::{Datagram, DatagramTransport, Destination};

const RECEIVE_BUFFER_SIZE: usize = 65_535;

#[derive(Debug, Clone)]
pub struct UdpTransportConfig {
    pub bind_addr: SocketAddr,
    pub max_datagram_size: usize,
    /// Multicast group joined for receiving and used by [`Destination::Multicast`].
    pub multicast_group: Option<SocketAddr>,
}

impl UdpTransportConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_datagram_size: MAX_UDP_PACKET_SIZE,
            multicast_group: None,
        }
    }
}

/// [`UdpTransport`] plain datagram transport over one UDP socket, plus a
/// second socket joined to the multicast group when multicast is enabled.
pub struct UdpTransport {
    datagram_tx: broadcast::Sender<Datagram>,
    udp_socket: Arc<UdpSocket>,
    multicast_group: Option<SocketAddr>,
    max_datagram_size: usize,
    shutdown_signal: broadcast::Sender<()>,
    closed: AtomicBool,
}

impl UdpTransport {
    pub async fn bind(config: UdpTransportConfig) -> Result<Self, TransportError> {
        let udp_socket = UdpSocket::bind(config.bind_addr).await?;
        let local_addr = udp_socket.local_addr()?;

        let (datagram_tx, _) = broadcast::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
        let (shutdown_signal, _) = broadcast::channel(1);

        let transport = Self {
            datagram_tx,
            udp_socket: Arc::new(udp_socket),
            multicast_group: config.multicast_group,
            max_datagram_size: config.max_datagram_size,
            shutdown_signal,
            closed: AtomicBool::new(false),
        };

        if local_addr.ip().is_unspecified() {
            info!(addr = %local_addr, "datagram transport bound to all network interfaces");
        } else {
            info!(addr = %local_addr, "datagram transport bound");
        }

        transport.spawn_datagram_listener(transport.udp_socket.clone());
        if let Some(group) = config.multicast_group {
            let socket = Self::join_multicast(group).await?;
            info!(group = %group, "joined multicast group");
            transport.spawn_datagram_listener(Arc::new(socket));
        }

        Ok(transport)
    }

    async fn join_multicast(group: SocketAddr) -> Result<UdpSocket, TransportError> {
        match group.ip() {
            IpAddr::V4(ip) => {
                let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), group.port())).await?;
                socket.join_multicast_v4(ip, Ipv4Addr::UNSPECIFIED)?;
                Ok(socket)
            }
            IpAddr::V6(ip) => {
                let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), group.port())).await?;
                socket.join_multicast_v6(&ip, 0)?;
                Ok(socket)
            }
        }
    }

    fn spawn_datagram_listener(&self, socket: Arc<UdpSocket>) {
        let tx = self.datagram_tx.clone();
        let mut shutdown_rx = self.shutdown_signal.subscribe();
        let max_datagram_size = self.max_datagram_size;
        let backoff = ReceiveBackoff::new();

        tokio::spawn(async move {
            let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
            loop {
                let pause = match backoff.pause() {
                    Pause::None => Duration::ZERO,
                    Pause::Retry(delay) => delay,
                    Pause::Open(left) => {
                        let left = left.max(Duration::from_millis(100));
                        warn!("receive circuit is open, pausing reads for {:?}", left);
                        left
                    }
                };
                if !pause.is_zero() {
                    tokio::select! {
                        _ = time::sleep(pause) => {},
                        _ = shutdown_rx.recv() => break,
                    }
                }

                tokio::select! {
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((len, src)) if len > max_datagram_size => {
                            warn!(%src, len, limit = max_datagram_size, "dropping oversize datagram");
                        }
                        Ok((len, src)) => {
                            backoff.success();
                            let datagram = Datagram { remote_addr: src, data: buf[..len].to_vec() };
                            if tx.send(datagram).is_err() {
                                debug!(%src, "no datagram subscribers, dropping datagram");
                            }
                        }
                        Err(e) => {
                            let failures = backoff.failure();
                            error!(failures, "receiving UDP datagram failed: {}", e);
                        }
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            info!("UDP listener shut down");
        });
    }
}

#[async_trait]
impl DatagramTransport for UdpTransport {
    fn incoming(&self) -> broadcast::Receiver<Datagram> {
        self.datagram_tx.subscribe()
    }

    async fn send(&self, destination: Destination, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport is shut down").into());
        }
        if data.len() > self.max_datagram_size {
            return Err(TransportError::PayloadTooLarge { size: data.len(), limit: self.max_datagram_size });
        }
        let target = match destination {
            Destination::Unicast(addr) => addr,
            Destination::Multicast => self.multicast_group.ok_or(TransportError::MulticastDisabled)?,
        };
        self.udp_socket.send_to(data, target).await?;
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.udp_socket.local_addr()?)
    }

    fn max_payload(&self) -> usize {
        self.max_datagram_size
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // listeners that already stopped have dropped their receivers
        let _ = self.shutdown_signal.send(());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn bind_local() -> UdpTransport {
        UdpTransport::bind(UdpTransportConfig::new("127.0.0.1:0".parse().unwrap())).await.unwrap()
    }

    #[tokio::test]
    async fn test_send_and_receive_on_loopback() {
        let a = bind_local().await;
        let b = bind_local().await;
        let mut incoming = b.incoming();

        a.send(Destination::Unicast(b.local_addr().unwrap()), b"ping").await.unwrap();
        let datagram = time::timeout(Duration::from_secs(2), incoming.recv()).await.unwrap().unwrap();
        assert_eq!(datagram.data, b"ping");
        assert_eq!(datagram.remote_addr, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_oversize_payload_is_rejected() {
        let a = bind_local().await;
        let payload = vec![0u8; MAX_UDP_PACKET_SIZE + 1];
        let result = a.send(Destination::Unicast(a.local_addr().unwrap()), &payload).await;
        assert!(matches!(result, Err(TransportError::PayloadTooLarge { size, limit })
            if size == MAX_UDP_PACKET_SIZE + 1 && limit == MAX_UDP_PACKET_SIZE));
    }

    #[tokio::test]
    async fn test_multicast_requires_group() {
        let a = bind_local().await;
        assert!(matches!(a.send(Destination::Multicast, b"x").await, Err(TransportError::MulticastDisabled)));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_rejects_sends() {
        let a = bind_local().await;
        a.shutdown().await.unwrap();
        a.shutdown().await.unwrap();
        let target = a.local_addr().unwrap();
        assert!(matches!(a.send(Destination::Unicast(target), b"x").await, Err(TransportError::Io(_))));
    }
}
