//! In-process datagram fabric.
//!
//! A [`MemoryNetwork`] connects any number of [`MemoryTransport`]s bound to
//! made-up socket addresses. Reachability can be switched off per address to
//! simulate a crashed or partitioned member: datagrams to or from an
//! unreachable address vanish the way lost UDP packets do.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::trace;

use crate::config::{DEFAULT_CHANNEL_BUFFER_SIZE, MAX_UDP_PACKET_SIZE};
use crate::error::TransportError;
use crate::transport::{Datagram, DatagramTransport, Destination};

const FIRST_EPHEMERAL_PORT: u16 = 40_000;

/// One datagram handed to the fabric, whether or not it was delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentDatagram {
    pub from: SocketAddr,
    pub destination: Destination,
    pub data: Vec<u8>,
}

#[derive(Default)]
struct NetworkInner {
    endpoints: DashMap<SocketAddr, broadcast::Sender<Datagram>>,
    unreachable: RwLock<HashSet<SocketAddr>>,
    sent: Mutex<Vec<SentDatagram>>,
    multicast: AtomicBool,
    next_port: AtomicU16,
}

#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        let network = Self::default();
        network.inner.next_port.store(FIRST_EPHEMERAL_PORT, Ordering::SeqCst);
        network
    }

    /// A fabric on which [`Destination::Multicast`] reaches every other endpoint.
    pub fn with_multicast() -> Self {
        let network = Self::new();
        network.inner.multicast.store(true, Ordering::SeqCst);
        network
    }

    /// Binds a transport at `addr`; port `0` picks a free port on the same host.
    pub fn bind(&self, addr: SocketAddr) -> Result<MemoryTransport, TransportError> {
        let addr = if addr.port() == 0 {
            let port = self.inner.next_port.fetch_add(1, Ordering::SeqCst);
            SocketAddr::new(addr.ip(), port)
        } else {
            addr
        };

        let (tx, _) = broadcast::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
        match self.inner.endpoints.entry(addr) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(std::io::Error::new(std::io::ErrorKind::AddrInUse, addr.to_string()).into());
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(tx.clone());
            }
        }

        Ok(MemoryTransport {
            network: self.clone(),
            local_addr: addr,
            incoming_tx: tx,
            closed: AtomicBool::new(false),
        })
    }

    /// Binds on 127.0.0.1 with a fresh port.
    pub fn bind_local(&self) -> Result<MemoryTransport, TransportError> {
        self.bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
    }

    pub fn set_reachable(&self, addr: SocketAddr, reachable: bool) {
        let mut unreachable = self.inner.unreachable.write();
        if reachable {
            unreachable.remove(&addr);
        } else {
            unreachable.insert(addr);
        }
    }

    pub fn is_reachable(&self, addr: &SocketAddr) -> bool {
        !self.inner.unreachable.read().contains(addr)
    }

    /// Every datagram handed to the fabric so far, in send order.
    pub fn sent(&self) -> Vec<SentDatagram> {
        self.inner.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.inner.sent.lock().clear();
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, data: &[u8]) -> Result<(), TransportError> {
        let tx = self.inner.endpoints
            .get(&to)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::Unreachable(to))?;

        if !self.is_reachable(&from) || !self.is_reachable(&to) {
            trace!(%from, %to, "dropping datagram on the floor");
            return Ok(());
        }
        // a receiver that nobody listens to loses the datagram, as UDP would
        let _ = tx.send(Datagram { remote_addr: from, data: data.to_vec() });
        Ok(())
    }
}

pub struct MemoryTransport {
    network: MemoryNetwork,
    local_addr: SocketAddr,
    incoming_tx: broadcast::Sender<Datagram>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl DatagramTransport for MemoryTransport {
    fn incoming(&self) -> broadcast::Receiver<Datagram> {
        self.incoming_tx.subscribe()
    }

    async fn send(&self, destination: Destination, data: &[u8]) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "transport is shut down").into());
        }
        if data.len() > MAX_UDP_PACKET_SIZE {
            return Err(TransportError::PayloadTooLarge { size: data.len(), limit: MAX_UDP_PACKET_SIZE });
        }

        self.network.inner.sent.lock().push(SentDatagram {
            from: self.local_addr,
            destination,
            data: data.to_vec(),
        });

        match destination {
            Destination::Unicast(to) => self.network.deliver(self.local_addr, to, data),
            Destination::Multicast => {
                if !self.network.inner.multicast.load(Ordering::SeqCst) {
                    return Err(TransportError::MulticastDisabled);
                }
                let targets: Vec<SocketAddr> = self.network.inner.endpoints
                    .iter()
                    .map(|entry| *entry.key())
                    .filter(|addr| *addr != self.local_addr)
                    .collect();
                for to in targets {
                    self.network.deliver(self.local_addr, to, data)?;
                }
                Ok(())
            }
        }
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.local_addr)
    }

    fn max_payload(&self) -> usize {
        MAX_UDP_PACKET_SIZE
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.network.inner.endpoints.remove(&self.local_addr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_unicast_delivery_and_record() {
        let network = MemoryNetwork::new();
        let a = network.bind_local().unwrap();
        let b = network.bind_local().unwrap();
        let mut incoming = b.incoming();

        a.send(Destination::Unicast(b.local_addr().unwrap()), b"hello").await.unwrap();

        let datagram = timeout(Duration::from_secs(1), incoming.recv()).await.unwrap().unwrap();
        assert_eq!(datagram.remote_addr, a.local_addr().unwrap());
        assert_eq!(datagram.data, b"hello");
        assert_eq!(network.sent().len(), 1);

        network.clear_sent();
        assert!(network.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_address_drops_silently() {
        let network = MemoryNetwork::new();
        let a = network.bind_local().unwrap();
        let b = network.bind_local().unwrap();
        let mut incoming = b.incoming();
        let b_addr = b.local_addr().unwrap();

        network.set_reachable(b_addr, false);
        a.send(Destination::Unicast(b_addr), b"lost").await.unwrap();
        assert!(incoming.try_recv().is_err());

        network.set_reachable(b_addr, true);
        a.send(Destination::Unicast(b_addr), b"found").await.unwrap();
        assert_eq!(incoming.recv().await.unwrap().data, b"found");
    }

    #[tokio::test]
    async fn test_unbound_destination_is_an_error() {
        let network = MemoryNetwork::new();
        let a = network.bind_local().unwrap();
        let nowhere: SocketAddr = "10.0.0.1:9".parse().unwrap();
        assert!(matches!(
            a.send(Destination::Unicast(nowhere), b"x").await,
            Err(TransportError::Unreachable(addr)) if addr == nowhere
        ));
    }

    #[tokio::test]
    async fn test_multicast_reaches_everyone_else() {
        let network = MemoryNetwork::with_multicast();
        let a = network.bind_local().unwrap();
        let b = network.bind_local().unwrap();
        let c = network.bind_local().unwrap();
        let (mut rx_a, mut rx_b, mut rx_c) = (a.incoming(), b.incoming(), c.incoming());

        a.send(Destination::Multicast, b"all").await.unwrap();

        assert_eq!(rx_b.recv().await.unwrap().data, b"all");
        assert_eq!(rx_c.recv().await.unwrap().data, b"all");
        assert!(rx_a.try_recv().is_err());
        assert!(matches!(
            MemoryNetwork::new().bind_local().unwrap().send(Destination::Multicast, b"x").await,
            Err(TransportError::MulticastDisabled)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_unbinds() {
        let network = MemoryNetwork::new();
        let a = network.bind_local().unwrap();
        let addr = a.local_addr().unwrap();
        assert!(network.bind(addr).is_err());

        a.shutdown().await.unwrap();
        a.shutdown().await.unwrap();
        assert!(network.bind(addr).is_ok());
    }
}
