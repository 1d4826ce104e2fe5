//! Connection-oriented direct channel between members.
//!
//! At most one outbound TCP connection exists per destination. Its first frame
//! is a handshake binding the local identity to the connection; the receiving
//! side stamps that identity on every later message, so a member cannot speak
//! for anyone else within a connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use futures::StreamExt as _;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OnceCell};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::{frame_codec, MessageCodec};
use crate::dispatch::MessageDispatcher;
use crate::error::{GmsError, TransportError};
use crate::member::{MemberIdentifier, Version};
use crate::message::{Message, Payload};
use crate::statistics::MembershipStatistics;

use connection::{Connection, WriterSettings};

mod connection;

#[derive(Debug, Clone)]
pub struct MessengerConfig {
    /// Bound on establishing an outbound connection
    pub connect_timeout: Duration,
    /// Bound on the orderly drain in [`Messenger::close`]
    pub shutdown_timeout: Duration,
}

struct MessengerInner {
    local_addr: SocketAddr,
    local_member: RwLock<Option<MemberIdentifier>>,
    connections: DashMap<SocketAddr, Arc<Connection>>,
    dispatcher: Arc<MessageDispatcher>,
    statistics: Arc<MembershipStatistics>,
    config: MessengerConfig,
    closed: AtomicBool,
    drained: OnceCell<()>,
    shutdown_signal: broadcast::Sender<()>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

/// [`Messenger`] TCP transport for direct member-to-member messages.
#[derive(Clone)]
pub struct Messenger {
    inner: Arc<MessengerInner>,
}

impl Messenger {
    /// Binds the direct channel listener and starts accepting connections.
    /// Delivered messages go to `dispatcher`.
    pub async fn bind(
        addr: SocketAddr,
        dispatcher: Arc<MessageDispatcher>,
        statistics: Arc<MembershipStatistics>,
        config: MessengerConfig,
    ) -> Result<Self, GmsError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_signal, _) = broadcast::channel(1);

        let messenger = Self {
            inner: Arc::new(MessengerInner {
                local_addr,
                local_member: RwLock::new(None),
                connections: DashMap::new(),
                dispatcher,
                statistics,
                config,
                closed: AtomicBool::new(false),
                drained: OnceCell::new(),
                shutdown_signal,
                acceptor: Mutex::new(None),
            }),
        };

        let acceptor = tokio::spawn(Self::accept_loop(messenger.inner.clone(), listener));
        *messenger.inner.acceptor.lock() = Some(acceptor);
        info!(addr = %local_addr, "direct channel listening");
        Ok(messenger)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Sets the identity written in the handshake of every new connection.
    pub fn set_local_member(&self, member: MemberIdentifier) {
        *self.inner.local_member.write() = Some(member);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Sends `message` to `recipient` over its direct channel, encoded in the
    /// newest schema both sides understand.
    pub async fn send(&self, recipient: &MemberIdentifier, message: Message) -> Result<(), GmsError> {
        let addr = recipient.direct_channel_addr().ok_or_else(|| {
            GmsError::Transport(TransportError::Unreachable(recipient.membership_addr()))
        })?;
        let version = Version::CURRENT.min(recipient.version());
        self.send_with_version(addr, version, message.with_recipient(recipient.clone())).await
    }

    /// Sends to a bare address, such as a locator whose identity is not known yet.
    pub async fn send_to_addr(&self, addr: SocketAddr, message: Message) -> Result<(), GmsError> {
        self.send_with_version(addr, Version::CURRENT, message).await
    }

    async fn send_with_version(&self, addr: SocketAddr, version: Version, message: Message) -> Result<(), GmsError> {
        if self.is_closed() {
            return Err(GmsError::MembershipClosed);
        }
        let connection = self.connection(addr, version)?;
        let result = connection.send(message).await;
        if result.is_err() {
            // a broken connection is replaced on the next send
            self.inner.connections.remove_if(&addr, |_, current| Arc::ptr_eq(current, &connection));
        }
        result
    }

    fn connection(&self, addr: SocketAddr, version: Version) -> Result<Arc<Connection>, GmsError> {
        let local = self.inner.local_member
            .read()
            .clone()
            .ok_or_else(|| GmsError::Other(anyhow::anyhow!("local member identity is not set")))?;

        let connection = self.inner.connections
            .entry(addr)
            .or_insert_with(|| {
                Arc::new(Connection::open(addr, WriterSettings {
                    local,
                    version,
                    connect_timeout: self.inner.config.connect_timeout,
                    statistics: self.inner.statistics.clone(),
                }))
            })
            .value()
            .clone();
        Ok(connection)
    }

    /// Flushes and closes the outbound connection to `addr`, if any.
    pub async fn disconnect(&self, addr: SocketAddr) {
        if let Some((_, connection)) = self.inner.connections.remove(&addr) {
            if time::timeout(self.inner.config.shutdown_timeout, connection.close()).await.is_err() {
                warn!(%addr, "timed out flushing connection");
            }
        }
    }

    /// Rejects new sends, then drains every connection within the shutdown
    /// timeout. Safe to call any number of times from any number of tasks;
    /// all of them return once the single drain has finished.
    #[instrument(skip(self), fields(addr = %self.inner.local_addr))]
    pub async fn close(&self) -> Result<(), GmsError> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.drained.get_or_init(|| self.drain()).await;
        Ok(())
    }

    async fn drain(&self) {
        let _ = self.inner.shutdown_signal.send(());

        let acceptor = self.inner.acceptor.lock().take();
        if let Some(acceptor) = acceptor {
            acceptor.abort();
            let _ = acceptor.await;
        }

        let connections: Vec<Arc<Connection>> = self.inner.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.connections.clear();

        let pending = connections.len();
        let flushed = join_all(connections.iter().map(|connection| connection.close()));
        if time::timeout(self.inner.config.shutdown_timeout, flushed).await.is_err() {
            warn!(pending, "shutdown timeout expired before every connection flushed");
        }
        info!("direct channel closed");
    }

    async fn accept_loop(inner: Arc<MessengerInner>, listener: TcpListener) {
        let mut shutdown_rx = inner.shutdown_signal.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        debug!(%remote_addr, "accepted direct channel connection");
                        tokio::spawn(Self::handle_connection(inner.clone(), stream, remote_addr));
                    }
                    Err(e) => {
                        error!("direct channel accept failed: {}", e);
                        time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("direct channel listener stopped");
    }

    async fn handle_connection(inner: Arc<MessengerInner>, stream: TcpStream, remote_addr: SocketAddr) {
        let mut shutdown_rx = inner.shutdown_signal.subscribe();
        let mut frames = FramedRead::new(stream, frame_codec());
        let mut peer: Option<(MemberIdentifier, MessageCodec)> = None;

        loop {
            let frame = tokio::select! {
                frame = frames.next() => frame,
                _ = shutdown_rx.recv() => break,
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    warn!(%remote_addr, "direct channel read failed: {}", e);
                    break;
                }
                None => {
                    debug!(%remote_addr, "direct channel closed by peer");
                    break;
                }
            };

            match &mut peer {
                None => match Self::accept_handshake(&frame) {
                    Ok(identity) => {
                        debug!(%remote_addr, member = %identity, "direct channel handshake");
                        let version = Version::CURRENT.min(identity.version());
                        peer = Some((identity, MessageCodec::new(version)));
                    }
                    Err(e) => {
                        warn!(%remote_addr, "rejecting connection: {}", e);
                        break;
                    }
                },
                Some((identity, codec)) => {
                    let started = inner.statistics.start_timer();
                    let decoded = codec.decode_slice(&frame);
                    inner.statistics.end_deserialization(started);

                    let message = match decoded {
                        Ok(message) => message.with_sender(identity.clone()),
                        Err(e) => {
                            warn!(%remote_addr, "dropping undecodable frame: {}", e);
                            continue;
                        }
                    };
                    inner.statistics.record_message_received(frame.len());
                    if let Err(e) = inner.dispatcher.dispatch(message).await {
                        warn!(%remote_addr, member = %identity, "message handler failed: {}", e);
                    }
                }
            }
        }
    }

    fn accept_handshake(frame: &[u8]) -> Result<MemberIdentifier, GmsError> {
        let message = MessageCodec::new(Version::CURRENT).decode_slice(frame)?;
        let kind = message.kind();
        match message.into_payload() {
            Payload::Handshake(handshake) => Ok(handshake.identity),
            _ => Err(GmsError::Handshake(format!("expected a handshake as the first frame, got {}", kind))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::frame_codec;
    use crate::dispatch::FnHandler;
    use crate::member::{vm_kind, MemberIdentifierBuilder};
    use crate::message::HandshakePayload;
    use futures::SinkExt as _;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;
    use tokio_util::bytes::Bytes;
    use tokio_util::codec::FramedWrite;

    fn member(port: u16, tag: &str) -> MemberIdentifier {
        MemberIdentifierBuilder::for_known_host(IpAddr::V4(Ipv4Addr::LOCALHOST), "localhost")
            .membership_port(port)
            .direct_channel_port(port)
            .vm_kind(vm_kind::NORMAL)
            .name(tag)
            .build()
            .unwrap()
    }

    fn config() -> MessengerConfig {
        MessengerConfig {
            connect_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    async fn recording_messenger() -> (Messenger, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(MessageDispatcher::new());
        dispatcher.set_default_handler(Arc::new(FnHandler::new(move |message: Message| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
                Ok(())
            }
        })));
        let messenger = Messenger::bind(
            "127.0.0.1:0".parse().unwrap(),
            dispatcher,
            Arc::new(MembershipStatistics::new()),
            config(),
        )
        .await
        .unwrap();
        let local = member(messenger.local_addr().port(), "local");
        messenger.set_local_member(local);
        (messenger, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_handshake_is_the_first_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = member(listener.local_addr().unwrap().port(), "peer");
        let (messenger, _rx) = recording_messenger().await;

        let sender = messenger.clone();
        let sending = tokio::spawn(async move {
            sender.send(&peer, Message::application(1, b"hello".to_vec()).unwrap()).await
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(stream, frame_codec());
        let mut codec = MessageCodec::new(Version::CURRENT);

        let first = codec.decode_slice(&frames.next().await.unwrap().unwrap()).unwrap();
        match first.payload() {
            Payload::Handshake(handshake) => assert_eq!(handshake.identity.name(), "local"),
            other => panic!("expected a handshake, got {:?}", other),
        }
        let second = codec.decode_slice(&frames.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(second.data(), Some(&b"hello"[..]));
        sending.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_forged_sender_is_replaced_by_handshake_identity() {
        let (messenger, mut rx) = recording_messenger().await;
        let honest = member(5001, "honest");
        let forged = member(5002, "forged");

        let stream = TcpStream::connect(messenger.local_addr()).await.unwrap();
        let mut frames = FramedWrite::new(stream, frame_codec());
        let mut codec = MessageCodec::new(Version::CURRENT);

        let handshake = Message::new(Payload::Handshake(HandshakePayload { identity: honest.clone() })).unwrap();
        frames.send(Bytes::from(codec.encode_to_vec(handshake).unwrap())).await.unwrap();
        let spoofed = Message::application(3, b"trust me".to_vec()).unwrap().with_sender(forged);
        frames.send(Bytes::from(codec.encode_to_vec(spoofed).unwrap())).await.unwrap();

        let delivered = next(&mut rx).await;
        assert_eq!(delivered.sender(), Some(&honest));
        assert_eq!(delivered.data(), Some(&b"trust me"[..]));
    }

    #[tokio::test]
    async fn test_connection_without_handshake_is_rejected() {
        let (messenger, mut rx) = recording_messenger().await;
        let stream = TcpStream::connect(messenger.local_addr()).await.unwrap();
        let mut frames = FramedWrite::new(stream, frame_codec());
        let mut codec = MessageCodec::new(Version::CURRENT);

        let message = Message::application(3, b"no intro".to_vec()).unwrap();
        frames.send(Bytes::from(codec.encode_to_vec(message).unwrap())).await.unwrap();

        assert!(time::timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order_between_messengers() {
        let (a, _a_rx) = recording_messenger().await;
        let (b, mut b_rx) = recording_messenger().await;
        let b_member = member(b.local_addr().port(), "b");

        for i in 0..20u8 {
            a.send(&b_member, Message::application(1, vec![i]).unwrap()).await.unwrap();
        }
        for i in 0..20u8 {
            let message = next(&mut b_rx).await;
            assert_eq!(message.data(), Some(&[i][..]));
            assert_eq!(message.sender().map(|s| s.name()), Some("local"));
        }
        assert_eq!(a.inner.connections.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_sends_share_one_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = member(listener.local_addr().unwrap().port(), "peer");
        let (messenger, _rx) = recording_messenger().await;

        let sender = messenger.clone();
        let sending = tokio::spawn(async move {
            join_all((0..8u8).map(|i| sender.send(&peer, Message::application(1, vec![i]).unwrap()))).await
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(stream, frame_codec());
        let mut codec = MessageCodec::new(Version::CURRENT);

        let first = codec.decode_slice(&frames.next().await.unwrap().unwrap()).unwrap();
        assert!(matches!(first.payload(), Payload::Handshake(_)));
        let mut received = Vec::new();
        for _ in 0..8 {
            let message = codec.decode_slice(&frames.next().await.unwrap().unwrap()).unwrap();
            received.extend_from_slice(message.data().unwrap());
        }
        received.sort();
        assert_eq!(received, (0..8u8).collect::<Vec<_>>());

        let results = sending.await.unwrap();
        assert!(results.iter().all(Result::is_ok));
        assert!(time::timeout(Duration::from_millis(200), listener.accept()).await.is_err());
        assert_eq!(messenger.inner.connections.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_close_is_idempotent() {
        let (a, _a_rx) = recording_messenger().await;
        let (b, mut b_rx) = recording_messenger().await;
        let b_member = member(b.local_addr().port(), "b");
        a.send(&b_member, Message::application(1, b"last words".to_vec()).unwrap()).await.unwrap();

        let (first, second) = tokio::join!(a.close(), a.close());
        first.unwrap();
        second.unwrap();
        a.close().await.unwrap();

        assert_eq!(next(&mut b_rx).await.data(), Some(&b"last words"[..]));
        assert!(a.inner.connections.is_empty());
        assert!(TcpStream::connect(a.local_addr()).await.is_err());
    }

    #[tokio::test]
    async fn test_send_after_close_fails_fast() {
        let (a, _a_rx) = recording_messenger().await;
        let b_member = member(1, "b");
        a.close().await.unwrap();
        let result = a.send(&b_member, Message::application(1, vec![]).unwrap()).await;
        assert!(matches!(result, Err(GmsError::MembershipClosed)));
    }

    #[tokio::test]
    async fn test_unreachable_destination_reports_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (a, _a_rx) = recording_messenger().await;
        let result = a.send(&member(port, "gone"), Message::application(1, vec![]).unwrap()).await;
        assert!(matches!(result, Err(GmsError::Transport(_))));
        assert!(a.inner.connections.is_empty());
    }
}
