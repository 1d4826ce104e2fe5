use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use futures::SinkExt;
use tokio::io::AsyncWriteExt as _;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::codec::{frame_codec, MessageCodec};
use crate::error::{GmsError, TransportError};
use crate::member::{MemberIdentifier, Version};
use crate::message::{HandshakePayload, Message, Payload};
use crate::statistics::MembershipStatistics;

pub(crate) enum Outbound {
    Message(Message, oneshot::Sender<Result<(), GmsError>>),
    /// Flush what was written, then shut the socket down.
    Close(oneshot::Sender<()>),
}

/// Handle to the single writer task that owns one outbound socket.
///
/// The writer connects on the first queued message and always writes the
/// handshake frame before anything else; queue order is wire order.
pub(crate) struct Connection {
    remote_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Outbound>,
}

pub(crate) struct WriterSettings {
    pub(crate) local: MemberIdentifier,
    pub(crate) version: Version,
    pub(crate) connect_timeout: Duration,
    pub(crate) statistics: Arc<MembershipStatistics>,
}

impl Connection {
    pub(crate) fn open(remote_addr: SocketAddr, settings: WriterSettings) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(remote_addr, settings, outbound_rx));
        Self { remote_addr, outbound }
    }

    /// Queues `message` and waits until it has been written to the socket.
    pub(crate) async fn send(&self, message: Message) -> Result<(), GmsError> {
        let (ack, written) = oneshot::channel();
        self.outbound
            .send(Outbound::Message(message, ack))
            .map_err(|_| TransportError::ConnectionLost(self.remote_addr))?;
        written.await.map_err(|_| TransportError::ConnectionLost(self.remote_addr))?
    }

    /// Waits for queued writes to flush and the socket to close.
    pub(crate) async fn close(&self) {
        let (done, closed) = oneshot::channel();
        if self.outbound.send(Outbound::Close(done)).is_ok() {
            let _ = closed.await;
        }
    }
}

type FrameSink = FramedWrite<TcpStream, LengthDelimitedCodec>;

async fn run_writer(remote_addr: SocketAddr, settings: WriterSettings, mut outbound: mpsc::UnboundedReceiver<Outbound>) {
    let mut codec = MessageCodec::new(settings.version);
    let mut sink: Option<FrameSink> = None;
    let mut broken = false;

    while let Some(item) = outbound.recv().await {
        match item {
            Outbound::Message(message, ack) => {
                let result = if broken {
                    Err(TransportError::ConnectionLost(remote_addr).into())
                } else {
                    write_message(remote_addr, &settings, &mut codec, &mut sink, message).await
                };
                if let Err(e) = &result {
                    warn!(%remote_addr, "direct channel write failed: {}", e);
                    broken = true;
                    sink = None;
                }
                let _ = ack.send(result);
            }
            Outbound::Close(done) => {
                if let Some(mut sink) = sink.take() {
                    if let Err(e) = SinkExt::<Bytes>::flush(&mut sink).await {
                        debug!(%remote_addr, "flush on close failed: {}", e);
                    }
                    let _ = sink.get_mut().shutdown().await;
                }
                let _ = done.send(());
                break;
            }
        }
    }
    debug!(%remote_addr, "connection writer stopped");
}

async fn write_message(
    remote_addr: SocketAddr,
    settings: &WriterSettings,
    codec: &mut MessageCodec,
    sink: &mut Option<FrameSink>,
    message: Message,
) -> Result<(), GmsError> {
    if sink.is_none() {
        *sink = Some(connect(remote_addr, settings, codec).await?);
    }
    let Some(sink) = sink.as_mut() else {
        return Err(TransportError::ConnectionLost(remote_addr).into());
    };

    let started = settings.statistics.start_timer();
    let frame = codec.encode_to_vec(message.with_sender(settings.local.clone()))?;
    settings.statistics.end_serialization(started);

    let len = frame.len();
    sink.send(Bytes::from(frame)).await?;
    settings.statistics.record_message_sent(len);
    Ok(())
}

async fn connect(remote_addr: SocketAddr, settings: &WriterSettings, codec: &mut MessageCodec) -> Result<FrameSink, GmsError> {
    let stream = time::timeout(settings.connect_timeout, TcpStream::connect(remote_addr))
        .await
        .map_err(|_| TransportError::Unreachable(remote_addr))??;
    stream.set_nodelay(true)?;
    let mut framed = FramedWrite::new(stream, frame_codec());

    let handshake = Message::new(Payload::Handshake(HandshakePayload { identity: settings.local.clone() }))?;
    framed.send(Bytes::from(codec.encode_to_vec(handshake)?)).await?;
    debug!(%remote_addr, version = %settings.version, "direct channel connected");
    Ok(framed)
}
