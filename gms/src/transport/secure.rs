//! Session-encrypted datagram transport.
//!
//! Every (peer, role) pair owns an independent session. The client role is
//! created by the first send to a peer, the server role by the first hello
//! received from it. Records on the wire:
//!
//! ```text
//! ClientHello  [1][client random: 32]
//! ServerHello  [2][client random: 32][server random: 32][verify tag: 16]
//! AppData      [4][sequence: u64 BE][ciphertext][tag: 16]
//! Close        [5][role of the sender: u8][tag: 16]
//! Renegotiate  [6]
//! ```
//!
//! The session key is `SHA-256(secret || client random || server random || domain)`;
//! AES-256-GCM seals application data with the record header as associated
//! data. Only application data ever reaches [`DatagramTransport::incoming`].
//!
//! Close records are sealed with the session key, so only the other end of a
//! session can tear it down. Renegotiate carries no authority: it only makes
//! an established client repeat its hello, which a server still holding the
//! session answers unchanged. A server session that sees no authentic record
//! within the handshake timeout is dropped, as is any session idle for longer
//! than the session idle timeout.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
// aes-gcm relies on generic-array 0.14, so suppress the upstream deprecation locally.
#[allow(deprecated)]
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::config::{SecurityConfig, DEFAULT_CHANNEL_BUFFER_SIZE};
use crate::error::TransportError;
use crate::statistics::MembershipStatistics;
use crate::transport::{Datagram, DatagramTransport, Destination};

const CLIENT_HELLO: u8 = 1;
const SERVER_HELLO: u8 = 2;
const APP_DATA: u8 = 4;
const CLOSE: u8 = 5;
const RENEGOTIATE: u8 = 6;

const RANDOM_LEN: usize = 32;
const TAG_LEN: usize = 16;
const APP_HEADER_LEN: usize = 1 + 8;
const CLIENT_HELLO_LEN: usize = 1 + RANDOM_LEN;
const SERVER_HELLO_HEADER_LEN: usize = 1 + 2 * RANDOM_LEN;
const CLOSE_HEADER_LEN: usize = 2;
const CLOSE_LEN: usize = CLOSE_HEADER_LEN + TAG_LEN;
const RECORD_OVERHEAD: usize = APP_HEADER_LEN + TAG_LEN;
const KEY_DOMAIN: &[u8] = b"gms-datagram-session v1";

// nonce direction bytes; close records use CLOSE_DIRECTION_BASE + sender role
const CLIENT_TO_SERVER: u8 = 0;
const SERVER_TO_CLIENT: u8 = 1;
const CLOSE_DIRECTION_BASE: u8 = 2;

const REPLAY_WINDOW_BITS: u64 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Role {
    Client = 0,
    Server = 1,
}

impl Role {
    fn from_byte(byte: u8) -> Option<Role> {
        match byte {
            0 => Some(Role::Client),
            1 => Some(Role::Server),
            _ => None,
        }
    }

    fn opposite(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HandshakeStatus {
    Pending,
    Established,
    Failed(String),
}

/// Sliding window over the last 64 sequence numbers seen on a session.
#[derive(Debug, Default)]
struct ReplayWindow {
    highest: Option<u64>,
    bitmap: u64,
}

impl ReplayWindow {
    fn is_fresh(&self, seq: u64) -> bool {
        let Some(highest) = self.highest else {
            return true;
        };
        if seq > highest {
            return true;
        }
        let age = highest - seq;
        age < REPLAY_WINDOW_BITS && self.bitmap & (1 << age) == 0
    }

    fn mark(&mut self, seq: u64) {
        match self.highest {
            None => {
                self.highest = Some(seq);
                self.bitmap = 1;
            }
            Some(highest) if seq > highest => {
                let shift = seq - highest;
                self.bitmap = if shift >= REPLAY_WINDOW_BITS { 0 } else { self.bitmap << shift };
                self.bitmap |= 1;
                self.highest = Some(seq);
            }
            Some(highest) => {
                let age = highest - seq;
                if age < REPLAY_WINDOW_BITS {
                    self.bitmap |= 1 << age;
                }
            }
        }
    }
}

/// Key offered to a client that started over while the server session was
/// already confirmed. Promoted by the first authentic record sealed with it.
struct PendingKey {
    client_random: [u8; RANDOM_LEN],
    cipher: Aes256Gcm,
    server_hello: Vec<u8>,
}

struct SessionState {
    client_random: [u8; RANDOM_LEN],
    server_random: [u8; RANDOM_LEN],
    cipher: Option<Aes256Gcm>,
    pending: Option<PendingKey>,
    send_seq: u64,
    replay: ReplayWindow,
    // answered again, unchanged, when the client retransmits its hello
    server_hello: Option<Vec<u8>>,
    // the peer proved the key; until then the session lives for the handshake timeout only
    confirmed: bool,
    // an established client repeated its hello and accepts one rekey
    renegotiating: bool,
    created: Instant,
    last_activity: Instant,
}

struct SessionShared {
    peer: SocketAddr,
    role: Role,
    state: Mutex<SessionState>,
    status: watch::Sender<HandshakeStatus>,
}

struct Session {
    shared: Arc<SessionShared>,
    records: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
    torn_down: AtomicBool,
}

impl Session {
    fn teardown(&self) {
        if !self.torn_down.swap(true, Ordering::AcqRel) {
            self.shared.status.send_replace(HandshakeStatus::Failed("session closed".to_string()));
            self.task.abort();
        }
    }
}

/// What a session task needs besides its own state.
struct SessionContext {
    inner: Weak<SecureInner>,
    transport: Arc<dyn DatagramTransport>,
    secret: Arc<[u8]>,
    delivered_tx: broadcast::Sender<Datagram>,
    handshake_timeout: Duration,
    idle_timeout: Duration,
}

struct SecureInner {
    transport: Arc<dyn DatagramTransport>,
    pre_shared_secret: Arc<[u8]>,
    handshake_timeout: Duration,
    idle_timeout: Duration,
    sessions: DashMap<(SocketAddr, Role), Arc<Session>>,
    delivered_tx: broadcast::Sender<Datagram>,
    statistics: Arc<MembershipStatistics>,
    shutdown_signal: broadcast::Sender<()>,
    closed: AtomicBool,
}

/// [`SecureTransport`] wraps any [`DatagramTransport`] with per-peer
/// authenticated encryption.
///
/// A handshake failure or timeout with one peer only fails sends to that
/// peer; sessions with every other peer are untouched. Records are handed from
/// the receive pump to per-session queues, so a slow handshake never stalls
/// the shared socket.
pub struct SecureTransport {
    inner: Arc<SecureInner>,
    pump: JoinHandle<()>,
}

impl SecureTransport {
    pub fn new(
        transport: Arc<dyn DatagramTransport>,
        security: &SecurityConfig,
        statistics: Arc<MembershipStatistics>,
    ) -> Self {
        let (delivered_tx, _) = broadcast::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
        let (shutdown_signal, _) = broadcast::channel(1);
        let incoming = transport.incoming();

        let inner = Arc::new(SecureInner {
            transport,
            pre_shared_secret: Arc::from(security.pre_shared_secret.as_slice()),
            handshake_timeout: security.handshake_timeout(),
            idle_timeout: security.session_idle_timeout(),
            sessions: DashMap::new(),
            delivered_tx,
            statistics,
            shutdown_signal,
            closed: AtomicBool::new(false),
        });

        let pump = tokio::spawn(Self::receive_pump(inner.clone(), incoming));
        Self { inner, pump }
    }

    async fn receive_pump(inner: Arc<SecureInner>, mut incoming: broadcast::Receiver<Datagram>) {
        let mut shutdown_rx = inner.shutdown_signal.subscribe();
        loop {
            tokio::select! {
                received = incoming.recv() => match received {
                    Ok(datagram) => inner.route(datagram).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "secure transport fell behind, datagrams were dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("secure transport receive pump stopped");
    }

    /// Tears down both sessions with `peer` and tells it to do the same.
    /// Idempotent; the next send renegotiates.
    pub async fn close_session(&self, peer: SocketAddr) {
        self.inner.close_session(peer, true).await;
    }

    pub fn has_session(&self, peer: SocketAddr) -> bool {
        self.inner.sessions.contains_key(&(peer, Role::Client)) || self.inner.sessions.contains_key(&(peer, Role::Server))
    }
}

impl SecureInner {
    async fn route(self: &Arc<Self>, datagram: Datagram) {
        let peer = datagram.remote_addr;
        let Some(&record_type) = datagram.data.first() else {
            return;
        };

        match record_type {
            CLIENT_HELLO => {
                let session = self.session(peer, Role::Server);
                let _ = session.records.send(datagram.data);
            }
            SERVER_HELLO => match self.existing(peer, Role::Client) {
                Some(session) => {
                    let _ = session.records.send(datagram.data);
                }
                None => debug!(%peer, "server hello without a pending session"),
            },
            APP_DATA => match self.existing(peer, Role::Server) {
                Some(session) => {
                    let _ = session.records.send(datagram.data);
                }
                None => {
                    debug!(%peer, "application data without a session, asking the peer to renegotiate");
                    if let Err(e) = self.transport.send(Destination::Unicast(peer), &[RENEGOTIATE]).await {
                        debug!(%peer, "failed to send renegotiate record: {}", e);
                    }
                }
            },
            CLOSE => match datagram.data.get(1).copied().and_then(Role::from_byte) {
                // the sender's role is the opposite of ours for that session
                Some(sender) => self.close_if_authentic(peer, sender.opposite(), &datagram.data),
                None => debug!(%peer, "malformed close record"),
            },
            RENEGOTIATE => self.repeat_hello(peer).await,
            other => debug!(%peer, record_type = other, "dropping unknown record"),
        }
    }

    fn existing(&self, peer: SocketAddr, role: Role) -> Option<Arc<Session>> {
        self.sessions.get(&(peer, role)).map(|s| s.value().clone())
    }

    /// Returns the session for (peer, role), creating it exactly once.
    fn session(self: &Arc<Self>, peer: SocketAddr, role: Role) -> Arc<Session> {
        self.sessions
            .entry((peer, role))
            .or_insert_with(|| self.spawn_session(peer, role))
            .value()
            .clone()
    }

    fn spawn_session(self: &Arc<Self>, peer: SocketAddr, role: Role) -> Arc<Session> {
        let mut client_random = [0u8; RANDOM_LEN];
        if role == Role::Client {
            rand::thread_rng().fill_bytes(&mut client_random);
        }
        let (status, _) = watch::channel(HandshakeStatus::Pending);
        let now = Instant::now();
        let shared = Arc::new(SessionShared {
            peer,
            role,
            state: Mutex::new(SessionState {
                client_random,
                server_random: [0u8; RANDOM_LEN],
                cipher: None,
                pending: None,
                send_seq: 0,
                replay: ReplayWindow::default(),
                server_hello: None,
                confirmed: false,
                renegotiating: false,
                created: now,
                last_activity: now,
            }),
            status,
        });

        let (records, records_rx) = mpsc::unbounded_channel();
        let context = SessionContext {
            inner: Arc::downgrade(self),
            transport: self.transport.clone(),
            secret: self.pre_shared_secret.clone(),
            delivered_tx: self.delivered_tx.clone(),
            handshake_timeout: self.handshake_timeout,
            idle_timeout: self.idle_timeout,
        };
        let task = tokio::spawn(Self::run_session(shared.clone(), records_rx, context));
        debug!(%peer, ?role, "session created");

        Arc::new(Session { shared, records, task, torn_down: AtomicBool::new(false) })
    }

    async fn run_session(
        shared: Arc<SessionShared>,
        mut records: mpsc::UnboundedReceiver<Vec<u8>>,
        context: SessionContext,
    ) {
        loop {
            let expires_at = shared.expires_at(context.handshake_timeout, context.idle_timeout);
            tokio::select! {
                record = records.recv() => {
                    let Some(record) = record else {
                        return;
                    };
                    shared.process(&record, &context).await;
                }
                _ = time::sleep_until(expires_at) => {
                    // sends may have refreshed the session while we slept
                    if shared.expires_at(context.handshake_timeout, context.idle_timeout) <= Instant::now() {
                        break;
                    }
                }
            }
        }

        if let Some(inner) = context.inner.upgrade() {
            inner.expire(&shared).await;
        }
    }

    /// Drops an expired session, unless it was already replaced.
    async fn expire(&self, shared: &Arc<SessionShared>) {
        let key = (shared.peer, shared.role);
        let Some((_, session)) = self.sessions.remove_if(&key, |_, s| Arc::ptr_eq(&s.shared, shared)) else {
            return;
        };
        debug!(peer = %shared.peer, role = ?shared.role, "session expired");
        // teardown aborts the calling task, so the peer hears about it first
        self.send_close(shared.peer, &session).await;
        session.teardown();
    }

    async fn send_close(&self, peer: SocketAddr, session: &Session) {
        let Some(record) = session.shared.seal_close() else {
            return;
        };
        if let Err(e) = self.transport.send(Destination::Unicast(peer), &record).await {
            debug!(%peer, "failed to send close record: {}", e);
        }
    }

    fn close_if_authentic(&self, peer: SocketAddr, role: Role, record: &[u8]) {
        let Some(session) = self.existing(peer, role) else {
            return;
        };
        if !session.shared.verify_close(record) {
            warn!(%peer, ?role, "ignoring close record that failed authentication");
            return;
        }
        if self.sessions.remove_if(&(peer, role), |_, s| Arc::ptr_eq(s, &session)).is_some() {
            session.teardown();
            debug!(%peer, ?role, "session closed by the peer");
        }
    }

    /// The peer lost its server session; our hello lets it build a new one.
    async fn repeat_hello(&self, peer: SocketAddr) {
        let Some(session) = self.existing(peer, Role::Client) else {
            return;
        };
        // a pending handshake retransmits on its own
        if !session.shared.is_established() {
            return;
        }
        debug!(%peer, "peer asked to renegotiate, repeating the hello");
        let hello = session.shared.renegotiation_hello();
        if let Err(e) = self.transport.send(Destination::Unicast(peer), &hello).await {
            debug!(%peer, "failed to repeat hello: {}", e);
        }
    }

    fn remove_session(&self, peer: SocketAddr, role: Role) {
        if let Some((_, session)) = self.sessions.remove(&(peer, role)) {
            session.teardown();
            debug!(%peer, ?role, "session torn down");
        }
    }

    async fn close_session(&self, peer: SocketAddr, notify: bool) {
        for role in [Role::Client, Role::Server] {
            if let Some((_, session)) = self.sessions.remove(&(peer, role)) {
                session.teardown();
                if notify {
                    self.send_close(peer, &session).await;
                }
            }
        }
    }

    /// Drives the client handshake until it settles or the handshake timeout
    /// expires, retransmitting the hello every quarter of the timeout.
    async fn await_established(self: &Arc<Self>, peer: SocketAddr) -> Result<Arc<Session>, TransportError> {
        let session = self.session(peer, Role::Client);
        let mut status = session.shared.status.subscribe();
        let deadline = Instant::now() + self.handshake_timeout;
        let retransmit_every = (self.handshake_timeout / 4).max(Duration::from_millis(1));
        let mut attempts = 0u32;

        loop {
            // cloned so the watch guard is released before any teardown
            let current = status.borrow_and_update().clone();
            match current {
                HandshakeStatus::Established => return Ok(session),
                HandshakeStatus::Failed(reason) => {
                    self.remove_session(peer, Role::Client);
                    return Err(TransportError::Handshake { peer, reason });
                }
                HandshakeStatus::Pending => {}
            }

            if Instant::now() >= deadline {
                self.remove_session(peer, Role::Client);
                return Err(TransportError::Handshake {
                    peer,
                    reason: format!("no answer within {:?}", self.handshake_timeout),
                });
            }

            if attempts > 0 {
                self.statistics.inc_handshake_retransmits();
            }
            attempts += 1;
            let hello = session.shared.client_hello();
            self.transport.send(Destination::Unicast(peer), &hello).await?;

            let wake_at = (Instant::now() + retransmit_every).min(deadline);
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::Handshake { peer, reason: "session closed".to_string() });
                    }
                }
                _ = time::sleep_until(wake_at) => {}
            }
        }
    }
}

impl SessionShared {
    async fn process(&self, record: &[u8], context: &SessionContext) {
        let reply = match (self.role, record[0]) {
            (Role::Server, CLIENT_HELLO) => self.answer_client_hello(record, &context.secret),
            (Role::Server, APP_DATA) => {
                if let Some(data) = self.open_app_data(record) {
                    let _ = context.delivered_tx.send(Datagram { remote_addr: self.peer, data });
                }
                None
            }
            (Role::Client, SERVER_HELLO) => {
                self.accept_server_hello(record, &context.secret);
                None
            }
            _ => None,
        };

        if let Some(reply) = reply {
            if let Err(e) = context.transport.send(Destination::Unicast(self.peer), &reply).await {
                warn!(peer = %self.peer, "failed to answer handshake: {}", e);
            }
        }
    }

    fn expires_at(&self, handshake_timeout: Duration, idle_timeout: Duration) -> Instant {
        let state = self.state.lock();
        if state.confirmed {
            state.last_activity + idle_timeout
        } else {
            state.created + handshake_timeout
        }
    }

    fn is_established(&self) -> bool {
        self.state.lock().cipher.is_some()
    }

    fn client_hello(&self) -> Vec<u8> {
        let mut hello = Vec::with_capacity(CLIENT_HELLO_LEN);
        hello.push(CLIENT_HELLO);
        hello.extend_from_slice(&self.state.lock().client_random);
        hello
    }

    fn renegotiation_hello(&self) -> Vec<u8> {
        self.state.lock().renegotiating = true;
        self.client_hello()
    }

    fn answer_client_hello(&self, record: &[u8], secret: &[u8]) -> Option<Vec<u8>> {
        if record.len() != CLIENT_HELLO_LEN {
            debug!(peer = %self.peer, "malformed client hello");
            return None;
        }
        let mut client_random = [0u8; RANDOM_LEN];
        client_random.copy_from_slice(&record[1..]);

        let mut state = self.state.lock();
        if state.client_random == client_random {
            if let Some(hello) = &state.server_hello {
                return Some(hello.clone());
            }
        }
        if let Some(pending) = state.pending.as_ref().filter(|p| p.client_random == client_random) {
            return Some(pending.server_hello.clone());
        }

        // a new client random means the peer restarted its side of the session
        let mut server_random = [0u8; RANDOM_LEN];
        rand::thread_rng().fill_bytes(&mut server_random);
        let cipher = Aes256Gcm::new(key_ref(&derive_key(secret, &client_random, &server_random)));
        let hello = server_hello(&cipher, &client_random, &server_random)?;

        if state.confirmed {
            // the current key stays until the new one carries an authentic record
            debug!(peer = %self.peer, "peer offered a new session, holding the key until it is used");
            state.pending = Some(PendingKey { client_random, cipher, server_hello: hello.clone() });
            return Some(hello);
        }

        state.client_random = client_random;
        state.server_random = server_random;
        state.cipher = Some(cipher);
        state.replay = ReplayWindow::default();
        state.server_hello = Some(hello.clone());
        drop(state);

        self.status.send_replace(HandshakeStatus::Established);
        debug!(peer = %self.peer, "answered client hello");
        Some(hello)
    }

    fn accept_server_hello(&self, record: &[u8], secret: &[u8]) {
        if record.len() != SERVER_HELLO_HEADER_LEN + TAG_LEN {
            debug!(peer = %self.peer, "malformed server hello");
            return;
        }
        let mut state = self.state.lock();
        if record[1..1 + RANDOM_LEN] != state.client_random {
            // stale answer to an earlier session
            return;
        }
        let mut server_random = [0u8; RANDOM_LEN];
        server_random.copy_from_slice(&record[1 + RANDOM_LEN..SERVER_HELLO_HEADER_LEN]);
        let established = state.cipher.is_some();
        if established && (!state.renegotiating || state.server_random == server_random) {
            // duplicate, or a replayed hello nobody asked for
            return;
        }

        let cipher = Aes256Gcm::new(key_ref(&derive_key(secret, &state.client_random, &server_random)));
        let (header, tag) = record.split_at(SERVER_HELLO_HEADER_LEN);
        let mut empty = Vec::new();
        let verified = cipher
            .decrypt_in_place_detached(nonce_ref(&nonce(SERVER_TO_CLIENT, 0)), header, &mut empty, tag_ref(tag))
            .is_ok();

        match (verified, established) {
            (true, _) => {
                state.cipher = Some(cipher);
                state.server_random = server_random;
                state.send_seq = 0;
                state.confirmed = true;
                state.renegotiating = false;
                state.last_activity = Instant::now();
                drop(state);
                if established {
                    info!(peer = %self.peer, "peer renegotiated, session rekeyed");
                } else {
                    self.status.send_replace(HandshakeStatus::Established);
                    info!(peer = %self.peer, "session established");
                }
            }
            (false, true) => {
                debug!(peer = %self.peer, "ignoring unverified server hello on an established session");
            }
            (false, false) => {
                drop(state);
                warn!(peer = %self.peer, "server hello failed verification, secrets differ");
                self.status.send_replace(HandshakeStatus::Failed("peer could not prove the shared secret".to_string()));
            }
        }
    }

    fn seal_app_data(&self, data: &[u8]) -> Option<Vec<u8>> {
        let mut state = self.state.lock();
        let seq = state.send_seq;
        let cipher = state.cipher.as_ref()?;

        let mut record = Vec::with_capacity(RECORD_OVERHEAD + data.len());
        record.push(APP_DATA);
        record.extend_from_slice(&seq.to_be_bytes());
        let mut body = data.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(nonce_ref(&nonce(CLIENT_TO_SERVER, seq)), &record, &mut body)
            .ok()?;
        state.send_seq += 1;
        state.last_activity = Instant::now();
        drop(state);

        record.extend_from_slice(&body);
        record.extend_from_slice(&tag);
        Some(record)
    }

    fn open_app_data(&self, record: &[u8]) -> Option<Vec<u8>> {
        if record.len() < RECORD_OVERHEAD {
            debug!(peer = %self.peer, "short application record");
            return None;
        }
        let (header, rest) = record.split_at(APP_HEADER_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&header[1..]);
        let seq = u64::from_be_bytes(seq_bytes);

        let mut state = self.state.lock();
        let fresh = state.replay.is_fresh(seq);
        if fresh {
            if let Some(body) = state.cipher.as_ref().and_then(|c| open_record(c, seq, header, ciphertext, tag)) {
                state.replay.mark(seq);
                state.last_activity = Instant::now();
                let first = !state.confirmed;
                state.confirmed = true;
                drop(state);
                if first {
                    info!(peer = %self.peer, "accepted session");
                }
                return Some(body);
            }
        }

        if let Some(pending) = state.pending.take() {
            match open_record(&pending.cipher, seq, header, ciphertext, tag) {
                Some(body) => {
                    state.client_random = pending.client_random;
                    state.cipher = Some(pending.cipher);
                    state.server_hello = Some(pending.server_hello);
                    state.replay = ReplayWindow::default();
                    state.replay.mark(seq);
                    state.last_activity = Instant::now();
                    drop(state);
                    info!(peer = %self.peer, "peer restarted its session, switched to the new key");
                    return Some(body);
                }
                None => state.pending = Some(pending),
            }
        }
        drop(state);

        if fresh {
            warn!(peer = %self.peer, seq, "record failed authentication");
        } else {
            warn!(peer = %self.peer, seq, "replayed record rejected");
        }
        None
    }

    fn seal_close(&self) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let cipher = state.cipher.as_ref()?;
        let mut record = Vec::with_capacity(CLOSE_LEN);
        record.push(CLOSE);
        record.push(self.role as u8);
        let mut empty = Vec::new();
        let tag = cipher
            .encrypt_in_place_detached(nonce_ref(&close_nonce(self.role)), &record, &mut empty)
            .ok()?;
        record.extend_from_slice(&tag);
        Some(record)
    }

    /// True when `record` was sealed by the other end of this session.
    fn verify_close(&self, record: &[u8]) -> bool {
        if record.len() != CLOSE_LEN {
            return false;
        }
        let (header, tag) = record.split_at(CLOSE_HEADER_LEN);
        let Some(sender) = Role::from_byte(header[1]).filter(|role| *role == self.role.opposite()) else {
            return false;
        };
        let state = self.state.lock();
        let Some(cipher) = state.cipher.as_ref() else {
            return false;
        };
        let mut empty = Vec::new();
        cipher
            .decrypt_in_place_detached(nonce_ref(&close_nonce(sender)), header, &mut empty, tag_ref(tag))
            .is_ok()
    }
}

#[async_trait]
impl DatagramTransport for SecureTransport {
    fn incoming(&self) -> broadcast::Receiver<Datagram> {
        self.inner.delivered_tx.subscribe()
    }

    /// Sessions are per peer, so multicast is never available here.
    async fn send(&self, destination: Destination, data: &[u8]) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "transport is shut down").into());
        }
        let Destination::Unicast(peer) = destination else {
            return Err(TransportError::MulticastDisabled);
        };
        let limit = self.max_payload();
        if data.len() > limit {
            return Err(TransportError::PayloadTooLarge { size: data.len(), limit });
        }

        let session = self.inner.await_established(peer).await?;
        let record = session.shared.seal_app_data(data).ok_or_else(|| TransportError::Handshake {
            peer,
            reason: "session has no key".to_string(),
        })?;
        self.inner.transport.send(Destination::Unicast(peer), &record).await
    }

    fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.inner.transport.local_addr()
    }

    fn max_payload(&self) -> usize {
        self.inner.transport.max_payload().saturating_sub(RECORD_OVERHEAD)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _ = self.inner.shutdown_signal.send(());
        self.pump.abort();

        let peers: Vec<SocketAddr> = self.inner.sessions.iter().map(|entry| entry.key().0).collect();
        for peer in peers {
            self.inner.close_session(peer, true).await;
        }
        self.inner.transport.shutdown().await
    }
}

fn derive_key(secret: &[u8], client_random: &[u8; RANDOM_LEN], server_random: &[u8; RANDOM_LEN]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret);
    hasher.update(client_random);
    hasher.update(server_random);
    hasher.update(KEY_DOMAIN);
    hasher.finalize().into()
}

fn server_hello(
    cipher: &Aes256Gcm,
    client_random: &[u8; RANDOM_LEN],
    server_random: &[u8; RANDOM_LEN],
) -> Option<Vec<u8>> {
    let mut hello = Vec::with_capacity(SERVER_HELLO_HEADER_LEN + TAG_LEN);
    hello.push(SERVER_HELLO);
    hello.extend_from_slice(client_random);
    hello.extend_from_slice(server_random);
    let mut empty = Vec::new();
    let tag = cipher
        .encrypt_in_place_detached(nonce_ref(&nonce(SERVER_TO_CLIENT, 0)), &hello, &mut empty)
        .ok()?;
    hello.extend_from_slice(&tag);
    Some(hello)
}

fn open_record(cipher: &Aes256Gcm, seq: u64, header: &[u8], ciphertext: &[u8], tag: &[u8]) -> Option<Vec<u8>> {
    let mut body = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(nonce_ref(&nonce(CLIENT_TO_SERVER, seq)), header, &mut body, tag_ref(tag))
        .ok()?;
    Some(body)
}

fn nonce(direction: u8, seq: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0] = direction;
    nonce[4..].copy_from_slice(&seq.to_be_bytes());
    nonce
}

fn close_nonce(sender: Role) -> [u8; 12] {
    nonce(CLOSE_DIRECTION_BASE + sender as u8, 0)
}

#[allow(deprecated)]
fn key_ref(bytes: &[u8; 32]) -> &Key<Aes256Gcm> {
    Key::<Aes256Gcm>::from_slice(bytes)
}

#[allow(deprecated)]
fn nonce_ref(bytes: &[u8; 12]) -> &GenericArray<u8, <Aes256Gcm as AeadCore>::NonceSize> {
    GenericArray::from_slice(bytes)
}

#[allow(deprecated)]
fn tag_ref(bytes: &[u8]) -> &GenericArray<u8, <Aes256Gcm as AeadCore>::TagSize> {
    GenericArray::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use crate::transport::memory::MemoryNetwork;
    use tokio::time::timeout;

    fn secure(network: &MemoryNetwork, secret: &str, handshake: Duration) -> (SecureTransport, Arc<MembershipStatistics>) {
        secure_with(network, &SecurityConfig::new(secret).with_handshake_timeout(handshake))
    }

    fn secure_with(network: &MemoryNetwork, security: &SecurityConfig) -> (SecureTransport, Arc<MembershipStatistics>) {
        let statistics = Arc::new(MembershipStatistics::new());
        let raw: Arc<dyn DatagramTransport> = Arc::new(network.bind_local().unwrap());
        (SecureTransport::new(raw, security, statistics.clone()), statistics)
    }

    async fn wait_until(condition: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            time::sleep(Duration::from_millis(20)).await;
        }
        condition()
    }

    async fn expect_datagram(rx: &mut broadcast::Receiver<Datagram>) -> Datagram {
        timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap()
    }

    #[test]
    fn test_replay_window() {
        let mut window = ReplayWindow::default();
        assert!(window.is_fresh(5));
        window.mark(5);
        assert!(!window.is_fresh(5));
        assert!(window.is_fresh(3));
        window.mark(3);
        assert!(!window.is_fresh(3));
        window.mark(100);
        assert!(!window.is_fresh(5), "older than the window");
        assert!(window.is_fresh(99));
        assert!(!window.is_fresh(100));
    }

    #[tokio::test]
    async fn test_handshake_then_delivery() {
        let network = MemoryNetwork::new();
        let (a, _) = secure(&network, "secret", Duration::from_secs(2));
        let (b, _) = secure(&network, "secret", Duration::from_secs(2));
        let mut incoming = b.incoming();

        a.send(Destination::Unicast(b.local_addr().unwrap()), b"first").await.unwrap();
        a.send(Destination::Unicast(b.local_addr().unwrap()), b"second").await.unwrap();

        let first = expect_datagram(&mut incoming).await;
        assert_eq!(first.remote_addr, a.local_addr().unwrap());
        assert_eq!(first.data, b"first");
        assert_eq!(expect_datagram(&mut incoming).await.data, b"second");

        // nothing on the wire carries the plaintext
        assert!(network.sent().iter().all(|d| !d.data.windows(5).any(|w| w == b"first")));
    }

    #[tokio::test]
    async fn test_wrong_secret_fails_only_that_peer() {
        let network = MemoryNetwork::new();
        let (a, _) = secure(&network, "secret", Duration::from_millis(500));
        let (b, _) = secure(&network, "secret", Duration::from_millis(500));
        let (intruder, _) = secure(&network, "other", Duration::from_millis(500));
        let mut b_incoming = b.incoming();

        let result = a.send(Destination::Unicast(intruder.local_addr().unwrap()), b"x").await;
        assert!(matches!(result, Err(TransportError::Handshake { .. })));

        a.send(Destination::Unicast(b.local_addr().unwrap()), b"still fine").await.unwrap();
        assert_eq!(expect_datagram(&mut b_incoming).await.data, b"still fine");
    }

    #[tokio::test]
    async fn test_unreachable_peer_times_out_with_retransmits() {
        let network = MemoryNetwork::new();
        let (a, statistics) = secure(&network, "secret", Duration::from_millis(200));
        let (b, _) = secure(&network, "secret", Duration::from_millis(200));
        let b_addr = b.local_addr().unwrap();
        network.set_reachable(b_addr, false);

        let result = a.send(Destination::Unicast(b_addr), b"x").await;
        assert!(matches!(result, Err(TransportError::Handshake { peer, .. }) if peer == b_addr));
        assert!(statistics.snapshot().handshake_retransmits >= 1);
        assert!(!a.has_session(b_addr));
    }

    #[tokio::test]
    async fn test_replayed_record_is_dropped() {
        let network = MemoryNetwork::new();
        let (a, _) = secure(&network, "secret", Duration::from_secs(2));
        let (b, _) = secure(&network, "secret", Duration::from_secs(2));
        let mut incoming = b.incoming();
        let a_addr = a.local_addr().unwrap();

        a.send(Destination::Unicast(b.local_addr().unwrap()), b"once").await.unwrap();
        assert_eq!(expect_datagram(&mut incoming).await.data, b"once");

        let record = network
            .sent()
            .into_iter()
            .rev()
            .find(|d| d.from == a_addr && d.data[0] == APP_DATA)
            .unwrap();
        b.inner.route(Datagram { remote_addr: a_addr, data: record.data }).await;

        assert!(timeout(Duration::from_millis(200), incoming.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent_and_renegotiates() {
        let network = MemoryNetwork::new();
        let (a, _) = secure(&network, "secret", Duration::from_secs(2));
        let (b, _) = secure(&network, "secret", Duration::from_secs(2));
        let mut incoming = b.incoming();
        let b_addr = b.local_addr().unwrap();

        a.send(Destination::Unicast(b_addr), b"one").await.unwrap();
        assert_eq!(expect_datagram(&mut incoming).await.data, b"one");

        a.close_session(b_addr).await;
        a.close_session(b_addr).await;
        assert!(!a.has_session(b_addr));

        a.send(Destination::Unicast(b_addr), b"two").await.unwrap();
        assert_eq!(expect_datagram(&mut incoming).await.data, b"two");

        a.shutdown().await.unwrap();
        a.shutdown().await.unwrap();
        assert!(a.send(Destination::Unicast(b_addr), b"three").await.is_err());
    }

    #[tokio::test]
    async fn test_multicast_is_refused() {
        let network = MemoryNetwork::with_multicast();
        let (a, _) = secure(&network, "secret", Duration::from_secs(1));
        assert!(matches!(a.send(Destination::Multicast, b"x").await, Err(TransportError::MulticastDisabled)));
    }

    #[tokio::test]
    async fn test_unanswered_server_session_expires() {
        let network = MemoryNetwork::new();
        let (b, _) = secure(&network, "secret", Duration::from_millis(200));
        let b_addr = b.local_addr().unwrap();
        let raw = network.bind_local().unwrap();
        let raw_addr = raw.local_addr().unwrap();

        let mut hello = vec![CLIENT_HELLO];
        hello.extend_from_slice(&[7u8; RANDOM_LEN]);
        raw.send(Destination::Unicast(b_addr), &hello).await.unwrap();
        assert!(wait_until(|| b.has_session(raw_addr)).await);

        // the hello is answered but no record under the key ever follows
        assert!(wait_until(|| !b.has_session(raw_addr)).await);
        assert!(network.sent().iter().any(|d| d.from == b_addr && d.data[0] == CLOSE));
    }

    #[tokio::test]
    async fn test_forged_close_and_hello_leave_session_intact() {
        let network = MemoryNetwork::new();
        let (a, _) = secure(&network, "secret", Duration::from_secs(2));
        let (b, _) = secure(&network, "secret", Duration::from_secs(2));
        let mut incoming = b.incoming();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send(Destination::Unicast(b_addr), b"one").await.unwrap();
        assert_eq!(expect_datagram(&mut incoming).await.data, b"one");

        let mut forged = vec![CLOSE, Role::Client as u8];
        b.inner.route(Datagram { remote_addr: a_addr, data: forged.clone() }).await;
        forged.extend_from_slice(&[0u8; TAG_LEN]);
        b.inner.route(Datagram { remote_addr: a_addr, data: forged }).await;
        let mut spoofed_hello = vec![CLIENT_HELLO];
        spoofed_hello.extend_from_slice(&[9u8; RANDOM_LEN]);
        b.inner.route(Datagram { remote_addr: a_addr, data: spoofed_hello }).await;
        assert!(b.has_session(a_addr));

        a.send(Destination::Unicast(b_addr), b"two").await.unwrap();
        assert_eq!(expect_datagram(&mut incoming).await.data, b"two");

        // a close sealed with the session key is honoured
        a.close_session(b_addr).await;
        assert!(wait_until(|| !b.has_session(a_addr)).await);
    }

    #[tokio::test]
    async fn test_idle_sessions_expire_and_renegotiate() {
        let network = MemoryNetwork::new();
        let security = SecurityConfig::new("secret")
            .with_handshake_timeout(Duration::from_secs(1))
            .with_session_idle_timeout(Duration::from_millis(200));
        let (a, _) = secure_with(&network, &security);
        let (b, _) = secure_with(&network, &security);
        let mut incoming = b.incoming();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send(Destination::Unicast(b_addr), b"one").await.unwrap();
        assert_eq!(expect_datagram(&mut incoming).await.data, b"one");

        assert!(wait_until(|| !a.has_session(b_addr) && !b.has_session(a_addr)).await);

        a.send(Destination::Unicast(b_addr), b"two").await.unwrap();
        assert_eq!(expect_datagram(&mut incoming).await.data, b"two");
    }

    #[tokio::test]
    async fn test_lost_server_session_is_renegotiated() {
        let network = MemoryNetwork::new();
        let (a, _) = secure(&network, "secret", Duration::from_secs(2));
        let (b, _) = secure(&network, "secret", Duration::from_secs(2));
        let mut incoming = b.incoming();
        let a_addr = a.local_addr().unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send(Destination::Unicast(b_addr), b"before").await.unwrap();
        assert_eq!(expect_datagram(&mut incoming).await.data, b"before");
        b.inner.remove_session(a_addr, Role::Server);

        let mut delivered = false;
        for _ in 0..20 {
            a.send(Destination::Unicast(b_addr), b"after").await.unwrap();
            if let Ok(Ok(datagram)) = timeout(Duration::from_millis(100), incoming.recv()).await {
                if datagram.data == b"after" {
                    delivered = true;
                    break;
                }
            }
        }
        assert!(delivered);
        assert!(network.sent().iter().any(|d| d.from == b_addr && d.data == [RENEGOTIATE]));
    }

    #[tokio::test]
    async fn test_concurrent_first_sends_share_one_session() {
        let network = MemoryNetwork::new();
        let (a, _) = secure(&network, "secret", Duration::from_secs(2));
        let (b, _) = secure(&network, "secret", Duration::from_secs(2));
        let mut incoming = b.incoming();
        let b_addr = b.local_addr().unwrap();

        let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i]).collect();
        let results = join_all(payloads.iter().map(|p| a.send(Destination::Unicast(b_addr), p))).await;
        assert!(results.iter().all(Result::is_ok));

        let mut received = Vec::new();
        for _ in 0..payloads.len() {
            received.push(expect_datagram(&mut incoming).await.data);
        }
        received.sort();
        assert_eq!(received, payloads);
        assert_eq!(a.inner.sessions.len(), 1);
        assert_eq!(b.inner.sessions.len(), 1);
    }
}
