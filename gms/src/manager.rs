//! Group membership service.
//!
//! [`MembershipManager`] ties the pieces together:
//!
//! * the datagram transport carries heartbeats and suspicion announcements;
//!   every datagram's claimed sender must match its source address.
//!
//! * the messenger (direct channel) carries everything that must not get
//!   lost: final checks, join/leave/remove requests, new views and application
//!   messages.
//!
//! * the failure detector runs inside a single runtime actor, so every health
//!   transition is serialized. Its timeouts are armed on the task scheduler,
//!   which a recurrent actor drives at the configured tick.
//!
//! * the coordinator of the current view is the only member that creates
//!   views. It admits joiners, records leavers as shutdown and crashed members
//!   as crashed, and sends each new view to every remaining member.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::slice;
use std::sync::{Arc, Weak};
use anyhow::{bail, Context as _};
use futures::future::join_all;
use gethostname::gethostname;
use gms_runtime::RuntimeExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, OnceCell};
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::MessageCodec;
use crate::config::{MembershipConfig, DEFAULT_CHANNEL_BUFFER_SIZE};
use crate::dispatch::{FnHandler, MessageDispatcher, MessageHandler};
use crate::error::GmsError;
use crate::fd::{DetectorAction, DetectorEvent, DetectorSettings, FailureDetector, HealthState, LossPolicy, WeightedLossPolicy};
use crate::ip_addr::IpAddress;
use crate::member::{MemberIdentifier, MemberIdentifierBuilder, Version};
use crate::message::{
    FinalCheckRequestPayload, FinalCheckResponsePayload, HeartbeatRequestPayload, HeartbeatResponsePayload,
    InstallViewPayload, JoinRequestPayload, JoinResponsePayload, LeaveRequestPayload, Message, MessageKind, Payload,
    RemoveMemberPayload, SuspectEntry, SuspectPayload,
};
use crate::messenger::{Messenger, MessengerConfig};
use crate::runtime::{ActorId, GmsRuntime};
use crate::scheduler::{MonotonicClock, TaskScheduler};
use crate::statistics::{MembershipStatistics, StatisticsSnapshot};
use crate::transport::{Datagram, DatagramTransport, Destination, SecureTransport, UdpTransport, UdpTransportConfig};
use crate::view::{MembershipView, ViewEvent};

const MAX_JOIN_REDIRECTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ManagerState {
    Joining,
    Running,
    /// Removed from the view by the rest of the group.
    Expelled,
    Closed,
}

enum Adoption {
    Installed(Option<MembershipView>),
    Expelled,
    Ignored,
}

/// [`MembershipManager`] one member of a process group.
#[derive(Clone)]
pub struct MembershipManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: MembershipConfig,

    /// Identity of this process; gains its view id with the first view.
    local: RwLock<MemberIdentifier>,

    /// The installed view, `None` until the join completes.
    view: RwLock<Option<MembershipView>>,

    // coordinator-side view changes run one at a time
    view_change: tokio::sync::Mutex<()>,

    /// Members that crashed or left in any view installed here.
    departed: RwLock<HashSet<MemberIdentifier>>,

    state: RwLock<ManagerState>,

    transport: Arc<dyn DatagramTransport>,

    /// Direct channel, absent when TCP is disabled.
    messenger: Option<Messenger>,

    dispatcher: Arc<MessageDispatcher>,

    statistics: Arc<MembershipStatistics>,

    scheduler: Arc<TaskScheduler>,

    runtime: Arc<GmsRuntime>,

    detector: Mutex<Option<FailureDetector>>,

    loss_policy: Arc<dyn LossPolicy>,

    events: broadcast::Sender<ViewEvent>,

    // set while a join is waiting for its answer
    join_responses: Mutex<Option<mpsc::UnboundedSender<JoinResponsePayload>>>,

    shutdown: broadcast::Sender<()>,

    closed: OnceCell<()>,
}

impl MembershipManager {
    /// Starts a member on UDP and joins the group through the configured
    /// locators, founding a new group when none of them answers.
    pub async fn join(config: MembershipConfig) -> Result<Self, GmsError> {
        let mut udp = UdpTransportConfig::new(SocketAddr::new(config.bind_addr, config.membership_port));
        udp.max_datagram_size = config.max_datagram_size;
        if config.enable_multicast {
            udp.multicast_group = config.multicast_addr;
        }
        let transport = UdpTransport::bind(udp).await?;
        Self::join_with_transport(config, Arc::new(transport)).await
    }

    /// Like [`MembershipManager::join`], over a caller-provided datagram transport.
    pub async fn join_with_transport(
        config: MembershipConfig,
        transport: Arc<dyn DatagramTransport>,
    ) -> Result<Self, GmsError> {
        let loss_policy = Arc::new(WeightedLossPolicy::new(config.loss_threshold_percent));
        Self::join_with(config, transport, loss_policy).await
    }

    /// Full control: datagram transport and partition loss policy.
    #[instrument(skip_all, fields(name = %config.name()))]
    pub async fn join_with(
        config: MembershipConfig,
        transport: Arc<dyn DatagramTransport>,
        loss_policy: Arc<dyn LossPolicy>,
    ) -> Result<Self, GmsError> {
        let statistics = Arc::new(MembershipStatistics::new());
        let transport: Arc<dyn DatagramTransport> = match &config.encryption {
            Some(security) => Arc::new(SecureTransport::new(transport, security, statistics.clone())),
            None => transport,
        };
        let membership_addr = transport.local_addr()?;

        let dispatcher = Arc::new(MessageDispatcher::new());
        let messenger = if config.disable_tcp {
            None
        } else {
            let messenger_config = MessengerConfig {
                connect_timeout: config.final_check_timeout,
                shutdown_timeout: config.shutdown_timeout,
            };
            let addr = SocketAddr::new(config.bind_addr, config.direct_channel_port);
            Some(Messenger::bind(addr, dispatcher.clone(), statistics.clone(), messenger_config).await?)
        };

        let direct_channel_port = messenger.as_ref().map_or(0, |m| m.local_addr().port());
        let local = Self::local_identity(&config, membership_addr, direct_channel_port)?;
        if let Some(messenger) = &messenger {
            messenger.set_local_member(local.clone());
        }

        let runtime = GmsRuntime::builder()
            .with_name(format!("gms-{}", config.name))
            .with_shutdown_duration(config.shutdown_timeout)
            .build::<ActorId, DetectorEvent>();
        let (events, _) = broadcast::channel(DEFAULT_CHANNEL_BUFFER_SIZE);
        let (shutdown, _) = broadcast::channel(1);

        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                local: RwLock::new(local.clone()),
                view: RwLock::new(None),
                view_change: tokio::sync::Mutex::new(()),
                departed: RwLock::new(HashSet::new()),
                state: RwLock::new(ManagerState::Joining),
                transport,
                messenger,
                dispatcher,
                statistics,
                scheduler: Arc::new(TaskScheduler::new(Arc::new(MonotonicClock::new()))),
                runtime,
                detector: Mutex::new(None),
                loss_policy,
                events,
                join_responses: Mutex::new(None),
                shutdown,
                closed: OnceCell::new(),
            }),
        };
        info!(member = %local, addr = %membership_addr, "membership service starting");

        if let Err(e) = manager.start().await {
            manager.close().await?;
            return Err(e);
        }
        Ok(manager)
    }

    async fn start(&self) -> Result<(), GmsError> {
        self.register_protocol_handlers();
        self.launch_failure_detector().await?;
        self.launch_scheduler_driver().await?;
        self.launch_datagram_listener();
        self.run_join().await
    }

    fn local_identity(
        config: &MembershipConfig,
        membership_addr: SocketAddr,
        direct_channel_port: u16,
    ) -> Result<MemberIdentifier, GmsError> {
        let address = IpAddress::advertised(membership_addr.ip())
            .map_err(|e| GmsError::InvalidIdentifier(format!("unable to resolve the advertised address: {}", e)))?;
        let host_name = gethostname().to_string_lossy().into_owned();

        let mut builder = MemberIdentifierBuilder::for_local_address(address, host_name)
            .name(config.name.clone())
            .membership_port(membership_addr.port())
            .direct_channel_port(direct_channel_port)
            .roles_and_groups(&config.roles, &config.groups)
            .durable_client(config.durable_client_id.clone(), config.durable_client_timeout)
            .network_partition_detection(config.enable_network_partition_detection)
            .require_vm_kind(config.require_vm_kind);
        if let Some(kind) = config.vm_kind {
            builder = builder.vm_kind(kind);
        }
        if let Some(weight) = config.weight {
            builder = builder.weight(weight);
        }
        if let Some(preferred) = config.preferred_for_coordinator {
            builder = builder.preferred_for_coordinator(preferred);
        }
        builder.build()
    }

    fn upgrade(inner: &Weak<ManagerInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub fn local_member(&self) -> MemberIdentifier {
        self.inner.local.read().clone()
    }

    pub fn current_view(&self) -> Option<MembershipView> {
        self.inner.view.read().clone()
    }

    pub fn coordinator(&self) -> Option<MemberIdentifier> {
        self.inner.view.read().as_ref().and_then(|view| view.coordinator().cloned())
    }

    /// View changes from now on. A receiver that falls too far behind skips
    /// the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.inner.events.subscribe()
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.inner.statistics.snapshot()
    }

    /// Health of `member` as seen by the local failure detector.
    pub fn health_of(&self, member: &MemberIdentifier) -> Option<HealthState> {
        self.inner.detector.lock().as_ref().and_then(|detector| detector.state_of(member))
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ManagerState::Closed
    }

    fn state(&self) -> ManagerState {
        *self.inner.state.read()
    }

    /// Routes application messages of type `kind` to `handler`, replacing any
    /// handler registered for it before.
    pub fn add_message_handler(&self, kind: u16, handler: Arc<dyn MessageHandler>) -> Result<(), GmsError> {
        self.inner.dispatcher.register(MessageKind::application(kind)?, handler);
        Ok(())
    }

    pub fn remove_message_handler(&self, kind: u16) -> Result<(), GmsError> {
        self.inner.dispatcher.unregister(MessageKind::application(kind)?);
        Ok(())
    }

    /// Sends an application message to one member over the direct channel.
    ///
    /// Fails fast with [`GmsError::MemberRemoved`] when the recipient already
    /// crashed or left. A recipient the local view does not know yet is tried
    /// anyway; it may have joined in a view not installed here yet.
    pub async fn send_to_member(&self, recipient: &MemberIdentifier, message: Message) -> Result<(), GmsError> {
        self.check_sendable(&message)?;
        let local = self.local_member();
        if recipient == &local {
            self.inner.dispatcher.dispatch(message.with_sender(local)).await?;
            return Ok(());
        }

        let known = self.current_view().and_then(|view| view.get(recipient).cloned());
        let recipient = match known {
            Some(member) => member,
            None if self.inner.departed.read().contains(recipient) => {
                return Err(GmsError::MemberRemoved(recipient.to_string()));
            }
            None => recipient.clone(),
        };
        self.messenger()?.send(&recipient, message).await
    }

    /// Sends an application message to every other member of the current
    /// view. Every member is tried; the first failure is returned.
    pub async fn broadcast(&self, message: Message) -> Result<(), GmsError> {
        self.check_sendable(&message)?;
        let view = self.current_view().ok_or(GmsError::MembershipClosed)?;
        let local = self.local_member();
        let messenger = self.messenger()?;

        let sends = view.members().iter().filter(|m| **m != local).map(|member| {
            let message = message.clone();
            async move { (member, messenger.send(member, message).await) }
        });
        let mut first_error = None;
        for (member, result) in join_all(sends).await {
            if let Err(e) = result {
                warn!(member = %member, "broadcast not delivered: {}", e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn check_sendable(&self, message: &Message) -> Result<(), GmsError> {
        match self.state() {
            ManagerState::Closed => return Err(GmsError::MembershipClosed),
            ManagerState::Expelled => return Err(GmsError::MemberRemoved(self.local_member().to_string())),
            ManagerState::Joining | ManagerState::Running => {}
        }
        if !message.kind().is_application() {
            return Err(GmsError::Codec(format!("{} is reserved for the membership protocol", message.kind())));
        }
        Ok(())
    }

    fn messenger(&self) -> Result<&Messenger, GmsError> {
        self.inner.messenger
            .as_ref()
            .ok_or_else(|| GmsError::Config("the direct channel is disabled".to_string()))
    }

    /// Leaves the group and closes the service.
    ///
    /// A member asks the coordinator to install a view without it; a leaving
    /// coordinator installs that view itself.
    #[instrument(skip(self), fields(member = %self.local_member()))]
    pub async fn leave(&self) -> Result<(), GmsError> {
        let view = match self.state() {
            ManagerState::Running => self.current_view(),
            _ => None,
        };
        let local = self.local_member();

        if let Some(view) = view.filter(|view| view.size() > 1) {
            match view.coordinator() {
                Some(coordinator) if *coordinator == local => {
                    info!(view_id = view.view_id(), "coordinator leaving, handing over");
                    self.coordinate(&[], |current, local| {
                        current.successor(local, &[], slice::from_ref(local), &[]).map(Some)
                    })
                    .await?;
                }
                Some(coordinator) => {
                    let request = Payload::LeaveRequest(LeaveRequestPayload {
                        member: local.clone(),
                        reason: "graceful shutdown".to_string(),
                    });
                    if let Err(e) = self.send_direct(coordinator, request).await {
                        warn!(coordinator = %coordinator, "leave request not delivered: {}", e);
                    }
                }
                None => {}
            }
        }
        self.close().await
    }

    /// Stops the service: new sends are rejected at once, then the detector,
    /// the actors and both transports shut down. Idempotent; concurrent
    /// callers all return once the single shutdown has finished.
    #[instrument(skip(self), fields(member = %self.local_member()))]
    pub async fn close(&self) -> Result<(), GmsError> {
        *self.inner.state.write() = ManagerState::Closed;
        self.inner.closed.get_or_init(|| self.shutdown()).await;
        Ok(())
    }

    async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(());
        *self.inner.join_responses.lock() = None;

        let detector = self.inner.detector.lock().take();
        if let Some(mut detector) = detector {
            detector.stop();
        }
        if let Err(e) = self.inner.runtime.destroy().await {
            warn!("runtime did not stop cleanly: {}", e);
        }
        self.inner.scheduler.clear();

        if let Some(messenger) = &self.inner.messenger {
            if let Err(e) = messenger.close().await {
                warn!("direct channel did not close cleanly: {}", e);
            }
        }
        if let Err(e) = self.inner.transport.shutdown().await {
            warn!("datagram transport did not close cleanly: {}", e);
        }
        info!("membership service closed");
    }

    async fn launch_failure_detector(&self) -> Result<(), GmsError> {
        let manager = Arc::downgrade(&self.inner);
        self.inner.runtime.spawn_actor(
            ActorId::FailureDetector,
            move |command| {
                let manager = manager.clone();
                Box::pin(async move {
                    let (Some(event), Some(manager)) = (command, Self::upgrade(&manager)) else {
                        return;
                    };
                    manager.on_detector_event(event).await;
                })
            },
        ).await?;
        Ok(())
    }

    async fn launch_scheduler_driver(&self) -> Result<(), GmsError> {
        let scheduler = self.inner.scheduler.clone();
        self.inner.runtime.spawn_recurrent_actor(
            ActorId::SchedulerDriver,
            self.inner.config.scheduler_tick,
            move |_| {
                let scheduler = scheduler.clone();
                Box::pin(async move {
                    if let Err(e) = scheduler.trigger_due() {
                        error!("scheduler pass failed: {:#}", e);
                    }
                })
            },
        ).await?;
        Ok(())
    }

    fn launch_datagram_listener(&self) {
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        let mut datagrams = self.inner.transport.incoming();
        let manager = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = datagrams.recv() => match received {
                        Ok(datagram) => {
                            let Some(manager) = Self::upgrade(&manager) else {
                                break;
                            };
                            let source = datagram.remote_addr;
                            if let Err(e) = manager.handle_datagram(datagram).await {
                                debug!(%source, "dropping datagram: {:#}", e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "datagram listener fell behind");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            debug!("datagram listener stopped");
        });
    }

    async fn handle_datagram(&self, datagram: Datagram) -> anyhow::Result<()> {
        let started = self.inner.statistics.start_timer();
        let decoded = MessageCodec::new(Version::CURRENT).decode_slice(&datagram.data);
        self.inner.statistics.end_deserialization(started);
        let message = decoded.context("undecodable datagram")?;
        self.inner.statistics.record_message_received(datagram.data.len());

        let kind = message.kind();
        if !kind.is_datagram() {
            bail!("{} is not carried by datagrams", kind);
        }
        let sender = match message.sender() {
            Some(sender) if sender.membership_addr() == datagram.remote_addr => sender.clone(),
            claimed => bail!(
                "claimed sender {} does not match the source address",
                claimed.map_or_else(|| "<none>".to_string(), |s| s.to_string())
            ),
        };
        if sender == self.local_member() {
            // own multicast
            return Ok(());
        }

        match message.into_payload() {
            Payload::HeartbeatRequest(request) => {
                self.inner.statistics.inc_heartbeat_requests_received();
                if request.target != self.local_member() {
                    debug!(target = %request.target, "heartbeat request for another incarnation");
                    return Ok(());
                }
                let response = Payload::HeartbeatResponse(HeartbeatResponsePayload { request_id: request.request_id });
                self.send_datagram(&sender, response).await?;
                self.inner.statistics.inc_heartbeat_responses_sent();
            }
            Payload::HeartbeatResponse(response) => {
                self.inner.statistics.inc_heartbeat_responses_received();
                self.feed_detector(DetectorEvent::HeartbeatResponse { from: sender, request_id: response.request_id });
            }
            Payload::Suspect(suspect) => {
                self.inner.statistics.inc_suspects_received();
                self.feed_detector(DetectorEvent::SuspectReceived { reporter: sender, suspects: suspect.suspects });
            }
            _ => bail!("unexpected {} datagram", kind),
        }
        Ok(())
    }

    fn encode(&self, version: Version, message: Message) -> Result<Vec<u8>, GmsError> {
        let started = self.inner.statistics.start_timer();
        let data = MessageCodec::new(version).encode_to_vec(message)?;
        self.inner.statistics.end_serialization(started);
        Ok(data)
    }

    async fn send_datagram(&self, to: &MemberIdentifier, payload: Payload) -> Result<(), GmsError> {
        let message = Message::new(payload)?
            .with_recipient(to.clone())
            .with_sender(self.local_member());
        let data = self.encode(Version::CURRENT.min(to.version()), message)?;
        self.inner.transport.send(Destination::Unicast(to.membership_addr()), &data).await?;
        self.inner.statistics.record_message_sent(data.len());
        Ok(())
    }

    async fn send_multicast(&self, version: Version, payload: Payload) -> Result<(), GmsError> {
        let message = Message::new(payload)?.with_sender(self.local_member());
        let data = self.encode(version, message)?;
        self.inner.transport.send(Destination::Multicast, &data).await?;
        self.inner.statistics.record_message_sent(data.len());
        Ok(())
    }

    async fn send_direct(&self, to: &MemberIdentifier, payload: Payload) -> Result<(), GmsError> {
        self.messenger()?.send(to, Message::new(payload)?).await
    }

    fn feed_detector(&self, event: DetectorEvent) {
        match self.inner.runtime.command_sender(&ActorId::FailureDetector) {
            Some(detector) if detector.send(event).is_ok() => {}
            _ => debug!("failure detector is not running, dropping event"),
        }
    }

    async fn on_detector_event(&self, event: DetectorEvent) {
        let handled = {
            let mut detector = self.inner.detector.lock();
            match detector.as_mut() {
                Some(detector) => detector.handle(event),
                None => return,
            }
        };
        match handled {
            Ok(actions) => {
                for action in actions {
                    self.execute(action).await;
                }
            }
            Err(e) => error!("failure detector rejected an event: {}", e),
        }
    }

    /// Carries out one detector action. Sends that may wait on a connection or
    /// a session handshake run in their own task so the detector never stalls.
    async fn execute(&self, action: DetectorAction) {
        match action {
            DetectorAction::SendHeartbeat { to, request_id } => {
                let manager = self.clone();
                tokio::spawn(async move {
                    let request = Payload::HeartbeatRequest(HeartbeatRequestPayload { request_id, target: to.clone() });
                    match manager.send_datagram(&to, request).await {
                        Ok(()) => manager.inner.statistics.inc_heartbeat_requests_sent(),
                        // surfaces as a missed heartbeat
                        Err(e) => debug!(member = %to, "heartbeat request not sent: {}", e),
                    }
                });
            }
            DetectorAction::BroadcastSuspect { suspect, reason } => self.broadcast_suspect(suspect, reason),
            DetectorAction::SendFinalCheck { to, request_id } => {
                let manager = self.clone();
                tokio::spawn(async move {
                    let request = Payload::FinalCheckRequest(FinalCheckRequestPayload { request_id, target: to.clone() });
                    match manager.send_direct(&to, request).await {
                        Ok(()) => manager.inner.statistics.inc_final_check_requests_sent(),
                        Err(e) => {
                            warn!(member = %to, "final check could not be sent: {}", e);
                            manager.feed_detector(DetectorEvent::FinalCheckFailed { member: to, request_id });
                        }
                    }
                });
            }
            DetectorAction::RequestRemoval { coordinator, member, reason } => {
                let manager = self.clone();
                tokio::spawn(async move {
                    info!(member = %member, coordinator = %coordinator, "asking the coordinator to remove member");
                    let request = Payload::RemoveMember(RemoveMemberPayload { member, reason });
                    if let Err(e) = manager.send_direct(&coordinator, request).await {
                        warn!(coordinator = %coordinator, "remove request not delivered: {}", e);
                    }
                });
            }
            DetectorAction::InstallView(view) => {
                let crashed = view.crashed_members();
                let removed = self.coordinate(&[], |current, local| {
                    let present: Vec<MemberIdentifier> = crashed.iter().filter(|m| current.contains(m)).cloned().collect();
                    if present.is_empty() {
                        return Ok(None);
                    }
                    current.successor(local, &[], &[], &present).map(Some)
                });
                if let Err(e) = removed.await {
                    error!("unable to install a view without the crashed members: {}", e);
                }
            }
            DetectorAction::PartitionDetected { unreachable, lost_weight, total_weight } => {
                self.inner.statistics.inc_partitions_detected();
                self.notify(ViewEvent::PartitionDetected { unreachable, lost_weight, total_weight });
            }
        }
    }

    fn broadcast_suspect(&self, suspect: MemberIdentifier, reason: String) {
        let Some(view) = self.current_view() else {
            return;
        };
        let manager = self.clone();
        tokio::spawn(async move {
            let payload = Payload::Suspect(SuspectPayload { suspects: vec![SuspectEntry { suspect, reason }] });
            let config = &manager.inner.config;
            if config.enable_multicast && !config.is_encrypted() {
                let version = view.members().iter().map(|m| m.version()).min().unwrap_or(Version::CURRENT);
                match manager.send_multicast(version, payload).await {
                    Ok(()) => manager.inner.statistics.inc_suspects_sent(),
                    Err(e) => debug!("suspect announcement not multicast: {}", e),
                }
                return;
            }

            let local = manager.local_member();
            for member in view.members().iter().filter(|m| **m != local) {
                match manager.send_datagram(member, payload.clone()).await {
                    Ok(()) => manager.inner.statistics.inc_suspects_sent(),
                    Err(e) => debug!(member = %member, "suspect announcement not sent: {}", e),
                }
            }
        });
    }

    fn register_protocol_handlers(&self) {
        let kinds = [
            MessageKind::FinalCheckRequest,
            MessageKind::FinalCheckResponse,
            MessageKind::JoinRequest,
            MessageKind::JoinResponse,
            MessageKind::LeaveRequest,
            MessageKind::RemoveMember,
            MessageKind::InstallView,
        ];
        for kind in kinds {
            let manager = Arc::downgrade(&self.inner);
            self.inner.dispatcher.register(kind, Arc::new(FnHandler::new(move |message: Message| {
                let manager = manager.clone();
                async move {
                    match Self::upgrade(&manager) {
                        Some(manager) => manager.handle_direct(message).await,
                        None => Ok(()),
                    }
                }
            })));
        }
    }

    async fn handle_direct(&self, message: Message) -> anyhow::Result<()> {
        let kind = message.kind();
        let sender = message.sender().cloned().context("direct message without a sender")?;

        match message.into_payload() {
            Payload::FinalCheckRequest(request) => {
                self.inner.statistics.inc_final_check_requests_received();
                if request.target != self.local_member() {
                    debug!(target = %request.target, "final check for another incarnation");
                    return Ok(());
                }
                let response = Payload::FinalCheckResponse(FinalCheckResponsePayload { request_id: request.request_id });
                self.send_direct(&sender, response).await?;
                self.inner.statistics.inc_final_check_responses_sent();
            }
            Payload::FinalCheckResponse(response) => {
                self.inner.statistics.inc_final_check_responses_received();
                self.feed_detector(DetectorEvent::FinalCheckResponse { from: sender, request_id: response.request_id });
            }
            Payload::JoinRequest(_) => self.handle_join_request(sender).await?,
            Payload::JoinResponse(response) => self.handle_join_response(&sender, response),
            Payload::LeaveRequest(request) => self.handle_leave_request(sender, &request.reason).await?,
            Payload::RemoveMember(request) => {
                let member = self.current_view()
                    .and_then(|view| view.get(&request.member).cloned())
                    .unwrap_or(request.member);
                self.feed_detector(DetectorEvent::RemoveRequested { requester: sender, member, reason: request.reason });
            }
            Payload::InstallView(install) => self.handle_install_view(&sender, install.view),
            _ => debug!(%kind, sender = %sender, "unexpected direct message"),
        }
        Ok(())
    }

    /// The joiner identity is the handshake identity of its connection; the
    /// identity claimed in the request is not used.
    async fn handle_join_request(&self, joiner: MemberIdentifier) -> anyhow::Result<()> {
        let view = match self.state() {
            ManagerState::Running => self.current_view(),
            _ => None,
        };
        let response = match view {
            None => JoinResponsePayload::Rejected("not a member of a view".to_string()),
            Some(view) => match view.coordinator() {
                Some(coordinator) if *coordinator != self.local_member() => {
                    debug!(joiner = %joiner, coordinator = %coordinator, "redirecting join request");
                    JoinResponsePayload::Redirect(coordinator.clone())
                }
                _ => self.admit(&joiner).await?,
            },
        };
        self.send_direct(&joiner, Payload::JoinResponse(response)).await?;
        Ok(())
    }

    async fn admit(&self, joiner: &MemberIdentifier) -> Result<JoinResponsePayload, GmsError> {
        self.coordinate(slice::from_ref(joiner), |current, local| {
            if current.contains(joiner) || current.coordinator() != Some(local) {
                return Ok(None);
            }
            current.successor(local, slice::from_ref(joiner), &[], &[]).map(Some)
        })
        .await?;

        match self.current_view() {
            Some(view) if view.contains(joiner) => {
                info!(member = %joiner, view_id = view.view_id(), "admitted member");
                Ok(JoinResponsePayload::Accepted(view))
            }
            _ => Ok(JoinResponsePayload::Rejected("the coordinator changed, retry".to_string())),
        }
    }

    fn handle_join_response(&self, sender: &MemberIdentifier, response: JoinResponsePayload) {
        match self.inner.join_responses.lock().as_ref() {
            Some(pending) => {
                let _ = pending.send(response);
            }
            None => debug!(sender = %sender, "ignoring join response, not joining"),
        }
    }

    async fn handle_leave_request(&self, leaver: MemberIdentifier, reason: &str) -> anyhow::Result<()> {
        info!(member = %leaver, reason, "member is leaving");
        self.coordinate(&[], |current, local| {
            let leaving = slice::from_ref(&leaver);
            if !current.contains(&leaver) || current.coordinator_excluding(leaving) != Some(local) {
                return Ok(None);
            }
            current.successor(local, &[], leaving, &[]).map(Some)
        })
        .await?;
        Ok(())
    }

    fn handle_install_view(&self, sender: &MemberIdentifier, view: MembershipView) {
        if sender != view.creator() {
            warn!(sender = %sender, creator = %view.creator(), "dropping view sent by a member that did not create it");
            return;
        }
        if self.is_closed() {
            return;
        }
        self.adopt_view(view);
    }

    /// Computes, installs and distributes the next view, one change at a time.
    ///
    /// `change` gets the current view and the local member and returns `None`
    /// when there is nothing to do. The new view goes to every member of it
    /// except the local member and `skip`.
    async fn coordinate<F>(&self, skip: &[MemberIdentifier], change: F) -> Result<Option<MembershipView>, GmsError>
    where
        F: FnOnce(&MembershipView, &MemberIdentifier) -> Result<Option<MembershipView>, GmsError>,
    {
        let _serialized = self.inner.view_change.lock().await;
        let Some(current) = self.current_view() else {
            return Ok(None);
        };
        let local = self.local_member();
        let Some(next) = change(&current, &local)? else {
            return Ok(None);
        };

        info!(view_id = next.view_id(), members = next.size(), "installing view");
        if next.contains(&local) {
            self.adopt_view(next.clone());
        }
        let recipients: Vec<MemberIdentifier> = next.members()
            .iter()
            .filter(|m| **m != local && !skip.contains(m))
            .cloned()
            .collect();
        self.distribute(&next, &recipients).await;
        Ok(Some(next))
    }

    async fn distribute(&self, view: &MembershipView, recipients: &[MemberIdentifier]) {
        let sends = recipients.iter().map(|member| async move {
            let install = Payload::InstallView(InstallViewPayload { view: view.clone() });
            (member, self.send_direct(member, install).await)
        });
        for (member, result) in join_all(sends).await {
            if let Err(e) = result {
                warn!(member = %member, view_id = view.view_id(), "view not delivered: {}", e);
            }
        }
    }

    /// Installs `view` unless it is not newer than the current one.
    fn adopt_view(&self, view: MembershipView) {
        let local = self.local_member();
        let adoption = {
            let mut current = self.inner.view.write();
            if current.as_ref().is_some_and(|c| view.view_id() <= c.view_id()) {
                Adoption::Ignored
            } else if !view.contains(&local) {
                if current.is_some() { Adoption::Expelled } else { Adoption::Ignored }
            } else {
                Adoption::Installed(current.replace(view.clone()))
            }
        };

        match adoption {
            Adoption::Ignored => debug!(view_id = view.view_id(), "ignoring view"),
            Adoption::Expelled => self.expel(view),
            Adoption::Installed(previous) => self.on_view_installed(previous, view),
        }
    }

    fn on_view_installed(&self, previous: Option<MembershipView>, view: MembershipView) {
        if let Some(resolved) = view.get(&self.local_member()).cloned() {
            if let Some(messenger) = &self.inner.messenger {
                messenger.set_local_member(resolved.clone());
            }
            *self.inner.local.write() = resolved;
        }
        {
            let mut departed = self.inner.departed.write();
            departed.extend(view.crashed_members().iter().cloned());
            departed.extend(view.shutdown_members().iter().cloned());
        }

        let statistics = &self.inner.statistics;
        statistics.inc_views_installed();
        statistics.inc_members_crashed(view.crashed_members().len() as u64);
        statistics.inc_members_departed(view.shutdown_members().len() as u64);
        info!(
            view_id = view.view_id(),
            members = view.size(),
            coordinator = %view.coordinator().map_or_else(String::new, |c| c.to_string()),
            "view installed"
        );

        match &previous {
            None => self.start_detector(view.clone()),
            Some(_) => self.feed_detector(DetectorEvent::ViewInstalled(view.clone())),
        }
        for event in view.diff(previous.as_ref()) {
            self.notify(event);
        }

        if let (Some(previous), Some(messenger)) = (previous, self.inner.messenger.clone()) {
            let gone: Vec<SocketAddr> = previous.members()
                .iter()
                .filter(|m| !view.contains(m))
                .filter_map(|m| m.direct_channel_addr())
                .collect();
            if !gone.is_empty() {
                tokio::spawn(async move {
                    for addr in gone {
                        messenger.disconnect(addr).await;
                    }
                });
            }
        }
    }

    fn start_detector(&self, view: MembershipView) {
        let Some(events) = self.inner.runtime.command_sender(&ActorId::FailureDetector) else {
            warn!("failure detector actor is gone, member health is not monitored");
            return;
        };
        let config = &self.inner.config;
        let settings = DetectorSettings {
            heartbeat_interval: config.heartbeat_interval,
            member_timeout: config.member_timeout,
            final_check_timeout: config.final_check_timeout,
            suspect_threshold: config.suspect_threshold,
            partition_detection: config.enable_network_partition_detection,
        };
        let mut detector = FailureDetector::new(
            self.local_member(),
            view,
            settings,
            self.inner.loss_policy.clone(),
            self.inner.scheduler.clone(),
            events,
        );
        detector.start();
        *self.inner.detector.lock() = Some(detector);
    }

    fn expel(&self, view: MembershipView) {
        {
            let mut state = self.inner.state.write();
            if !matches!(*state, ManagerState::Joining | ManagerState::Running) {
                return;
            }
            *state = ManagerState::Expelled;
        }
        warn!(view_id = view.view_id(), "removed from the view by the rest of the group");
        let detector = self.inner.detector.lock().take();
        if let Some(mut detector) = detector {
            detector.stop();
        }
        self.notify(ViewEvent::Expelled(view));
    }

    fn notify(&self, event: ViewEvent) {
        // nobody listening is fine
        let _ = self.inner.events.send(event);
    }

    async fn run_join(&self) -> Result<(), GmsError> {
        let view = match self.join_through_locators().await? {
            Some(view) => view,
            None => {
                info!("no locator admitted this member, founding a new group");
                MembershipView::initial(self.local_member())?
            }
        };
        self.adopt_view(view);

        let mut state = self.inner.state.write();
        if *state == ManagerState::Joining {
            *state = ManagerState::Running;
        }
        Ok(())
    }

    async fn join_through_locators(&self) -> Result<Option<MembershipView>, GmsError> {
        let own_addr = self.inner.messenger.as_ref().map(|m| m.local_addr());
        let locators: Vec<SocketAddr> = self.inner.config.locators
            .iter()
            .copied()
            .filter(|addr| Some(*addr) != own_addr)
            .collect();
        if locators.is_empty() {
            return Ok(None);
        }

        let (tx, mut responses) = mpsc::unbounded_channel();
        *self.inner.join_responses.lock() = Some(tx);
        let mut accepted = None;
        for locator in locators {
            match self.join_through(locator, &mut responses).await {
                Ok(Some(view)) => {
                    accepted = Some(view);
                    break;
                }
                Ok(None) => {}
                Err(GmsError::MembershipClosed) => return Err(GmsError::MembershipClosed),
                Err(e) => warn!(%locator, "join attempt failed: {}", e),
            }
        }
        *self.inner.join_responses.lock() = None;
        Ok(accepted)
    }

    /// Asks `locator` for admission, following redirects to the coordinator.
    async fn join_through(
        &self,
        locator: SocketAddr,
        responses: &mut mpsc::UnboundedReceiver<JoinResponsePayload>,
    ) -> Result<Option<MembershipView>, GmsError> {
        let messenger = self.messenger()?;
        let mut target = locator;

        for _ in 0..=MAX_JOIN_REDIRECTS {
            debug!(%target, "sending join request");
            let request = Message::new(Payload::JoinRequest(JoinRequestPayload { member: self.local_member() }))?;
            messenger.send_to_addr(target, request).await?;

            let response = match time::timeout(self.inner.config.join_timeout, responses.recv()).await {
                Ok(Some(response)) => response,
                Ok(None) => return Err(GmsError::MembershipClosed),
                Err(_) => {
                    warn!(%target, "join request timed out");
                    return Ok(None);
                }
            };
            match response {
                JoinResponsePayload::Accepted(view) => {
                    info!(view_id = view.view_id(), members = view.size(), "joined the group");
                    return Ok(Some(view));
                }
                JoinResponsePayload::Redirect(coordinator) => {
                    debug!(coordinator = %coordinator, "join redirected to the coordinator");
                    target = coordinator.direct_channel_addr().ok_or_else(|| {
                        GmsError::InvalidIdentifier(format!("coordinator {} has no direct channel", coordinator))
                    })?;
                }
                JoinResponsePayload::Rejected(reason) => {
                    warn!(%target, reason, "join request rejected");
                    return Ok(None);
                }
            }
        }
        warn!(%locator, "too many join redirects");
        Ok(None)
    }
}
