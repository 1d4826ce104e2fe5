use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use gethostname::gethostname;
use std::time::Duration;

use crate::error::GmsError;
use crate::ip_addr::IpAddress;
use crate::member::vm_kind;

// Default configuration constants
pub(crate) const DEFAULT_BIND_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub(crate) const DEFAULT_HEARTBEAT_INTERVAL: u64 = 1_000; // 1 second
pub(crate) const DEFAULT_MEMBER_TIMEOUT: u64 = 2_000; // heartbeat response wait
pub(crate) const DEFAULT_FINAL_CHECK_TIMEOUT: u64 = 3_000;
pub(crate) const DEFAULT_JOIN_TIMEOUT: u64 = 5_000;
pub(crate) const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 5_000;
pub(crate) const DEFAULT_HANDSHAKE_TIMEOUT: u64 = 5_000;
pub(crate) const DEFAULT_SESSION_IDLE_TIMEOUT: u64 = 300_000;
pub(crate) const DEFAULT_SCHEDULER_TICK: u64 = 10;
pub(crate) const DEFAULT_SUSPECT_THRESHOLD: u32 = 2;
pub(crate) const DEFAULT_LOSS_THRESHOLD_PERCENT: u8 = 51;
pub(crate) const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 1_000;
pub(crate) const MAX_RETRY_DELAY: u64 = 60; // in secs
pub(crate) const MAX_UDP_PACKET_SIZE: usize = 1400;
pub(crate) const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// [`SecurityConfig`] enables the encrypted datagram transport.
#[derive(Clone)]
pub struct SecurityConfig {
    /// Secret shared by every member; session keys are derived from it.
    pub(crate) pre_shared_secret: Vec<u8>,

    /// How long a sender waits for a session handshake before failing the send.
    pub(crate) handshake_timeout: Duration,

    /// Sessions without traffic for this long are dropped and renegotiated on
    /// the next send.
    pub(crate) session_idle_timeout: Duration,
}

impl SecurityConfig {
    pub fn new(pre_shared_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            pre_shared_secret: pre_shared_secret.into(),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT),
            session_idle_timeout: Duration::from_millis(DEFAULT_SESSION_IDLE_TIMEOUT),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.session_idle_timeout = timeout;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn session_idle_timeout(&self) -> Duration {
        self.session_idle_timeout
    }
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("pre_shared_secret", &"<redacted>")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("session_idle_timeout", &self.session_idle_timeout)
            .finish()
    }
}

/// [`MembershipConfig`] configuration of one member of the group membership service.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Display name of the member, defaults to the host name
    pub(crate) name: String,

    /// Address both the datagram socket and the direct channel listener bind to
    pub(crate) bind_addr: IpAddr,

    /// UDP port for heartbeats and suspicion traffic, `0` picks an ephemeral port
    pub(crate) membership_port: u16,

    /// TCP port of the direct channel (messenger), `0` picks an ephemeral port
    pub(crate) direct_channel_port: u16,

    pub(crate) roles: String,
    pub(crate) groups: String,
    pub(crate) vm_kind: Option<u8>,
    pub(crate) require_vm_kind: bool,
    pub(crate) weight: Option<u8>,
    pub(crate) preferred_for_coordinator: Option<bool>,
    pub(crate) durable_client_id: Option<String>,
    pub(crate) durable_client_timeout: u32,

    /// Period between heartbeat requests to every other member
    pub(crate) heartbeat_interval: Duration,

    /// How long a heartbeat request waits for its response
    pub(crate) member_timeout: Duration,

    /// How long the connection-oriented final check waits for its response
    pub(crate) final_check_timeout: Duration,

    /// Number of corroborated suspicions before a final check is issued
    pub(crate) suspect_threshold: u32,

    pub(crate) join_timeout: Duration,

    /// Bound on the orderly shutdown drain
    pub(crate) shutdown_timeout: Duration,

    /// Period of the task scheduler's driving loop
    pub(crate) scheduler_tick: Duration,

    pub(crate) enable_network_partition_detection: bool,

    /// Share of the view's weight whose loss is treated as a partition
    pub(crate) loss_threshold_percent: u8,

    /// Direct channel addresses of existing members used to join
    pub(crate) locators: Vec<SocketAddr>,

    pub(crate) enable_multicast: bool,
    pub(crate) multicast_addr: Option<SocketAddr>,

    // When TCP is disabled, no direct channel is opened: joins, final checks and
    // application messages are unavailable and the member runs standalone.
    pub(crate) disable_tcp: bool,

    pub(crate) max_datagram_size: usize,
    pub(crate) encryption: Option<SecurityConfig>,
}

impl MembershipConfig {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bind_addr(&self) -> IpAddr {
        self.bind_addr
    }

    pub fn membership_port(&self) -> u16 {
        self.membership_port
    }

    pub fn direct_channel_port(&self) -> u16 {
        self.direct_channel_port
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn member_timeout(&self) -> Duration {
        self.member_timeout
    }

    pub fn final_check_timeout(&self) -> Duration {
        self.final_check_timeout
    }

    pub fn suspect_threshold(&self) -> u32 {
        self.suspect_threshold
    }

    pub fn join_timeout(&self) -> Duration {
        self.join_timeout
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn loss_threshold_percent(&self) -> u8 {
        self.loss_threshold_percent
    }

    pub fn locators(&self) -> &[SocketAddr] {
        &self.locators
    }

    pub fn is_tcp_disabled(&self) -> bool {
        self.disable_tcp
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }
}

pub struct MembershipConfigBuilder {
    pub(crate) name: Option<String>,
    pub(crate) bind_addr: IpAddr,
    pub(crate) membership_port: u16,
    pub(crate) direct_channel_port: u16,
    pub(crate) roles: String,
    pub(crate) groups: String,
    pub(crate) vm_kind: Option<u8>,
    pub(crate) require_vm_kind: bool,
    pub(crate) weight: Option<u8>,
    pub(crate) preferred_for_coordinator: Option<bool>,
    pub(crate) durable_client_id: Option<String>,
    pub(crate) durable_client_timeout: u32,
    pub(crate) heartbeat_interval: Duration,
    pub(crate) member_timeout: Duration,
    pub(crate) final_check_timeout: Duration,
    pub(crate) suspect_threshold: u32,
    pub(crate) join_timeout: Duration,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) scheduler_tick: Duration,
    pub(crate) enable_network_partition_detection: bool,
    pub(crate) loss_threshold_percent: u8,
    pub(crate) locators: Vec<SocketAddr>,
    pub(crate) enable_multicast: bool,
    pub(crate) multicast_addr: Option<SocketAddr>,
    pub(crate) disable_tcp: bool,
    pub(crate) max_datagram_size: usize,
    pub(crate) encryption: Option<SecurityConfig>,
}

impl Default for MembershipConfigBuilder {
    fn default() -> MembershipConfigBuilder {
        Self {
            name: None,
            bind_addr: DEFAULT_BIND_ADDR,
            membership_port: 0,
            direct_channel_port: 0,
            roles: String::new(),
            groups: String::new(),
            vm_kind: None,
            require_vm_kind: false,
            weight: None,
            preferred_for_coordinator: None,
            durable_client_id: None,
            durable_client_timeout: 0,
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL),
            member_timeout: Duration::from_millis(DEFAULT_MEMBER_TIMEOUT),
            final_check_timeout: Duration::from_millis(DEFAULT_FINAL_CHECK_TIMEOUT),
            suspect_threshold: DEFAULT_SUSPECT_THRESHOLD,
            join_timeout: Duration::from_millis(DEFAULT_JOIN_TIMEOUT),
            shutdown_timeout: Duration::from_millis(DEFAULT_SHUTDOWN_TIMEOUT),
            scheduler_tick: Duration::from_millis(DEFAULT_SCHEDULER_TICK),
            enable_network_partition_detection: true,
            loss_threshold_percent: DEFAULT_LOSS_THRESHOLD_PERCENT,
            locators: Vec::new(),
            enable_multicast: false,
            multicast_addr: None,
            disable_tcp: false,
            max_datagram_size: MAX_UDP_PACKET_SIZE,
            encryption: None,
        }
    }
}

impl MembershipConfigBuilder {
    /// Creates a new [`MembershipConfigBuilder`] with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the display name of the member
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the IP address both endpoints bind to
    pub fn with_bind_addr(mut self, addr: impl Into<IpAddress>) -> Self {
        self.bind_addr = addr.into().0;
        self
    }

    pub fn with_membership_port(mut self, port: u16) -> Self {
        self.membership_port = port;
        self
    }

    pub fn with_direct_channel_port(mut self, port: u16) -> Self {
        self.direct_channel_port = port;
        self
    }

    /// Sets the comma separated roles and groups; they are merged into the
    /// member's group list.
    pub fn with_roles_and_groups(mut self, roles: impl Into<String>, groups: impl Into<String>) -> Self {
        self.roles = roles.into();
        self.groups = groups.into();
        self
    }

    pub fn with_vm_kind(mut self, kind: u8) -> Self {
        self.vm_kind = Some(kind);
        self
    }

    pub fn with_required_vm_kind(mut self, required: bool) -> Self {
        self.require_vm_kind = required;
        self
    }

    /// Weight of this member in partition arbitration
    pub fn with_weight(mut self, weight: u8) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_preferred_for_coordinator(mut self, preferred: bool) -> Self {
        self.preferred_for_coordinator = Some(preferred);
        self
    }

    pub fn with_durable_client(mut self, id: impl Into<String>, timeout_secs: u32) -> Self {
        self.durable_client_id = Some(id.into());
        self.durable_client_timeout = timeout_secs;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_member_timeout(mut self, timeout: Duration) -> Self {
        self.member_timeout = timeout;
        self
    }

    pub fn with_final_check_timeout(mut self, timeout: Duration) -> Self {
        self.final_check_timeout = timeout;
        self
    }

    /// Sets how many corroborated suspicions trigger the final check
    pub fn with_suspect_threshold(mut self, threshold: u32) -> Self {
        self.suspect_threshold = threshold;
        self
    }

    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_scheduler_tick(mut self, tick: Duration) -> Self {
        self.scheduler_tick = tick;
        self
    }

    pub fn with_network_partition_detection(mut self, enabled: bool) -> Self {
        self.enable_network_partition_detection = enabled;
        self
    }

    pub fn with_loss_threshold_percent(mut self, percent: u8) -> Self {
        self.loss_threshold_percent = percent;
        self
    }

    pub fn with_locators(mut self, locators: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.locators = locators.into_iter().collect();
        self
    }

    pub fn with_multicast(mut self, group: SocketAddr) -> Self {
        self.enable_multicast = true;
        self.multicast_addr = Some(group);
        self
    }

    pub fn with_multicast_enabled(mut self, enabled: bool) -> Self {
        self.enable_multicast = enabled;
        self
    }

    pub fn with_tcp_disabled(mut self, disable: bool) -> Self {
        self.disable_tcp = disable;
        self
    }

    pub fn with_max_datagram_size(mut self, size: usize) -> Self {
        self.max_datagram_size = size;
        self
    }

    pub fn with_encryption(mut self, security: SecurityConfig) -> Self {
        self.encryption = Some(security);
        self
    }

    /// Validates the current configuration
    pub(crate) fn validate(&self) -> Result<(), GmsError> {
        let fail = |reason: &str| Err(GmsError::Config(reason.to_string()));

        for (name, value) in [
            ("heartbeat interval", self.heartbeat_interval),
            ("member timeout", self.member_timeout),
            ("final check timeout", self.final_check_timeout),
            ("join timeout", self.join_timeout),
            ("shutdown timeout", self.shutdown_timeout),
            ("scheduler tick", self.scheduler_tick),
        ] {
            if value.is_zero() {
                return Err(GmsError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.suspect_threshold == 0 {
            return fail("suspect threshold must be greater than zero");
        }
        if !(1..=100).contains(&self.loss_threshold_percent) {
            return fail("loss threshold must be between 1 and 100 percent");
        }
        if self.enable_multicast && self.multicast_addr.is_none() {
            return fail("multicast is enabled but no multicast address is set");
        }
        if let Some(group) = self.multicast_addr {
            if self.enable_multicast && !group.ip().is_multicast() {
                return Err(GmsError::Config(format!("{} is not a multicast address", group)));
            }
        }
        if self.disable_tcp && !self.locators.is_empty() {
            return fail("locators require the direct channel, but TCP is disabled");
        }
        if self.max_datagram_size == 0 || self.max_datagram_size > u16::MAX as usize {
            return fail("max datagram size must be between 1 and 65535 bytes");
        }
        if let Some(kind) = self.vm_kind {
            if !(vm_kind::NORMAL..=vm_kind::LONER).contains(&kind) {
                return Err(GmsError::Config(format!("unknown vm kind {}", kind)));
            }
        }
        if let Some(security) = &self.encryption {
            if security.pre_shared_secret.is_empty() {
                return fail("encryption is enabled with an empty pre-shared secret");
            }
            if security.handshake_timeout.is_zero() {
                return fail("handshake timeout must be greater than zero");
            }
            if security.session_idle_timeout.is_zero() {
                return fail("session idle timeout must be greater than zero");
            }
        }
        Ok(())
    }

    /// Builds the final [`MembershipConfig`].
    ///
    /// If the name is not set, the host name of the machine is used.
    pub fn build(mut self) -> Result<MembershipConfig, GmsError> {
        self.fill();
        self.validate()?;

        Ok(MembershipConfig {
            name: self.name.unwrap_or_default(),
            bind_addr: self.bind_addr,
            membership_port: self.membership_port,
            direct_channel_port: self.direct_channel_port,
            roles: self.roles,
            groups: self.groups,
            vm_kind: self.vm_kind,
            require_vm_kind: self.require_vm_kind,
            weight: self.weight,
            preferred_for_coordinator: self.preferred_for_coordinator,
            durable_client_id: self.durable_client_id,
            durable_client_timeout: self.durable_client_timeout,
            heartbeat_interval: self.heartbeat_interval,
            member_timeout: self.member_timeout,
            final_check_timeout: self.final_check_timeout,
            suspect_threshold: self.suspect_threshold,
            join_timeout: self.join_timeout,
            shutdown_timeout: self.shutdown_timeout,
            scheduler_tick: self.scheduler_tick,
            enable_network_partition_detection: self.enable_network_partition_detection,
            loss_threshold_percent: self.loss_threshold_percent,
            locators: self.locators,
            enable_multicast: self.enable_multicast,
            multicast_addr: self.multicast_addr,
            disable_tcp: self.disable_tcp,
            max_datagram_size: self.max_datagram_size,
            encryption: self.encryption,
        })
    }

    /// Fills in any missing fields with default values
    fn fill(&mut self) {
        if self.name.is_none() {
            self.name = Some(gethostname().to_string_lossy().into_owned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_build() {
        let config = MembershipConfigBuilder::new().with_name("m1").build().unwrap();
        assert_eq!(config.name(), "m1");
        assert_eq!(config.suspect_threshold(), DEFAULT_SUSPECT_THRESHOLD);
        assert_eq!(config.loss_threshold_percent(), 51);
        assert_eq!(config.max_datagram_size, MAX_UDP_PACKET_SIZE);
        assert!(!config.is_encrypted());
    }

    #[test]
    fn test_name_falls_back_to_host_name() {
        let config = MembershipConfigBuilder::new().build().unwrap();
        assert_eq!(config.name(), gethostname().to_string_lossy());
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let rejected = [
            MembershipConfigBuilder::new().with_heartbeat_interval(Duration::ZERO),
            MembershipConfigBuilder::new().with_suspect_threshold(0),
            MembershipConfigBuilder::new().with_loss_threshold_percent(0),
            MembershipConfigBuilder::new().with_loss_threshold_percent(101),
            MembershipConfigBuilder::new().with_multicast_enabled(true),
            MembershipConfigBuilder::new()
                .with_tcp_disabled(true)
                .with_locators(["127.0.0.1:7000".parse().unwrap()]),
            MembershipConfigBuilder::new().with_encryption(SecurityConfig::new(Vec::new())),
            MembershipConfigBuilder::new()
                .with_encryption(SecurityConfig::new("secret").with_session_idle_timeout(Duration::ZERO)),
            MembershipConfigBuilder::new().with_multicast("127.0.0.1:7000".parse().unwrap()),
            MembershipConfigBuilder::new().with_vm_kind(42),
        ];
        for builder in rejected {
            assert!(matches!(builder.build(), Err(GmsError::Config(_))));
        }
    }

    #[test]
    fn test_security_config_debug_redacts_secret() {
        let security = SecurityConfig::new("hunter2");
        assert!(!format!("{:?}", security).contains("hunter2"));
        assert_eq!(security.session_idle_timeout(), Duration::from_millis(DEFAULT_SESSION_IDLE_TIMEOUT));
    }
}
