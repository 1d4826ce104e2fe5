//! Group Membership Service for GMS
//!
//! This crate keeps a set of cooperating processes agreed on who is alive.
//! Members exchange heartbeats over datagrams, escalate silence through a
//! corroborated suspicion and a final check over a connection-oriented direct
//! channel, and agree on numbered views installed by a single coordinator.
//! The implementation is modularized for clarity:
//!
//! * MembershipManager: entry point. Joins the group through locators (or
//!   founds one), answers heartbeats and final checks, coordinates view
//!   changes when it is the coordinator, and publishes view events.
//!
//! * FailureDetector: per-member health state machine
//!   (ALIVE -> SUSPECTED -> FINAL_CHECK -> REMOVED). It performs no I/O; its
//!   timeouts run on the task scheduler and every transition is serialized
//!   through one runtime actor.
//!
//! * Transport: the datagram layer (UDP, an encrypting session wrapper and an
//!   in-process fabric for tests) and the TCP messenger for direct messages.
//!
//! * Identity & views: member identifiers with a total order used for
//!   coordinator election, and immutable views whose ids grow by exactly one.
//!
//! Network partitions are detected by weighing the members lost at once
//! against the view; when too much is lost, the side that noticed refrains
//! from removing anyone.

pub use config::{MembershipConfig, MembershipConfigBuilder, SecurityConfig};
pub use dispatch::{FnHandler, MessageDispatcher, MessageHandler};
pub use error::{GmsError, Result, TransportError};
pub use fd::{CountLossPolicy, HealthState, LossAssessment, LossPolicy, WeightedLossPolicy, LEAD_MEMBER_BONUS};
pub use ip_addr::IpAddress;
pub use manager::MembershipManager;
pub use member::{merge_groups, vm_kind, MemberIdentifier, MemberIdentifierBuilder, Version};
pub use message::{Message, MessageKind, Payload};
pub use messenger::{Messenger, MessengerConfig};
pub use scheduler::{Clock, ManualClock, MonotonicClock, TaskHandle, TaskScheduler};
pub use statistics::{MembershipStatistics, StatisticsSnapshot};
pub use transport::{Datagram, DatagramTransport, Destination, SecureTransport, UdpTransport, UdpTransportConfig};
pub use view::{MembershipView, ViewEvent};

pub mod config;
pub mod message;
pub mod transport;
mod backoff;
mod codec;
mod dispatch;
mod error;
mod fd;
mod ip_addr;
mod manager;
mod member;
mod messenger;
mod runtime;
mod scheduler;
mod statistics;
mod view;
