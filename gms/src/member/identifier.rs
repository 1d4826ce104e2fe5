use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GmsError;
use crate::member::builder::MemberIdentifierBuilder;
use crate::member::Version;

/// Process kinds carried in [`MemberIdentifier::vm_kind`].
pub mod vm_kind {
    pub const NORMAL: u8 = 10;
    pub const LOCATOR: u8 = 11;
    pub const ADMIN_ONLY: u8 = 12;
    pub const LONER: u8 = 13;

    /// Admin-only and loner processes never coordinate a view.
    pub fn may_coordinate(kind: u8) -> bool {
        !matches!(kind, ADMIN_ONLY | LONER)
    }
}

pub(crate) const DEFAULT_MEMBER_WEIGHT: u8 = 10;
pub(crate) const DEFAULT_LOCATOR_WEIGHT: u8 = 3;
pub(crate) const UNSET_VIEW_ID: i32 = -1;

/// [`MemberIdentifier`] is the immutable identity of one cluster process.
///
/// Two identifiers are equal when they name the same process incarnation: same
/// address, ports and unique instance tag. Everything else (name, groups, view
/// join order, weight) is descriptive and does not take part in equality, so a
/// partial identifier learnt from the wire compares equal to the fully resolved
/// one that later replaces it.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "IdentifierWire", into = "IdentifierWire")]
pub struct MemberIdentifier {
    pub(crate) host_address: IpAddr,
    pub(crate) host_name: String,
    pub(crate) membership_port: u16,
    pub(crate) direct_channel_port: u16,
    pub(crate) process_id: u32,
    pub(crate) vm_kind: u8,
    pub(crate) vm_view_id: i32,
    pub(crate) version: Version,
    pub(crate) name: String,
    pub(crate) groups: Vec<String>,
    pub(crate) durable_id: Option<String>,
    pub(crate) durable_timeout: u32,
    pub(crate) preferred_for_coordinator: bool,
    pub(crate) network_partition_detection: bool,
    pub(crate) weight: u8,
    pub(crate) uuid_msb: u64,
    pub(crate) uuid_lsb: u64,
    pub(crate) partial: bool,
    pub(crate) unique_tag: Option<String>,
}

impl MemberIdentifier {
    pub fn host_address(&self) -> IpAddr {
        self.host_address
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn membership_port(&self) -> u16 {
        self.membership_port
    }

    pub fn direct_channel_port(&self) -> u16 {
        self.direct_channel_port
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn vm_kind(&self) -> u8 {
        self.vm_kind
    }

    /// Id of the view in which this member was admitted, `-1` before admission.
    pub fn vm_view_id(&self) -> i32 {
        self.vm_view_id
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn durable_id(&self) -> Option<&str> {
        self.durable_id.as_deref()
    }

    pub fn durable_timeout(&self) -> u32 {
        self.durable_timeout
    }

    pub fn is_preferred_for_coordinator(&self) -> bool {
        self.preferred_for_coordinator
    }

    pub fn is_network_partition_detection_enabled(&self) -> bool {
        self.network_partition_detection
    }

    pub fn weight(&self) -> u8 {
        self.weight
    }

    pub fn uuid_most_significant_bits(&self) -> u64 {
        self.uuid_msb
    }

    pub fn uuid_least_significant_bits(&self) -> u64 {
        self.uuid_lsb
    }

    pub fn instance_tag(&self) -> Uuid {
        Uuid::from_u64_pair(self.uuid_msb, self.uuid_lsb)
    }

    pub fn is_partial(&self) -> bool {
        self.partial
    }

    pub fn unique_tag(&self) -> Option<&str> {
        self.unique_tag.as_deref()
    }

    /// Address of the datagram (heartbeat) endpoint.
    pub fn membership_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host_address, self.membership_port)
    }

    /// Address of the connection-oriented endpoint, if the member runs one.
    pub fn direct_channel_addr(&self) -> Option<SocketAddr> {
        if self.direct_channel_port == 0 {
            None
        } else {
            Some(SocketAddr::new(self.host_address, self.direct_channel_port))
        }
    }

    pub fn may_coordinate(&self) -> bool {
        vm_kind::may_coordinate(self.vm_kind)
    }

    /// A builder pre-populated with every field of this identifier, used to
    /// produce a replacement value (identifiers are never patched in place).
    pub fn to_builder(&self) -> MemberIdentifierBuilder {
        MemberIdentifierBuilder::from_identifier(self)
    }

    /// Replacement identifier carrying the id of the view that admitted it.
    pub fn with_vm_view_id(&self, view_id: i32) -> Result<MemberIdentifier, GmsError> {
        self.to_builder().vm_view_id(view_id).partial(false).build()
    }

    /// Wire form of this identifier for a peer speaking `version`. Fields that
    /// the older schema does not know are left out.
    ///
    /// The V1 form is lossy: it carries neither the instance tag nor the unique
    /// tag string, both part of the identity key. A V1 peer therefore decodes
    /// an identifier that is not equal to the original; it is a distinct
    /// identity at the same endpoints.
    pub(crate) fn to_wire(&self, version: Version) -> IdentifierWire {
        let mut wire = IdentifierWire::from(self.clone());
        if version < Version::V2 {
            wire.uuid = None;
            wire.unique_tag = None;
        }
        wire
    }

    /// This identifier as a peer speaking `version` will decode it. Lossy for
    /// V1, see [`MemberIdentifier::to_wire`].
    pub(crate) fn for_version(&self, version: Version) -> Result<MemberIdentifier, GmsError> {
        if version >= Version::V2 {
            return Ok(self.clone());
        }
        MemberIdentifier::try_from(self.to_wire(version))
    }

    fn identity_key(&self) -> (IpAddr, u16, u16, u64, u64, Option<&str>) {
        (
            self.host_address,
            self.membership_port,
            self.direct_channel_port,
            self.uuid_msb,
            self.uuid_lsb,
            self.unique_tag.as_deref(),
        )
    }
}

impl PartialEq for MemberIdentifier {
    fn eq(&self, other: &Self) -> bool {
        self.identity_key() == other.identity_key()
    }
}

impl Eq for MemberIdentifier {}

impl Hash for MemberIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity_key().hash(state);
    }
}

impl PartialOrd for MemberIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemberIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.identity_key().cmp(&other.identity_key())
    }
}

impl fmt::Display for MemberIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}:{}:{})", self.host_address, self.name, self.process_id, self.vm_kind)?;
        if self.vm_view_id >= 0 {
            write!(f, "<v{}>", self.vm_view_id)?;
        }
        write!(f, ":{}", self.membership_port)
    }
}

impl fmt::Debug for MemberIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)?;
        if self.partial {
            write!(f, "(partial)")?;
        }
        Ok(())
    }
}

/// Serialized shape of a [`MemberIdentifier`]. Deserialization funnels through
/// [`MemberIdentifierBuilder::for_deserialization`] so every identifier read
/// from the network is validated the same way as a locally built one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct IdentifierWire {
    host_address: IpAddr,
    host_name: String,
    membership_port: u16,
    direct_channel_port: u16,
    process_id: u32,
    vm_kind: u8,
    vm_view_id: i32,
    version: u16,
    name: String,
    groups: Vec<String>,
    durable_id: Option<String>,
    durable_timeout: u32,
    preferred_for_coordinator: bool,
    network_partition_detection: bool,
    weight: u8,
    uuid: Option<(u64, u64)>,
    partial: bool,
    unique_tag: Option<String>,
}

impl From<MemberIdentifier> for IdentifierWire {
    fn from(id: MemberIdentifier) -> Self {
        IdentifierWire {
            host_address: id.host_address,
            host_name: id.host_name,
            membership_port: id.membership_port,
            direct_channel_port: id.direct_channel_port,
            process_id: id.process_id,
            vm_kind: id.vm_kind,
            vm_view_id: id.vm_view_id,
            version: id.version.ordinal(),
            name: id.name,
            groups: id.groups,
            durable_id: id.durable_id,
            durable_timeout: id.durable_timeout,
            preferred_for_coordinator: id.preferred_for_coordinator,
            network_partition_detection: id.network_partition_detection,
            weight: id.weight,
            uuid: (id.uuid_msb != 0 || id.uuid_lsb != 0).then_some((id.uuid_msb, id.uuid_lsb)),
            partial: id.partial,
            unique_tag: id.unique_tag,
        }
    }
}

impl TryFrom<IdentifierWire> for MemberIdentifier {
    type Error = GmsError;

    fn try_from(wire: IdentifierWire) -> Result<Self, Self::Error> {
        let version = Version::from_ordinal(wire.version)?;
        let mut builder = MemberIdentifierBuilder::for_deserialization()
            .host_address(wire.host_address)
            .host_name(wire.host_name)
            .membership_port(wire.membership_port)
            .direct_channel_port(wire.direct_channel_port)
            .process_id(wire.process_id)
            .vm_kind(wire.vm_kind)
            .vm_view_id(wire.vm_view_id)
            .version(version)
            .name(wire.name)
            .groups(wire.groups)
            .durable_client(wire.durable_id, wire.durable_timeout)
            .preferred_for_coordinator(wire.preferred_for_coordinator)
            .network_partition_detection(wire.network_partition_detection)
            .weight(wire.weight)
            .partial(wire.partial);
        if let Some((msb, lsb)) = wire.uuid {
            builder = builder.unique_instance_tag(msb, lsb);
        }
        if let Some(tag) = wire.unique_tag {
            builder = builder.unique_tag(tag);
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn member(port: u16) -> MemberIdentifier {
        MemberIdentifierBuilder::for_known_host(IpAddr::V4(Ipv4Addr::LOCALHOST), "localhost")
            .name(format!("m{}", port))
            .membership_port(port)
            .direct_channel_port(port + 1)
            .vm_kind(vm_kind::NORMAL)
            .unique_instance_tag(1, port as u64)
            .build()
            .unwrap()
    }

    #[test]
    fn test_equality_ignores_descriptive_fields() {
        let a = member(4000);
        let renamed = a.to_builder().name("other").weight(42).build().unwrap();
        assert_eq!(a, renamed);

        let joined = a.with_vm_view_id(7).unwrap();
        assert_eq!(joined.vm_view_id(), 7);
        assert_eq!(a, joined);
        assert_ne!(a, member(4002));
    }

    #[test]
    fn test_bincode_round_trip_goes_through_builder() {
        let a = member(4000);
        let bytes = bincode::serialize(&a).unwrap();
        let decoded: MemberIdentifier = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, a);
        assert_eq!(decoded.name(), "m4000");
        assert_eq!(decoded.weight(), DEFAULT_MEMBER_WEIGHT);
    }

    #[test]
    fn test_v1_wire_drops_instance_tag() {
        let a = member(4000).to_builder().unique_tag("tag").build().unwrap();
        let wire = a.to_wire(Version::V1);
        assert!(wire.uuid.is_none());
        assert!(wire.unique_tag.is_none());

        let decoded = MemberIdentifier::try_from(wire).unwrap();
        assert_eq!(decoded.uuid_most_significant_bits(), 0);
        assert_eq!(decoded.unique_tag(), None);

        // lossy: same endpoints, different identity
        assert_ne!(decoded, a);
        assert_eq!(decoded.direct_channel_addr(), a.direct_channel_addr());
        assert_eq!(a.for_version(Version::V1).unwrap(), decoded);
        assert_eq!(a.for_version(Version::V2).unwrap(), a);
    }

    #[test]
    fn test_display_contains_view_id_once_admitted() {
        let a = member(4000);
        assert_eq!(a.to_string(), "127.0.0.1(m4000:0:10):4000");
        let joined = a.with_vm_view_id(3).unwrap();
        assert_eq!(joined.to_string(), "127.0.0.1(m4000:0:10)<v3>:4000");
    }
}
