use std::net::IpAddr;
use uuid::Uuid;

use crate::error::GmsError;
use crate::ip_addr::IpAddress;
use crate::member::identifier::{
    vm_kind, MemberIdentifier, DEFAULT_LOCATOR_WEIGHT, DEFAULT_MEMBER_WEIGHT, UNSET_VIEW_ID,
};
use crate::member::Version;

/// Merges the comma separated `roles` and `groups` strings into one group list.
///
/// Entries are trimmed, empty entries dropped and duplicates removed keeping
/// the first occurrence, so the result only depends on the order in which the
/// names appear. Other members compare group lists by value, which makes this
/// policy part of the wire contract.
pub fn merge_groups(roles: &str, groups: &str) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for entry in roles.split(',').chain(groups.split(',')) {
        let entry = entry.trim();
        if entry.is_empty() || merged.iter().any(|g| g == entry) {
            continue;
        }
        merged.push(entry.to_string());
    }
    merged
}

/// [`MemberIdentifierBuilder`] is a plain mutable bag of identity fields consumed by
/// a single [`MemberIdentifierBuilder::build`] call.
///
/// Setters never validate; `build` does.
#[derive(Debug, Clone)]
pub struct MemberIdentifierBuilder {
    host_address: Option<IpAddr>,
    host_name: Option<String>,
    membership_port: u16,
    direct_channel_port: u16,
    process_id: u32,
    vm_kind: Option<u8>,
    vm_view_id: i32,
    version: Version,
    name: Option<String>,
    groups: Vec<String>,
    durable_id: Option<String>,
    durable_timeout: u32,
    preferred_for_coordinator: Option<bool>,
    network_partition_detection: bool,
    weight: Option<u8>,
    uuid: Option<(u64, u64)>,
    partial: bool,
    unique_tag: Option<String>,
    require_vm_kind: bool,
}

impl MemberIdentifierBuilder {
    fn empty() -> Self {
        Self {
            host_address: None,
            host_name: None,
            membership_port: 0,
            direct_channel_port: 0,
            process_id: 0,
            vm_kind: None,
            vm_view_id: UNSET_VIEW_ID,
            version: Version::CURRENT,
            name: None,
            groups: Vec::new(),
            durable_id: None,
            durable_timeout: 0,
            preferred_for_coordinator: None,
            network_partition_detection: false,
            weight: None,
            uuid: None,
            partial: false,
            unique_tag: None,
            require_vm_kind: false,
        }
    }

    /// Identity of a process running on a named remote host.
    pub fn for_known_host(address: IpAddr, host_name: impl Into<String>) -> Self {
        let mut builder = Self::empty();
        builder.host_address = Some(address);
        builder.host_name = Some(host_name.into());
        builder
    }

    /// Identity of the local, newly joining process. The host address is
    /// resolved from the system's interfaces, the process id and a fresh
    /// unique instance tag are filled in.
    pub fn for_local_host(host_name: impl Into<String>) -> Result<Self, GmsError> {
        let address = IpAddress::find_local_ip()
            .map_err(|e| GmsError::InvalidIdentifier(format!("unable to resolve local host address: {}", e)))?;
        Ok(Self::for_local_address(address, host_name))
    }

    /// Like [`MemberIdentifierBuilder::for_local_host`], for a process that
    /// advertises `address` instead of the resolved one.
    pub fn for_local_address(address: IpAddr, host_name: impl Into<String>) -> Self {
        let (msb, lsb) = Uuid::new_v4().as_u64_pair();
        let mut builder = Self::for_known_host(address, host_name);
        builder.process_id = std::process::id();
        builder.uuid = Some((msb, lsb));
        builder
    }

    /// Empty builder whose fields are all populated from wire bytes.
    pub fn for_deserialization() -> Self {
        Self::empty()
    }

    pub(crate) fn from_identifier(id: &MemberIdentifier) -> Self {
        Self {
            host_address: Some(id.host_address),
            host_name: Some(id.host_name.clone()),
            membership_port: id.membership_port,
            direct_channel_port: id.direct_channel_port,
            process_id: id.process_id,
            vm_kind: Some(id.vm_kind),
            vm_view_id: id.vm_view_id,
            version: id.version,
            name: Some(id.name.clone()),
            groups: id.groups.clone(),
            durable_id: id.durable_id.clone(),
            durable_timeout: id.durable_timeout,
            preferred_for_coordinator: Some(id.preferred_for_coordinator),
            network_partition_detection: id.network_partition_detection,
            weight: Some(id.weight),
            uuid: Some((id.uuid_msb, id.uuid_lsb)),
            partial: id.partial,
            unique_tag: id.unique_tag.clone(),
            require_vm_kind: false,
        }
    }

    pub fn host_address(mut self, address: IpAddr) -> Self {
        self.host_address = Some(address);
        self
    }

    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    pub fn membership_port(mut self, port: u16) -> Self {
        self.membership_port = port;
        self
    }

    pub fn direct_channel_port(mut self, port: u16) -> Self {
        self.direct_channel_port = port;
        self
    }

    pub fn process_id(mut self, pid: u32) -> Self {
        self.process_id = pid;
        self
    }

    pub fn vm_kind(mut self, kind: u8) -> Self {
        self.vm_kind = Some(kind);
        self
    }

    pub fn vm_view_id(mut self, view_id: i32) -> Self {
        self.vm_view_id = view_id;
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the group list from the two comma separated inputs, see [`merge_groups`].
    pub fn roles_and_groups(mut self, roles: &str, groups: &str) -> Self {
        self.groups = merge_groups(roles, groups);
        self
    }

    pub fn groups(mut self, groups: Vec<String>) -> Self {
        self.groups = groups;
        self
    }

    pub fn durable_client(mut self, id: Option<String>, timeout_secs: u32) -> Self {
        self.durable_id = id;
        self.durable_timeout = timeout_secs;
        self
    }

    pub fn preferred_for_coordinator(mut self, preferred: bool) -> Self {
        self.preferred_for_coordinator = Some(preferred);
        self
    }

    pub fn network_partition_detection(mut self, enabled: bool) -> Self {
        self.network_partition_detection = enabled;
        self
    }

    pub fn weight(mut self, weight: u8) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn unique_instance_tag(mut self, most_significant: u64, least_significant: u64) -> Self {
        self.uuid = Some((most_significant, least_significant));
        self
    }

    pub fn partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    pub fn unique_tag(mut self, tag: impl Into<String>) -> Self {
        self.unique_tag = Some(tag.into());
        self
    }

    /// When set, [`MemberIdentifierBuilder::build`] refuses identifiers without a VM kind.
    pub fn require_vm_kind(mut self, required: bool) -> Self {
        self.require_vm_kind = required;
        self
    }

    pub fn build(self) -> Result<MemberIdentifier, GmsError> {
        let host_address = self.host_address
            .ok_or_else(|| GmsError::InvalidIdentifier("host address is not set".to_string()))?;
        if self.require_vm_kind && self.vm_kind.is_none() {
            return Err(GmsError::InvalidIdentifier("vm kind is not set".to_string()));
        }
        let kind = self.vm_kind.unwrap_or(vm_kind::NORMAL);
        if !(vm_kind::NORMAL..=vm_kind::LONER).contains(&kind) {
            return Err(GmsError::InvalidIdentifier(format!("unknown vm kind {}", kind)));
        }

        let weight = self.weight.unwrap_or(if kind == vm_kind::LOCATOR {
            DEFAULT_LOCATOR_WEIGHT
        } else {
            DEFAULT_MEMBER_WEIGHT
        });
        let preferred = vm_kind::may_coordinate(kind)
            && self.preferred_for_coordinator.unwrap_or(kind == vm_kind::LOCATOR);
        let (uuid_msb, uuid_lsb) = self.uuid.unwrap_or((0, 0));
        let host_name = self.host_name.unwrap_or_else(|| host_address.to_string());

        Ok(MemberIdentifier {
            host_address,
            name: self.name.unwrap_or_else(|| host_name.clone()),
            host_name,
            membership_port: self.membership_port,
            direct_channel_port: self.direct_channel_port,
            process_id: self.process_id,
            vm_kind: kind,
            vm_view_id: self.vm_view_id,
            version: self.version,
            groups: self.groups,
            durable_id: self.durable_id,
            durable_timeout: self.durable_timeout,
            preferred_for_coordinator: preferred,
            network_partition_detection: self.network_partition_detection,
            weight,
            uuid_msb,
            uuid_lsb,
            partial: self.partial,
            unique_tag: self.unique_tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_merge_groups_preserves_first_seen_order() {
        assert_eq!(merge_groups("a,b", "b,c"), vec!["a", "b", "c"]);
        assert_eq!(merge_groups("", "a,b,b,c"), vec!["a", "b", "c"]);
        assert_eq!(merge_groups("a,b,b,c", ""), vec!["a", "b", "c"]);
        assert_eq!(merge_groups(" a , ,b", "a"), vec!["a", "b"]);
        assert!(merge_groups("", "").is_empty());
    }

    #[test]
    fn test_merge_groups_is_idempotent() {
        let once = merge_groups("x, y", "y,z,x");
        let twice = merge_groups(&once.join(","), "");
        assert_eq!(once, twice);
        assert_eq!(merge_groups(&once.join(","), &once.join(",")), once);
    }

    #[test]
    fn test_build_requires_vm_kind_when_configured() {
        let builder = MemberIdentifierBuilder::for_known_host(IpAddr::V4(Ipv4Addr::LOCALHOST), "localhost")
            .require_vm_kind(true);
        assert!(matches!(builder.clone().build(), Err(GmsError::InvalidIdentifier(_))));
        assert!(builder.vm_kind(vm_kind::NORMAL).build().is_ok());
    }

    #[test]
    fn test_deserialization_without_address_is_invalid() {
        let result = MemberIdentifierBuilder::for_deserialization().membership_port(1).build();
        assert!(matches!(result, Err(GmsError::InvalidIdentifier(_))));
    }

    #[test]
    fn test_kind_driven_defaults() {
        let host = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let locator = MemberIdentifierBuilder::for_known_host(host, "h").vm_kind(vm_kind::LOCATOR).build().unwrap();
        assert_eq!(locator.weight(), DEFAULT_LOCATOR_WEIGHT);
        assert!(locator.is_preferred_for_coordinator());

        let admin = MemberIdentifierBuilder::for_known_host(host, "h")
            .vm_kind(vm_kind::ADMIN_ONLY)
            .preferred_for_coordinator(true)
            .build()
            .unwrap();
        assert!(!admin.is_preferred_for_coordinator());
        assert_eq!(admin.weight(), DEFAULT_MEMBER_WEIGHT);
        assert_eq!(admin.name(), "h");
    }

    #[test]
    fn test_roles_and_groups_setter() {
        let id = MemberIdentifierBuilder::for_known_host(IpAddr::V4(Ipv4Addr::LOCALHOST), "localhost")
            .roles_and_groups("red, blue", "blue,green")
            .build()
            .unwrap();
        assert_eq!(id.groups(), &["red", "blue", "green"]);
    }
}
