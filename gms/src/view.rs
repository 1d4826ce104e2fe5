use core::fmt;
use serde::{Deserialize, Serialize};

use crate::error::GmsError;
use crate::member::{MemberIdentifier, Version};

/// [`MembershipView`] the agreed, versioned list of live members.
///
/// Views are immutable; every membership change produces a successor with an
/// id exactly one greater. The view also records which members left the
/// previous view, split into graceful departures and crashes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipView {
    view_id: i32,
    creator: MemberIdentifier,
    members: Vec<MemberIdentifier>,
    shutdown: Vec<MemberIdentifier>,
    crashed: Vec<MemberIdentifier>,
}

impl MembershipView {
    /// First view of a new cluster, containing only its founder.
    pub fn initial(founder: MemberIdentifier) -> Result<Self, GmsError> {
        let founder = founder.with_vm_view_id(1)?;
        Ok(Self {
            view_id: 1,
            creator: founder.clone(),
            members: vec![founder],
            shutdown: Vec::new(),
            crashed: Vec::new(),
        })
    }

    pub fn view_id(&self) -> i32 {
        self.view_id
    }

    pub fn creator(&self) -> &MemberIdentifier {
        &self.creator
    }

    pub fn members(&self) -> &[MemberIdentifier] {
        &self.members
    }

    /// Members that left the previous view gracefully.
    pub fn shutdown_members(&self) -> &[MemberIdentifier] {
        &self.shutdown
    }

    /// Members that were removed from the previous view after failing.
    pub fn crashed_members(&self) -> &[MemberIdentifier] {
        &self.crashed
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, member: &MemberIdentifier) -> bool {
        self.members.contains(member)
    }

    /// The view's own (fully resolved) copy of `member`.
    pub fn get(&self, member: &MemberIdentifier) -> Option<&MemberIdentifier> {
        self.members.iter().find(|m| *m == member)
    }

    /// Total weight of every member of the view.
    pub fn total_weight(&self) -> u32 {
        self.members.iter().map(|m| m.weight() as u32).sum()
    }

    /// The coordinator of this view, see [`MembershipView::coordinator_excluding`].
    pub fn coordinator(&self) -> Option<&MemberIdentifier> {
        self.coordinator_excluding(&[])
    }

    /// The member that coordinates once `excluded` are gone.
    ///
    /// The first member allowed to coordinate wins, where members flagged as
    /// preferred come before the rest and otherwise the member admitted in the
    /// oldest view comes first. Every member computes the same answer from the
    /// same view, so no election round trip is needed.
    pub fn coordinator_excluding(&self, excluded: &[MemberIdentifier]) -> Option<&MemberIdentifier> {
        let candidates = self.members.iter()
            .enumerate()
            .filter(|(_, m)| !excluded.contains(m));

        candidates.clone()
            .filter(|(_, m)| m.may_coordinate())
            .min_by_key(|(position, m)| (!m.is_preferred_for_coordinator(), m.vm_view_id(), *position))
            .or_else(|| candidates.min_by_key(|(position, _)| *position))
            .map(|(_, m)| m)
    }

    /// Successor view: id + 1, `departed` and `crashed` removed, `joined`
    /// appended in order and stamped with the new view id.
    pub fn successor(
        &self,
        creator: &MemberIdentifier,
        joined: &[MemberIdentifier],
        departed: &[MemberIdentifier],
        crashed: &[MemberIdentifier],
    ) -> Result<Self, GmsError> {
        let view_id = self.view_id + 1;
        let mut members: Vec<MemberIdentifier> = self.members.iter()
            .filter(|m| !departed.contains(m) && !crashed.contains(m))
            .cloned()
            .collect();
        for joiner in joined {
            if !members.contains(joiner) {
                members.push(joiner.with_vm_view_id(view_id)?);
            }
        }

        Ok(Self {
            view_id,
            creator: self.get(creator).unwrap_or(creator).clone(),
            members,
            shutdown: self.members.iter().filter(|m| departed.contains(m)).cloned().collect(),
            crashed: self.members.iter().filter(|m| crashed.contains(m)).cloned().collect(),
        })
    }

    /// This view as a peer speaking `version` will decode it.
    pub(crate) fn for_version(&self, version: Version) -> Result<Self, GmsError> {
        let convert = |ids: &[MemberIdentifier]| -> Result<Vec<MemberIdentifier>, GmsError> {
            ids.iter().map(|m| m.for_version(version)).collect()
        };
        Ok(Self {
            view_id: self.view_id,
            creator: self.creator.for_version(version)?,
            members: convert(&self.members)?,
            shutdown: convert(&self.shutdown)?,
            crashed: convert(&self.crashed)?,
        })
    }

    /// Events observed by a member moving from `previous` to this view.
    pub fn diff(&self, previous: Option<&MembershipView>) -> Vec<ViewEvent> {
        let mut events = Vec::new();
        let Some(previous) = previous else {
            if let Some(coordinator) = self.coordinator() {
                events.push(ViewEvent::CoordinatorChanged { previous: None, current: coordinator.clone() });
            }
            events.push(ViewEvent::ViewInstalled(self.clone()));
            return events;
        };

        for member in self.members.iter().filter(|m| !previous.contains(m)) {
            events.push(ViewEvent::MemberJoined(member.clone()));
        }
        for member in previous.members.iter().filter(|m| !self.contains(m)) {
            if self.crashed.contains(member) {
                events.push(ViewEvent::MemberCrashed(member.clone()));
            } else {
                events.push(ViewEvent::MemberLeft(member.clone()));
            }
        }
        match (previous.coordinator(), self.coordinator()) {
            (old, Some(new)) if old != Some(new) => {
                events.push(ViewEvent::CoordinatorChanged { previous: old.cloned(), current: new.clone() });
            }
            _ => {}
        }
        events.push(ViewEvent::ViewInstalled(self.clone()));
        events
    }
}

impl fmt::Debug for MembershipView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "View[{}|{}] members: {:?}", self.creator, self.view_id, self.members)?;
        if !self.shutdown.is_empty() {
            write!(f, " shutdown: {:?}", self.shutdown)?;
        }
        if !self.crashed.is_empty() {
            write!(f, " crashed: {:?}", self.crashed)?;
        }
        Ok(())
    }
}

/// Membership changes as observed by the local member.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewEvent {
    MemberJoined(MemberIdentifier),
    /// The member left gracefully.
    MemberLeft(MemberIdentifier),
    /// The member was removed after failing its final check.
    MemberCrashed(MemberIdentifier),
    CoordinatorChanged {
        previous: Option<MemberIdentifier>,
        current: MemberIdentifier,
    },
    ViewInstalled(MembershipView),
    /// Too much of the view's weight became unreachable at once; no member was
    /// removed.
    PartitionDetected {
        unreachable: Vec<MemberIdentifier>,
        lost_weight: u32,
        total_weight: u32,
    },
    /// The local member was removed from the view by the rest of the cluster.
    Expelled(MembershipView),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::{vm_kind, MemberIdentifierBuilder};
    use std::net::{IpAddr, Ipv4Addr};

    fn member(port: u16, kind: u8) -> MemberIdentifier {
        MemberIdentifierBuilder::for_known_host(IpAddr::V4(Ipv4Addr::LOCALHOST), "localhost")
            .membership_port(port)
            .direct_channel_port(port + 1)
            .vm_kind(kind)
            .unique_instance_tag(7, port as u64)
            .build()
            .unwrap()
    }

    #[test]
    fn test_successor_increments_id_and_records_departures() {
        let a = member(1000, vm_kind::NORMAL);
        let b = member(2000, vm_kind::NORMAL);
        let c = member(3000, vm_kind::NORMAL);
        let v1 = MembershipView::initial(a.clone()).unwrap();
        let v2 = v1.successor(&a, &[b.clone(), c.clone()], &[], &[]).unwrap();
        assert_eq!(v2.view_id(), 2);
        assert_eq!(v2.get(&b).unwrap().vm_view_id(), 2);

        let v3 = v2.successor(&a, &[], &[c.clone()], &[b.clone()]).unwrap();
        assert_eq!(v3.view_id(), 3);
        assert_eq!(v3.members(), &[a.clone()]);
        assert_eq!(v3.shutdown_members(), &[c.clone()]);
        assert_eq!(v3.crashed_members(), &[b.clone()]);

        let events = v3.diff(Some(&v2));
        assert!(events.contains(&ViewEvent::MemberCrashed(b)));
        assert!(events.contains(&ViewEvent::MemberLeft(c)));
        assert!(matches!(events.last(), Some(ViewEvent::ViewInstalled(v)) if v.view_id() == 3));
    }

    #[test]
    fn test_coordinator_is_oldest_eligible_member() {
        let a = member(1000, vm_kind::ADMIN_ONLY);
        let b = member(2000, vm_kind::NORMAL);
        let c = member(3000, vm_kind::NORMAL);
        let v1 = MembershipView::initial(a.clone()).unwrap();
        let v2 = v1.successor(&a, &[b.clone()], &[], &[]).unwrap();
        let v3 = v2.successor(&a, &[c.clone()], &[], &[]).unwrap();

        assert_eq!(v3.coordinator(), Some(&b));
        assert_eq!(v3.coordinator_excluding(&[b.clone()]), Some(&c));
        // with nobody eligible, the first remaining member coordinates
        assert_eq!(v3.coordinator_excluding(&[b, c]), Some(&a));
    }

    #[test]
    fn test_preferred_member_wins_coordination() {
        let a = member(1000, vm_kind::NORMAL);
        let locator = member(2000, vm_kind::LOCATOR);
        let v1 = MembershipView::initial(a.clone()).unwrap();
        let v2 = v1.successor(&a, &[locator.clone()], &[], &[]).unwrap();
        assert_eq!(v2.coordinator(), Some(&locator));

        let events = v2.diff(Some(&v1));
        assert!(events.contains(&ViewEvent::MemberJoined(locator.clone())));
        assert!(events.iter().any(|e| matches!(e,
            ViewEvent::CoordinatorChanged { previous: Some(p), current } if *p == a && *current == locator)));
    }

    #[test]
    fn test_view_round_trips_through_bincode() {
        let a = member(1000, vm_kind::NORMAL);
        let view = MembershipView::initial(a).unwrap();
        let bytes = bincode::serialize(&view).unwrap();
        let decoded: MembershipView = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, view);
        assert_eq!(decoded.total_weight(), 10);
    }
}
