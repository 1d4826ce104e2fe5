use crate::member::{vm_kind, MemberIdentifier};
use crate::view::MembershipView;

/// Extra weight carried by the lead member, the oldest normal member of a view.
pub const LEAD_MEMBER_BONUS: u32 = 5;

/// Outcome of weighing a set of unreachable members against a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LossAssessment {
    pub lost_weight: u32,
    pub total_weight: u32,
    pub partitioned: bool,
}

/// [`LossPolicy`] decides whether losing `unreachable` at the same time means
/// the local member is on the wrong side of a network partition.
pub trait LossPolicy: Send + Sync {
    fn assess(&self, view: &MembershipView, unreachable: &[MemberIdentifier]) -> LossAssessment;
}

/// Weight-based policy: a partition is declared when the weight of the
/// unreachable members exceeds `threshold_percent` of the view's weight.
#[derive(Debug, Clone, Copy)]
pub struct WeightedLossPolicy {
    threshold_percent: u8,
}

impl WeightedLossPolicy {
    pub fn new(threshold_percent: u8) -> Self {
        Self { threshold_percent }
    }

    /// Weight of `member` in `view`, including the lead member bonus.
    pub fn member_weight(view: &MembershipView, member: &MemberIdentifier) -> u32 {
        let bonus = match lead_member(view) {
            Some(lead) if lead == member => LEAD_MEMBER_BONUS,
            _ => 0,
        };
        member.weight() as u32 + bonus
    }
}

impl LossPolicy for WeightedLossPolicy {
    fn assess(&self, view: &MembershipView, unreachable: &[MemberIdentifier]) -> LossAssessment {
        let total_weight: u32 = view.members().iter().map(|m| Self::member_weight(view, m)).sum();
        let lost_weight: u32 = view.members()
            .iter()
            .filter(|m| unreachable.contains(m))
            .map(|m| Self::member_weight(view, m))
            .sum();
        LossAssessment {
            lost_weight,
            total_weight,
            partitioned: exceeds(lost_weight, total_weight, self.threshold_percent),
        }
    }
}

/// Plain head count: every member weighs one.
#[derive(Debug, Clone, Copy)]
pub struct CountLossPolicy {
    threshold_percent: u8,
}

impl CountLossPolicy {
    pub fn new(threshold_percent: u8) -> Self {
        Self { threshold_percent }
    }
}

impl LossPolicy for CountLossPolicy {
    fn assess(&self, view: &MembershipView, unreachable: &[MemberIdentifier]) -> LossAssessment {
        let total_weight = view.size() as u32;
        let lost_weight = view.members().iter().filter(|m| unreachable.contains(m)).count() as u32;
        LossAssessment {
            lost_weight,
            total_weight,
            partitioned: exceeds(lost_weight, total_weight, self.threshold_percent),
        }
    }
}

fn exceeds(lost: u32, total: u32, threshold_percent: u8) -> bool {
    total > 0 && u64::from(lost) * 100 > u64::from(threshold_percent) * u64::from(total)
}

fn lead_member(view: &MembershipView) -> Option<&MemberIdentifier> {
    view.members().iter().find(|m| m.vm_kind() == vm_kind::NORMAL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::member::MemberIdentifierBuilder;
    use std::net::{IpAddr, Ipv4Addr};

    fn member(port: u16, kind: u8) -> MemberIdentifier {
        MemberIdentifierBuilder::for_known_host(IpAddr::V4(Ipv4Addr::LOCALHOST), "localhost")
            .membership_port(port)
            .vm_kind(kind)
            .build()
            .unwrap()
    }

    fn view_of(members: &[MemberIdentifier]) -> MembershipView {
        let initial = MembershipView::initial(members[0].clone()).unwrap();
        initial.successor(&members[0], &members[1..], &[], &[]).unwrap()
    }

    #[test]
    fn test_weighted_policy_counts_lead_bonus() {
        let locator = member(1000, vm_kind::LOCATOR);
        let lead = member(2000, vm_kind::NORMAL);
        let other = member(3000, vm_kind::NORMAL);
        let view = view_of(&[locator.clone(), lead.clone(), other.clone()]);
        let policy = WeightedLossPolicy::new(51);

        // 3 + 15 + 10
        let losing_other = policy.assess(&view, &[other.clone()]);
        assert_eq!(losing_other, LossAssessment { lost_weight: 10, total_weight: 28, partitioned: false });

        // 15 of 28 is just above 51%
        let losing_lead = policy.assess(&view, &[lead.clone()]);
        assert_eq!(losing_lead.lost_weight, 15);
        assert!(losing_lead.partitioned);
    }

    #[test]
    fn test_two_members_losing_one_is_not_a_partition() {
        let a = member(1000, vm_kind::NORMAL);
        let b = member(2000, vm_kind::NORMAL);
        let view = view_of(&[a, b.clone()]);
        assert!(!WeightedLossPolicy::new(51).assess(&view, &[b]).partitioned);
    }

    #[test]
    fn test_count_policy() {
        let members: Vec<_> = (1..=4).map(|i| member(1000 * i, vm_kind::NORMAL)).collect();
        let view = view_of(&members);
        let policy = CountLossPolicy::new(51);
        assert!(!policy.assess(&view, &members[2..]).partitioned);
        assert!(policy.assess(&view, &members[1..]).partitioned);
    }
}
