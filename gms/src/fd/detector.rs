use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::GmsError;
use crate::fd::partition::LossPolicy;
use crate::fd::HealthState;
use crate::member::MemberIdentifier;
use crate::message::SuspectEntry;
use crate::scheduler::{TaskHandle, TaskScheduler};
use crate::view::MembershipView;

/// Inputs of the failure detector. Timer expiries arrive through the same
/// channel as network input, so every transition is serialized.
#[derive(Debug, Clone)]
pub(crate) enum DetectorEvent {
    HeartbeatTick,
    HeartbeatTimeout { member: MemberIdentifier, request_id: u64 },
    HeartbeatResponse { from: MemberIdentifier, request_id: u64 },
    SuspectReceived { reporter: MemberIdentifier, suspects: Vec<SuspectEntry> },
    FinalCheckTimeout { member: MemberIdentifier, request_id: u64 },
    FinalCheckResponse { from: MemberIdentifier, request_id: u64 },
    /// The final check request could not even be sent.
    FinalCheckFailed { member: MemberIdentifier, request_id: u64 },
    RemoveRequested { requester: MemberIdentifier, member: MemberIdentifier, reason: String },
    ViewInstalled(MembershipView),
}

/// What the detector wants done; the caller owns all I/O.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DetectorAction {
    SendHeartbeat { to: MemberIdentifier, request_id: u64 },
    BroadcastSuspect { suspect: MemberIdentifier, reason: String },
    SendFinalCheck { to: MemberIdentifier, request_id: u64 },
    RequestRemoval { coordinator: MemberIdentifier, member: MemberIdentifier, reason: String },
    InstallView(MembershipView),
    PartitionDetected { unreachable: Vec<MemberIdentifier>, lost_weight: u32, total_weight: u32 },
}

#[derive(Debug, Clone)]
pub(crate) struct DetectorSettings {
    pub(crate) heartbeat_interval: Duration,
    pub(crate) member_timeout: Duration,
    pub(crate) final_check_timeout: Duration,
    pub(crate) suspect_threshold: u32,
    pub(crate) partition_detection: bool,
}

#[derive(Default)]
struct MemberHealth {
    state: HealthState,
    heartbeat: Option<(u64, TaskHandle)>,
    missed_heartbeats: u32,
    // remote members that reported this one during the current suspicion
    reporters: HashSet<MemberIdentifier>,
    final_check: Option<(u64, TaskHandle)>,
}

impl MemberHealth {
    fn corroborations(&self) -> u32 {
        self.missed_heartbeats + self.reporters.len() as u32
    }

    fn cancel_timers(&mut self) {
        if let Some((_, task)) = self.heartbeat.take() {
            task.cancel();
        }
        if let Some((_, task)) = self.final_check.take() {
            task.cancel();
        }
    }
}

/// [`FailureDetector`] per-member health state machine.
///
/// ```text
/// ALIVE --heartbeat timeout--> SUSPECTED --threshold reached--> FINAL_CHECK --fails--> REMOVED
///   ^                              |                                 |
///   +------- any response ---------+---------------------------------+
/// ```
///
/// The detector performs no I/O. [`FailureDetector::handle`] consumes one
/// event and returns the actions to carry out; timeouts are armed on the
/// [`TaskScheduler`] and come back as events through `events`. A single
/// owner must feed it, which is what serializes all transitions.
pub(crate) struct FailureDetector {
    local: MemberIdentifier,
    view: MembershipView,
    health: HashMap<MemberIdentifier, MemberHealth>,
    settings: DetectorSettings,
    loss_policy: Arc<dyn LossPolicy>,
    scheduler: Arc<TaskScheduler>,
    events: mpsc::UnboundedSender<DetectorEvent>,
    next_request_id: u64,
    tick: Option<TaskHandle>,
    // set while a partition is declared; cleared once enough members answer again
    partitioned: bool,
}

impl FailureDetector {
    pub(crate) fn new(
        local: MemberIdentifier,
        view: MembershipView,
        settings: DetectorSettings,
        loss_policy: Arc<dyn LossPolicy>,
        scheduler: Arc<TaskScheduler>,
        events: mpsc::UnboundedSender<DetectorEvent>,
    ) -> Self {
        let mut detector = Self {
            local,
            view: view.clone(),
            health: HashMap::new(),
            settings,
            loss_policy,
            scheduler,
            events,
            next_request_id: 1,
            tick: None,
            partitioned: false,
        };
        detector.track(&view);
        detector
    }

    pub(crate) fn view(&self) -> &MembershipView {
        &self.view
    }

    pub(crate) fn state_of(&self, member: &MemberIdentifier) -> Option<HealthState> {
        self.health.get(member).map(|h| h.state)
    }

    /// Arms the first heartbeat round.
    pub(crate) fn start(&mut self) {
        self.schedule_tick(Duration::ZERO);
    }

    /// Cancels every armed timer.
    pub(crate) fn stop(&mut self) {
        if let Some(tick) = self.tick.take() {
            tick.cancel();
        }
        for health in self.health.values_mut() {
            health.cancel_timers();
        }
    }

    pub(crate) fn handle(&mut self, event: DetectorEvent) -> Result<Vec<DetectorAction>, GmsError> {
        let mut actions = Vec::new();
        match event {
            DetectorEvent::HeartbeatTick => self.on_tick(&mut actions),
            DetectorEvent::HeartbeatTimeout { member, request_id } => {
                self.on_heartbeat_timeout(&member, request_id, &mut actions)?
            }
            DetectorEvent::HeartbeatResponse { from, request_id } => self.on_response(&from, Some(request_id), false),
            DetectorEvent::SuspectReceived { reporter, suspects } => {
                for entry in suspects {
                    self.on_suspect(&reporter, &entry.suspect, &entry.reason, &mut actions)?;
                }
            }
            DetectorEvent::FinalCheckResponse { from, request_id } => self.on_response(&from, Some(request_id), true),
            DetectorEvent::FinalCheckTimeout { member, request_id }
            | DetectorEvent::FinalCheckFailed { member, request_id } => {
                self.on_final_check_failed(&member, request_id, &mut actions)?
            }
            DetectorEvent::RemoveRequested { requester, member, reason } => {
                self.on_remove_requested(&requester, &member, &reason, &mut actions)?
            }
            DetectorEvent::ViewInstalled(view) => self.install(view),
        }
        Ok(actions)
    }

    fn on_tick(&mut self, actions: &mut Vec<DetectorAction>) {
        let targets: Vec<MemberIdentifier> = self.health
            .iter()
            .filter(|(_, h)| matches!(h.state, HealthState::Alive | HealthState::Suspected) && h.heartbeat.is_none())
            .map(|(member, _)| member.clone())
            .collect();

        for member in targets {
            let request_id = self.next_request_id();
            let task = self.arm(
                DetectorEvent::HeartbeatTimeout { member: member.clone(), request_id },
                self.settings.member_timeout,
            );
            if let Some(health) = self.health.get_mut(&member) {
                health.heartbeat = Some((request_id, task));
            }
            actions.push(DetectorAction::SendHeartbeat { to: member, request_id });
        }
        self.schedule_tick(self.settings.heartbeat_interval);
    }

    fn on_heartbeat_timeout(
        &mut self,
        member: &MemberIdentifier,
        request_id: u64,
        actions: &mut Vec<DetectorAction>,
    ) -> Result<(), GmsError> {
        let Some(health) = self.health.get_mut(member) else {
            return Ok(());
        };
        if !matches!(health.heartbeat, Some((id, _)) if id == request_id) {
            return Ok(());
        }
        health.heartbeat = None;
        health.missed_heartbeats += 1;

        if health.state == HealthState::Alive {
            health.state = HealthState::Suspected;
            info!(member = %member, "heartbeat timed out, member suspected");
            actions.push(DetectorAction::BroadcastSuspect {
                suspect: member.clone(),
                reason: "heartbeat timed out".to_string(),
            });
        } else {
            debug!(member = %member, missed = health.missed_heartbeats, "heartbeat timed out again");
        }
        self.check_threshold(member, actions);
        Ok(())
    }

    fn on_suspect(
        &mut self,
        reporter: &MemberIdentifier,
        suspect: &MemberIdentifier,
        reason: &str,
        actions: &mut Vec<DetectorAction>,
    ) -> Result<(), GmsError> {
        if suspect == &self.local {
            debug!(reporter = %reporter, "suspected by a peer, heartbeat responses will refute it");
            return Ok(());
        }
        let Some(health) = self.health.get_mut(suspect) else {
            return Ok(());
        };
        if matches!(health.state, HealthState::FinalCheck | HealthState::Removed) {
            return Ok(());
        }
        health.reporters.insert(reporter.clone());
        if health.state == HealthState::Alive {
            health.state = HealthState::Suspected;
            info!(member = %suspect, reporter = %reporter, reason, "member suspected by a peer");
        }
        self.check_threshold(suspect, actions);
        Ok(())
    }

    fn check_threshold(&mut self, member: &MemberIdentifier, actions: &mut Vec<DetectorAction>) {
        let reached = self.health
            .get(member)
            .is_some_and(|h| h.state == HealthState::Suspected && h.corroborations() >= self.settings.suspect_threshold);
        if reached {
            self.begin_final_check(member, actions);
        }
    }

    fn begin_final_check(&mut self, member: &MemberIdentifier, actions: &mut Vec<DetectorAction>) {
        let request_id = self.next_request_id();
        let task = self.arm(
            DetectorEvent::FinalCheckTimeout { member: member.clone(), request_id },
            self.settings.final_check_timeout,
        );
        if let Some(health) = self.health.get_mut(member) {
            health.cancel_timers();
            health.state = HealthState::FinalCheck;
            health.final_check = Some((request_id, task));
        }
        info!(member = %member, "issuing final check");
        actions.push(DetectorAction::SendFinalCheck { to: member.clone(), request_id });
    }

    /// Any sign of life brings a suspected member back. A final check response
    /// only counts for the check it answers; heartbeats count regardless of
    /// which request they answer.
    fn on_response(&mut self, from: &MemberIdentifier, request_id: Option<u64>, final_check: bool) {
        let Some(health) = self.health.get_mut(from) else {
            return;
        };
        if health.state == HealthState::Removed {
            return;
        }
        if final_check && !matches!((health.final_check.as_ref(), request_id), (Some((id, _)), Some(r)) if *id == r) {
            return;
        }

        if !final_check && matches!(health.heartbeat, Some((id, _)) if Some(id) == request_id) {
            if let Some((_, task)) = health.heartbeat.take() {
                task.cancel();
            }
        }

        if health.state != HealthState::Alive {
            if let Some((_, task)) = health.final_check.take() {
                task.cancel();
            }
            health.state = HealthState::Alive;
            health.missed_heartbeats = 0;
            health.reporters.clear();
            info!(member = %from, "member responded, alive again");
            if self.partitioned {
                self.check_partition_healed();
            }
        } else {
            health.missed_heartbeats = 0;
        }
    }

    fn check_partition_healed(&mut self) {
        let unreachable = self.unreachable();
        if !self.loss_policy.assess(&self.view, &unreachable).partitioned {
            self.partitioned = false;
            info!(unreachable = unreachable.len(), "partition healed, failure detection resumes");
        }
    }

    /// Members counted against the loss threshold. While a partition is
    /// declared, members still suspected from it keep counting.
    fn unreachable(&self) -> Vec<MemberIdentifier> {
        if self.partitioned {
            self.members_in(&[HealthState::Suspected, HealthState::FinalCheck, HealthState::Removed])
        } else {
            self.members_in(&[HealthState::FinalCheck, HealthState::Removed])
        }
    }

    fn on_final_check_failed(
        &mut self,
        member: &MemberIdentifier,
        request_id: u64,
        actions: &mut Vec<DetectorAction>,
    ) -> Result<(), GmsError> {
        let Some(health) = self.health.get_mut(member) else {
            return Ok(());
        };
        if health.state != HealthState::FinalCheck || !matches!(health.final_check, Some((id, _)) if id == request_id) {
            return Ok(());
        }
        if let Some((_, task)) = health.final_check.take() {
            task.cancel();
        }
        health.state = HealthState::Removed;
        warn!(member = %member, "final check failed");
        self.conclude(actions)
    }

    fn on_remove_requested(
        &mut self,
        requester: &MemberIdentifier,
        member: &MemberIdentifier,
        reason: &str,
        actions: &mut Vec<DetectorAction>,
    ) -> Result<(), GmsError> {
        if member == &self.local {
            warn!(requester = %requester, reason, "asked to remove the local member, ignoring");
            return Ok(());
        }
        let Some(health) = self.health.get_mut(member) else {
            return Ok(());
        };
        match health.state {
            HealthState::Alive | HealthState::Suspected => {
                info!(member = %member, requester = %requester, reason, "removal requested, verifying");
                health.state = HealthState::Suspected;
                health.reporters.insert(requester.clone());
                self.begin_final_check(member, actions);
            }
            HealthState::FinalCheck => {
                health.reporters.insert(requester.clone());
            }
            HealthState::Removed => {}
        }
        Ok(())
    }

    /// Acts on every member whose final check failed: remove them, or declare
    /// a partition when too much of the view is unreachable at once.
    ///
    /// Under a partition nobody is removed. The unreachable members go back to
    /// SUSPECTED and keep being heartbeated, so an answer restores them and a
    /// lasting silence brings them back here for another assessment.
    fn conclude(&mut self, actions: &mut Vec<DetectorAction>) -> Result<(), GmsError> {
        let removed: Vec<MemberIdentifier> = self.members_in(&[HealthState::Removed]);
        if removed.is_empty() {
            return Ok(());
        }

        if self.settings.partition_detection {
            let unreachable = self.unreachable();
            let assessment = self.loss_policy.assess(&self.view, &unreachable);
            if assessment.partitioned {
                for member in &unreachable {
                    if let Some(health) = self.health.get_mut(member) {
                        health.cancel_timers();
                        health.state = HealthState::Suspected;
                        health.missed_heartbeats = 0;
                        health.reporters.clear();
                    }
                }
                if !self.partitioned {
                    warn!(
                        unreachable = unreachable.len(),
                        lost_weight = assessment.lost_weight,
                        total_weight = assessment.total_weight,
                        "possible network partition, not removing members"
                    );
                    self.partitioned = true;
                    actions.push(DetectorAction::PartitionDetected {
                        unreachable,
                        lost_weight: assessment.lost_weight,
                        total_weight: assessment.total_weight,
                    });
                }
                return Ok(());
            }
            if self.partitioned {
                self.partitioned = false;
                info!(unreachable = unreachable.len(), "partition no longer holds");
            }
        }

        let coordinator = self.view.coordinator_excluding(&removed).cloned();
        match coordinator {
            Some(coordinator) if coordinator == self.local => {
                let view = self.view.successor(&self.local, &[], &[], &removed)?;
                info!(view_id = view.view_id(), crashed = removed.len(), "removing failed members");
                self.install(view.clone());
                actions.push(DetectorAction::InstallView(view));
            }
            Some(coordinator) => {
                for member in removed {
                    actions.push(DetectorAction::RequestRemoval {
                        coordinator: coordinator.clone(),
                        member,
                        reason: "failed final check".to_string(),
                    });
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Adopts `view` unless it is older than the current one.
    fn install(&mut self, view: MembershipView) {
        if view.view_id() < self.view.view_id() {
            debug!(view_id = view.view_id(), current = self.view.view_id(), "ignoring stale view");
            return;
        }
        let departed: Vec<MemberIdentifier> = self.health
            .keys()
            .filter(|m| !view.contains(m))
            .cloned()
            .collect();
        for member in departed {
            if let Some(mut health) = self.health.remove(&member) {
                health.cancel_timers();
            }
        }
        self.track(&view);
        self.view = view;
        self.partitioned = false;
    }

    fn track(&mut self, view: &MembershipView) {
        for member in view.members() {
            if member != &self.local {
                self.health.entry(member.clone()).or_default();
            }
        }
    }

    fn members_in(&self, states: &[HealthState]) -> Vec<MemberIdentifier> {
        // view order keeps the result deterministic
        self.view.members()
            .iter()
            .filter(|m| self.health.get(m).is_some_and(|h| states.contains(&h.state)))
            .cloned()
            .collect()
    }

    fn schedule_tick(&mut self, delay: Duration) {
        if let Some(previous) = self.tick.take() {
            previous.cancel();
        }
        self.tick = Some(self.arm(DetectorEvent::HeartbeatTick, delay));
    }

    fn arm(&self, event: DetectorEvent, delay: Duration) -> TaskHandle {
        let events = self.events.clone();
        self.scheduler.schedule(
            move || {
                events.send(event).map_err(|_| anyhow::anyhow!("failure detector is gone"))
            },
            delay,
        )
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_request_id;
        self.next_request_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd::partition::WeightedLossPolicy;
    use crate::member::{vm_kind, MemberIdentifierBuilder};
    use crate::scheduler::ManualClock;
    use std::net::{IpAddr, Ipv4Addr};

    const HEARTBEAT: Duration = Duration::from_millis(1000);
    const MEMBER_TIMEOUT: Duration = Duration::from_millis(500);
    const FINAL_CHECK: Duration = Duration::from_millis(800);

    fn member(port: u16) -> MemberIdentifier {
        MemberIdentifierBuilder::for_known_host(IpAddr::V4(Ipv4Addr::LOCALHOST), "localhost")
            .membership_port(port)
            .direct_channel_port(port + 1)
            .vm_kind(vm_kind::NORMAL)
            .build()
            .unwrap()
    }

    /// Detector plus the plumbing a test needs to drive it by hand.
    struct Harness {
        detector: FailureDetector,
        clock: Arc<ManualClock>,
        scheduler: Arc<TaskScheduler>,
        events: mpsc::UnboundedReceiver<DetectorEvent>,
    }

    impl Harness {
        fn new(local: &MemberIdentifier, members: &[MemberIdentifier]) -> Self {
            let initial = MembershipView::initial(members[0].clone()).unwrap();
            let view = initial.successor(&members[0], &members[1..], &[], &[]).unwrap();
            let clock = Arc::new(ManualClock::new());
            let scheduler = Arc::new(TaskScheduler::new(clock.clone()));
            let (tx, events) = mpsc::unbounded_channel();
            let settings = DetectorSettings {
                heartbeat_interval: HEARTBEAT,
                member_timeout: MEMBER_TIMEOUT,
                final_check_timeout: FINAL_CHECK,
                suspect_threshold: 2,
                partition_detection: true,
            };
            let mut detector = FailureDetector::new(
                local.clone(),
                view,
                settings,
                Arc::new(WeightedLossPolicy::new(51)),
                scheduler.clone(),
                tx,
            );
            detector.start();
            Self { detector, clock, scheduler, events }
        }

        /// Advances time, fires due timers and feeds their events back.
        fn advance(&mut self, by: Duration) -> Vec<DetectorAction> {
            self.clock.advance(by);
            self.scheduler.trigger_due().unwrap();
            let mut actions = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                actions.extend(self.detector.handle(event).unwrap());
            }
            actions
        }

        /// Like [`Harness::advance`], but heartbeats to `responsive` members
        /// are answered on the spot and left out of the result.
        fn advance_answering(&mut self, by: Duration, responsive: &[MemberIdentifier]) -> Vec<DetectorAction> {
            let mut remaining = Vec::new();
            for action in self.advance(by) {
                match action {
                    DetectorAction::SendHeartbeat { to, request_id } if responsive.contains(&to) => {
                        self.feed(DetectorEvent::HeartbeatResponse { from: to, request_id });
                    }
                    other => remaining.push(other),
                }
            }
            remaining
        }

        fn feed(&mut self, event: DetectorEvent) -> Vec<DetectorAction> {
            self.detector.handle(event).unwrap()
        }
    }

    fn heartbeat_to(actions: &[DetectorAction], target: &MemberIdentifier) -> Option<u64> {
        actions.iter().find_map(|a| match a {
            DetectorAction::SendHeartbeat { to, request_id } if to == target => Some(*request_id),
            _ => None,
        })
    }

    fn final_check_to(actions: &[DetectorAction], target: &MemberIdentifier) -> Option<u64> {
        actions.iter().find_map(|a| match a {
            DetectorAction::SendFinalCheck { to, request_id } if to == target => Some(*request_id),
            _ => None,
        })
    }

    fn installed_views(actions: &[DetectorAction]) -> Vec<MembershipView> {
        actions.iter().filter_map(|a| match a {
            DetectorAction::InstallView(view) => Some(view.clone()),
            _ => None,
        }).collect()
    }

    #[test]
    fn test_single_missed_heartbeat_is_tolerated() {
        let (a, b) = (member(1000), member(2000));
        let mut h = Harness::new(&a, &[a.clone(), b.clone()]);

        let first = h.advance(Duration::ZERO);
        assert!(heartbeat_to(&first, &b).is_some());

        // no answer: suspected once
        let missed = h.advance(MEMBER_TIMEOUT);
        assert!(missed.iter().any(|a| matches!(a, DetectorAction::BroadcastSuspect { suspect, .. } if *suspect == b)));
        assert_eq!(h.detector.state_of(&b), Some(HealthState::Suspected));

        // the next heartbeat is answered
        let second = h.advance(HEARTBEAT - MEMBER_TIMEOUT);
        let request_id = heartbeat_to(&second, &b).unwrap();
        h.feed(DetectorEvent::HeartbeatResponse { from: b.clone(), request_id });
        assert_eq!(h.detector.state_of(&b), Some(HealthState::Alive));

        let later = h.advance(HEARTBEAT * 3);
        assert!(final_check_to(&later, &b).is_none());
    }

    #[test]
    fn test_failed_member_is_removed_exactly_once() {
        let (a, b) = (member(1000), member(2000));
        let mut h = Harness::new(&a, &[a.clone(), b.clone()]);
        let before = h.detector.view().view_id();

        let mut actions = h.advance(Duration::ZERO);
        // two missed heartbeats reach the suspect threshold
        for _ in 0..4 {
            actions.extend(h.advance(MEMBER_TIMEOUT));
        }
        let request_id = final_check_to(&actions, &b).expect("final check issued");
        assert_eq!(h.detector.state_of(&b), Some(HealthState::FinalCheck));

        actions.extend(h.advance(FINAL_CHECK));
        actions.extend(h.advance(HEARTBEAT * 5));
        // a late answer to the failed check changes nothing
        actions.extend(h.feed(DetectorEvent::FinalCheckResponse { from: b.clone(), request_id }));

        let views = installed_views(&actions);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].view_id(), before + 1);
        assert_eq!(views[0].members(), &[a.clone()]);
        assert_eq!(views[0].crashed_members(), &[b.clone()]);
        assert_eq!(h.detector.state_of(&b), None);
    }

    #[test]
    fn test_final_check_response_restores_member() {
        let (a, b) = (member(1000), member(2000));
        let mut h = Harness::new(&a, &[a.clone(), b.clone()]);
        let mut actions = h.advance(Duration::ZERO);
        for _ in 0..4 {
            actions.extend(h.advance(MEMBER_TIMEOUT));
        }
        let request_id = final_check_to(&actions, &b).unwrap();

        h.feed(DetectorEvent::FinalCheckResponse { from: b.clone(), request_id });
        assert_eq!(h.detector.state_of(&b), Some(HealthState::Alive));
        assert!(installed_views(&h.advance(FINAL_CHECK * 2)).is_empty());
    }

    #[test]
    fn test_corroborating_suspicion_triggers_final_check() {
        let (a, b, c) = (member(1000), member(2000), member(3000));
        let mut h = Harness::new(&a, &[a.clone(), b.clone(), c.clone()]);
        h.advance(Duration::ZERO);
        h.advance(MEMBER_TIMEOUT);
        assert_eq!(h.detector.state_of(&c), Some(HealthState::Suspected));

        let actions = h.feed(DetectorEvent::SuspectReceived {
            reporter: b.clone(),
            suspects: vec![SuspectEntry { suspect: c.clone(), reason: "silent".into() }],
        });
        assert!(final_check_to(&actions, &c).is_some());
    }

    #[test]
    fn test_non_coordinator_asks_coordinator_to_remove() {
        let (a, b, c) = (member(1000), member(2000), member(3000));
        // b watches while a coordinates and keeps answering
        let mut h = Harness::new(&b, &[a.clone(), b.clone(), c.clone()]);
        let mut actions = h.advance_answering(Duration::ZERO, &[a.clone()]);
        for _ in 0..4 {
            actions.extend(h.advance_answering(MEMBER_TIMEOUT, &[a.clone()]));
        }
        actions.extend(h.advance_answering(FINAL_CHECK, &[a.clone()]));

        assert_eq!(h.detector.state_of(&a), Some(HealthState::Alive));
        assert!(installed_views(&actions).is_empty());
        assert!(actions.iter().any(|action| matches!(action,
            DetectorAction::RequestRemoval { coordinator, member, .. } if *coordinator == a && *member == c)));
    }

    #[test]
    fn test_losing_most_of_the_view_declares_a_partition() {
        let members: Vec<_> = (1..=5).map(|i| member(1000 * i)).collect();
        let local = members[0].clone();
        let mut h = Harness::new(&local, &members);

        // members 3, 4 and 5 go silent while 2 keeps answering
        let mut actions = Vec::new();
        for _ in 0..6 {
            actions.extend(h.advance_answering(MEMBER_TIMEOUT, &members[1..2]));
        }
        actions.extend(h.advance_answering(FINAL_CHECK, &members[1..2]));

        assert!(installed_views(&actions).is_empty());
        let partition = actions.iter().find_map(|a| match a {
            DetectorAction::PartitionDetected { unreachable, lost_weight, total_weight } => {
                Some((unreachable.clone(), *lost_weight, *total_weight))
            }
            _ => None,
        });
        let (unreachable, lost_weight, total_weight) = partition.expect("partition declared");
        assert_eq!(unreachable, members[2..].to_vec());
        // the local member leads with 10 + 5
        assert_eq!((lost_weight, total_weight), (30, 55));
        assert_eq!(h.detector.view().size(), 5);
    }

    #[test]
    fn test_detection_resumes_after_partition_heals() {
        let members: Vec<_> = (1..=5).map(|i| member(1000 * i)).collect();
        let local = members[0].clone();
        let mut h = Harness::new(&local, &members);
        let before = h.detector.view().view_id();

        let mut actions = Vec::new();
        for _ in 0..6 {
            actions.extend(h.advance_answering(MEMBER_TIMEOUT, &members[1..2]));
        }
        actions.extend(h.advance_answering(FINAL_CHECK, &members[1..2]));
        assert!(actions.iter().any(|a| matches!(a, DetectorAction::PartitionDetected { .. })));
        for m in &members[2..] {
            assert_eq!(h.detector.state_of(m), Some(HealthState::Suspected));
        }

        // the partition heals: unreachable members are still heartbeated and come back
        let mut healing = Vec::new();
        for _ in 0..6 {
            healing.extend(h.advance_answering(MEMBER_TIMEOUT, &members[1..]));
        }
        for m in &members[2..] {
            assert_eq!(h.detector.state_of(m), Some(HealthState::Alive));
        }
        assert!(installed_views(&healing).is_empty());
        assert!(!healing.iter().any(|a| matches!(a, DetectorAction::PartitionDetected { .. })));

        // a real crash afterwards is handled again
        let mut crash = Vec::new();
        for _ in 0..12 {
            crash.extend(h.advance_answering(MEMBER_TIMEOUT, &members[2..]));
        }
        let views = installed_views(&crash);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].view_id(), before + 1);
        assert_eq!(views[0].crashed_members(), &[members[1].clone()]);
        assert_eq!(h.detector.view().size(), 4);
        assert_eq!(h.detector.state_of(&members[1]), None);
    }

    #[test]
    fn test_partition_persists_while_members_stay_silent() {
        let members: Vec<_> = (1..=5).map(|i| member(1000 * i)).collect();
        let mut h = Harness::new(&members[0], &members);

        let mut actions = Vec::new();
        for _ in 0..30 {
            actions.extend(h.advance_answering(MEMBER_TIMEOUT, &members[1..2]));
        }
        let partitions = actions.iter().filter(|a| matches!(a, DetectorAction::PartitionDetected { .. })).count();
        assert_eq!(partitions, 1);
        assert!(installed_views(&actions).is_empty());
        // still heartbeated on every round
        let rounds = actions.iter().filter(|a| matches!(a, DetectorAction::SendHeartbeat { to, .. } if *to == members[4])).count();
        assert!(rounds > 5);
        assert_eq!(h.detector.view().size(), 5);
    }

    #[test]
    fn test_stale_views_are_ignored() {
        let (a, b) = (member(1000), member(2000));
        let mut h = Harness::new(&a, &[a.clone(), b.clone()]);
        let current = h.detector.view().clone();
        let older = MembershipView::initial(a.clone()).unwrap();
        h.feed(DetectorEvent::ViewInstalled(older));
        assert_eq!(h.detector.view(), &current);
        assert_eq!(h.detector.state_of(&b), Some(HealthState::Alive));
    }
}
