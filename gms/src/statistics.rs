use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
struct Counter(AtomicU64);

impl Counter {
    fn incr(&self) {
        self.add(1);
    }

    fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// [`MembershipStatistics`] protocol telemetry of one membership service
/// instance. Counters only ever grow and never influence protocol decisions.
#[derive(Debug, Default)]
pub struct MembershipStatistics {
    heartbeat_requests_sent: Counter,
    heartbeat_requests_received: Counter,
    heartbeat_responses_sent: Counter,
    heartbeat_responses_received: Counter,
    suspects_sent: Counter,
    suspects_received: Counter,
    final_check_requests_sent: Counter,
    final_check_requests_received: Counter,
    final_check_responses_sent: Counter,
    final_check_responses_received: Counter,
    handshake_retransmits: Counter,
    messages_sent: Counter,
    messages_received: Counter,
    bytes_sent: Counter,
    bytes_received: Counter,
    views_installed: Counter,
    members_crashed: Counter,
    members_departed: Counter,
    partitions_detected: Counter,
    serializations: Counter,
    serialization_nanos: Counter,
    deserializations: Counter,
    deserialization_nanos: Counter,
}

/// Point in time copy of every counter, for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub heartbeat_requests_sent: u64,
    pub heartbeat_requests_received: u64,
    pub heartbeat_responses_sent: u64,
    pub heartbeat_responses_received: u64,
    pub suspects_sent: u64,
    pub suspects_received: u64,
    pub final_check_requests_sent: u64,
    pub final_check_requests_received: u64,
    pub final_check_responses_sent: u64,
    pub final_check_responses_received: u64,
    pub handshake_retransmits: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub views_installed: u64,
    pub members_crashed: u64,
    pub members_departed: u64,
    pub partitions_detected: u64,
    pub serializations: u64,
    pub serialization_nanos: u64,
    pub deserializations: u64,
    pub deserialization_nanos: u64,
}

impl MembershipStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_heartbeat_requests_sent(&self) {
        self.heartbeat_requests_sent.incr();
    }

    pub fn inc_heartbeat_requests_received(&self) {
        self.heartbeat_requests_received.incr();
    }

    pub fn inc_heartbeat_responses_sent(&self) {
        self.heartbeat_responses_sent.incr();
    }

    pub fn inc_heartbeat_responses_received(&self) {
        self.heartbeat_responses_received.incr();
    }

    pub fn inc_suspects_sent(&self) {
        self.suspects_sent.incr();
    }

    pub fn inc_suspects_received(&self) {
        self.suspects_received.incr();
    }

    pub fn inc_final_check_requests_sent(&self) {
        self.final_check_requests_sent.incr();
    }

    pub fn inc_final_check_requests_received(&self) {
        self.final_check_requests_received.incr();
    }

    pub fn inc_final_check_responses_sent(&self) {
        self.final_check_responses_sent.incr();
    }

    pub fn inc_final_check_responses_received(&self) {
        self.final_check_responses_received.incr();
    }

    pub fn inc_handshake_retransmits(&self) {
        self.handshake_retransmits.incr();
    }

    pub fn inc_views_installed(&self) {
        self.views_installed.incr();
    }

    pub fn inc_members_crashed(&self, n: u64) {
        self.members_crashed.add(n);
    }

    pub fn inc_members_departed(&self, n: u64) {
        self.members_departed.add(n);
    }

    pub fn inc_partitions_detected(&self) {
        self.partitions_detected.incr();
    }

    pub fn record_message_sent(&self, bytes: usize) {
        self.messages_sent.incr();
        self.bytes_sent.add(bytes as u64);
    }

    pub fn record_message_received(&self, bytes: usize) {
        self.messages_received.incr();
        self.bytes_received.add(bytes as u64);
    }

    /// Marks the start of a timed (de)serialization.
    pub fn start_timer(&self) -> Instant {
        Instant::now()
    }

    pub fn end_serialization(&self, start: Instant) {
        self.serializations.incr();
        self.serialization_nanos.add(start.elapsed().as_nanos() as u64);
    }

    pub fn end_deserialization(&self, start: Instant) {
        self.deserializations.incr();
        self.deserialization_nanos.add(start.elapsed().as_nanos() as u64);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            heartbeat_requests_sent: self.heartbeat_requests_sent.get(),
            heartbeat_requests_received: self.heartbeat_requests_received.get(),
            heartbeat_responses_sent: self.heartbeat_responses_sent.get(),
            heartbeat_responses_received: self.heartbeat_responses_received.get(),
            suspects_sent: self.suspects_sent.get(),
            suspects_received: self.suspects_received.get(),
            final_check_requests_sent: self.final_check_requests_sent.get(),
            final_check_requests_received: self.final_check_requests_received.get(),
            final_check_responses_sent: self.final_check_responses_sent.get(),
            final_check_responses_received: self.final_check_responses_received.get(),
            handshake_retransmits: self.handshake_retransmits.get(),
            messages_sent: self.messages_sent.get(),
            messages_received: self.messages_received.get(),
            bytes_sent: self.bytes_sent.get(),
            bytes_received: self.bytes_received.get(),
            views_installed: self.views_installed.get(),
            members_crashed: self.members_crashed.get(),
            members_departed: self.members_departed.get(),
            partitions_detected: self.partitions_detected.get(),
            serializations: self.serializations.get(),
            serialization_nanos: self.serialization_nanos.get(),
            deserializations: self.deserializations.get(),
            deserialization_nanos: self.deserialization_nanos.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = MembershipStatistics::new();
        stats.inc_heartbeat_requests_sent();
        stats.inc_heartbeat_requests_sent();
        stats.record_message_sent(100);
        stats.record_message_received(40);
        stats.inc_members_crashed(2);
        let start = stats.start_timer();
        stats.end_serialization(start);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.heartbeat_requests_sent, 2);
        assert_eq!(snapshot.messages_sent, 1);
        assert_eq!(snapshot.bytes_sent, 100);
        assert_eq!(snapshot.bytes_received, 40);
        assert_eq!(snapshot.members_crashed, 2);
        assert_eq!(snapshot.serializations, 1);
        assert_eq!(snapshot.suspects_sent, 0);
    }

    #[test]
    fn test_snapshot_serializes_for_operators() {
        let stats = MembershipStatistics::new();
        stats.inc_views_installed();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"views_installed\":1"));
        let back: StatisticsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats.snapshot());
    }
}
