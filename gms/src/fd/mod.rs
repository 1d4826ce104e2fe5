//! Failure detection: heartbeats, corroborated suspicion, a final check over
//! the direct channel, and partition-aware removal.

use std::fmt;

pub(crate) use detector::{DetectorAction, DetectorEvent, DetectorSettings, FailureDetector};
pub use partition::{CountLossPolicy, LossAssessment, LossPolicy, WeightedLossPolicy, LEAD_MEMBER_BONUS};

mod detector;
mod partition;

/// Health of one member as seen by the local failure detector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum HealthState {
    #[default]
    Alive,
    Suspected,
    FinalCheck,
    /// Failed the final check; gone with the next view.
    Removed,
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthState::Alive => "ALIVE",
            HealthState::Suspected => "SUSPECTED",
            HealthState::FinalCheck => "FINAL_CHECK",
            HealthState::Removed => "REMOVED",
        };
        f.write_str(name)
    }
}
