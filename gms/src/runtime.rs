use gms_runtime::{ActorCommand, Runtime};

use crate::fd::DetectorEvent;

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub(crate) enum ActorId {
    /// Owns the failure detector; every health transition runs here.
    FailureDetector,
    /// Drives the task scheduler at the configured tick.
    SchedulerDriver,
}

impl ActorCommand for DetectorEvent {}

pub(crate) type GmsRuntime = Runtime<ActorId, DetectorEvent>;
