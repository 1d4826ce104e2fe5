use metrics::{describe_counter, describe_gauge, describe_histogram, Counter, Gauge, Histogram, Unit};

const ACTORS: &str = "gms_runtime.actors";
const COMMANDS: &str = "gms_runtime.commands_handled";
const COMMAND_LATENCY: &str = "gms_runtime.command_latency";
const TICKS: &str = "gms_runtime.recurrent_ticks";
const ERRORS: &str = "gms_runtime.errors";

/// Metric handles of one [`crate::Runtime`], labelled with its name so that
/// several runtimes in one process report separately.
pub struct RuntimeMetrics {
    pub actors: Gauge,
    pub commands_handled: Counter,
    pub command_latency: Histogram,
    pub recurrent_ticks: Counter,
    pub errors: Counter,
}

impl RuntimeMetrics {
    pub fn new(runtime_name: &str) -> Self {
        describe_gauge!(ACTORS, "Actors currently running");
        describe_counter!(COMMANDS, "Commands handled by actors");
        describe_histogram!(COMMAND_LATENCY, Unit::Seconds, "Time an actor spent on one command");
        describe_counter!(TICKS, "Interval ticks handled by recurrent actors");
        describe_counter!(ERRORS, "Failed sends and unclean actor shutdowns");

        let label = runtime_name.to_string();
        Self {
            actors: metrics::gauge!(ACTORS, "runtime" => label.clone()),
            commands_handled: metrics::counter!(COMMANDS, "runtime" => label.clone()),
            command_latency: metrics::histogram!(COMMAND_LATENCY, "runtime" => label.clone()),
            recurrent_ticks: metrics::counter!(TICKS, "runtime" => label.clone()),
            errors: metrics::counter!(ERRORS, "runtime" => label),
        }
    }
}
