use std::time::{Duration, Instant};
use parking_lot::Mutex;

use crate::config::MAX_RETRY_DELAY;

const OPEN_AFTER_FAILURES: u32 = 5;
const RESET_TIMEOUT: Duration = Duration::from_secs(300);
const BASE_DELAY: Duration = Duration::from_millis(100);

/// What the receive loop should do before its next read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pause {
    None,
    /// Back off after recent failures.
    Retry(Duration),
    /// Too many consecutive failures; stop reading for this long.
    Open(Duration),
}

#[derive(Default)]
struct BreakerState {
    failures: u32,
    last_failure: Option<Instant>,
}

/// [`ReceiveBackoff`] exponential backoff plus circuit breaker for a socket
/// read loop.
///
/// Each consecutive failure doubles the pause before the next read, capped at
/// [`MAX_RETRY_DELAY`]. From [`OPEN_AFTER_FAILURES`] failures on the circuit is
/// open until the reset timeout has passed since the last failure, after which
/// the count starts over. A successful read resets everything.
// References: https://learn.microsoft.com/en-us/azure/architecture/patterns/circuit-breaker
pub(crate) struct ReceiveBackoff {
    state: Mutex<BreakerState>,
    reset_timeout: Duration,
}

impl ReceiveBackoff {
    pub(crate) fn new() -> Self {
        Self::with_reset_timeout(RESET_TIMEOUT)
    }

    pub(crate) fn with_reset_timeout(reset_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState::default()),
            reset_timeout,
        }
    }

    /// Records a failed read; returns the consecutive failure count.
    pub(crate) fn failure(&self) -> u32 {
        let mut state = self.state.lock();
        state.failures = state.failures.saturating_add(1);
        state.last_failure = Some(Instant::now());
        state.failures
    }

    pub(crate) fn success(&self) {
        *self.state.lock() = BreakerState::default();
    }

    pub(crate) fn pause(&self) -> Pause {
        let mut state = self.state.lock();
        if state.failures == 0 {
            return Pause::None;
        }
        if state.failures >= OPEN_AFTER_FAILURES {
            let since_failure = state.last_failure.map_or(self.reset_timeout, |at| at.elapsed());
            if since_failure >= self.reset_timeout {
                *state = BreakerState::default();
                return Pause::None;
            }
            return Pause::Open(self.reset_timeout - since_failure);
        }
        let delay = BASE_DELAY.saturating_mul(2u32.saturating_pow(state.failures));
        Pause::Retry(delay.min(Duration::from_secs(MAX_RETRY_DELAY)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_delay_doubles_until_circuit_opens() {
        let backoff = ReceiveBackoff::new();
        assert_eq!(backoff.pause(), Pause::None);

        assert_eq!(backoff.failure(), 1);
        assert_eq!(backoff.pause(), Pause::Retry(Duration::from_millis(200)));
        backoff.failure();
        assert_eq!(backoff.pause(), Pause::Retry(Duration::from_millis(400)));

        for _ in 3..=OPEN_AFTER_FAILURES {
            backoff.failure();
        }
        assert!(matches!(backoff.pause(), Pause::Open(left) if left <= RESET_TIMEOUT));

        backoff.success();
        assert_eq!(backoff.pause(), Pause::None);
    }

    #[test]
    fn test_open_circuit_closes_after_reset_timeout() {
        let backoff = ReceiveBackoff::with_reset_timeout(Duration::from_millis(200));
        for _ in 0..OPEN_AFTER_FAILURES {
            backoff.failure();
        }
        assert!(matches!(backoff.pause(), Pause::Open(_)));

        thread::sleep(Duration::from_millis(250));
        assert_eq!(backoff.pause(), Pause::None);
        assert_eq!(backoff.failure(), 1);
    }
}
