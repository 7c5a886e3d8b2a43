//! Wait-loop primitives: caller context, backoff ladder and jitter.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation scope of a caller waiting for admission.
///
/// Firing `cancel` ends the wait as an explicit cancel; passing `deadline`
/// ends it as a timeout.
#[derive(Debug, Clone, Default)]
pub struct WaitContext {
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl WaitContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Scale `base` by a random factor in `[0.8, 1.2)`.
pub(crate) fn jitter(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    base.mul_f64(0.8 + rand::random::<f64>() * 0.4)
}

/// Capped exponential ladder used when the store gives no retry hint.
#[derive(Debug, Clone)]
pub(crate) struct WaitBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
}

impl WaitBackoff {
    pub(crate) fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            current: initial,
        }
    }

    /// How long to wait before the next acquire.
    ///
    /// A non-zero `retry_after` is honoured (jittered) and resets the ladder;
    /// otherwise the ladder advances one step.
    pub(crate) fn next_wait(&mut self, retry_after: Duration) -> Duration {
        if !retry_after.is_zero() {
            self.current = self.initial;
            return jitter(retry_after);
        }

        let wait = jitter(self.current).min(self.max);
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        wait
    }
}
