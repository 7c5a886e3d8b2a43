//! Sliding-window rate-limit stores.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::Result;

/// Outcome of a single window evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted,
    /// `retry_after` is the time until the oldest hit leaves the window;
    /// zero when the store has no suggestion.
    Denied { retry_after: Duration },
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// A store offering one atomic "evaluate and update" operation per key.
///
/// `acquire` must, as a single indivisible step: drop hits at or before
/// `now - window`, count the remaining hits, and either record a hit at `now`
/// (when the count is below `limit`) or deny with
/// `window - (now - oldest)` clamped to zero.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now_ms: i64,
    ) -> Result<Decision>;
}

/// Compute the denial hint for a full window.
pub(crate) fn retry_after(window: Duration, now_ms: i64, oldest_ms: i64) -> Duration {
    let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
    let remaining = window_ms.saturating_sub(now_ms.saturating_sub(oldest_ms));
    Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
}

/// Process-local store. Each key's window is mutated under its map entry lock.
///
/// Keys whose hits have all expired are dropped by a sweep that runs at most
/// once per window, from inside `acquire`.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    windows: DashMap<String, Vec<i64>>,
    last_sweep_ms: AtomicI64,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop keys whose every hit has left the window.
    pub fn prune(&self, window: Duration, now_ms: i64) {
        let cutoff = cutoff(window, now_ms);
        self.windows.retain(|_, hits| hits.iter().any(|&t| t > cutoff));
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    fn sweep_idle(&self, window: Duration, now_ms: i64) {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let last = self.last_sweep_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) < window_ms {
            return;
        }
        // One caller per window does the sweep.
        if self
            .last_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.prune(window, now_ms);
        }
    }
}

fn cutoff(window: Duration, now_ms: i64) -> i64 {
    now_ms.saturating_sub(i64::try_from(window.as_millis()).unwrap_or(i64::MAX))
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now_ms: i64,
    ) -> Result<Decision> {
        // Must run before the entry lock below is taken.
        self.sweep_idle(window, now_ms);

        let cutoff = cutoff(window, now_ms);
        let mut entry = self.windows.entry(key.to_string()).or_default();
        let hits = entry.value_mut();

        hits.retain(|&t| t > cutoff);
        if hits.len() < limit as usize {
            hits.push(now_ms);
            return Ok(Decision::Granted);
        }

        let oldest = hits.iter().copied().min().unwrap_or(now_ms);
        Ok(Decision::Denied {
            retry_after: retry_after(window, now_ms, oldest),
        })
    }
}
