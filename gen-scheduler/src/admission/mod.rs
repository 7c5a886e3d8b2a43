//! Per-(user, model) admission control.
//!
//! Requests are admitted against a sliding 60 s window whose limit comes from
//! the model settings. A denied caller can block in [`AdmissionController::await_slot`],
//! which retries on a jittered schedule until granted, cancelled or timed out,
//! optionally emitting keep-alive pings on an idle streaming connection.
//!
//! The wait runs on the caller's own task and never spawns background work.

mod keepalive;
mod store;
mod wait;

pub use keepalive::{DEFAULT_PING_FRAME, KeepAlive, SSE_HEADERS, SseKeepAlive, StreamFrame};
pub use store::{Decision, MemoryRateLimitStore, RateLimitStore};
pub use wait::WaitContext;

pub(crate) use store::retry_after;

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::SettingsCache;
use crate::database::time::now_ms;
use crate::{Error, Result};
use wait::WaitBackoff;

/// Admission controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Length of the sliding window.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// First step of the backoff ladder.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Ceiling of the backoff ladder.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Interval between keep-alive ticks.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    2_000
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

fn default_ping_interval_ms() -> u64 {
    10_000
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            ping_interval_ms: default_ping_interval_ms(),
        }
    }
}

impl AdmissionConfig {
    pub fn with_window(mut self, window: Duration) -> Self {
        self.window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    fn backoff(&self) -> WaitBackoff {
        WaitBackoff::new(
            Duration::from_millis(self.initial_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
            self.backoff_multiplier,
        )
    }
}

/// Result of a non-blocking admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Denied { retry_after: Duration },
}

/// Store key of a (user, model) window.
pub fn rate_limit_key(user_id: i64, model: &str) -> String {
    format!("model:rpm:{}:{}", user_id, model)
}

/// Millisecond clock anchored to wall time at construction and advanced by
/// the runtime's monotonic clock.
#[derive(Debug, Clone, Copy)]
struct WindowClock {
    wall_ms: i64,
    anchor: Instant,
}

impl WindowClock {
    fn new() -> Self {
        Self {
            wall_ms: now_ms(),
            anchor: Instant::now(),
        }
    }

    fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.wall_ms.saturating_add(elapsed)
    }
}

/// Gate applied before a task is created.
pub struct AdmissionController {
    store: Arc<dyn RateLimitStore>,
    settings: Arc<SettingsCache>,
    config: AdmissionConfig,
    clock: WindowClock,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn RateLimitStore>, settings: Arc<SettingsCache>) -> Self {
        Self::with_config(store, settings, AdmissionConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn RateLimitStore>,
        settings: Arc<SettingsCache>,
        config: AdmissionConfig,
    ) -> Self {
        Self {
            store,
            settings,
            config,
            clock: WindowClock::new(),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Effective RPM for the pair, or `None` when admission is a no-op
    /// (limit disabled, zero, or model unknown).
    pub fn resolve_limit(&self, user_id: i64, model: &str) -> Result<Option<u32>> {
        if user_id <= 0 {
            return Err(Error::validation("invalid user id"));
        }
        let model = model.trim();
        if model.is_empty() {
            return Ok(None);
        }
        Ok(self
            .settings
            .model_limit(model)
            .filter(|limit| limit.enabled)
            .map(|limit| limit.rpm))
    }

    /// Try once to take a slot.
    pub async fn try_enter(&self, user_id: i64, model: &str) -> Result<Admission> {
        let model = model.trim();
        let Some(limit) = self.resolve_limit(user_id, model)? else {
            return Ok(Admission::Granted);
        };
        Ok(self.acquire(&rate_limit_key(user_id, model), limit).await)
    }

    /// Block until a slot is granted, the context is cancelled, or its
    /// deadline passes.
    ///
    /// With `keep_alive`, a tick is delivered every ping interval while
    /// waiting; an error from the sink ends the wait.
    pub async fn await_slot(
        &self,
        user_id: i64,
        model: &str,
        ctx: &WaitContext,
        mut keep_alive: Option<&mut dyn KeepAlive>,
    ) -> Result<()> {
        let model = model.trim();
        let Some(limit) = self.resolve_limit(user_id, model)? else {
            return Ok(());
        };
        let key = rate_limit_key(user_id, model);

        let mut backoff = self.config.backoff();
        let first_wait = match self.acquire(&key, limit).await {
            Admission::Granted => return Ok(()),
            Admission::Denied { retry_after } => backoff.next_wait(retry_after),
        };

        debug!(
            key = %key,
            limit,
            wait_ms = first_wait.as_millis() as u64,
            "Rate limit reached, waiting for a slot"
        );

        let timer = tokio::time::sleep(first_wait);
        tokio::pin!(timer);

        let ping_interval = self.config.ping_interval();
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        let pinging = keep_alive.is_some();

        let has_deadline = ctx.deadline.is_some();
        let deadline = tokio::time::sleep_until(
            ctx.deadline
                .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400)),
        );
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = ctx.cancel.cancelled() => {
                    return Err(Error::RateLimited { deadline_exceeded: false });
                }
                _ = &mut deadline, if has_deadline => {
                    return Err(Error::RateLimited { deadline_exceeded: true });
                }
                _ = ping.tick(), if pinging => {
                    if let Some(sink) = keep_alive.as_deref_mut() {
                        sink.on_wait_tick().await?;
                    }
                }
                _ = &mut timer => {
                    match self.acquire(&key, limit).await {
                        Admission::Granted => return Ok(()),
                        Admission::Denied { retry_after } => {
                            let wait = backoff.next_wait(retry_after);
                            timer.as_mut().reset(Instant::now() + wait);
                        }
                    }
                }
            }
        }
    }

    /// One store round-trip. Store failures admit the request.
    async fn acquire(&self, key: &str, limit: u32) -> Admission {
        match self
            .store
            .acquire(key, limit, self.config.window(), self.clock.now_ms())
            .await
        {
            Ok(Decision::Granted) => Admission::Granted,
            Ok(Decision::Denied { retry_after }) => Admission::Denied { retry_after },
            Err(e) => {
                warn!(key = %key, error = %e, "Rate limit store unavailable, admitting request");
                Admission::Granted
            }
        }
    }
}
