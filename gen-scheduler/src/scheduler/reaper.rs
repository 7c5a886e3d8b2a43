//! Stale task recovery.
//!
//! A row left RUNNING by a crashed or hung worker is requeued as PENDING once
//! it has not been touched for the queue's stale threshold. At process start
//! every running row is orphaned, so the first sweep uses a cutoff of "now".
//!
//! The threshold never drops below the configured execution timeout plus
//! `STALE_MARGIN`, so a live execution is not handed to a second worker.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::TaskStore;
use crate::Result;
use crate::config::SettingsCache;
use crate::database::time::{ms_before, now_ms};

/// Headroom past the execution timeout for the outcome write-back.
pub const STALE_MARGIN: Duration = Duration::from_secs(60);

pub struct StaleTaskReaper<S: TaskStore> {
    store: Arc<S>,
    stale_after: Duration,
    check_interval: Duration,
    settings: Option<Arc<SettingsCache>>,
}

impl<S: TaskStore> StaleTaskReaper<S> {
    pub fn new(store: Arc<S>, stale_after: Duration, check_interval: Duration) -> Self {
        Self {
            store,
            stale_after,
            check_interval,
            settings: None,
        }
    }

    /// Keep the threshold above the live execution timeout of this queue.
    pub fn with_settings(mut self, settings: Arc<SettingsCache>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Age after which a running row is considered orphaned.
    pub fn threshold(&self) -> Duration {
        match &self.settings {
            Some(settings) => self
                .stale_after
                .max(settings.task_timeout(self.store.kind()) + STALE_MARGIN),
            None => self.stale_after,
        }
    }

    /// Requeue rows running since before `cutoff_ms`.
    pub async fn sweep(&self, cutoff_ms: i64) -> Result<u64> {
        let reset = self.store.reset_stale_running(cutoff_ms).await?;
        if reset > 0 {
            warn!(
                kind = self.store.kind().label(),
                count = reset,
                "Requeued stale running tasks"
            );
        }
        Ok(reset)
    }

    /// Requeue everything left running by a previous process.
    pub async fn recover_on_startup(&self) -> Result<u64> {
        let reset = self.sweep(now_ms()).await?;
        info!(
            kind = self.store.kind().label(),
            count = reset,
            "Startup recovery complete"
        );
        Ok(reset)
    }

    /// Requeue rows past the stale threshold.
    pub async fn sweep_stale(&self) -> Result<u64> {
        self.sweep(ms_before(now_ms(), self.threshold())).await
    }

    /// Sweep periodically until cancelled.
    pub fn start(self: Arc<Self>, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let kind = self.store.kind();
            let mut check_interval = interval(self.check_interval);
            check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; startup recovery already ran.
            check_interval.tick().await;

            debug!(
                "{} stale reaper started (threshold: {}s, interval: {}s)",
                kind.label(),
                self.threshold().as_secs(),
                self.check_interval.as_secs()
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("{} stale reaper shutting down", kind.label());
                        break;
                    }
                    _ = check_interval.tick() => {
                        if let Err(e) = self.sweep_stale().await {
                            error!("{} stale sweep failed: {}", kind.label(), e);
                        }
                    }
                }
            }
        })
    }
}
