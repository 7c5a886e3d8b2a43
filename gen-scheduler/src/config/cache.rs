//! Snapshot cache over the settings provider.
//!
//! Readers take an `Arc` of the current snapshot under a short read lock; a
//! refresh builds a complete new snapshot and swaps it in. A failed refresh
//! keeps serving the previous snapshot.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::settings::{
    ModelLimit, SettingsProvider, default_max_attempts, default_task_timeout,
};
use crate::Result;
use crate::database::models::TaskKind;

/// Default interval between settings refreshes.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// An immutable view of all scheduler settings.
#[derive(Debug, Clone)]
pub struct SettingsSnapshot {
    models: HashMap<String, ModelLimit>,
    max_attempts: HashMap<TaskKind, i64>,
    task_timeouts: HashMap<TaskKind, Duration>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl Default for SettingsSnapshot {
    fn default() -> Self {
        Self {
            models: HashMap::new(),
            max_attempts: TaskKind::ALL
                .iter()
                .map(|k| (*k, default_max_attempts(*k)))
                .collect(),
            task_timeouts: TaskKind::ALL
                .iter()
                .map(|k| (*k, default_task_timeout(*k)))
                .collect(),
            refreshed_at: None,
        }
    }
}

impl SettingsSnapshot {
    /// Limit configured for `model`; `None` when the model is unknown.
    pub fn model_limit(&self, model: &str) -> Option<ModelLimit> {
        self.models.get(model.trim()).copied()
    }

    pub fn max_attempts(&self, kind: TaskKind) -> i64 {
        self.max_attempts
            .get(&kind)
            .copied()
            .unwrap_or_else(|| default_max_attempts(kind))
    }

    pub fn task_timeout(&self, kind: TaskKind) -> Duration {
        self.task_timeouts
            .get(&kind)
            .copied()
            .unwrap_or_else(|| default_task_timeout(kind))
    }
}

/// Cached, periodically refreshed settings.
pub struct SettingsCache {
    provider: Arc<dyn SettingsProvider>,
    snapshot: RwLock<Arc<SettingsSnapshot>>,
}

impl SettingsCache {
    /// Create a cache that serves defaults until the first refresh.
    pub fn new(provider: Arc<dyn SettingsProvider>) -> Self {
        Self {
            provider,
            snapshot: RwLock::new(Arc::new(SettingsSnapshot::default())),
        }
    }

    /// Create a cache and load it once.
    pub async fn load(provider: Arc<dyn SettingsProvider>) -> Result<Arc<Self>> {
        let cache = Arc::new(Self::new(provider));
        cache.refresh().await?;
        Ok(cache)
    }

    pub fn provider(&self) -> &Arc<dyn SettingsProvider> {
        &self.provider
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> Arc<SettingsSnapshot> {
        self.snapshot.read().clone()
    }

    pub fn model_limit(&self, model: &str) -> Option<ModelLimit> {
        self.snapshot.read().model_limit(model)
    }

    pub fn max_attempts(&self, kind: TaskKind) -> i64 {
        self.snapshot.read().max_attempts(kind)
    }

    pub fn task_timeout(&self, kind: TaskKind) -> Duration {
        self.snapshot.read().task_timeout(kind)
    }

    /// Re-read the provider and swap in a new snapshot.
    pub async fn refresh(&self) -> Result<()> {
        let mut next = SettingsSnapshot::default();

        for setting in self.provider.model_settings().await? {
            let model = setting.model_id.trim();
            if model.is_empty() {
                continue;
            }
            next.models.insert(model.to_string(), setting.limit());
        }

        for kind in TaskKind::ALL {
            if let Some(max) = self.provider.max_attempts(kind).await? {
                next.max_attempts.insert(kind, max);
            }
            if let Some(timeout) = self.provider.task_timeout(kind).await? {
                next.task_timeouts.insert(kind, timeout);
            }
        }

        next.refreshed_at = Some(Utc::now());
        debug!(models = next.models.len(), "Settings snapshot refreshed");
        *self.snapshot.write() = Arc::new(next);
        Ok(())
    }

    /// Refresh on a fixed interval until `cancel` fires.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Settings refresh task shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = cache.refresh().await {
                            warn!(error = %e, "Failed to refresh settings, keeping previous snapshot");
                        }
                    }
                }
            }
        })
    }
}
