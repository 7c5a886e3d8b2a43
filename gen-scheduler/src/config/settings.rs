//! Runtime settings consumed by the scheduler.
//!
//! Settings live in the `app_setting` key/value table (JSON values) and are
//! read through [`SettingsProvider`]. Nothing on a hot path talks to the
//! provider directly; see [`super::SettingsCache`].

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::database::models::TaskKind;
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Settings key holding the per-model RPM list.
pub const MODEL_SETTINGS_KEY: &str = "model_settings";
/// Settings key holding the persisted log filter directive.
pub const LOG_FILTER_KEY: &str = "log_filter_directive";

/// Configured request-per-minute limit of one model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSetting {
    pub model_id: String,
    #[serde(default)]
    pub rpm: i64,
    #[serde(default)]
    pub rpm_enabled: bool,
}

impl ModelSetting {
    pub fn new(model_id: impl Into<String>, rpm: i64, rpm_enabled: bool) -> Self {
        Self {
            model_id: model_id.into(),
            rpm,
            rpm_enabled,
        }
    }

    /// Normalized limit; negative RPM values count as zero.
    pub fn limit(&self) -> ModelLimit {
        let rpm = u32::try_from(self.rpm.max(0)).unwrap_or(u32::MAX);
        ModelLimit {
            rpm,
            enabled: self.rpm_enabled && rpm > 0,
        }
    }
}

/// Effective admission limit for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelLimit {
    pub rpm: u32,
    /// Only true when the flag is set and `rpm > 0`.
    pub enabled: bool,
}

/// Default attempt ceiling per task kind.
pub fn default_max_attempts(kind: TaskKind) -> i64 {
    match kind {
        TaskKind::Image | TaskKind::Page => 3,
        // Every provider status poll is a claim.
        TaskKind::Video => 120,
    }
}

/// Accepted range for a stored attempt ceiling.
pub fn max_attempts_range(kind: TaskKind) -> RangeInclusive<i64> {
    match kind {
        TaskKind::Image | TaskKind::Page => 0..=10,
        TaskKind::Video => 1..=1000,
    }
}

/// Default bound on a single execution of a task of `kind`.
pub fn default_task_timeout(kind: TaskKind) -> Duration {
    match kind {
        TaskKind::Image | TaskKind::Page => Duration::from_secs(5 * 60),
        TaskKind::Video => Duration::from_secs(2 * 60),
    }
}

const TASK_TIMEOUT_RANGE_SECS: RangeInclusive<u64> = 1..=3600;

fn max_attempts_key(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Image => "image_max_retry_attempts",
        TaskKind::Page => "page_max_retry_attempts",
        TaskKind::Video => "video_max_poll_attempts",
    }
}

fn task_timeout_key(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Image => "image_task_timeout_secs",
        TaskKind::Page => "page_task_timeout_secs",
        TaskKind::Video => "video_task_timeout_secs",
    }
}

/// Source of runtime settings.
///
/// Returning `None` means "not configured"; callers fall back to defaults.
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn model_settings(&self) -> Result<Vec<ModelSetting>>;
    async fn max_attempts(&self, kind: TaskKind) -> Result<Option<i64>>;
    async fn task_timeout(&self, kind: TaskKind) -> Result<Option<Duration>>;
    async fn log_filter_directive(&self) -> Result<Option<String>>;
}

/// Settings backed by the `app_setting` table.
pub struct SqliteSettingsProvider {
    pool: SqlitePool,
}

impl SqliteSettingsProvider {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Raw JSON value stored under `key`.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM app_setting WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.0))
    }

    /// Upsert `value` (serialized as JSON) under `key`.
    pub async fn set<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        sqlx::query(
            r#"
            INSERT INTO app_setting (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(raw)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SettingsProvider for SqliteSettingsProvider {
    async fn model_settings(&self) -> Result<Vec<ModelSetting>> {
        Ok(self
            .get_json::<Vec<ModelSetting>>(MODEL_SETTINGS_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn max_attempts(&self, kind: TaskKind) -> Result<Option<i64>> {
        let value = self.get_json::<i64>(max_attempts_key(kind)).await?;
        Ok(value.filter(|v| max_attempts_range(kind).contains(v)))
    }

    async fn task_timeout(&self, kind: TaskKind) -> Result<Option<Duration>> {
        let value = self.get_json::<u64>(task_timeout_key(kind)).await?;
        Ok(value
            .filter(|secs| TASK_TIMEOUT_RANGE_SECS.contains(secs))
            .map(Duration::from_secs))
    }

    async fn log_filter_directive(&self) -> Result<Option<String>> {
        Ok(self
            .get_json::<String>(LOG_FILTER_KEY)
            .await?
            .filter(|d| !d.trim().is_empty()))
    }
}

/// In-memory settings, mutable at runtime. Used when no settings table is
/// wanted and in tests.
#[derive(Default)]
pub struct StaticSettings {
    inner: RwLock<StaticSettingsInner>,
}

#[derive(Default)]
struct StaticSettingsInner {
    models: Vec<ModelSetting>,
    max_attempts: HashMap<TaskKind, i64>,
    timeouts: HashMap<TaskKind, Duration>,
    log_filter: Option<String>,
    fail: bool,
}

impl StaticSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(self, model_id: &str, rpm: i64, rpm_enabled: bool) -> Self {
        self.set_model(model_id, rpm, rpm_enabled);
        self
    }

    pub fn with_max_attempts(self, kind: TaskKind, max: i64) -> Self {
        self.set_max_attempts(kind, max);
        self
    }

    pub fn with_task_timeout(self, kind: TaskKind, timeout: Duration) -> Self {
        self.inner.write().timeouts.insert(kind, timeout);
        self
    }

    pub fn set_model(&self, model_id: &str, rpm: i64, rpm_enabled: bool) {
        let mut inner = self.inner.write();
        inner.models.retain(|m| m.model_id != model_id);
        inner
            .models
            .push(ModelSetting::new(model_id, rpm, rpm_enabled));
    }

    pub fn set_max_attempts(&self, kind: TaskKind, max: i64) {
        self.inner.write().max_attempts.insert(kind, max);
    }

    /// Make every subsequent read fail, to exercise degraded paths.
    pub fn set_unavailable(&self, fail: bool) {
        self.inner.write().fail = fail;
    }

    fn check(&self) -> Result<()> {
        if self.inner.read().fail {
            return Err(Error::Other("settings store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsProvider for StaticSettings {
    async fn model_settings(&self) -> Result<Vec<ModelSetting>> {
        self.check()?;
        Ok(self.inner.read().models.clone())
    }

    async fn max_attempts(&self, kind: TaskKind) -> Result<Option<i64>> {
        self.check()?;
        Ok(self.inner.read().max_attempts.get(&kind).copied())
    }

    async fn task_timeout(&self, kind: TaskKind) -> Result<Option<Duration>> {
        self.check()?;
        Ok(self.inner.read().timeouts.get(&kind).copied())
    }

    async fn log_filter_directive(&self) -> Result<Option<String>> {
        self.check()?;
        Ok(self.inner.read().log_filter.clone())
    }
}
