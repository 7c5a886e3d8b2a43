//! Configuration: process environment and runtime settings.

mod app;
mod cache;
mod settings;

pub use app::AppConfig;
pub use cache::{DEFAULT_REFRESH_INTERVAL, SettingsCache, SettingsSnapshot};
pub use settings::{
    LOG_FILTER_KEY, MODEL_SETTINGS_KEY, ModelLimit, ModelSetting, SettingsProvider,
    SqliteSettingsProvider, StaticSettings, default_max_attempts, default_task_timeout,
    max_attempts_range,
};
