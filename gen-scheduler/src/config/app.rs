//! Process-level configuration read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

const DEFAULT_DATABASE_URL: &str = "sqlite:gen-scheduler.db?mode=rwc";
const DEFAULT_LOG_DIR: &str = "logs";
const DEFAULT_BLOB_DIR: &str = "data/media";
const DEFAULT_BLOB_PUBLIC_BASE_URL: &str = "/media";
const DEFAULT_PROVIDER_BASE_URL: &str = "http://127.0.0.1:8080";
const DEFAULT_PROVIDER_TIMEOUT_SECS: u64 = 300;

/// Configuration assembled from environment variables (and `.env`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub log_dir: PathBuf,
    pub blob_dir: PathBuf,
    pub blob_public_base_url: String,
    pub provider_base_url: String,
    pub provider_api_key: Option<String>,
    /// Upper bound on a single HTTP call to the provider.
    pub provider_timeout: Duration,
    /// Run two page workers instead of one.
    pub page_high_concurrency: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            log_dir: PathBuf::from(DEFAULT_LOG_DIR),
            blob_dir: PathBuf::from(DEFAULT_BLOB_DIR),
            blob_public_base_url: DEFAULT_BLOB_PUBLIC_BASE_URL.to_string(),
            provider_base_url: DEFAULT_PROVIDER_BASE_URL.to_string(),
            provider_api_key: None,
            provider_timeout: Duration::from_secs(DEFAULT_PROVIDER_TIMEOUT_SECS),
            page_high_concurrency: false,
        }
    }
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or(defaults.database_url),
            log_dir: get("LOG_DIR").map(PathBuf::from).unwrap_or(defaults.log_dir),
            blob_dir: get("BLOB_DIR").map(PathBuf::from).unwrap_or(defaults.blob_dir),
            blob_public_base_url: get("BLOB_PUBLIC_BASE_URL")
                .unwrap_or(defaults.blob_public_base_url),
            provider_base_url: get("PROVIDER_BASE_URL").unwrap_or(defaults.provider_base_url),
            provider_api_key: get("PROVIDER_API_KEY"),
            provider_timeout: get("PROVIDER_TIMEOUT_SECS")
                .map(|v| parse_value::<u64>("PROVIDER_TIMEOUT_SECS", &v))
                .transpose()?
                .map(Duration::from_secs)
                .unwrap_or(defaults.provider_timeout),
            page_high_concurrency: get("PAGE_HIGH_CONCURRENCY")
                .map(|v| parse_bool("PAGE_HIGH_CONCURRENCY", &v))
                .transpose()?
                .unwrap_or(defaults.page_high_concurrency),
        })
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| Error::config(format!("{key} has invalid value '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("{key} has invalid value '{value}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert!(!config.page_high_concurrency);
        assert!(config.provider_api_key.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "sqlite:/tmp/x.db"),
            ("PAGE_HIGH_CONCURRENCY", "yes"),
            ("PROVIDER_TIMEOUT_SECS", "30"),
            ("PROVIDER_API_KEY", "  "),
        ]))
        .unwrap();
        assert_eq!(config.database_url, "sqlite:/tmp/x.db");
        assert!(config.page_high_concurrency);
        assert_eq!(config.provider_timeout, Duration::from_secs(30));
        assert!(config.provider_api_key.is_none());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = AppConfig::from_lookup(lookup(&[("PAGE_HIGH_CONCURRENCY", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(AppConfig::from_lookup(lookup(&[("PROVIDER_TIMEOUT_SECS", "soon")])).is_err());
    }
}
