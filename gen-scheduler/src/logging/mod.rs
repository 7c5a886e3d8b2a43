//! Tracing setup.
//!
//! Events go to stderr and to a daily-rolled file under the log directory.
//! The filter sits behind a reload layer so it can be swapped at runtime,
//! e.g. from the persisted `log_filter` setting.

use chrono::{Local, NaiveDate};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

use crate::config::SettingsProvider;
use crate::{Error, Result};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "gen_scheduler=info,sqlx=warn";

/// Rolled files are named `gen-scheduler.log.YYYY-MM-DD`.
const LOG_FILE_PREFIX: &str = "gen-scheduler.log";

/// Rolled files older than this many days are deleted.
const RETENTION_DAYS: u64 = 7;

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Local wall-clock timestamps with millisecond precision and UTC offset.
struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

type FilterReload = reload::Handle<EnvFilter, Registry>;

/// Validate a directive such as `gen_scheduler=debug,sqlx=warn`.
pub fn parse_filter(directive: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(directive.trim())
        .map_err(|e| Error::config(format!("invalid log filter '{}': {}", directive.trim(), e)))
}

/// Runtime control over the installed subscriber.
pub struct LogHandle {
    filter: FilterReload,
    dir: PathBuf,
}

impl LogHandle {
    /// The active filter, rendered as a directive string.
    pub fn current_filter(&self) -> String {
        self.filter
            .with_current(ToString::to_string)
            .unwrap_or_default()
    }

    /// Swap in a new filter. An invalid directive is rejected and the active
    /// one stays in place.
    pub fn reload_filter(&self, directive: &str) -> Result<()> {
        let filter = parse_filter(directive)?;
        self.filter
            .reload(filter)
            .map_err(|e| Error::Other(format!("log filter reload failed: {}", e)))?;
        info!(filter = %directive.trim(), "Log filter reloaded");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Use the stored `log_filter` setting, if there is one.
    pub async fn apply_persisted_filter(&self, provider: &dyn SettingsProvider) {
        let directive = match provider.log_filter_directive().await {
            Ok(Some(directive)) => directive,
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "Could not read persisted log filter");
                return;
            }
        };
        if let Err(e) = self.reload_filter(&directive) {
            warn!(error = %e, "Ignoring persisted log filter");
        }
    }

    /// Periodically delete rolled files past retention until cancelled.
    pub fn start_retention_cleanup(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let dir = self.dir.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let cutoff = Local::now().date_naive()
                            - chrono::Days::new(RETENTION_DAYS);
                        match remove_rolled_before(&dir, cutoff).await {
                            Ok(0) => {}
                            Ok(removed) => info!(removed, "Removed expired log files"),
                            Err(e) => warn!(error = %e, "Log retention sweep failed"),
                        }
                    }
                }
            }
            debug!("Log retention sweep stopped");
        })
    }
}

/// Date suffix of a rolled log file, if `name` is one.
fn rolled_date(name: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix(LOG_FILE_PREFIX)?.strip_prefix('.')?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// Delete rolled files dated before `cutoff`. Other files are left alone.
async fn remove_rolled_before(dir: &Path, cutoff: NaiveDate) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let expired = entry
            .file_name()
            .to_str()
            .and_then(rolled_date)
            .is_some_and(|date| date < cutoff);
        if !expired || !entry.file_type().await?.is_file() {
            continue;
        }
        let path = entry.path();
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Could not remove log file"),
        }
    }
    Ok(removed)
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped; hold it until exit.
pub fn init_logging(log_dir: impl AsRef<Path>) -> Result<(LogHandle, WorkerGuard)> {
    let dir = log_dir.as_ref().to_path_buf();
    std::fs::create_dir_all(&dir)?;

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX));

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| parse_filter(DEFAULT_LOG_FILTER))?;
    let (filter_layer, filter) = reload::Layer::new(filter);

    let console = fmt::layer().with_timer(LocalTime).with_target(true);
    let file = fmt::layer()
        .with_timer(LocalTime)
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| Error::Other(format!("logging already initialized: {}", e)))?;

    Ok((LogHandle { filter, dir }, guard))
}
