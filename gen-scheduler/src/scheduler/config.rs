//! Per-kind queue configuration.

use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

use crate::database::models::TaskKind;

/// Delay before the next attempt, indexed by the attempt that just failed.
///
/// Attempts past the end of the ladder reuse the last step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryLadder {
    steps: Vec<Duration>,
}

impl RetryLadder {
    pub fn new(steps: Vec<Duration>) -> Self {
        Self { steps }
    }

    /// Delay after the `attempts`-th claim failed (1-based).
    pub fn delay_for_attempt(&self, attempts: i64) -> Duration {
        let Some(last) = self.steps.len().checked_sub(1) else {
            return Duration::ZERO;
        };
        let index = usize::try_from(attempts.saturating_sub(1))
            .unwrap_or(0)
            .min(last);
        self.steps[index]
    }
}

/// Worker and recovery settings of one queue.
///
/// Missing fields take the image queue's defaults when deserialized on their
/// own; inside `SchedulerConfig` they take the defaults of the queue's kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Concurrent workers polling the queue.
    pub workers: usize,
    /// Sleep between polls when the queue is empty, in milliseconds.
    pub poll_interval_ms: u64,
    /// A running row untouched for this long is considered orphaned.
    pub stale_after_secs: u64,
    /// Interval between stale sweeps.
    pub stale_check_interval_secs: u64,
    /// Retry delays in milliseconds.
    pub retry_ladder_ms: Vec<u64>,
    /// Delay between provider polls of a parked job (video only).
    pub poll_delay_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::for_kind(TaskKind::Image)
    }
}

/// Fields present in a serialized queue section.
#[derive(Debug, Deserialize)]
struct QueueOverrides {
    workers: Option<usize>,
    poll_interval_ms: Option<u64>,
    stale_after_secs: Option<u64>,
    stale_check_interval_secs: Option<u64>,
    retry_ladder_ms: Option<Vec<u64>>,
    poll_delay_ms: Option<u64>,
}

impl QueueOverrides {
    fn apply(self, mut config: QueueConfig) -> QueueConfig {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval_ms = ms;
        }
        if let Some(secs) = self.stale_after_secs {
            config.stale_after_secs = secs;
        }
        if let Some(secs) = self.stale_check_interval_secs {
            config.stale_check_interval_secs = secs;
        }
        if let Some(ladder) = self.retry_ladder_ms {
            config.retry_ladder_ms = ladder;
        }
        if let Some(ms) = self.poll_delay_ms {
            config.poll_delay_ms = ms;
        }
        config
    }
}

fn queue_for<'de, D: Deserializer<'de>>(
    kind: TaskKind,
    deserializer: D,
) -> Result<QueueConfig, D::Error> {
    QueueOverrides::deserialize(deserializer).map(|o| o.apply(QueueConfig::for_kind(kind)))
}

pub(super) fn image_queue<'de, D: Deserializer<'de>>(d: D) -> Result<QueueConfig, D::Error> {
    queue_for(TaskKind::Image, d)
}

pub(super) fn video_queue<'de, D: Deserializer<'de>>(d: D) -> Result<QueueConfig, D::Error> {
    queue_for(TaskKind::Video, d)
}

pub(super) fn page_queue<'de, D: Deserializer<'de>>(d: D) -> Result<QueueConfig, D::Error> {
    queue_for(TaskKind::Page, d)
}

impl QueueConfig {
    /// Defaults for the given kind.
    pub fn for_kind(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Image => Self {
                workers: 2,
                poll_interval_ms: 2_000,
                stale_after_secs: 10 * 60,
                stale_check_interval_secs: 30,
                retry_ladder_ms: vec![10_000, 30_000, 120_000],
                poll_delay_ms: 0,
            },
            TaskKind::Video => Self {
                workers: 1,
                poll_interval_ms: 3_000,
                stale_after_secs: 30 * 60,
                stale_check_interval_secs: 60,
                retry_ladder_ms: vec![20_000, 45_000, 120_000],
                poll_delay_ms: 12_000,
            },
            TaskKind::Page => Self {
                workers: 1,
                poll_interval_ms: 2_000,
                stale_after_secs: 10 * 60,
                stale_check_interval_secs: 30,
                retry_ladder_ms: vec![10_000, 30_000, 120_000],
                poll_delay_ms: 0,
            },
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after_secs = stale_after.as_secs();
        self
    }

    pub fn with_stale_check_interval(mut self, interval: Duration) -> Self {
        self.stale_check_interval_secs = interval.as_secs().max(1);
        self
    }

    pub fn with_retry_ladder(mut self, steps: &[Duration]) -> Self {
        self.retry_ladder_ms = steps.iter().map(|d| d.as_millis() as u64).collect();
        self
    }

    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn stale_check_interval(&self) -> Duration {
        Duration::from_secs(self.stale_check_interval_secs.max(1))
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_millis(self.poll_delay_ms)
    }

    pub fn retry_ladder(&self) -> RetryLadder {
        RetryLadder::new(
            self.retry_ladder_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
        )
    }
}
