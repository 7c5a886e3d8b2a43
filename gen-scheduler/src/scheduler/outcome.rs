//! Write-back of task outcomes.
//!
//! Every claimed task ends in exactly one of: success, scheduled retry, or
//! terminal failure. All three writes are fenced on the claim, so a worker
//! whose claim was superseded by a stale requeue observes `Superseded` and
//! leaves the row alone.

use std::any::Any;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::config::RetryLadder;
use super::store::TaskStore;
use crate::Error;
use crate::database::models::Claim;

/// Longest error text persisted with a task.
pub const MAX_ERROR_CHARS: usize = 240;

/// Stored when a claim arrives with the retry budget already spent.
pub const RETRY_LIMIT_MESSAGE: &str = "retry limit reached";

/// Stored when execution panicked or was aborted.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error during generation";

/// Trim an error for persistence: bounded length, never empty.
pub fn sanitize_error(message: &str) -> String {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return "unknown error".to_string();
    }
    if trimmed.chars().count() <= MAX_ERROR_CHARS {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(MAX_ERROR_CHARS).collect();
    cut.push_str("...");
    cut
}

/// User-facing text of an execution error.
pub fn failure_message(err: &Error) -> String {
    match err {
        Error::Generation(e) => sanitize_error(&e.to_string()),
        other => sanitize_error(&other.to_string()),
    }
}

/// Best-effort text of a panic payload, for logs only.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    Retry { delay: Duration },
    Fail,
}

/// Retry only retryable errors, and only while attempts remain.
pub fn classify_failure(
    retryable: bool,
    attempts: i64,
    max_attempts: i64,
    ladder: &RetryLadder,
) -> FailureAction {
    if retryable && attempts < max_attempts {
        FailureAction::Retry {
            delay: ladder.delay_for_attempt(attempts),
        }
    } else {
        FailureAction::Fail
    }
}

/// The write that ended an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Retrying { delay: Duration },
    Failed,
    /// The claim no longer matched; a newer execution owns the row.
    Superseded,
    /// The store rejected every write; the reaper will requeue the row.
    Unrecorded,
}

impl Outcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Persist a success. If the write itself fails, try to fail the task so it
/// does not sit in RUNNING until the reaper finds it.
pub async fn record_success<S: TaskStore + ?Sized>(
    store: &S,
    claim: &Claim,
    media: &[String],
) -> Outcome {
    let kind = store.kind();
    match store.complete(claim, media).await {
        Ok(true) => {
            info!(
                kind = kind.label(),
                task_id = %claim.id,
                attempts = claim.attempts,
                "Task succeeded"
            );
            Outcome::Succeeded
        }
        Ok(false) => {
            debug!(kind = kind.label(), task_id = %claim.id, "Claim superseded, result dropped");
            Outcome::Superseded
        }
        Err(e) => {
            error!(kind = kind.label(), task_id = %claim.id, error = %e, "Failed to persist result");
            let fallback = format!("failed to persist {} result", kind.label());
            record_terminal(store, claim, &fallback).await
        }
    }
}

/// Persist a terminal failure.
pub async fn record_terminal<S: TaskStore + ?Sized>(
    store: &S,
    claim: &Claim,
    message: &str,
) -> Outcome {
    let kind = store.kind();
    let message = sanitize_error(message);
    match store.fail_terminal(claim, &message).await {
        Ok(true) => {
            warn!(
                kind = kind.label(),
                task_id = %claim.id,
                attempts = claim.attempts,
                error = %message,
                "Task failed"
            );
            Outcome::Failed
        }
        Ok(false) => {
            debug!(kind = kind.label(), task_id = %claim.id, "Claim superseded, failure dropped");
            Outcome::Superseded
        }
        Err(e) => {
            error!(kind = kind.label(), task_id = %claim.id, error = %e, "Failed to persist failure");
            Outcome::Unrecorded
        }
    }
}

/// Persist a failed attempt as either a scheduled retry or a terminal failure.
pub async fn record_failure<S: TaskStore + ?Sized>(
    store: &S,
    claim: &Claim,
    round_attempts: i64,
    max_attempts: i64,
    ladder: &RetryLadder,
    err: &Error,
) -> Outcome {
    let kind = store.kind();
    let message = failure_message(err);
    match classify_failure(err.is_retryable(), round_attempts, max_attempts, ladder) {
        FailureAction::Retry { delay } => {
            match store.schedule_retry(claim, delay, &message).await {
                Ok(true) => {
                    info!(
                        kind = kind.label(),
                        task_id = %claim.id,
                        attempts = round_attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Task scheduled for retry"
                    );
                    Outcome::Retrying { delay }
                }
                Ok(false) => Outcome::Superseded,
                Err(e) => {
                    error!(kind = kind.label(), task_id = %claim.id, error = %e, "Failed to schedule retry");
                    Outcome::Unrecorded
                }
            }
        }
        FailureAction::Fail => record_terminal(store, claim, &message).await,
    }
}
