//! Worker pool polling one task queue.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::outcome::{INTERNAL_ERROR_MESSAGE, Outcome, panic_message, record_terminal};
use super::store::{ClaimedTask, TaskStore};
use crate::Result;
use crate::database::models::{Claim, TaskKind};

/// Executes claimed tasks of one kind.
///
/// `process` must write back exactly one outcome through the store. If it
/// panics, the pool calls `recover` with the claim instead.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    type Store: TaskStore;

    fn store(&self) -> &Self::Store;

    async fn process(&self, task: <Self::Store as TaskStore>::Task) -> Outcome;

    /// Fail a task whose execution died without writing an outcome.
    async fn recover(&self, claim: &Claim, message: &str) -> Outcome {
        record_terminal(self.store(), claim, message).await
    }
}

/// Claim one task and execute it. Returns `false` when nothing was due.
pub async fn run_once<H: TaskHandler>(handler: &Arc<H>) -> Result<bool> {
    let Some(task) = handler.store().claim_next().await? else {
        return Ok(false);
    };
    execute(handler, task).await;
    Ok(true)
}

/// Run `process` on its own task so a panic is contained and converted into a
/// terminal failure.
pub async fn execute<H: TaskHandler>(
    handler: &Arc<H>,
    task: <H::Store as TaskStore>::Task,
) -> Outcome {
    let claim = task.claim();
    let kind = handler.store().kind();
    debug!(kind = kind.label(), task_id = %claim.id, attempts = claim.attempts, "Processing task");

    let worker = Arc::clone(handler);
    match tokio::spawn(async move { worker.process(task).await }).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            error!(
                kind = kind.label(),
                task_id = %claim.id,
                panic = %panic_message(e.into_panic().as_ref()),
                "Task execution panicked"
            );
            handler.recover(&claim, INTERNAL_ERROR_MESSAGE).await
        }
        Err(e) => {
            warn!(kind = kind.label(), task_id = %claim.id, error = %e, "Task execution aborted");
            handler.recover(&claim, INTERNAL_ERROR_MESSAGE).await
        }
    }
}

/// Fixed set of workers polling one queue.
pub struct WorkerPool {
    kind: TaskKind,
    workers: usize,
    poll_interval: Duration,
    /// Tasks currently being executed.
    active: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(kind: TaskKind, workers: usize, poll_interval: Duration) -> Self {
        Self {
            kind,
            workers: workers.max(1),
            poll_interval,
            active: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Spawn the workers.
    pub fn start<H: TaskHandler>(&self, handler: Arc<H>) {
        let kind = self.kind;
        info!(
            "Starting {} worker pool with {} workers",
            kind.label(),
            self.workers
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("{} worker pool already stopped", kind.label());
            return;
        };
        for i in 0..self.workers {
            let handler = handler.clone();
            let cancellation_token = self.cancellation_token.clone();
            let active = self.active.clone();
            let poll_interval = self.poll_interval;

            join_set.spawn(async move {
                debug!("{} worker {} started", kind.label(), i);

                while !cancellation_token.is_cancelled() {
                    let had_work = match handler.store().claim_next().await {
                        Ok(Some(task)) => {
                            active.fetch_add(1, Ordering::SeqCst);
                            execute(&handler, task).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            true
                        }
                        Ok(None) => false,
                        Err(e) => {
                            error!("{} worker {} failed to claim a task: {}", kind.label(), i, e);
                            false
                        }
                    };

                    // Drain back to back while work is available.
                    if had_work {
                        continue;
                    }

                    tokio::select! {
                        _ = cancellation_token.cancelled() => break,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }

                debug!("{} worker {} shutting down", kind.label(), i);
            });
        }
    }

    /// Stop polling and wait for in-flight tasks to finish.
    pub async fn stop(&self) {
        info!("Stopping {} worker pool", self.kind.label());
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("{} worker pool stopped", self.kind.label());
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}
