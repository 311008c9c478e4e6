//! Background worker loop
//!
//! One task drains the [`JobQueue`] for the life of the process. Jobs run
//! one at a time, in dequeue order. The loop exits only when its
//! cancellation token fires; store and pipeline errors are logged and the
//! loop moves on. A panic inside a run is contained the same way and the
//! job is marked `error`.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use saxscore_common::db;
use saxscore_common::events::EventBus;
use saxscore_common::JobStatus;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::pipeline::{set_status, Orchestrator};
use crate::queue::JobQueue;

/// Default sleep between polls of an empty queue
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(500);

/// Outcome of one loop iteration, for logs and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Idle,
    /// Job id not found in the store
    Missing(Uuid),
    /// Job was not `queued` when dequeued
    Skipped(Uuid),
    Finished(Uuid, JobStatus),
    /// Cancelled before the claim; the job stays `queued` for the next start
    Deferred(Uuid),
    /// The job left `processing` during the run without this worker moving it
    Superseded(Uuid),
    /// Store failure while loading, claiming or recording the outcome
    StoreError(Uuid),
}

pub struct Worker {
    db: SqlitePool,
    queue: Arc<JobQueue>,
    events: EventBus,
    orchestrator: Orchestrator,
    idle_interval: Duration,
}

/// Running worker task
pub struct WorkerHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel the loop and wait for it to exit
    ///
    /// A backend call already in flight finishes first.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "Worker task ended abnormally");
        }
    }
}

impl Worker {
    pub fn new(db: SqlitePool, queue: Arc<JobQueue>, events: EventBus, orchestrator: Orchestrator) -> Self {
        Self {
            db,
            queue,
            events,
            orchestrator,
            idle_interval: DEFAULT_IDLE_INTERVAL,
        }
    }

    pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    /// Start the loop on the runtime
    pub fn spawn(self) -> WorkerHandle {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let join = tokio::spawn(async move { self.run(loop_token).await });
        WorkerHandle { token, join }
    }

    /// Drain the queue until `cancel_token` fires
    pub async fn run(self, cancel_token: CancellationToken) {
        tracing::info!(
            idle_interval_ms = self.idle_interval.as_millis() as u64,
            pending = self.queue.len(),
            "Worker started"
        );

        while !cancel_token.is_cancelled() {
            if self.tick(&cancel_token).await == Tick::Idle {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = tokio::time::sleep(self.idle_interval) => {}
                }
            }
        }

        tracing::info!(pending = self.queue.len(), "Worker stopped");
    }

    /// One iteration: take at most one job and run it to a terminal status
    pub async fn tick(&self, cancel_token: &CancellationToken) -> Tick {
        let Some(job_id) = self.queue.try_dequeue() else {
            return Tick::Idle;
        };

        let job = match db::jobs::load_job(&self.db, job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::debug!(job_id = %job_id, "Dequeued job no longer exists, skipping");
                return Tick::Missing(job_id);
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
                return Tick::StoreError(job_id);
            }
        };

        if job.status != JobStatus::Queued {
            tracing::warn!(job_id = %job_id, status = %job.status, "Dequeued job is not queued, skipping");
            return Tick::Skipped(job_id);
        }

        if cancel_token.is_cancelled() {
            tracing::info!(job_id = %job_id, "Shutdown requested, leaving job queued");
            return Tick::Deferred(job_id);
        }

        match set_status(&self.db, &self.events, job_id, JobStatus::Queued, JobStatus::Processing).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(job_id = %job_id, "Job left queued status before it was claimed, skipping");
                return Tick::Skipped(job_id);
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to mark job processing");
                return Tick::StoreError(job_id);
            }
        }

        let run = AssertUnwindSafe(self.orchestrator.run(&job, cancel_token))
            .catch_unwind()
            .await;

        match run {
            Ok(Ok(outcome)) => {
                tracing::info!(
                    job_id = %job_id,
                    run_id = %outcome.run_id,
                    notes = outcome.note_count,
                    elapsed_ms = outcome.elapsed_ms,
                    "Job done"
                );
                Tick::Finished(job_id, JobStatus::Done)
            }
            Ok(Err(e)) => {
                tracing::error!(job_id = %job_id, error = %e, "Job failed");
                self.mark_error(job_id).await
            }
            Err(panic) => {
                tracing::error!(job_id = %job_id, panic = panic_message(&*panic), "Pipeline run panicked");
                self.mark_error(job_id).await
            }
        }
    }

    async fn mark_error(&self, job_id: Uuid) -> Tick {
        match set_status(&self.db, &self.events, job_id, JobStatus::Processing, JobStatus::Error).await {
            Ok(true) => Tick::Finished(job_id, JobStatus::Error),
            Ok(false) => {
                tracing::warn!(job_id = %job_id, "Job was not processing when marking error");
                Tick::Superseded(job_id)
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to mark job error");
                Tick::StoreError(job_id)
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Restore queue state after a restart
///
/// Jobs still `queued` are re-enqueued oldest first. Jobs left
/// `processing` by a previous process cannot resume and are marked `error`.
pub async fn recover(pool: &SqlitePool, queue: &JobQueue, events: &EventBus) -> saxscore_common::Result<RecoveryReport> {
    let mut report = RecoveryReport::default();

    for job_id in db::jobs::job_ids_with_status(pool, JobStatus::Processing).await? {
        if set_status(pool, events, job_id, JobStatus::Processing, JobStatus::Error).await? {
            tracing::warn!(job_id = %job_id, "Marked interrupted job as error");
            report.interrupted += 1;
        }
    }

    for job_id in db::jobs::job_ids_with_status(pool, JobStatus::Queued).await? {
        queue.enqueue(job_id);
        report.requeued += 1;
    }

    if report.requeued > 0 || report.interrupted > 0 {
        tracing::info!(requeued = report.requeued, interrupted = report.interrupted, "Recovered jobs from store");
    }
    Ok(report)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub requeued: usize,
    pub interrupted: usize,
}
