//! Shared fixtures for saxscore-worker integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use saxscore_common::db;
use saxscore_common::events::{EventBus, JobEvent};
use saxscore_common::models::Job;
use saxscore_common::{Instrument, JobStatus};
use saxscore_worker::admission;
use saxscore_worker::backend::{AnalysisBackend, StubBackend};
use saxscore_worker::pipeline::{set_status, Orchestrator, PipelineConfig};
use saxscore_worker::queue::JobQueue;
use saxscore_worker::transpose::Transposer;
use saxscore_worker::worker::Worker;
use saxscore_worker::AppState;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Throwaway database, queue and event bus around a stub backend
pub struct Harness {
    _dir: TempDir,
    pub db: SqlitePool,
    pub queue: Arc<JobQueue>,
    pub events: EventBus,
    pub stub: Arc<StubBackend>,
    pub config: PipelineConfig,
}

impl Harness {
    pub async fn new(stub: StubBackend) -> Self {
        Self::with_config(stub, PipelineConfig::default()).await
    }

    pub async fn with_config(stub: StubBackend, config: PipelineConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let db = db::init_database_pool(&dir.path().join("saxscore.db")).await.unwrap();
        Self {
            _dir: dir,
            db,
            queue: Arc::new(JobQueue::new()),
            events: EventBus::new(256),
            stub: Arc::new(stub),
            config,
        }
    }

    pub fn backend(&self) -> Arc<dyn AnalysisBackend> {
        self.stub.clone()
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.db.clone(), self.backend(), self.events.clone(), self.config.clone())
    }

    pub fn worker(&self) -> Worker {
        Worker::new(self.db.clone(), Arc::clone(&self.queue), self.events.clone(), self.orchestrator())
            .with_idle_interval(Duration::from_millis(10))
    }

    pub fn transposer(&self) -> Transposer {
        Transposer::new(self.db.clone(), self.backend(), self.events.clone())
    }

    pub fn app_state(&self) -> AppState {
        AppState::new(self.db.clone(), Arc::clone(&self.queue), self.events.clone(), self.transposer())
    }

    /// Admit a job with a few bytes of fake audio
    pub async fn admit(&self, hint: Instrument) -> Job {
        admission::admit(&self.db, &self.queue, "solo.wav", hint, b"RIFF\0\0\0\0WAVEfmt ".to_vec())
            .await
            .unwrap()
    }

    /// Admit a job and claim it the way the worker does, without enqueueing
    pub async fn claimed_job(&self, hint: Instrument) -> Job {
        let job = self.admit(hint).await;
        assert_eq!(self.queue.try_dequeue(), Some(job.id));
        assert!(set_status(&self.db, &self.events, job.id, JobStatus::Queued, JobStatus::Processing)
            .await
            .unwrap());
        self.load(job.id).await
    }

    pub async fn load(&self, job_id: Uuid) -> Job {
        db::jobs::load_job(&self.db, job_id).await.unwrap().unwrap()
    }

    pub async fn status(&self, job_id: Uuid) -> JobStatus {
        self.load(job_id).await.status
    }
}

/// Everything already buffered on `rx`
pub fn drain(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Wait until `job_id` reaches `status`, or panic after `limit`
pub async fn wait_for_status(rx: &mut broadcast::Receiver<JobEvent>, job_id: Uuid, status: JobStatus, limit: Duration) {
    tokio::time::timeout(limit, async {
        loop {
            match rx.recv().await {
                Ok(JobEvent::StatusChanged { job_id: id, new_status, .. }) if id == job_id && new_status == status => {
                    return;
                }
                Ok(_) => {}
                Err(e) => panic!("event bus closed: {}", e),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {} did not reach {} within {:?}", job_id, status, limit));
}
