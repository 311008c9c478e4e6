//! Job lifecycle events
//!
//! The worker publishes an event for every status change, stage boundary and
//! persisted artifact. Subscribers (tests, future SSE endpoints) receive only
//! events emitted after they subscribe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::JobStatus;

/// Pipeline stage names as they appear in events and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Separation,
    Detection,
    Export,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Separation => "separation",
            Stage::Detection => "detection",
            Stage::Export => "export",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    /// Job status persisted with a new value
    StatusChanged {
        job_id: Uuid,
        old_status: JobStatus,
        new_status: JobStatus,
        timestamp: DateTime<Utc>,
    },

    /// Stage began for a pipeline run
    StageStarted {
        job_id: Uuid,
        run_id: Uuid,
        stage: Stage,
        timestamp: DateTime<Utc>,
    },

    /// Stage committed its results
    StageCompleted {
        job_id: Uuid,
        run_id: Uuid,
        stage: Stage,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Stage failed; no later stage runs
    StageFailed {
        job_id: Uuid,
        run_id: Uuid,
        stage: Stage,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Export artifact persisted (pipeline or transpose)
    ArtifactCreated {
        job_id: Uuid,
        format: String,
        size_bytes: usize,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::StatusChanged { job_id, .. }
            | JobEvent::StageStarted { job_id, .. }
            | JobEvent::StageCompleted { job_id, .. }
            | JobEvent::StageFailed { job_id, .. }
            | JobEvent::ArtifactCreated { job_id, .. } => *job_id,
        }
    }
}

/// Broadcast bus for [`JobEvent`]s
///
/// Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: JobEvent) -> Result<usize, broadcast::error::SendError<JobEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let job_id = Uuid::new_v4();

        bus.emit_lossy(JobEvent::StatusChanged {
            job_id,
            old_status: JobStatus::Queued,
            new_status: JobStatus::Processing,
            timestamp: Utc::now(),
        });
        bus.emit_lossy(JobEvent::StatusChanged {
            job_id,
            old_status: JobStatus::Processing,
            new_status: JobStatus::Done,
            timestamp: Utc::now(),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, JobEvent::StatusChanged { new_status: JobStatus::Processing, .. }));
        assert!(matches!(second, JobEvent::StatusChanged { new_status: JobStatus::Done, .. }));
        assert_eq!(second.job_id(), job_id);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 4);

        let event = JobEvent::ArtifactCreated {
            job_id: Uuid::new_v4(),
            format: "json".to_string(),
            size_bytes: 2,
            timestamp: Utc::now(),
        };
        assert!(bus.emit(event.clone()).is_err());
        bus.emit_lossy(event);
    }
}
