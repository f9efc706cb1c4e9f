//! # Lifecycle Notifications
//!
//! Every submission produces `run_dispatched` followed by at most one of
//! `result_ready`, `failed` or `stopped`. The coordinator emits the terminal
//! event while it holds its gate, so sinks must not block.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use sca_core::JobId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    RunDispatched { job_id: JobId, at: DateTime<Utc> },
    ResultReady { job_id: JobId, at: DateTime<Utc> },
    Failed { job_id: JobId, message: String, at: DateTime<Utc> },
    Stopped { job_id: JobId, at: DateTime<Utc> },
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::RunDispatched { job_id, .. }
            | Self::ResultReady { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Stopped { job_id, .. } => *job_id,
        }
    }

    /// `true` for the events that close a submission.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::RunDispatched { .. })
    }
}

/// Where lifecycle events go. Only [`NotificationSink::publish`] is required.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, event: JobEvent);

    fn run_dispatched(&self, job_id: JobId) {
        self.publish(JobEvent::RunDispatched {
            job_id,
            at: Utc::now(),
        });
    }

    fn result_ready(&self, job_id: JobId) {
        self.publish(JobEvent::ResultReady {
            job_id,
            at: Utc::now(),
        });
    }

    fn failed(&self, job_id: JobId, message: &str) {
        self.publish(JobEvent::Failed {
            job_id,
            message: message.to_string(),
            at: Utc::now(),
        });
    }

    fn stopped(&self, job_id: JobId) {
        self.publish(JobEvent::Stopped {
            job_id,
            at: Utc::now(),
        });
    }
}

/// Broadcasts events to every subscriber (the `/ws` stream) and logs them.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl NotificationSink for EventBus {
    fn publish(&self, event: JobEvent) {
        match &event {
            JobEvent::RunDispatched { job_id, .. } => {
                tracing::info!(job_id = %job_id, "run dispatched")
            }
            JobEvent::ResultReady { job_id, .. } => {
                tracing::info!(job_id = %job_id, "result ready")
            }
            JobEvent::Failed {
                job_id, message, ..
            } => tracing::warn!(job_id = %job_id, %message, "job failed"),
            JobEvent::Stopped { job_id, .. } => tracing::info!(job_id = %job_id, "job stopped"),
        }
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
