//! Lifecycle events emitted by the worker pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a delivery was dropped without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// No handler is registered for the job name.
    UnknownHandler,
    /// A retry was requested but the attempt ceiling was reached.
    AttemptsExhausted,
    /// The handler returned without acknowledging or requesting a retry.
    NoDecision,
    /// The message body was not a job envelope.
    Undecodable,
    /// The handler panicked.
    HandlerPanicked,
    /// The retry could not be re-published.
    RetryPublishFailed,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::UnknownHandler => "unknown_handler",
            DropReason::AttemptsExhausted => "attempts_exhausted",
            DropReason::NoDecision => "no_decision",
            DropReason::Undecodable => "undecodable",
            DropReason::HandlerPanicked => "handler_panicked",
            DropReason::RetryPublishFailed => "retry_publish_failed",
        }
    }
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the worker pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    /// A worker opened its session and began consuming.
    WorkerStarted {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A worker stopped consuming.
    WorkerStopped {
        worker_id: String,
        timestamp: DateTime<Utc>,
    },
    /// A job was delivered to a worker.
    JobReceived {
        worker_id: String,
        name: String,
        tries: u32,
        correlation_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// The handler settled the delivery without asking for a retry.
    JobCompleted {
        worker_id: String,
        name: String,
        tries: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// The job was re-published for another attempt.
    JobRetrying {
        worker_id: String,
        name: String,
        /// Value of `tries` on the re-published envelope.
        tries: u32,
        correlation_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// The delivery was rejected without requeue.
    JobDropped {
        worker_id: String,
        name: Option<String>,
        tries: u32,
        reason: DropReason,
        errors: Vec<String>,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            JobEvent::WorkerStarted { timestamp, .. }
            | JobEvent::WorkerStopped { timestamp, .. }
            | JobEvent::JobReceived { timestamp, .. }
            | JobEvent::JobCompleted { timestamp, .. }
            | JobEvent::JobRetrying { timestamp, .. }
            | JobEvent::JobDropped { timestamp, .. } => *timestamp,
        }
    }

    pub fn worker_id(&self) -> &str {
        match self {
            JobEvent::WorkerStarted { worker_id, .. }
            | JobEvent::WorkerStopped { worker_id, .. }
            | JobEvent::JobReceived { worker_id, .. }
            | JobEvent::JobCompleted { worker_id, .. }
            | JobEvent::JobRetrying { worker_id, .. }
            | JobEvent::JobDropped { worker_id, .. } => worker_id,
        }
    }

    /// Short description for logging.
    pub fn description(&self) -> String {
        match self {
            JobEvent::WorkerStarted { worker_id, .. } => format!("Worker {} started", worker_id),
            JobEvent::WorkerStopped { worker_id, .. } => format!("Worker {} stopped", worker_id),
            JobEvent::JobReceived {
                worker_id,
                name,
                tries,
                ..
            } => format!("[{}] got {} (tries {})", worker_id, name, tries),
            JobEvent::JobCompleted {
                worker_id,
                name,
                duration_ms,
                ..
            } => format!("[{}] finished {} in {}ms", worker_id, name, duration_ms),
            JobEvent::JobRetrying {
                worker_id,
                name,
                tries,
                ..
            } => format!("[{}] retrying {} (tries {})", worker_id, name, tries),
            JobEvent::JobDropped {
                worker_id,
                name,
                reason,
                ..
            } => format!(
                "[{}] dropped {}: {}",
                worker_id,
                name.as_deref().unwrap_or("<undecodable>"),
                reason
            ),
        }
    }
}
