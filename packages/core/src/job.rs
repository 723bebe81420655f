//! Job envelope: the unit of work carried over the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Default number of attempts a job gets before it is dropped.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Content type of an encoded job envelope.
pub const JOB_CONTENT_TYPE: &str = "application/json";

/// Token linking a published job to its reply.
///
/// A fresh ULID per dispatch; the random component makes collisions between
/// outstanding calls practically impossible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new random correlation token.
    pub fn new() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Wrap a token received from the wire.
    pub fn from_wire(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A failure recorded while executing a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
    /// Whether the failure can be retried.
    pub recoverable: bool,
    pub at: DateTime<Utc>,
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = if self.recoverable { "recoverable" } else { "fatal" };
        write!(f, "[{}] {} ({})", self.at.format("%H:%M:%S%.3f"), self.message, kind)
    }
}

/// Error raised by a handler while processing a job.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Worth another attempt.
    #[error("recoverable: {0}")]
    Recoverable(String),
    /// Retrying cannot help.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl HandlerError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, HandlerError::Recoverable(_))
    }
}

/// Failure to decode an envelope from a message body.
#[derive(Debug, thiserror::Error)]
#[error("invalid job envelope: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// The serializable unit of dispatched work.
///
/// Only `name`, `payload` and `tries` travel in the message body. The
/// correlation token and reply destination ride on message properties, and
/// the error list and retry flag live only inside the worker handling it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Name of the handler that runs this job.
    pub name: String,
    /// Handler-specific request, decoded only by the matched handler.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Number of completed retry cycles.
    #[serde(default)]
    pub tries: u32,
    #[serde(skip)]
    correlation_id: Option<CorrelationId>,
    #[serde(skip)]
    reply_to: Option<String>,
    #[serde(skip)]
    errors: Vec<JobFailure>,
    #[serde(skip)]
    retry_requested: bool,
}

impl Job {
    /// Create a fresh job for the named handler.
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            tries: 0,
            correlation_id: None,
            reply_to: None,
            errors: Vec::new(),
            retry_requested: false,
        }
    }

    /// Attach the caller's reply identifiers.
    pub fn with_reply(
        mut self,
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
    ) -> Self {
        self.correlation_id = Some(correlation_id);
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation_id.as_ref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Decode the payload into the handler's request type.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            HandlerError::Unrecoverable(format!("invalid payload for {}: {}", self.name, e))
        })
    }

    /// Ask the worker pool to run this job again.
    pub fn retry(&mut self) {
        self.retry_requested = true;
    }

    pub fn retry_requested(&self) -> bool {
        self.retry_requested
    }

    /// Whether a requested retry still fits under the attempt ceiling.
    pub fn should_retry(&self, max_attempts: u32) -> bool {
        self.retry_requested && self.tries.saturating_add(1) < max_attempts
    }

    pub fn increment_tries(&mut self) {
        self.tries = self.tries.saturating_add(1);
    }

    /// Record a failure. Recoverable failures also request a retry.
    pub fn add_error(&mut self, error: &HandlerError) {
        if error.is_recoverable() {
            self.retry();
        }
        let message = match error {
            HandlerError::Recoverable(m) | HandlerError::Unrecoverable(m) => m.clone(),
        };
        self.errors.push(JobFailure {
            message,
            recoverable: error.is_recoverable(),
            at: Utc::now(),
        });
    }

    pub fn errors(&self) -> &[JobFailure] {
        &self.errors
    }

    /// Build the envelope for the next attempt.
    ///
    /// The retry keeps the caller's identifiers so the waiting dispatcher
    /// can still match the eventual reply.
    pub fn next_attempt(&self) -> Job {
        Job {
            name: self.name.clone(),
            payload: self.payload.clone(),
            tries: self.tries.saturating_add(1),
            correlation_id: self.correlation_id.clone(),
            reply_to: self.reply_to.clone(),
            errors: Vec::new(),
            retry_requested: false,
        }
    }

    /// Encode the wire body.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a wire body; identifiers are taken from message properties.
    pub fn decode(
        body: &[u8],
        correlation_id: Option<&str>,
        reply_to: Option<&str>,
    ) -> Result<Job, DecodeError> {
        let mut job: Job = serde_json::from_slice(body)?;
        job.correlation_id = correlation_id.map(CorrelationId::from_wire);
        job.reply_to = reply_to.map(str::to_string);
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use serde_json::json;

    #[test]
    fn wire_body_carries_only_name_payload_and_tries() {
        let job = Job::new("Echo", json!({"a": 1})).with_reply(CorrelationId::new(), "amq.gen-1");
        let body: serde_json::Value = serde_json::from_slice(&job.encode().unwrap()).unwrap();
        assert_eq!(body, json!({"name": "Echo", "payload": {"a": 1}, "tries": 0}));
    }

    #[test]
    fn decode_takes_identifiers_from_properties() {
        let body = br#"{"name":"Echo","payload":{}}"#;
        let job = Job::decode(body, Some("abc"), Some("reply-q")).unwrap();
        assert_eq!(job.tries, 0);
        assert_eq!(job.correlation_id().map(CorrelationId::as_str), Some("abc"));
        assert_eq!(job.reply_to(), Some("reply-q"));
        assert!(job.errors().is_empty());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Job::decode(b"not json", None, None).is_err());
    }

    #[test]
    fn retry_ceiling_allows_two_attempts() {
        let mut first = Job::new("Convert", json!(null));
        assert!(!first.should_retry(DEFAULT_MAX_ATTEMPTS));

        first.retry();
        assert!(first.should_retry(DEFAULT_MAX_ATTEMPTS));

        let mut second = first.next_attempt();
        assert_eq!(second.tries, 1);
        assert!(!second.retry_requested());

        second.retry();
        assert!(!second.should_retry(DEFAULT_MAX_ATTEMPTS));
    }

    #[test]
    fn next_attempt_preserves_reply_identifiers() {
        let corr = CorrelationId::new();
        let job = Job::new("Convert", json!({"id": "x"})).with_reply(corr.clone(), "reply-q");
        let next = job.next_attempt();
        assert_eq!(next.correlation_id(), Some(&corr));
        assert_eq!(next.reply_to(), Some("reply-q"));
        assert_eq!(next.payload, job.payload);
    }

    #[test]
    fn recoverable_errors_request_retry() {
        let mut job = Job::new("Convert", json!(null));
        job.add_error(&HandlerError::Unrecoverable("bad input".into()));
        assert!(!job.retry_requested());

        job.add_error(&HandlerError::Recoverable("store down".into()));
        assert!(job.retry_requested());
        assert_eq!(job.errors().len(), 2);
        assert!(!job.errors()[0].recoverable);
    }

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }
}
