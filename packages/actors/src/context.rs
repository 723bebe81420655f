//! Per-delivery handler context.

use std::sync::Arc;

use broker::{BrokerError, Delivery, MessageProperties, OutboundMessage, Session};
use relay_core::{HandlerError, Job};

/// Everything a handler needs to settle one delivery.
///
/// The handler owns the acknowledgement contract: on success it calls
/// [`complete`](Self::complete) (ack, then reply); on failure it records an
/// error, which requests a retry when the error is recoverable. The worker
/// inspects the job once the handler returns.
pub struct JobContext {
    job: Job,
    delivery: Delivery,
    session: Arc<dyn Session>,
    worker_id: String,
}

impl JobContext {
    pub fn new(
        job: Job,
        delivery: Delivery,
        session: Arc<dyn Session>,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            job,
            delivery,
            session,
            worker_id: worker_id.into(),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> Result<T, HandlerError> {
        self.job.decode_payload()
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.delivery.ack().await
    }

    /// Publish the empty completion reply to the caller's reply queue.
    ///
    /// Jobs published without a reply destination are fire-and-forget.
    pub async fn send_reply(&self) -> Result<(), BrokerError> {
        let Some(reply_to) = self.job.reply_to() else {
            tracing::debug!("[{}] {} has no reply destination", self.worker_id, self.job.name);
            return Ok(());
        };

        let mut properties = MessageProperties::default();
        if let Some(correlation_id) = self.job.correlation_id() {
            properties = properties.with_correlation_id(correlation_id.as_str());
        }
        self.session
            .publish("", reply_to, OutboundMessage::new(Vec::new(), properties))
            .await
    }

    /// Acknowledge the delivery, then reply. Failures are recorded on the job.
    pub async fn complete(&mut self) {
        if let Err(e) = self.ack().await {
            self.add_error(HandlerError::Unrecoverable(format!("ack failed: {}", e)));
            return;
        }
        if let Err(e) = self.send_reply().await {
            self.add_error(HandlerError::Unrecoverable(format!("reply failed: {}", e)));
        }
    }

    /// Ask for another attempt without recording an error.
    pub fn retry(&mut self) {
        self.job.retry();
    }

    pub fn add_error(&mut self, error: HandlerError) {
        tracing::debug!("[{}] {} error: {}", self.worker_id, self.job.name, error);
        self.job.add_error(&error);
    }

    pub(crate) fn into_parts(self) -> (Job, Delivery) {
        (self.job, self.delivery)
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("worker_id", &self.worker_id)
            .field("job", &self.job)
            .field("delivery", &self.delivery)
            .finish()
    }
}
