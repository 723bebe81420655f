//! Publish-and-wait RPC over the broker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use broker::{
    Broker, BrokerError, ConsumeOptions, DeliveryMode, DeliveryStream, MessageProperties,
    OutboundMessage, QueueOptions, Session, Topology,
};
use futures_util::StreamExt;
use relay_core::{CorrelationId, JOB_CONTENT_TYPE, Job, RelayConfig};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no reply for {correlation_id} within {waited:?}")]
    Timeout {
        correlation_id: CorrelationId,
        waited: Duration,
    },

    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to publish job: {0}")]
    Publish(#[source] BrokerError),

    #[error("broker error: {0}")]
    Broker(#[source] BrokerError),

    #[error("reply stream closed before a reply arrived")]
    ReplyStreamClosed,
}

impl DispatchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DispatchError::Timeout { .. })
    }
}

/// A matched completion reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub correlation_id: CorrelationId,
    /// Time from publish to reply.
    pub elapsed: Duration,
}

/// Sends a job to the worker pool and waits for its reply.
///
/// Every call runs on its own session with its own server-named reply
/// queue, so concurrent calls cannot see each other's replies. The session
/// is closed on every exit path; dropping the future closes it too.
#[derive(Clone)]
pub struct Dispatcher {
    broker: Arc<dyn Broker>,
    topology: Topology,
    reply_timeout: Duration,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("broker", &self.broker.provider_name())
            .field("topology", &self.topology)
            .field("reply_timeout", &self.reply_timeout)
            .finish()
    }
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn Broker>, topology: Topology, reply_timeout: Duration) -> Self {
        Self {
            broker,
            topology,
            reply_timeout,
        }
    }

    pub fn from_config(broker: Arc<dyn Broker>, config: &RelayConfig) -> Self {
        Self::new(broker, Topology::from_config(config), config.reply_timeout())
    }

    pub fn reply_timeout(&self) -> Duration {
        self.reply_timeout
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Publish `job` and block until a worker replies or the timeout elapses.
    pub async fn dispatch(&self, job: Job) -> Result<Reply, DispatchError> {
        let session = self.broker.open_session().await.map_err(DispatchError::Broker)?;
        let result = self.call(session.as_ref(), job).await;
        if let Err(e) = session.close().await {
            tracing::debug!("Failed to close dispatch session: {}", e);
        }
        result
    }

    async fn call(&self, session: &dyn Session, job: Job) -> Result<Reply, DispatchError> {
        let reply_queue = session
            .declare_queue("", QueueOptions::ephemeral())
            .await
            .map_err(DispatchError::Broker)?;
        let mut replies = session
            .consume(&reply_queue, ConsumeOptions { auto_ack: true })
            .await
            .map_err(DispatchError::Broker)?;

        let correlation_id = CorrelationId::new();
        let job = job.with_reply(correlation_id.clone(), reply_queue.clone());
        let properties = MessageProperties::default()
            .with_content_type(JOB_CONTENT_TYPE)
            .with_correlation_id(correlation_id.as_str())
            .with_reply_to(reply_queue)
            .with_delivery_mode(DeliveryMode::Persistent);

        let started = Instant::now();
        session
            .publish(
                &self.topology.exchange,
                &self.topology.routing_key,
                OutboundMessage::new(job.encode()?, properties),
            )
            .await
            .map_err(DispatchError::Publish)?;
        tracing::debug!("Dispatched {} as {}", job.name, correlation_id);

        let reply = await_reply(&mut replies, &correlation_id);
        match tokio::time::timeout(self.reply_timeout, reply).await {
            Ok(Ok(())) => {
                let elapsed = started.elapsed();
                tracing::debug!("{} {} replied in {:?}", job.name, correlation_id, elapsed);
                Ok(Reply {
                    correlation_id,
                    elapsed,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(
                    "{} {} timed out after {:?}",
                    job.name,
                    correlation_id,
                    self.reply_timeout
                );
                Err(DispatchError::Timeout {
                    correlation_id,
                    waited: self.reply_timeout,
                })
            }
        }
    }
}

async fn await_reply(
    replies: &mut DeliveryStream,
    expected: &CorrelationId,
) -> Result<(), DispatchError> {
    while let Some(item) = replies.next().await {
        let delivery = item.map_err(DispatchError::Broker)?;
        match delivery.properties.correlation_id.as_deref() {
            Some(id) if id == expected.as_str() => return Ok(()),
            other => tracing::warn!("Ignoring reply for {:?} while waiting on {}", other, expected),
        }
    }
    Err(DispatchError::ReplyStreamClosed)
}
