//! Provider-agnostic broker capabilities.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::BrokerError;
use crate::types::{ConsumeOptions, DeliveryStream, OutboundMessage, QueueOptions};

/// A connection to a message broker that hands out sessions.
///
/// A session maps to one AMQP channel. Sessions are cheap; the dispatcher
/// opens one per call and each worker holds one for its lifetime.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    async fn open_session(&self) -> Result<Arc<dyn Session>, BrokerError>;

    /// Provider name for logging.
    fn provider_name(&self) -> &'static str;
}

/// One logical channel on a broker connection.
///
/// Closing a session (explicitly or by dropping it) cancels its consumers,
/// returns its unacknowledged deliveries to their queues and deletes the
/// exclusive queues it declared.
#[async_trait]
pub trait Session: Send + Sync {
    /// Declare a direct exchange. Idempotent for identical arguments.
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError>;

    /// Declare a queue and return its name. An empty `name` asks the broker
    /// to generate a unique one.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Maximum number of unacknowledged deliveries per consumer on this session.
    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError>;

    /// Publish a message. The empty exchange routes straight to the queue
    /// named by `routing_key`; messages that route nowhere are discarded.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError>;

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    fn is_open(&self) -> bool;
}
