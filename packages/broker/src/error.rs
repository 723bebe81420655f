//! Broker error types.

/// Errors raised by broker providers.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("failed to declare {entity} '{name}': {reason}")]
    Declare {
        entity: &'static str,
        name: String,
        reason: String,
    },

    #[error("failed to bind queue '{queue}' to '{exchange}': {reason}")]
    Bind {
        queue: String,
        exchange: String,
        reason: String,
    },

    #[error("publish to '{exchange}' with key '{routing_key}' failed: {reason}")]
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },

    #[error("consume from '{queue}' failed: {reason}")]
    Consume { queue: String, reason: String },

    #[error("acknowledgement failed: {0}")]
    Acknowledge(String),

    #[error("delivery already settled")]
    AlreadySettled,

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("queue '{0}' is exclusive to another session")]
    ResourceLocked(String),

    #[error("session closed")]
    Closed,
}

impl BrokerError {
    pub fn declare(entity: &'static str, name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Declare {
            entity,
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn publish(exchange: &str, routing_key: &str, reason: impl ToString) -> Self {
        Self::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn consume(queue: &str, reason: impl ToString) -> Self {
        Self::Consume {
            queue: queue.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Failure to declare the broker topology. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
#[error("broker topology setup failed while {step}: {source}")]
pub struct SetupError {
    pub step: &'static str,
    #[source]
    pub source: BrokerError,
}

impl SetupError {
    pub fn new(step: &'static str, source: BrokerError) -> Self {
        Self { step, source }
    }
}
