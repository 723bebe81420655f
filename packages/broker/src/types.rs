//! Provider-agnostic message types.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::BrokerError;

/// Whether the broker should persist a message to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    #[default]
    Transient,
    Persistent,
}

impl DeliveryMode {
    /// AMQP `delivery-mode` property value.
    pub fn as_amqp(self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }

    pub fn from_amqp(mode: u8) -> Self {
        if mode == 2 {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        }
    }
}

/// Message properties the relay relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub delivery_mode: DeliveryMode,
}

impl MessageProperties {
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }
}

/// A message about to be published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

impl OutboundMessage {
    pub fn new(body: Vec<u8>, properties: MessageProperties) -> Self {
        Self { body, properties }
    }
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives broker restarts.
    pub durable: bool,
    /// Usable only by the declaring session; deleted when it closes.
    pub exclusive: bool,
    /// Deleted once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Default::default()
        }
    }

    /// Per-call reply queue flags.
    pub fn ephemeral() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Consumer flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// The broker considers deliveries settled as soon as they are sent.
    pub auto_ack: bool,
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message received from a queue.
///
/// A delivery is settled at most once; a second `ack`/`nack` returns
/// [`BrokerError::AlreadySettled`] instead of reaching the broker, where it
/// would be a channel-level protocol error.
pub struct Delivery {
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub delivery_tag: u64,
    pub redelivered: bool,
    acker: Option<Arc<dyn Acknowledger>>,
    settled: AtomicBool,
}

impl Delivery {
    /// A delivery that must be settled through `acker`.
    pub fn new(
        body: Vec<u8>,
        properties: MessageProperties,
        delivery_tag: u64,
        redelivered: bool,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            properties,
            delivery_tag,
            redelivered,
            acker: Some(acker),
            settled: AtomicBool::new(false),
        }
    }

    /// A delivery from an auto-ack consumer; already settled.
    pub fn auto_acked(body: Vec<u8>, properties: MessageProperties, delivery_tag: u64) -> Self {
        Self {
            body,
            properties,
            delivery_tag,
            redelivered: false,
            acker: None,
            settled: AtomicBool::new(true),
        }
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    pub async fn ack(&self) -> Result<(), BrokerError> {
        let acker = self.claim()?;
        acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let acker = self.claim()?;
        acker.nack(requeue).await
    }

    fn claim(&self) -> Result<&Arc<dyn Acknowledger>, BrokerError> {
        let acker = self.acker.as_ref().ok_or(BrokerError::AlreadySettled)?;
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(BrokerError::AlreadySettled);
        }
        Ok(acker)
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("body_len", &self.body.len())
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// Stream of deliveries from a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;
