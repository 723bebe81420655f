//! RabbitMQ provider built on the `lapin` AMQP 0.9.1 client.
//!
//! One [`RabbitMqBroker`] owns the TCP connection; each [`RabbitMqSession`]
//! is a channel on it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use relay_core::RelayConfig;

use crate::error::BrokerError;
use crate::traits::{Broker, Session};
use crate::types::{
    Acknowledger, ConsumeOptions, Delivery, DeliveryMode, DeliveryStream, MessageProperties,
    OutboundMessage, QueueOptions,
};

const CLOSE_OK: u16 = 200;

/// A live AMQP connection.
pub struct RabbitMqBroker {
    connection: Connection,
}

impl std::fmt::Debug for RabbitMqBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitMqBroker")
            .field("status", &self.connection.status().state())
            .finish()
    }
}

impl RabbitMqBroker {
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(
            url,
            ConnectionProperties::default().with_connection_name("compute-relay".into()),
        )
        .await
        .map_err(|e| BrokerError::Connection(format!("RabbitMQ connection failed: {}", e)))?;
        Ok(Self { connection })
    }

    pub async fn from_config(config: &RelayConfig) -> Result<Self, BrokerError> {
        tracing::info!("Connecting to broker at {}", config.amqp_url_redacted());
        Self::connect(&config.amqp_url).await
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn open_session(&self) -> Result<Arc<dyn Session>, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Session(format!("channel creation failed: {}", e)))?;
        Ok(Arc::new(RabbitMqSession {
            channel,
            closed: AtomicBool::new(false),
        }))
    }

    fn provider_name(&self) -> &'static str {
        "rabbitmq"
    }
}

/// One AMQP channel.
pub struct RabbitMqSession {
    channel: Channel,
    closed: AtomicBool,
}

impl Drop for RabbitMqSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) || !self.channel.status().connected() {
            return;
        }
        let channel = self.channel.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = channel.close(CLOSE_OK, "OK").await {
                    tracing::debug!("Failed to close dropped channel: {}", e);
                }
            });
        }
    }
}

#[async_trait]
impl Session for RabbitMqSession {
    async fn declare_exchange(&self, name: &str, durable: bool) -> Result<(), BrokerError> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::declare("exchange", name, e))
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> Result<String, BrokerError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::declare("queue", name, e))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Bind {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                reason: e.to_string(),
            })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Session(format!("failed to set QoS: {}", e)))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                to_amqp_properties(&message.properties),
            )
            .await
            .map_err(|e| BrokerError::publish(exchange, routing_key, e))?;
        confirm.await.map_err(|e| {
            BrokerError::publish(exchange, routing_key, format!("confirmation failed: {}", e))
        })?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: options.auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::consume(queue, e))?;

        let queue = queue.to_string();
        let auto_ack = options.auto_ack;
        Ok(consumer
            .map(move |item| {
                item.map(|delivery| from_amqp_delivery(delivery, auto_ack))
                    .map_err(|e| BrokerError::consume(&queue, e))
            })
            .boxed())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::AcqRel) || !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(CLOSE_OK, "OK")
            .await
            .map_err(|e| BrokerError::Session(format!("channel close failed: {}", e)))
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.channel.status().connected()
    }
}

struct LapinAcker {
    acker: lapin::acker::Acker,
}

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }
}

fn to_amqp_properties(properties: &MessageProperties) -> BasicProperties {
    let mut amqp =
        BasicProperties::default().with_delivery_mode(properties.delivery_mode.as_amqp());
    if let Some(content_type) = &properties.content_type {
        amqp = amqp.with_content_type(content_type.clone().into());
    }
    if let Some(correlation_id) = &properties.correlation_id {
        amqp = amqp.with_correlation_id(correlation_id.clone().into());
    }
    if let Some(reply_to) = &properties.reply_to {
        amqp = amqp.with_reply_to(reply_to.clone().into());
    }
    amqp
}

fn from_amqp_delivery(delivery: lapin::message::Delivery, auto_ack: bool) -> Delivery {
    let amqp = &delivery.properties;
    let properties = MessageProperties {
        content_type: amqp.content_type().as_ref().map(|s| s.as_str().to_string()),
        correlation_id: amqp.correlation_id().as_ref().map(|s| s.as_str().to_string()),
        reply_to: amqp.reply_to().as_ref().map(|s| s.as_str().to_string()),
        delivery_mode: (*amqp.delivery_mode())
            .map(DeliveryMode::from_amqp)
            .unwrap_or_default(),
    };

    if auto_ack {
        return Delivery::auto_acked(delivery.data, properties, delivery.delivery_tag);
    }
    let acker = Arc::new(LapinAcker {
        acker: delivery.acker,
    });
    Delivery::new(
        delivery.data,
        properties,
        delivery.delivery_tag,
        delivery.redelivered,
        acker,
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    #[test]
    fn properties_map_to_amqp() {
        let properties = MessageProperties::default()
            .with_content_type("application/json")
            .with_correlation_id("01J0000000000000000000000")
            .with_reply_to("amq.gen-abc")
            .with_delivery_mode(DeliveryMode::Persistent);
        let amqp = to_amqp_properties(&properties);

        assert_eq!(amqp.delivery_mode(), &Some(2));
        assert_eq!(
            amqp.content_type().as_ref().map(|s| s.as_str()),
            Some("application/json")
        );
        assert_eq!(amqp.reply_to().as_ref().map(|s| s.as_str()), Some("amq.gen-abc"));
    }

    /// Requires a running RabbitMQ at `AMQP_URL`.
    #[tokio::test]
    #[ignore]
    async fn round_trip_against_rabbitmq() {
        let url = std::env::var("AMQP_URL").unwrap_or_else(|_| RelayConfig::default().amqp_url);
        let broker = RabbitMqBroker::connect(&url).await.unwrap();
        let session = broker.open_session().await.unwrap();

        let queue = session.declare_queue("", QueueOptions::ephemeral()).await.unwrap();
        let mut stream = session.consume(&queue, ConsumeOptions { auto_ack: true }).await.unwrap();
        session
            .publish(
                "",
                &queue,
                OutboundMessage::new(
                    b"ping".to_vec(),
                    MessageProperties::default().with_correlation_id("c-1"),
                ),
            )
            .await
            .unwrap();

        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"ping");
        assert_eq!(delivery.properties.correlation_id.as_deref(), Some("c-1"));
        session.close().await.unwrap();
    }
}
