//! Broker providers.

mod in_memory;
mod rabbitmq;

pub use in_memory::{InMemoryBroker, InMemorySession, QueueStats};
pub use rabbitmq::{RabbitMqBroker, RabbitMqSession};
