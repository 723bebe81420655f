//! Message broker abstraction for the compute relay.
//!
//! - [`Broker`] / [`Session`]: provider-agnostic connection and channel
//! - [`Delivery`]: a received message that is settled at most once
//! - [`Topology`]: the exchange, work queue and binding the relay uses
//! - providers: RabbitMQ via `lapin`, and an in-memory broker for tests

mod error;
pub mod providers;
mod topology;
mod traits;
mod types;

pub use error::{BrokerError, SetupError};
pub use providers::{InMemoryBroker, QueueStats, RabbitMqBroker};
pub use topology::Topology;
pub use traits::{Broker, Session};
pub use types::{
    Acknowledger, ConsumeOptions, Delivery, DeliveryMode, DeliveryStream, MessageProperties,
    OutboundMessage, QueueOptions,
};
