//! Message types for actor communication.

use broker::Delivery;
use ractor::RpcReplyPort;

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// A delivery from the task queue consumer.
    Deliver(Box<Delivery>),

    /// The consumer stream reported an error.
    ConsumerFailed(String),

    /// The consumer stream ended (channel or connection closed).
    ConsumerClosed,

    /// Stop after the current delivery.
    Shutdown,
}

/// Messages for the pool supervisor.
#[derive(Debug)]
pub enum PoolMessage {
    /// Number of live workers.
    WorkerCount { reply: RpcReplyPort<usize> },

    /// Bring a worker slot back after a failed restart.
    Respawn { index: usize },

    /// Stop every worker, then the supervisor.
    Shutdown,
}
