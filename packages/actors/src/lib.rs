//! Actor system for the worker side of the compute relay.
//!
//! # Architecture
//!
//! - `PoolSupervisor` - spawns the workers and restarts any that fail
//! - `WorkerActor` - one task queue consumer with its own broker session
//! - `HandlerRegistry` - job name to handler map, shared read-only
//!
//! # Usage
//!
//! ```ignore
//! use actors::{HandlerRegistry, WorkerPool};
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.register_converter::<InstanceToJpg>(cache.clone());
//!
//! let pool = WorkerPool::start(broker, Topology::from_config(&config), handlers, &config).await?;
//! let mut events = pool.subscribe();
//! ```

mod context;
mod handler;
mod messages;
mod pool;
mod supervisor;
mod worker_actor;

pub use context::JobContext;
pub use handler::{ConversionHandler, FnHandler, HandlerFuture, HandlerRegistry, JobHandler};
pub use pool::{PoolError, WorkerPool};
