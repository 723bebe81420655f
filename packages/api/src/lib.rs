//! Caller-side API for the compute relay.
//!
//! This crate contains:
//! - `Dispatcher`: publish a job and wait for its completion reply
//! - `Gateway`: cache-gated get-or-compute over the dispatcher
//! - startup wiring and demo handlers

mod compute;
mod dispatcher;
mod init;

pub use compute::{Artifact, ComputeError, Gateway};
pub use dispatcher::{DispatchError, Dispatcher, Reply};
pub use init::{InitError, connect, demo_handlers, init_gateway, init_workers};

// Re-export core types for convenience
pub use relay_core::{CacheKey, Converter, CorrelationId, Job, JobEvent, RelayConfig, Task};
