//! Core domain types for the compute relay.
//!
//! This crate contains shared types used across all packages:
//! - Job envelope, correlation token and failure bookkeeping
//! - Cache keys and the converter/task capabilities
//! - Worker lifecycle events
//! - Runtime configuration

mod config;
mod conversion;
mod events;
mod job;
mod key;

pub use config::{ConfigError, RelayConfig};
pub use conversion::{ConvertError, ConvertFuture, Converter, Task};
pub use events::{DropReason, JobEvent};
pub use job::{
    CorrelationId, DEFAULT_MAX_ATTEMPTS, DecodeError, HandlerError, JOB_CONTENT_TYPE, Job,
    JobFailure,
};
pub use key::{CacheKey, CacheKeyBuilder};
