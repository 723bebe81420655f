//! Startup wiring for the gateway and worker processes.

use std::sync::Arc;
use std::time::Duration;

use actors::{FnHandler, HandlerRegistry, PoolError, WorkerPool};
use broker::{Broker, RabbitMqBroker, Topology};
use relay_core::{HandlerError, RelayConfig};
use storage::Storage;

use crate::compute::Gateway;
use crate::dispatcher::Dispatcher;

pub type InitError = Box<dyn std::error::Error + Send + Sync>;

/// Connect to the broker named by `config`.
pub async fn connect(config: &RelayConfig) -> Result<Arc<dyn Broker>, InitError> {
    let broker = RabbitMqBroker::from_config(config).await?;
    Ok(Arc::new(broker))
}

/// Declare the topology and build the caller-side gateway.
///
/// Should be called once at startup; a topology failure aborts it.
pub async fn init_gateway(
    broker: Arc<dyn Broker>,
    config: &RelayConfig,
    cache: Storage,
) -> Result<Gateway, InitError> {
    tracing::info!("Initializing compute gateway...");
    let topology = Topology::from_config(config);
    topology.declare(broker.as_ref()).await?;

    tracing::info!(
        "Compute gateway initialized (cache: {}, reply timeout {:?})",
        cache.kind().as_str(),
        config.reply_timeout()
    );
    let dispatcher = Dispatcher::new(broker, topology, config.reply_timeout());
    let gateway = Gateway::new(dispatcher, cache);
    Ok(gateway)
}

/// Declare the topology and start the worker pool with `handlers`.
pub async fn init_workers(
    broker: Arc<dyn Broker>,
    config: &RelayConfig,
    handlers: HandlerRegistry,
) -> Result<WorkerPool, PoolError> {
    tracing::info!("Initializing worker pool...");
    let pool = WorkerPool::start(broker, Topology::from_config(config), handlers, config).await?;
    tracing::info!("Worker pool initialized with {} workers", config.concurrency);
    Ok(pool)
}

/// Demo handlers for exercising the pipeline end to end.
///
/// - `Echo`: completes immediately
/// - `Sleep`: waits `payload.millis` (default 1000) then completes
/// - `Fail`: records a failure; recoverable unless `payload.recoverable` is false
pub fn demo_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();

    handlers.register(
        "Echo",
        FnHandler::new(|ctx| {
            Box::pin(async move {
                tracing::info!("[{}] Echo job: {}", ctx.worker_id(), ctx.job().payload);
                ctx.complete().await;
            })
        }),
    );

    handlers.register(
        "Sleep",
        FnHandler::new(|ctx| {
            Box::pin(async move {
                let millis = ctx
                    .job()
                    .payload
                    .get("millis")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(1000);
                tracing::info!("Sleeping for {}ms", millis);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                ctx.complete().await;
            })
        }),
    );

    handlers.register(
        "Fail",
        FnHandler::new(|ctx| {
            Box::pin(async move {
                let recoverable = ctx
                    .job()
                    .payload
                    .get("recoverable")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(true);
                let error = if recoverable {
                    HandlerError::Recoverable("intentional failure".to_string())
                } else {
                    HandlerError::Unrecoverable("intentional failure".to_string())
                };
                ctx.add_error(error);
            })
        }),
    );

    handlers
}
