//! Public handle for the worker pool.

use std::sync::Arc;

use broker::{Broker, SetupError, Topology};
use ractor::{Actor, ActorRef};
use relay_core::{JobEvent, RelayConfig};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::handler::HandlerRegistry;
use crate::messages::PoolMessage;
use crate::supervisor::{PoolArgs, PoolSupervisor};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("failed to spawn worker pool: {0}")]
    Spawn(String),

    #[error("worker pool unavailable: {0}")]
    Unavailable(String),
}

/// A running pool of task queue consumers.
pub struct WorkerPool {
    supervisor: ActorRef<PoolMessage>,
    handle: JoinHandle<()>,
    event_tx: broadcast::Sender<JobEvent>,
}

impl WorkerPool {
    /// Declare the topology, then start `config.concurrency` workers.
    ///
    /// Topology failures are returned as [`PoolError::Setup`] and should
    /// abort startup.
    pub async fn start(
        broker: Arc<dyn Broker>,
        topology: Topology,
        handlers: HandlerRegistry,
        config: &RelayConfig,
    ) -> Result<Self, PoolError> {
        topology.declare(broker.as_ref()).await?;

        if handlers.is_empty() {
            tracing::warn!("Starting worker pool with no handlers; every job will be dropped");
        } else {
            tracing::info!("Registered handlers: {:?}", handlers.names());
        }

        let (event_tx, _) = broadcast::channel(1024);
        let args = PoolArgs {
            broker,
            topology,
            handlers: Arc::new(handlers),
            concurrency: config.concurrency as usize,
            max_attempts: config.max_attempts,
            event_tx: event_tx.clone(),
        };

        let (supervisor, handle) = Actor::spawn(None, PoolSupervisor, args)
            .await
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        Ok(Self {
            supervisor,
            handle,
            event_tx,
        })
    }

    /// Receive lifecycle events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    pub async fn worker_count(&self) -> Result<usize, PoolError> {
        ractor::call!(self.supervisor, |reply| PoolMessage::WorkerCount { reply })
            .map_err(|e| PoolError::Unavailable(e.to_string()))
    }

    /// Stop every worker after its current delivery, then the supervisor.
    pub async fn shutdown(self) -> Result<(), PoolError> {
        if let Err(e) = self.supervisor.send_message(PoolMessage::Shutdown) {
            tracing::debug!("Pool supervisor already stopped: {}", e);
        }
        self.handle
            .await
            .map_err(|e| PoolError::Unavailable(format!("supervisor task failed: {}", e)))?;
        tracing::info!("Worker pool stopped");
        Ok(())
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("supervisor", &self.supervisor.get_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use broker::InMemoryBroker;

    fn config(concurrency: u32) -> RelayConfig {
        RelayConfig {
            concurrency,
            ..RelayConfig::default()
        }
    }

    #[tokio::test]
    async fn starts_one_consumer_per_worker() {
        let broker = InMemoryBroker::new();
        let topology = Topology::default();
        let handlers = HandlerRegistry::new();
        let pool =
            WorkerPool::start(Arc::new(broker.clone()), topology.clone(), handlers, &config(4))
                .await
                .unwrap();

        assert_eq!(pool.worker_count().await.unwrap(), 4);
        assert_eq!(broker.queue_stats(&topology.task_queue).unwrap().consumers, 4);

        pool.shutdown().await.unwrap();
        assert_eq!(broker.queue_stats(&topology.task_queue).unwrap().consumers, 0);
        assert_eq!(broker.open_sessions(), 0);
    }

    #[tokio::test]
    async fn setup_failure_is_reported() {
        let broker = InMemoryBroker::new();
        broker.fail_declarations(true);

        let handlers = HandlerRegistry::new();
        let err = WorkerPool::start(Arc::new(broker), Topology::default(), handlers, &config(2))
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Setup(_)));
    }
}
