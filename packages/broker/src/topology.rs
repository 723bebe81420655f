//! Exchange, queue and binding layout shared by dispatchers and workers.

use relay_core::RelayConfig;

use crate::error::SetupError;
use crate::traits::{Broker, Session};
use crate::types::QueueOptions;

/// The relay's broker layout: one durable direct exchange bound to one
/// durable work queue with the empty routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub task_queue: String,
    pub routing_key: String,
    /// Per-worker unacknowledged delivery limit.
    pub prefetch: u16,
}

impl Default for Topology {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

impl Topology {
    pub fn new(exchange: impl Into<String>, task_queue: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            task_queue: task_queue.into(),
            routing_key: String::new(),
            prefetch: 1,
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.exchange.clone(), config.task_queue.clone())
    }

    /// Declare the layout on an open session. Safe to repeat.
    pub async fn declare_on(&self, session: &dyn Session) -> Result<(), SetupError> {
        session
            .declare_exchange(&self.exchange, true)
            .await
            .map_err(|e| SetupError::new("declaring exchange", e))?;
        session
            .declare_queue(&self.task_queue, QueueOptions::durable())
            .await
            .map_err(|e| SetupError::new("declaring task queue", e))?;
        session
            .bind_queue(&self.task_queue, &self.exchange, &self.routing_key)
            .await
            .map_err(|e| SetupError::new("binding task queue", e))?;
        Ok(())
    }

    /// Declare the layout on a short-lived session of its own.
    pub async fn declare(&self, broker: &dyn Broker) -> Result<(), SetupError> {
        let session = broker
            .open_session()
            .await
            .map_err(|e| SetupError::new("opening setup session", e))?;
        let declared = self.declare_on(session.as_ref()).await;
        if let Err(e) = session.close().await {
            tracing::debug!("Failed to close setup session: {}", e);
        }
        declared?;
        tracing::info!(
            "Declared topology: exchange={} queue={} prefetch={}",
            self.exchange,
            self.task_queue,
            self.prefetch
        );
        Ok(())
    }
}
