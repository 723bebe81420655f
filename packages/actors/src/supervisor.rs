//! Supervisor actor that keeps the worker pool at full strength.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use broker::{Broker, Topology};
use ractor::{Actor, ActorId, ActorProcessingErr, ActorRef, SpawnErr, SupervisionEvent};
use relay_core::JobEvent;
use tokio::sync::broadcast;

use crate::handler::HandlerRegistry;
use crate::messages::{PoolMessage, WorkerMessage};
use crate::worker_actor::{WorkerActor, WorkerArgs};

const RESPAWN_DELAY: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Supervisor arguments.
pub struct PoolArgs {
    pub broker: Arc<dyn Broker>,
    pub topology: Topology,
    pub handlers: Arc<HandlerRegistry>,
    pub concurrency: usize,
    pub max_attempts: u32,
    pub event_tx: broadcast::Sender<JobEvent>,
}

impl PoolArgs {
    fn worker_args(&self, index: usize) -> WorkerArgs {
        WorkerArgs {
            index,
            broker: Arc::clone(&self.broker),
            topology: self.topology.clone(),
            handlers: Arc::clone(&self.handlers),
            max_attempts: self.max_attempts,
            event_tx: self.event_tx.clone(),
        }
    }
}

/// State for the pool supervisor.
pub struct PoolSupervisorState {
    args: PoolArgs,
    /// Live workers by actor id, with their slot index.
    workers: HashMap<ActorId, (usize, ActorRef<WorkerMessage>)>,
    shutting_down: bool,
}

impl PoolSupervisorState {
    async fn spawn_worker(
        &mut self,
        myself: &ActorRef<PoolMessage>,
        index: usize,
    ) -> Result<(), SpawnErr> {
        let args = self.args.worker_args(index);
        let (worker, _handle) =
            Actor::spawn_linked(None, WorkerActor, args, myself.get_cell()).await?;
        self.workers.insert(worker.get_id(), (index, worker));
        Ok(())
    }

    async fn replace(&mut self, myself: &ActorRef<PoolMessage>, id: ActorId) {
        let Some((index, _)) = self.workers.remove(&id) else {
            return;
        };
        if self.shutting_down {
            return;
        }
        tracing::info!("Restarting worker-{}", index);
        if let Err(e) = self.spawn_worker(myself, index).await {
            tracing::error!("Failed to restart worker-{}: {}", index, e);
            myself.send_after(RESPAWN_DELAY, move || PoolMessage::Respawn { index });
        }
    }

    async fn stop_all(&mut self) {
        for (_, (index, worker)) in self.workers.drain() {
            if let Err(e) = worker.stop_and_wait(None, Some(SHUTDOWN_GRACE)).await {
                tracing::warn!("worker-{} did not stop cleanly: {}", index, e);
            }
        }
    }
}

/// Supervisor actor owning every worker in the pool.
pub struct PoolSupervisor;

impl Actor for PoolSupervisor {
    type Msg = PoolMessage;
    type State = PoolSupervisorState;
    type Arguments = PoolArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            "Starting worker pool supervisor: {} workers on {}",
            args.concurrency,
            args.topology.task_queue
        );

        let concurrency = args.concurrency;
        let mut state = PoolSupervisorState {
            args,
            workers: HashMap::with_capacity(concurrency),
            shutting_down: false,
        };
        for index in 0..concurrency {
            if let Err(e) = state.spawn_worker(&myself, index).await {
                state.shutting_down = true;
                state.stop_all().await;
                return Err(ActorProcessingErr::from(format!(
                    "failed to spawn worker-{}: {}",
                    index, e
                )));
            }
        }
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            PoolMessage::WorkerCount { reply } => {
                let _ = reply.send(state.workers.len());
            }

            PoolMessage::Respawn { index } => {
                if state.shutting_down {
                    return Ok(());
                }
                if let Err(e) = state.spawn_worker(&myself, index).await {
                    tracing::error!("Failed to restart worker-{}: {}", index, e);
                    myself.send_after(RESPAWN_DELAY, move || PoolMessage::Respawn { index });
                }
            }

            PoolMessage::Shutdown => {
                tracing::info!("Shutting down worker pool");
                state.shutting_down = true;
                state.stop_all().await;
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisionEvent::ActorFailed(cell, err) => {
                tracing::warn!("Worker actor {} failed: {}", cell.get_id(), err);
                state.replace(&myself, cell.get_id()).await;
            }
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                if !state.shutting_down {
                    tracing::warn!("Worker actor {} terminated: {:?}", cell.get_id(), reason);
                }
                state.replace(&myself, cell.get_id()).await;
            }
            _ => {}
        }
        Ok(())
    }
}
