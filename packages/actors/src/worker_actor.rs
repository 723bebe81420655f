//! Worker actor: one task queue consumer with its own broker session.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use broker::{
    Broker, BrokerError, ConsumeOptions, Delivery, MessageProperties, OutboundMessage, Session,
    Topology,
};
use chrono::Utc;
use futures_util::{FutureExt, StreamExt};
use ractor::{Actor, ActorProcessingErr, ActorRef};
use relay_core::{DropReason, Job, JobEvent};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::context::JobContext;
use crate::handler::HandlerRegistry;
use crate::messages::WorkerMessage;

/// Worker actor arguments.
pub struct WorkerArgs {
    pub index: usize,
    pub broker: Arc<dyn Broker>,
    pub topology: Topology,
    pub handlers: Arc<HandlerRegistry>,
    pub max_attempts: u32,
    pub event_tx: broadcast::Sender<JobEvent>,
}

/// State for the worker actor.
pub struct WorkerActorState {
    worker_id: String,
    session: Arc<dyn Session>,
    topology: Topology,
    handlers: Arc<HandlerRegistry>,
    max_attempts: u32,
    event_tx: broadcast::Sender<JobEvent>,
    consumer: JoinHandle<()>,
}

impl Drop for WorkerActorState {
    fn drop(&mut self) {
        self.consumer.abort();
    }
}

impl WorkerActorState {
    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    /// Reject without requeue and report why.
    async fn drop_delivery(
        &self,
        delivery: &Delivery,
        name: Option<&str>,
        tries: u32,
        reason: DropReason,
        errors: Vec<String>,
    ) {
        if !delivery.is_settled()
            && let Err(e) = delivery.nack(false).await
        {
            tracing::warn!("[{}] nack failed: {}", self.worker_id, e);
        }
        tracing::warn!(
            "[{}] dropped {} (tries {}): {} {:?}",
            self.worker_id,
            name.unwrap_or("<undecodable>"),
            tries,
            reason,
            errors
        );
        self.emit(JobEvent::JobDropped {
            worker_id: self.worker_id.clone(),
            name: name.map(str::to_string),
            tries,
            reason,
            errors,
            timestamp: Utc::now(),
        });
    }

    async fn drop_job(
        &self,
        delivery: &Delivery,
        job: &Job,
        reason: DropReason,
        errors: Vec<String>,
    ) {
        self.drop_delivery(delivery, Some(&job.name), job.tries, reason, errors).await;
    }

    /// Publish the next attempt with the delivered message's properties.
    async fn republish(
        &self,
        next: &Job,
        delivered: &MessageProperties,
    ) -> Result<(), BrokerError> {
        let topology = &self.topology;
        let body = next
            .encode()
            .map_err(|e| BrokerError::publish(&topology.exchange, &topology.routing_key, e))?;
        self.session
            .publish(
                &topology.exchange,
                &topology.routing_key,
                OutboundMessage::new(body, delivered.clone()),
            )
            .await
    }

    async fn process(&self, delivery: Delivery) {
        let started = Instant::now();
        let job = match Job::decode(
            &delivery.body,
            delivery.properties.correlation_id.as_deref(),
            delivery.properties.reply_to.as_deref(),
        ) {
            Ok(job) => job,
            Err(e) => {
                let errors = vec![e.to_string()];
                self.drop_delivery(&delivery, None, 0, DropReason::Undecodable, errors).await;
                return;
            }
        };

        tracing::debug!("[{}] got {} (tries {})", self.worker_id, job.name, job.tries);
        self.emit(JobEvent::JobReceived {
            worker_id: self.worker_id.clone(),
            name: job.name.clone(),
            tries: job.tries,
            correlation_id: job.correlation_id().map(|c| c.to_string()),
            timestamp: Utc::now(),
        });

        let Some(handler) = self.handlers.get(&job.name) else {
            let errors = vec![format!("no handler registered for {}", job.name)];
            self.drop_job(&delivery, &job, DropReason::UnknownHandler, errors).await;
            return;
        };

        let session = Arc::clone(&self.session);
        let mut ctx = JobContext::new(job, delivery, session, self.worker_id.clone());
        let outcome = AssertUnwindSafe(handler.handle(&mut ctx)).catch_unwind().await;
        let (job, delivery) = ctx.into_parts();
        let errors: Vec<String> = job.errors().iter().map(|e| e.to_string()).collect();

        if outcome.is_err() {
            self.drop_job(&delivery, &job, DropReason::HandlerPanicked, errors).await;
            return;
        }

        if job.retry_requested() {
            if !job.should_retry(self.max_attempts) {
                self.drop_job(&delivery, &job, DropReason::AttemptsExhausted, errors).await;
                return;
            }

            let next = job.next_attempt();
            if let Err(e) = self.republish(&next, &delivery.properties).await {
                let mut errors = errors;
                errors.push(e.to_string());
                self.drop_job(&delivery, &job, DropReason::RetryPublishFailed, errors).await;
                return;
            }
            // The new message replaces this one; release the prefetch slot.
            if !delivery.is_settled()
                && let Err(e) = delivery.ack().await
            {
                tracing::warn!("[{}] failed to ack superseded delivery: {}", self.worker_id, e);
            }

            tracing::info!(
                "[{}] retrying {} (tries {}) after {:?}: {:?}",
                self.worker_id,
                next.name,
                next.tries,
                started.elapsed(),
                errors
            );
            self.emit(JobEvent::JobRetrying {
                worker_id: self.worker_id.clone(),
                name: next.name.clone(),
                tries: next.tries,
                correlation_id: next.correlation_id().map(|c| c.to_string()),
                timestamp: Utc::now(),
            });
            return;
        }

        if !delivery.is_settled() {
            let mut errors = errors;
            errors.push("handler returned without acknowledging or requesting a retry".to_string());
            self.drop_job(&delivery, &job, DropReason::NoDecision, errors).await;
            return;
        }

        let elapsed = started.elapsed();
        if errors.is_empty() {
            tracing::info!(
                "[{}] {} done (tries {}) in {:?}",
                self.worker_id,
                job.name,
                job.tries,
                elapsed
            );
        } else {
            tracing::warn!(
                "[{}] {} settled with errors (tries {}) in {:?}: {:?}",
                self.worker_id,
                job.name,
                job.tries,
                elapsed,
                errors
            );
        }
        self.emit(JobEvent::JobCompleted {
            worker_id: self.worker_id.clone(),
            name: job.name.clone(),
            tries: job.tries,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            timestamp: Utc::now(),
        });
    }
}

/// Worker actor that consumes the task queue.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let worker_id = format!("worker-{}", args.index);
        tracing::info!("Starting worker: {}", worker_id);

        let session = args.broker.open_session().await?;
        session.set_prefetch(args.topology.prefetch).await?;
        let mut deliveries = session
            .consume(&args.topology.task_queue, ConsumeOptions::default())
            .await?;

        // Pump deliveries into the mailbox; prefetch keeps this to one at a time.
        let consumer = tokio::spawn(async move {
            while let Some(item) = deliveries.next().await {
                let message = match item {
                    Ok(delivery) => WorkerMessage::Deliver(Box::new(delivery)),
                    Err(e) => WorkerMessage::ConsumerFailed(e.to_string()),
                };
                if myself.send_message(message).is_err() {
                    return;
                }
            }
            let _ = myself.send_message(WorkerMessage::ConsumerClosed);
        });

        let state = WorkerActorState {
            worker_id,
            session,
            topology: args.topology,
            handlers: args.handlers,
            max_attempts: args.max_attempts,
            event_tx: args.event_tx,
            consumer,
        };
        state.emit(JobEvent::WorkerStarted {
            worker_id: state.worker_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(state)
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Deliver(delivery) => {
                state.process(*delivery).await;
            }

            WorkerMessage::ConsumerFailed(reason) => {
                return Err(ActorProcessingErr::from(format!(
                    "{} consumer failed: {}",
                    state.worker_id, reason
                )));
            }

            WorkerMessage::ConsumerClosed => {
                tracing::warn!("[{}] consumer closed by broker", state.worker_id);
                myself.stop(Some("consumer closed".to_string()));
            }

            WorkerMessage::Shutdown => {
                tracing::info!("Shutting down worker: {}", state.worker_id);
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.consumer.abort();
        if let Err(e) = state.session.close().await {
            tracing::debug!("[{}] session close failed: {}", state.worker_id, e);
        }
        state.emit(JobEvent::WorkerStopped {
            worker_id: state.worker_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }
}
