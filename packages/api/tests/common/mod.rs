#![allow(dead_code, clippy::disallowed_methods)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use actors::{HandlerRegistry, WorkerPool};
use api::{Dispatcher, Gateway};
use broker::{InMemoryBroker, Topology};
use bytes::Bytes;
use relay_core::{CacheKey, ConvertError, ConvertFuture, Converter, JobEvent, RelayConfig};
use serde::{Deserialize, Serialize};
use storage::Storage;
use tokio::sync::broadcast;

pub const WORKERS: u32 = 4;

/// In-memory broker, in-memory cache and a running worker pool.
pub struct Harness {
    pub broker: InMemoryBroker,
    pub topology: Topology,
    pub cache: Storage,
    pub pool: WorkerPool,
    pub gateway: Gateway,
}

impl Harness {
    pub async fn start(handlers: HandlerRegistry) -> Self {
        Self::start_with(Storage::in_memory(), handlers, Duration::from_secs(10)).await
    }

    /// In-memory cache with a short reply timeout, for jobs expected to fail.
    pub async fn with_timeout(handlers: HandlerRegistry, reply_timeout: Duration) -> Self {
        Self::start_with(Storage::in_memory(), handlers, reply_timeout).await
    }

    pub async fn start_with(
        cache: Storage,
        handlers: HandlerRegistry,
        reply_timeout: Duration,
    ) -> Self {
        let broker = InMemoryBroker::new();
        let config = RelayConfig {
            concurrency: WORKERS,
            ..RelayConfig::default()
        };
        let topology = Topology::from_config(&config);
        let pool = WorkerPool::start(Arc::new(broker.clone()), topology.clone(), handlers, &config)
            .await
            .expect("worker pool should start");
        let dispatcher = Dispatcher::new(Arc::new(broker.clone()), topology.clone(), reply_timeout);

        Self {
            broker,
            topology,
            gateway: Gateway::new(dispatcher, cache.clone()),
            cache,
            pool,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        self.gateway.dispatcher()
    }

    /// Messages published to the task queue so far.
    pub fn published(&self) -> u64 {
        self.broker
            .queue_stats(&self.topology.task_queue)
            .map(|s| s.published)
            .unwrap_or_default()
    }

    /// Messages rejected from the task queue without requeue.
    pub fn dropped(&self) -> u64 {
        self.broker
            .queue_stats(&self.topology.task_queue)
            .map(|s| s.dropped)
            .unwrap_or_default()
    }
}

/// Wait up to five seconds for an event matching `pred`.
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<JobEvent>, pred: F) -> JobEvent
where
    F: Fn(&JobEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for event")
}

/// Thumbnail converter: renders a deterministic fake JPEG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thumbnail {
    pub instance_id: String,
    pub size: u32,
}

impl Thumbnail {
    pub fn new(instance_id: &str, size: u32) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            size,
        }
    }

    pub fn expected_bytes(&self) -> Bytes {
        Bytes::from(format!("jpeg:{}:{}", self.instance_id, self.size))
    }
}

impl Converter for Thumbnail {
    const NAME: &'static str = "InstanceToJPG";

    fn key(&self) -> CacheKey {
        CacheKey::builder("conversions", &self.instance_id)
            .option("size", self.size)
            .extension("jpg")
            .build()
    }

    fn content_type(&self) -> &str {
        "image/jpeg"
    }

    fn convert(&self) -> ConvertFuture<'_> {
        Box::pin(async move {
            if self.instance_id.is_empty() {
                return Err(ConvertError::Invalid("instance id is empty".to_string()));
            }
            Ok(self.expected_bytes())
        })
    }
}

static FLAKY_CALLS: AtomicUsize = AtomicUsize::new(0);

/// Movie converter whose first conversion fails transiently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlakyMovie {
    pub instance_id: String,
}

impl FlakyMovie {
    pub fn calls() -> usize {
        FLAKY_CALLS.load(Ordering::SeqCst)
    }
}

impl Converter for FlakyMovie {
    const NAME: &'static str = "InstanceToMovie";

    fn key(&self) -> CacheKey {
        CacheKey::builder("conversions", &self.instance_id)
            .extension("mp4")
            .build()
    }

    fn content_type(&self) -> &str {
        "video/mp4"
    }

    fn convert(&self) -> ConvertFuture<'_> {
        Box::pin(async move {
            if FLAKY_CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ConvertError::Transient("source not ready".to_string()));
            }
            Ok(Bytes::from_static(b"mp4"))
        })
    }
}
