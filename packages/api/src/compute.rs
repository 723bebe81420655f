//! Cache-gated dispatch: serve from the result cache, compute on a miss.

use bytes::{Bytes, BytesMut};
use futures_util::TryStreamExt;
use relay_core::{CacheKey, Job, Task};
use storage::{ByteStream, Storage, StorageError};

use crate::dispatcher::{DispatchError, Dispatcher};

#[derive(Debug, thiserror::Error)]
pub enum ComputeError {
    #[error("result cache error: {0}")]
    Cache(#[from] StorageError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("failed to encode task payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A cached artifact ready to stream to the caller.
pub struct Artifact {
    pub key: CacheKey,
    pub content_type: String,
    pub stream: ByteStream,
}

impl Artifact {
    /// Buffer the whole artifact.
    pub async fn into_bytes(self) -> Result<Bytes, StorageError> {
        let buf = self
            .stream
            .try_fold(BytesMut::new(), |mut buf, chunk| async move {
                buf.extend_from_slice(&chunk);
                Ok(buf)
            })
            .await?;
        Ok(buf.freeze())
    }
}

impl std::fmt::Debug for Artifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Artifact")
            .field("key", &self.key)
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// Front door for callers: one cache check, at most one dispatch.
///
/// Two concurrent misses for the same key both dispatch; the second write
/// simply replaces the first.
#[derive(Debug, Clone)]
pub struct Gateway {
    dispatcher: Dispatcher,
    cache: Storage,
}

impl Gateway {
    pub fn new(dispatcher: Dispatcher, cache: Storage) -> Self {
        Self { dispatcher, cache }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn cache(&self) -> &Storage {
        &self.cache
    }

    pub async fn get_or_compute<T: Task + ?Sized>(
        &self,
        task: &T,
    ) -> Result<Artifact, ComputeError> {
        let key = task.cache_key();
        if self.cache.exists(key.as_str()).await? {
            tracing::debug!("Cache hit for {}", key);
            return self.fetch(key, task).await;
        }

        tracing::debug!("Cache miss for {}; dispatching {}", key, task.handler_name());
        let payload = task.payload().map_err(ComputeError::Encode)?;
        let reply = self.dispatcher.dispatch(Job::new(task.handler_name(), payload)).await?;
        tracing::info!("Computed {} via {} in {:?}", key, task.handler_name(), reply.elapsed);

        self.fetch(key, task).await
    }

    async fn fetch<T: Task + ?Sized>(
        &self,
        key: CacheKey,
        task: &T,
    ) -> Result<Artifact, ComputeError> {
        let stream = self.cache.get(key.as_str()).await?;
        Ok(Artifact {
            key,
            content_type: task.content_type().to_string(),
            stream,
        })
    }
}
