//! Result cache for computed artifacts.
//!
//! Artifacts are opaque blobs addressed by cache key. The backend is an
//! `object_store` implementation:
//! - S3-compatible storage in production/staging
//! - On-disk storage for local dev
//! - In-memory storage for tests
//!
//! Presence of a key is the only "already computed" signal, so `exists`
//! distinguishes a missing object from a backend failure.

mod config;

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use object_store::path::Path;
use object_store::{ObjectStore, ObjectStoreExt};

pub use config::{S3Config, StorageBackendConfig, StorageConfig};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage config: {0}")]
    InvalidConfig(String),

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object_store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Artifact contents as a stream of chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes, StorageError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    S3,
    Filesystem,
    Memory,
}

impl StorageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StorageKind::S3 => "s3",
            StorageKind::Filesystem => "filesystem",
            StorageKind::Memory => "memory",
        }
    }
}

/// Key-addressed blob store shared by handlers (writers) and the gateway
/// (reader). Clones share the same backend.
#[derive(Clone)]
pub struct Storage {
    kind: StorageKind,
    store: Arc<dyn ObjectStore>,
    prefix: Option<String>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("kind", &self.kind)
            .field("prefix", &self.prefix)
            .finish()
    }
}

impl Storage {
    pub async fn new(cfg: StorageConfig) -> Result<Self, StorageError> {
        let (kind, store): (StorageKind, Arc<dyn ObjectStore>) = match cfg.backend {
            StorageBackendConfig::S3(s3) => (StorageKind::S3, Arc::new(build_s3(s3)?)),
            StorageBackendConfig::Filesystem { root } => {
                std::fs::create_dir_all(&root)?;
                let fs = object_store::local::LocalFileSystem::new_with_prefix(&root)?;
                (StorageKind::Filesystem, Arc::new(fs))
            }
            StorageBackendConfig::Memory => {
                (StorageKind::Memory, Arc::new(object_store::memory::InMemory::new()))
            }
        };

        tracing::info!("Result cache backend: {}", kind.as_str());
        Ok(Self {
            kind,
            store,
            prefix: cfg.prefix.and_then(config::non_empty),
        })
    }

    pub async fn from_env() -> Result<Self, StorageError> {
        Self::new(StorageConfig::from_env()?).await
    }

    /// Fresh in-memory cache.
    pub fn in_memory() -> Self {
        Self {
            kind: StorageKind::Memory,
            store: Arc::new(object_store::memory::InMemory::new()),
            prefix: None,
        }
    }

    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    /// Whether an artifact is stored under `key`.
    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.to_path(key)?;
        match self.store.head(&path).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Open the artifact under `key` as a byte stream.
    pub async fn get(&self, key: &str) -> Result<ByteStream, StorageError> {
        let path = self.to_path(key)?;
        let result = self.store.get(&path).await.map_err(|e| not_found(key, e))?;
        Ok(result.into_stream().map_err(StorageError::from).boxed())
    }

    pub async fn get_bytes(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.to_path(key)?;
        let result = self.store.get(&path).await.map_err(|e| not_found(key, e))?;
        result.bytes().await.map_err(|e| not_found(key, e))
    }

    /// Store an artifact, replacing any previous one under the same key.
    pub async fn put_bytes(&self, key: &str, bytes: Bytes) -> Result<(), StorageError> {
        let path = self.to_path(key)?;
        let len = bytes.len();
        self.store.put(&path, object_store::PutPayload::from(bytes)).await?;
        tracing::debug!("Cached {} bytes at {}", len, path);
        Ok(())
    }

    /// Remove the artifact under `key`. Removing a missing key is not an error.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.to_path(key)?;
        match self.store.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn to_path(&self, key: &str) -> Result<Path, StorageError> {
        let key = key.trim_start_matches('/');
        if key.is_empty() {
            return Err(StorageError::InvalidConfig("cache key must not be empty".to_string()));
        }

        let joined = match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}/{key}"),
            _ => key.to_string(),
        };
        Ok(Path::from(joined))
    }
}

fn not_found(key: &str, err: object_store::Error) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NotFound(key.to_string()),
        other => other.into(),
    }
}

fn build_s3(cfg: S3Config) -> Result<object_store::aws::AmazonS3, StorageError> {
    let mut builder = object_store::aws::AmazonS3Builder::new()
        .with_bucket_name(cfg.bucket)
        .with_region(cfg.region)
        .with_virtual_hosted_style_request(cfg.virtual_hosted_style)
        .with_allow_http(cfg.allow_http);

    if let Some(endpoint) = cfg.endpoint {
        builder = builder.with_endpoint(endpoint);
    }
    if let Some(access_key_id) = cfg.access_key_id {
        builder = builder.with_access_key_id(access_key_id);
    }
    if let Some(secret_access_key) = cfg.secret_access_key {
        builder = builder.with_secret_access_key(secret_access_key);
    }
    if let Some(session_token) = cfg.session_token {
        builder = builder.with_token(session_token);
    }

    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    async fn collect(mut stream: ByteStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn exists_tracks_puts_and_deletes() -> Result<(), StorageError> {
        let cache = Storage::in_memory();
        assert_eq!(cache.kind(), StorageKind::Memory);
        assert!(!cache.exists("conversions/abc.jpg").await?);

        cache.put_bytes("conversions/abc.jpg", Bytes::from_static(b"jpeg")).await?;
        assert!(cache.exists("conversions/abc.jpg").await?);

        cache.delete("conversions/abc.jpg").await?;
        assert!(!cache.exists("conversions/abc.jpg").await?);
        cache.delete("conversions/abc.jpg").await?;
        Ok(())
    }

    #[tokio::test]
    async fn missing_keys_are_not_found() {
        let cache = Storage::in_memory();
        assert!(cache.get("nope.mp4").await.err().is_some_and(|e| e.is_not_found()));
        assert!(matches!(
            cache.get_bytes("nope.mp4").await,
            Err(StorageError::NotFound(key)) if key == "nope.mp4"
        ));
    }

    #[tokio::test]
    async fn empty_keys_are_rejected() {
        let cache = Storage::in_memory();
        assert!(matches!(cache.exists("/").await, Err(StorageError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn filesystem_streams_artifacts_under_prefix() -> Result<(), StorageError> {
        let dir = tempfile::tempdir()?;
        let cache = Storage::new(StorageConfig::filesystem(dir.path()).with_prefix("relay")).await?;
        assert_eq!(cache.kind().as_str(), "filesystem");

        cache.put_bytes("conversions/movie.mp4", Bytes::from_static(b"frames")).await?;
        assert_eq!(collect(cache.get("conversions/movie.mp4").await?).await, b"frames");
        assert!(dir.path().join("relay/conversions/movie.mp4").exists());
        Ok(())
    }
}
