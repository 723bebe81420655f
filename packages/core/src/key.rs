//! Deterministic cache keys for derived artifacts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Location of a finished artifact in the result cache.
///
/// Presence of the key in the cache is the only signal that the artifact is
/// ready; nothing re-validates the stored bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Start a key for `source_id` under `namespace`.
    pub fn builder(namespace: impl Into<String>, source_id: impl Into<String>) -> CacheKeyBuilder {
        CacheKeyBuilder {
            namespace: namespace.into(),
            source_id: source_id.into(),
            options: BTreeMap::new(),
            extension: None,
        }
    }

    /// Use a raw string as a key.
    pub fn raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Collects the request identity that a key is derived from.
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    namespace: String,
    source_id: String,
    options: BTreeMap<String, String>,
    extension: Option<String>,
}

impl CacheKeyBuilder {
    /// Add an option that affects the output.
    pub fn option(mut self, name: impl Into<String>, value: impl std::fmt::Display) -> Self {
        self.options.insert(name.into(), value.to_string());
        self
    }

    /// Set the file extension of the artifact.
    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// Hash the identity into `<namespace>/<sha256>[.<extension>]`.
    ///
    /// Options are hashed in name order, so insertion order never matters.
    pub fn build(self) -> CacheKey {
        let mut hasher = Sha256::new();
        hash_field(&mut hasher, &self.source_id);
        for (name, value) in &self.options {
            hash_field(&mut hasher, name);
            hash_field(&mut hasher, value);
        }
        let digest = hasher.finalize();

        let namespace = self.namespace.trim_matches('/');
        let key = match self.extension.as_deref() {
            Some(ext) => format!("{namespace}/{digest:x}.{}", ext.trim_start_matches('.')),
            None => format!("{namespace}/{digest:x}"),
        };
        CacheKey(key)
    }
}

/// Length-prefixed, so no field can absorb or forge its neighbours.
fn hash_field(hasher: &mut Sha256, field: &str) {
    hasher.update((field.len() as u64).to_le_bytes());
    hasher.update(field.as_bytes());
}
