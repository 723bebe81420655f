//! Result cache backend selection.

use std::path::PathBuf;

use crate::StorageError;

const DEFAULT_FS_ROOT: &str = "./data/result_cache";

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub allow_http: bool,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
    pub virtual_hosted_style: bool,
}

#[derive(Debug, Clone)]
pub enum StorageBackendConfig {
    S3(S3Config),
    Filesystem { root: PathBuf },
    Memory,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: StorageBackendConfig,
    /// Optional prefix applied to every cache key.
    pub prefix: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::filesystem(DEFAULT_FS_ROOT)
    }
}

impl StorageConfig {
    pub fn memory() -> Self {
        Self {
            backend: StorageBackendConfig::Memory,
            prefix: None,
        }
    }

    pub fn filesystem(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackendConfig::Filesystem { root: root.into() },
            prefix: None,
        }
    }

    pub fn s3(cfg: S3Config) -> Self {
        Self {
            backend: StorageBackendConfig::S3(cfg),
            prefix: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = non_empty(prefix.into());
        self
    }

    /// Build a config from environment variables.
    ///
    /// - `STORAGE_BACKEND`: `s3`, `filesystem` (default) or `memory`
    /// - `STORAGE_FS_ROOT` (default: `./data/result_cache`)
    /// - `STORAGE_PREFIX` (optional)
    ///
    /// S3-compatible backends read `S3_BUCKET` (required), `AWS_REGION`
    /// (default `us-east-1`), `S3_ENDPOINT`, `S3_ALLOW_HTTP` (defaults to true
    /// for `http://` endpoints), `S3_VIRTUAL_HOSTED_STYLE`, and the usual
    /// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` / `AWS_SESSION_TOKEN`.
    pub fn from_env() -> Result<Self, StorageError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, StorageError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).and_then(non_empty);
        let fs_root = || {
            var("STORAGE_FS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FS_ROOT))
        };

        let cfg = match var("STORAGE_BACKEND").as_deref() {
            Some("s3") => Self::s3(read_s3_config(&var)?),
            Some("filesystem") | Some("fs") | None => Self::filesystem(fs_root()),
            Some("memory") | Some("mem") => Self::memory(),
            Some(other) => {
                return Err(StorageError::InvalidConfig(format!(
                    "unsupported STORAGE_BACKEND={other} (expected s3|filesystem|memory)"
                )));
            }
        };

        Ok(Self {
            prefix: var("STORAGE_PREFIX"),
            ..cfg
        })
    }
}

pub(crate) fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_bool(name: &str, raw: Option<String>) -> Result<Option<bool>, StorageError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Ok(Some(true)),
        "0" | "false" | "no" | "n" => Ok(Some(false)),
        _ => Err(StorageError::InvalidConfig(format!(
            "invalid boolean for {name}={raw} (expected true/false)"
        ))),
    }
}

fn read_s3_config(var: &dyn Fn(&str) -> Option<String>) -> Result<S3Config, StorageError> {
    let bucket = var("S3_BUCKET")
        .ok_or_else(|| StorageError::InvalidConfig("S3_BUCKET is required for s3 backend".into()))?;
    let endpoint = var("S3_ENDPOINT");
    let allow_http = match parse_bool("S3_ALLOW_HTTP", var("S3_ALLOW_HTTP"))? {
        Some(v) => v,
        None => endpoint
            .as_deref()
            .is_some_and(|e| e.to_ascii_lowercase().starts_with("http://")),
    };

    Ok(S3Config {
        bucket,
        region: var("AWS_REGION").unwrap_or_else(|| "us-east-1".to_string()),
        endpoint,
        allow_http,
        access_key_id: var("AWS_ACCESS_KEY_ID"),
        secret_access_key: var("AWS_SECRET_ACCESS_KEY"),
        session_token: var("AWS_SESSION_TOKEN"),
        virtual_hosted_style: parse_bool("S3_VIRTUAL_HOSTED_STYLE", var("S3_VIRTUAL_HOSTED_STYLE"))?
            .unwrap_or(false),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;

    fn lookup(vars: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |name| {
            vars.iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn defaults_to_filesystem() {
        let cfg = StorageConfig::from_lookup(lookup(&[])).unwrap();
        match cfg.backend {
            StorageBackendConfig::Filesystem { root } => {
                assert_eq!(root, PathBuf::from(DEFAULT_FS_ROOT))
            }
            other => panic!("unexpected backend {other:?}"),
        }
        assert!(cfg.prefix.is_none());
    }

    #[test]
    fn s3_endpoint_over_http_allows_http() {
        let cfg = StorageConfig::from_lookup(lookup(&[
            ("STORAGE_BACKEND", "s3"),
            ("S3_BUCKET", "artifacts"),
            ("S3_ENDPOINT", "http://localhost:9000"),
            ("STORAGE_PREFIX", " relay/ "),
        ]))
        .unwrap();
        let StorageBackendConfig::S3(s3) = cfg.backend else {
            panic!("expected s3 backend");
        };
        assert_eq!(s3.bucket, "artifacts");
        assert_eq!(s3.region, "us-east-1");
        assert!(s3.allow_http);
        assert_eq!(cfg.prefix.as_deref(), Some("relay/"));
    }

    #[test]
    fn s3_requires_bucket() {
        let err = StorageConfig::from_lookup(lookup(&[("STORAGE_BACKEND", "s3")])).unwrap_err();
        assert!(err.to_string().contains("S3_BUCKET"));
    }

    #[test]
    fn rejects_unknown_backend() {
        assert!(StorageConfig::from_lookup(lookup(&[("STORAGE_BACKEND", "tape")])).is_err());
    }
}
