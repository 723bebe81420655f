//! Capabilities consumed from conversion collaborators.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::job::HandlerError;
use crate::key::CacheKey;

/// Future returned by [`Converter::convert`].
pub type ConvertFuture<'a> = Pin<Box<dyn Future<Output = Result<Bytes, ConvertError>> + Send + 'a>>;

/// Failure while producing an artifact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConvertError {
    /// The source or a collaborator was temporarily unavailable.
    #[error("transient conversion failure: {0}")]
    Transient(String),
    /// The request can never succeed.
    #[error("invalid conversion request: {0}")]
    Invalid(String),
}

impl From<ConvertError> for HandlerError {
    fn from(err: ConvertError) -> Self {
        match err {
            ConvertError::Transient(_) => HandlerError::Recoverable(err.to_string()),
            ConvertError::Invalid(_) => HandlerError::Unrecoverable(err.to_string()),
        }
    }
}

/// A request the cache-gated dispatcher can serve.
pub trait Task: Send + Sync {
    /// Where the finished artifact lives in the result cache.
    fn cache_key(&self) -> CacheKey;

    fn content_type(&self) -> &str;

    /// Name of the handler that produces the artifact.
    fn handler_name(&self) -> &str;

    /// Request payload shipped to the handler.
    fn payload(&self) -> Result<serde_json::Value, serde_json::Error>;
}

/// A conversion routine producing one artifact per request.
///
/// The request itself is the job payload, so implementors must round-trip
/// through serde.
pub trait Converter: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Handler name the conversion is registered under.
    const NAME: &'static str;

    fn key(&self) -> CacheKey;

    fn content_type(&self) -> &str;

    fn convert(&self) -> ConvertFuture<'_>;
}

impl<C: Converter> Task for C {
    fn cache_key(&self) -> CacheKey {
        self.key()
    }

    fn content_type(&self) -> &str {
        Converter::content_type(self)
    }

    fn handler_name(&self) -> &str {
        C::NAME
    }

    fn payload(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct Thumbnail {
        instance_id: String,
        size: u32,
    }

    impl Converter for Thumbnail {
        const NAME: &'static str = "Thumbnail";

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
            Box::pin(async move { Ok(Bytes::from(format!("{}@{}", self.instance_id, self.size))) })
        }
    }

    #[test]
    fn converters_are_tasks() {
        let thumb = Thumbnail {
            instance_id: "i-1".into(),
            size: 64,
        };
        assert_eq!(thumb.handler_name(), "Thumbnail");
        assert_eq!(Task::content_type(&thumb), "image/jpeg");
        assert_eq!(thumb.cache_key(), thumb.key());

        let payload = thumb.payload().unwrap();
        let decoded: Thumbnail = serde_json::from_value(payload).unwrap();
        assert_eq!(decoded.key(), thumb.key());
    }

    #[test]
    fn convert_errors_map_to_handler_errors() {
        let transient: HandlerError = ConvertError::Transient("s3 timeout".into()).into();
        assert!(transient.is_recoverable());
        let invalid: HandlerError = ConvertError::Invalid("empty id".into()).into();
        assert!(!invalid.is_recoverable());
    }
}
