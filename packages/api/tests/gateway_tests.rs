#![allow(clippy::disallowed_methods)]

mod common;

use std::time::Duration;

use actors::{FnHandler, HandlerRegistry};
use api::{ComputeError, DispatchError, Task};
use bytes::Bytes;
use common::{FlakyMovie, Harness, Thumbnail, wait_for_event};
use relay_core::{DropReason, JobEvent};
use storage::{Storage, StorageError};

fn converters(cache: &Storage) -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers
        .register_converter::<Thumbnail>(cache.clone())
        .register_converter::<FlakyMovie>(cache.clone());
    handlers
}

async fn start() -> Harness {
    let cache = Storage::in_memory();
    let handlers = converters(&cache);
    Harness::start_with(cache, handlers, Duration::from_secs(10)).await
}

#[tokio::test]
async fn miss_computes_then_hit_serves_from_cache() {
    let harness = start().await;
    let request = Thumbnail::new("1.2.840.1", 256);

    let first = harness.gateway.get_or_compute(&request).await.unwrap();
    assert_eq!(first.content_type, "image/jpeg");
    assert_eq!(first.key, request.cache_key());
    assert_eq!(first.into_bytes().await.unwrap(), request.expected_bytes());
    assert_eq!(harness.published(), 1);

    let second = harness.gateway.get_or_compute(&request).await.unwrap();
    assert_eq!(second.content_type, "image/jpeg");
    assert_eq!(second.into_bytes().await.unwrap(), request.expected_bytes());
    assert_eq!(harness.published(), 1, "a hit must not dispatch");
}

#[tokio::test]
async fn different_options_are_different_artifacts() {
    let harness = start().await;
    let small = Thumbnail::new("1.2.840.2", 64);
    let large = Thumbnail::new("1.2.840.2", 512);
    assert_ne!(small.cache_key(), large.cache_key());

    let a = harness.gateway.get_or_compute(&small).await.unwrap();
    let b = harness.gateway.get_or_compute(&large).await.unwrap();
    assert_eq!(a.into_bytes().await.unwrap(), small.expected_bytes());
    assert_eq!(b.into_bytes().await.unwrap(), large.expected_bytes());
    assert_eq!(harness.published(), 2);
}

#[tokio::test]
async fn prepopulated_cache_never_dispatches() {
    let harness = start().await;
    let request = Thumbnail::new("1.2.840.3", 128);
    harness
        .cache
        .put_bytes(request.cache_key().as_str(), Bytes::from_static(b"precomputed"))
        .await
        .unwrap();

    let artifact = harness.gateway.get_or_compute(&request).await.unwrap();
    assert_eq!(artifact.into_bytes().await.unwrap(), Bytes::from_static(b"precomputed"));
    assert_eq!(harness.published(), 0);
}

#[tokio::test]
async fn invalid_request_surfaces_as_timeout() {
    let cache = Storage::in_memory();
    let handlers = converters(&cache);
    let harness = Harness::start_with(cache, handlers, Duration::from_millis(500)).await;
    let mut events = harness.pool.subscribe();

    let err = harness
        .gateway
        .get_or_compute(&Thumbnail::new("", 128))
        .await
        .unwrap_err();
    assert!(matches!(err, ComputeError::Dispatch(DispatchError::Timeout { .. })));

    // Invalid requests are not retried.
    let dropped = wait_for_event(&mut events, |e| matches!(e, JobEvent::JobDropped { .. })).await;
    assert!(matches!(
        dropped,
        JobEvent::JobDropped {
            reason: DropReason::NoDecision,
            tries: 0,
            ..
        }
    ));
    assert_eq!(harness.published(), 1);
}

#[tokio::test]
async fn transient_conversion_failure_is_retried() {
    let harness = start().await;
    let mut events = harness.pool.subscribe();
    let request = FlakyMovie {
        instance_id: "1.2.840.4".to_string(),
    };

    let artifact = harness.gateway.get_or_compute(&request).await.unwrap();
    assert_eq!(artifact.content_type, "video/mp4");
    assert_eq!(artifact.into_bytes().await.unwrap(), Bytes::from_static(b"mp4"));
    assert_eq!(FlakyMovie::calls(), 2);
    assert_eq!(harness.published(), 2);

    let completed =
        wait_for_event(&mut events, |e| matches!(e, JobEvent::JobCompleted { .. })).await;
    assert!(matches!(completed, JobEvent::JobCompleted { tries: 1, .. }));
}

#[tokio::test]
async fn reply_without_artifact_is_a_cache_error() {
    // A handler that claims success but never writes the artifact.
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "InstanceToJPG",
        FnHandler::new(|ctx| Box::pin(async move { ctx.complete().await })),
    );
    let harness = Harness::start(handlers).await;

    let err = harness
        .gateway
        .get_or_compute(&Thumbnail::new("1.2.840.5", 32))
        .await
        .unwrap_err();
    match err {
        ComputeError::Cache(StorageError::NotFound(_)) => {}
        other => panic!("expected missing artifact, got {other}"),
    }
    assert_eq!(harness.published(), 1);
}

#[tokio::test]
async fn concurrent_misses_for_one_key_both_dispatch() {
    let harness = start().await;
    let request = Thumbnail::new("1.2.840.6", 96);

    let (a, b) = tokio::join!(
        harness.gateway.get_or_compute(&request),
        harness.gateway.get_or_compute(&request),
    );

    assert_eq!(a.unwrap().into_bytes().await.unwrap(), request.expected_bytes());
    assert_eq!(b.unwrap().into_bytes().await.unwrap(), request.expected_bytes());
    assert_eq!(harness.published(), 2);
}
