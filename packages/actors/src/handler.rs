//! Job handler trait and registry.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use relay_core::{Converter, HandlerError};
use storage::Storage;

use crate::context::JobContext;

/// Future type for async job handlers.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Trait for job handlers.
///
/// A handler settles the delivery through the context it is given; it does
/// not return a result. See [`JobContext`] for the contract.
pub trait JobHandler: Send + Sync + 'static {
    fn handle<'a>(&'a self, ctx: &'a mut JobContext) -> HandlerFuture<'a>;
}

/// Maps job names to handlers.
///
/// Built once at startup, then shared read-only by every worker.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing any previous one.
    pub fn register<H: JobHandler>(&mut self, name: impl Into<String>, handler: H) -> &mut Self {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            tracing::warn!("Replaced handler for {}", name);
        } else {
            tracing::debug!("Registered handler for {}", name);
        }
        self
    }

    /// Register a [`ConversionHandler`] for `C` under `C::NAME`.
    pub fn register_converter<C: Converter>(&mut self, cache: Storage) -> &mut Self {
        self.register(C::NAME, ConversionHandler::<C>::new(cache))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered job names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// A closure-based job handler.
///
/// ```ignore
/// registry.register("Echo", FnHandler::new(|ctx| Box::pin(async move { ctx.complete().await })));
/// ```
pub struct FnHandler<F>
where
    F: for<'a> Fn(&'a mut JobContext) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    handler: F,
}

impl<F> FnHandler<F>
where
    F: for<'a> Fn(&'a mut JobContext) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: for<'a> Fn(&'a mut JobContext) -> HandlerFuture<'a> + Send + Sync + 'static,
{
    fn handle<'a>(&'a self, ctx: &'a mut JobContext) -> HandlerFuture<'a> {
        (self.handler)(ctx)
    }
}

/// Runs a [`Converter`] and stores its artifact in the result cache.
///
/// Decode payload, convert, write the artifact under the request's cache
/// key, then ack and reply. Transient conversion or cache failures request a
/// retry; invalid requests are recorded and left for the pool to drop.
pub struct ConversionHandler<C> {
    cache: Storage,
    _converter: PhantomData<fn() -> C>,
}

impl<C: Converter> ConversionHandler<C> {
    pub fn new(cache: Storage) -> Self {
        Self {
            cache,
            _converter: PhantomData,
        }
    }
}

impl<C: Converter> JobHandler for ConversionHandler<C> {
    fn handle<'a>(&'a self, ctx: &'a mut JobContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            let request: C = match ctx.decode_payload() {
                Ok(request) => request,
                Err(e) => {
                    ctx.add_error(e);
                    return;
                }
            };

            let artifact = match request.convert().await {
                Ok(artifact) => artifact,
                Err(e) => {
                    ctx.add_error(e.into());
                    return;
                }
            };

            let key = request.key();
            if let Err(e) = self.cache.put_bytes(key.as_str(), artifact).await {
                ctx.add_error(HandlerError::Recoverable(format!("caching {} failed: {}", key, e)));
                return;
            }

            ctx.complete().await;
        })
    }
}
