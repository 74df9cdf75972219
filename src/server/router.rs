//! Method routing for the worker server.
//!
//! Maps method names to async handlers. Every worker answers the
//! built-in `health` method without touching user code; user handlers
//! may shadow it.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::cancel::CancelRegistry;
use crate::error::{Error, Result};

/// Boxed future returned by handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

type BoxedHandler = Box<dyn Fn(Value, RequestContext) -> HandlerFuture + Send + Sync>;

/// Per-request context handed to handlers.
#[derive(Clone)]
pub struct RequestContext {
    request_id: u64,
    cancel: CancellationToken,
    registry: Arc<CancelRegistry>,
}

impl RequestContext {
    pub(crate) fn new(
        request_id: u64,
        cancel: CancellationToken,
        registry: Arc<CancelRegistry>,
    ) -> Self {
        Self {
            request_id,
            cancel,
            registry,
        }
    }

    /// Id of the request being handled.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// True once the driver has cancelled this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the driver cancels this request.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Register a cleanup that runs when the request finishes, whether
    /// it completed or was cancelled.
    pub fn on_cleanup(&self, cleanup: impl FnOnce() + Send + 'static) {
        self.registry.add_cleanup(self.request_id, cleanup);
    }

    /// The error a handler should return after observing cancellation.
    pub fn cancellation_error(&self) -> Error {
        Error::Cancelled("context cancelled".to_string())
    }
}

/// Registry mapping method names to handlers.
#[derive(Default)]
pub struct Router {
    methods: HashMap<String, BoxedHandler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `method`.
    pub fn register<F, Fut>(&mut self, method: impl Into<String>, handler: F)
    where
        F: Fn(Value, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.methods.insert(
            method.into(),
            Box::new(move |body, ctx| Box::pin(handler(body, ctx))),
        );
    }

    /// True if a handler is registered under `method`.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Dispatch a request body to its handler.
    ///
    /// `health` is answered built-in unless user code registered its own
    /// handler; unknown methods produce an error naming the method.
    pub async fn dispatch(&self, method: &str, body: Value, ctx: RequestContext) -> Result<Value> {
        match self.methods.get(method) {
            Some(handler) => handler(body, ctx).await,
            None if method == "health" => Ok(json!({"status": "ok"})),
            None => Err(Error::Remote(format!("method not found: {method}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ctx(registry: &Arc<CancelRegistry>, id: u64) -> RequestContext {
        RequestContext::new(id, registry.register(id), registry.clone())
    }

    #[tokio::test]
    async fn test_dispatch_registered_method() {
        let mut router = Router::new();
        router.register("double", |body: Value, _ctx| async move {
            let n = body["n"].as_i64().unwrap_or(0);
            Ok(json!({"result": n * 2}))
        });

        let registry = Arc::new(CancelRegistry::new());
        let out = router
            .dispatch("double", json!({"n": 21}), test_ctx(&registry, 1))
            .await
            .unwrap();
        assert_eq!(out, json!({"result": 42}));
    }

    #[tokio::test]
    async fn test_builtin_health() {
        let router = Router::new();
        let registry = Arc::new(CancelRegistry::new());

        let out = router
            .dispatch("health", Value::Null, test_ctx(&registry, 1))
            .await
            .unwrap();
        assert_eq!(out["status"], json!("ok"));
    }

    #[tokio::test]
    async fn test_user_handler_shadows_health() {
        let mut router = Router::new();
        router.register("health", |_body, _ctx| async move {
            Ok(json!({"status": "custom"}))
        });
        assert!(router.has_method("health"));

        let registry = Arc::new(CancelRegistry::new());
        let out = router
            .dispatch("health", Value::Null, test_ctx(&registry, 1))
            .await
            .unwrap();
        assert_eq!(out["status"], json!("custom"));
    }

    #[tokio::test]
    async fn test_unknown_method_names_the_method() {
        let router = Router::new();
        let registry = Arc::new(CancelRegistry::new());

        let err = router
            .dispatch("nonexistent", Value::Null, test_ctx(&registry, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote(ref m) if m.contains("nonexistent")));
    }

    #[tokio::test]
    async fn test_context_observes_cancellation() {
        let mut router = Router::new();
        router.register("wait", |_body, ctx: RequestContext| async move {
            ctx.cancelled().await;
            Err(ctx.cancellation_error())
        });

        let registry = Arc::new(CancelRegistry::new());
        let ctx = test_ctx(&registry, 5);

        let registry_for_cancel = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            registry_for_cancel.cancel(5, "test");
        });

        let err = router
            .dispatch("wait", Value::Null, ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }
}
