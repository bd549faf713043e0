//! Task handler registry.
//!
//! Per the redesign note on "plugin discovery via package metadata": handlers
//! are registered explicitly by name at process start (`HandlerRegistry::register`)
//! rather than discovered via reflection or module-import side effects. The
//! gateway's own `build_queue`/`build_store` `match` tables follow the same
//! explicit-registry spirit for backend selection.
//!
//! A handler is invoked with the envelope's `args` plus a [`HandlerContext`]
//! giving it a resolved secret view and a cooperative cancellation signal; it
//! returns a [`HandlerOutcome`] that the runtime reports back to the gateway
//! via `Work.finished`. Handler execution itself — what a `process`/`mutate`/
//! `evolve`/`doe`/`evaluate` task actually does — is outside the core; this
//! registry only defines the seam.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use peagen_client::GatewayClient;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl HandlerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HandlerStatus::Succeeded => "succeeded",
            HandlerStatus::Failed => "failed",
            HandlerStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub status: HandlerStatus,
    pub result: Value,
    pub artifacts: Vec<String>,
}

impl HandlerOutcome {
    pub fn succeeded(result: Value, artifacts: Vec<String>) -> Self {
        Self { status: HandlerStatus::Succeeded, result, artifacts }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: HandlerStatus::Failed,
            result: serde_json::json!({ "reason": reason.into() }),
            artifacts: Vec::new(),
        }
    }

    pub fn cancel_refused() -> Self {
        Self {
            status: HandlerStatus::Failed,
            result: serde_json::json!({ "reason": "cancel_refused" }),
            artifacts: Vec::new(),
        }
    }
}

/// Cooperative cancellation signal handed to a running handler. `Work.cancel`
/// is advisory: the runtime flips this flag, but a handler that never
/// observes it simply runs to completion.
#[derive(Clone)]
pub struct CancelSignal {
    rx: tokio::sync::watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Resolved per-call dependencies a handler needs to do its work: the
/// envelope identity, a secret-fetching callback (`Secret.get` round-trips
/// through the gateway client), and the cancellation signal.
pub struct HandlerContext {
    pub task_id: Uuid,
    pub kind: String,
    pub attempt: i64,
    pub gateway: GatewayClient,
    pub cancel: CancelSignal,
}

impl HandlerContext {
    /// Fetches a secret's ciphertext/wrapped-keys envelope via `Secret.get`.
    /// Unwrapping under the worker's private key is the handler's job (the
    /// core vault functions in [`peagen_core::vault`] do the unwrap); the
    /// worker runtime never sees plaintext.
    pub async fn get_secret(&self, name: &str, pool: &str) -> anyhow::Result<Value> {
        Ok(self.gateway.secret_get(name, pool).await?)
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext, args: Value) -> HandlerOutcome;
}

type BoxedHandler = Arc<dyn TaskHandler>;

/// Adapts a plain async closure into a [`TaskHandler`], the common case for
/// registering a handler without defining a named type.
pub struct FnHandler<F>(pub F);

impl<F, Fut> FnHandler<F>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    pub fn boxed(f: F) -> Arc<dyn TaskHandler>
    where
        F: 'static,
    {
        Arc::new(Self(f))
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(HandlerContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerContext, args: Value) -> HandlerOutcome {
        let fut: Pin<Box<dyn Future<Output = HandlerOutcome> + Send>> = Box::pin((self.0)(ctx, args));
        fut.await
    }
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, BoxedHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for the given `kind` tag. Re-registering a kind
    /// replaces the previous handler.
    pub fn register(&mut self, kind: impl Into<String>, handler: Arc<dyn TaskHandler>) -> &mut Self {
        self.handlers.insert(kind.into(), handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn capabilities(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

pub(crate) fn new_cancel_pair() -> (tokio::sync::watch::Sender<bool>, CancelSignal) {
    let (tx, rx) = tokio::sync::watch::channel(false);
    (tx, CancelSignal { rx })
}
