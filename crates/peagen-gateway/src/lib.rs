//! The gateway binary's library surface: config, the pluggable result/audit
//! store, the scheduler/dispatcher loops, the JSON-RPC router, and the
//! WebSocket bridge. Split out of `main.rs` so integration tests (and the
//! harness) can build a gateway in-process against the in-memory backends.

pub mod config;
pub mod dispatch;
pub mod rpc;
pub mod store;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use peagen_core::queue::in_memory::InMemoryQueue;
use peagen_core::Queue;
use tokio::net::TcpListener;
use tokio::sync::watch;
use uuid::Uuid;

use config::GatewayConfig;
use dispatch::DispatchContext;
use rpc::AppState;
use store::memory::InMemoryStore;
use store::postgres::PostgresStore;
use store::GatewayStore;

/// A reason the gateway failed to start, mapped onto the daemon's documented
/// exit codes by the binary entry point.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[source] anyhow::Error),
    #[error("storage unavailable: {0}")]
    Storage(#[source] anyhow::Error),
    #[error("queue unavailable: {0}")]
    Queue(#[source] anyhow::Error),
    #[error("gateway runtime error: {0}")]
    Runtime(#[source] anyhow::Error),
}

impl StartupError {
    /// Exit code per the daemon's documented contract: 1 config, 2 storage, 3 queue.
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => 1,
            StartupError::Storage(_) => 2,
            StartupError::Queue(_) => 3,
            StartupError::Runtime(_) => 1,
        }
    }
}

const DEFAULT_TENANT_SLUG: &str = "default";
const DEFAULT_POOL: &str = "default";

async fn build_queue(cfg: &GatewayConfig) -> Result<Arc<dyn Queue>, StartupError> {
    match cfg.queue_kind.as_str() {
        "in_memory" => Ok(Arc::new(InMemoryQueue::new())),
        "redis" => {
            let queue = peagen_core::queue::redis_backend::RedisQueue::new(&cfg.queue_url)
                .map_err(|err| StartupError::Queue(anyhow::anyhow!(err)))?;
            Ok(Arc::new(queue))
        }
        other => Err(StartupError::Config(anyhow::anyhow!("unknown queue.kind: {other}"))),
    }
}

async fn build_store(cfg: &GatewayConfig) -> Result<Arc<dyn GatewayStore>, StartupError> {
    match cfg.result_backend_kind.as_str() {
        "in_memory" => Ok(Arc::new(InMemoryStore::new())),
        "postgres" => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(16)
                .connect(&cfg.result_backend_dsn)
                .await
                .map_err(|err| StartupError::Storage(anyhow::Error::from(err)))?;
            sqlx::migrate!("../../migrations/state")
                .run(&pool)
                .await
                .map_err(|err| StartupError::Storage(anyhow::Error::from(err)))?;
            Ok(Arc::new(PostgresStore::new(pool)))
        }
        other => Err(StartupError::Config(anyhow::anyhow!("unknown result_backend.kind: {other}"))),
    }
}

/// Builds every dependency, binds the HTTP listener, and serves until
/// `shutdown_rx` fires, draining for `shutdown_drain_s` before returning.
pub async fn run(cfg: GatewayConfig, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), StartupError> {
    let store = build_store(&cfg).await?;
    let queue = build_queue(&cfg).await?;

    store
        .ensure_tenant(cfg.org_id, DEFAULT_TENANT_SLUG)
        .await
        .map_err(|err| StartupError::Storage(anyhow::anyhow!(err)))?;
    store
        .ensure_pool(cfg.org_id, DEFAULT_POOL)
        .await
        .map_err(|err| StartupError::Storage(anyhow::anyhow!(err)))?;

    let known_pools = vec![DEFAULT_POOL.to_string()];

    let app_state = Arc::new(AppState::new(store.clone(), queue.clone(), cfg.clone()));

    let dispatch_ctx = Arc::new(DispatchContext::new(store, queue, cfg.clone(), &known_pools));
    let (loop_shutdown_tx, loop_shutdown_rx) = watch::channel(false);
    let dispatch_handles = dispatch::spawn(dispatch_ctx, known_pools, loop_shutdown_rx);

    let app = rpc::build_router(app_state.clone()).merge(ws::build_router(app_state));

    let addr: SocketAddr = cfg
        .gateway_bind
        .parse()
        .map_err(|err| StartupError::Config(anyhow::anyhow!("invalid gateway_bind: {err}")))?;
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| StartupError::Storage(anyhow::anyhow!("bind {addr}: {err}")))?;

    tracing::info!(addr = %addr, "gateway listening");

    let drain = std::time::Duration::from_secs(cfg.shutdown_drain_s);
    let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
    });

    let server_result = server.await;

    let _ = loop_shutdown_tx.send(true);
    tokio::time::sleep(drain.min(std::time::Duration::from_secs(30))).await;
    for handle in dispatch_handles {
        let _ = handle.await;
    }

    server_result.map_err(|err| StartupError::Runtime(anyhow::Error::from(err)))
}

/// Convenience: a UUID for a fresh tenant id, used by callers that don't
/// pin one via config (tests, local dev).
pub fn new_tenant_id() -> Uuid {
    Uuid::new_v4()
}
