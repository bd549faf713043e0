//! The worker binary's library surface: config, the handler registry, the
//! runtime that registers/heartbeats against the gateway, and the reverse
//! `/rpc` router the gateway's dispatcher calls into. Split out of `main.rs`
//! the same way `peagen_gateway` is, so the harness can drive a worker
//! in-process for local dev and tests.

pub mod config;
pub mod handler;
pub mod rpc;
pub mod runtime;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::sync::watch;

use config::WorkerConfig;
use handler::HandlerRegistry;
use runtime::WorkerRuntime;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[source] anyhow::Error),
    #[error("gateway registration failed: {0}")]
    Registration(#[source] anyhow::Error),
    #[error("worker runtime error: {0}")]
    Runtime(#[source] anyhow::Error),
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StartupError::Config(_) => 1,
            StartupError::Registration(_) => 3,
            StartupError::Runtime(_) => 1,
        }
    }
}

/// Registers with the gateway, binds the reverse `/rpc` listener, and serves
/// until `shutdown_rx` fires. The heartbeat loop runs alongside as a spawned
/// task and is joined on shutdown.
pub async fn run(cfg: WorkerConfig, registry: HandlerRegistry, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), StartupError> {
    let addr: SocketAddr = cfg
        .worker_bind
        .parse()
        .map_err(|err| StartupError::Config(anyhow::anyhow!("invalid worker_bind: {err}")))?;

    let runtime = WorkerRuntime::register(cfg, registry)
        .await
        .map_err(StartupError::Registration)?;

    let (heartbeat_shutdown_tx, heartbeat_shutdown_rx) = watch::channel(false);
    let heartbeat_handle = tokio::spawn(runtime.clone().heartbeat_loop(heartbeat_shutdown_rx));

    let app = rpc::router(runtime.clone());
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| StartupError::Runtime(anyhow::anyhow!("bind {addr}: {err}")))?;

    tracing::info!(addr = %addr, worker_id = %runtime.worker_id, "worker listening");

    let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(async move {
        while !*shutdown_rx.borrow() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
    });

    let server_result = server.await;

    let _ = heartbeat_shutdown_tx.send(true);
    let _ = heartbeat_handle.await;

    server_result.map_err(|err| StartupError::Runtime(anyhow::Error::from(err)))
}
