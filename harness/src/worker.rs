use std::time::Duration;

use peagen_worker::handler::{FnHandler, HandlerOutcome, HandlerRegistry};
use tokio::sync::watch;

/// Runs a worker in-process until Ctrl-C, registered with a single `echo`
/// handler: sleeps briefly (so `Work.cancel` has something to interrupt),
/// then hands the task's `args` straight back as its result. Useful for
/// exercising the dispatch pipeline locally without a real handler plugged
/// in; a production worker binary registers its own handlers and calls
/// [`peagen_worker::run`] directly instead of going through this module.
pub async fn run() -> anyhow::Result<()> {
    let cfg = peagen_worker::config::WorkerConfig::load()?;

    let mut registry = HandlerRegistry::new();
    registry.register(
        "echo",
        FnHandler::boxed(|mut ctx, args| async move {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(200)) => {
                    HandlerOutcome::succeeded(args, Vec::new())
                }
                _ = ctx.cancel.cancelled() => {
                    HandlerOutcome::failed("cancelled")
                }
            }
        }),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    peagen_worker::run(cfg, registry, shutdown_rx).await.map_err(|err| {
        tracing::error!(error = %err, exit_code = err.exit_code(), "worker exited with error");
        anyhow::anyhow!(err)
    })
}
