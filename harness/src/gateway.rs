use tokio::sync::watch;

/// Runs the gateway in-process until Ctrl-C, draining per its configured
/// `shutdown_drain_s`. This is the same entry point a container image would
/// call from its own thin `main.rs`; the harness just gives local dev a way
/// to run it without a separate binary.
pub async fn run() -> anyhow::Result<()> {
    let cfg = peagen_gateway::config::GatewayConfig::load()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });

    peagen_gateway::run(cfg, shutdown_rx).await.map_err(|err| {
        tracing::error!(error = %err, exit_code = err.exit_code(), "gateway exited with error");
        anyhow::anyhow!(err)
    })
}
