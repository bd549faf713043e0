use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::config::HarnessConfig;

/// Run the state database migrations. The same migration set is also run
/// lazily by `peagen_gateway::run` when `result_backend.kind = postgres`,
/// but running it ahead of time is the harness's job for local dev and CI.
pub async fn run(cfg: &HarnessConfig) -> anyhow::Result<()> {
    let state_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&cfg.state_database_url)
        .await
        .context("connect state db")?;

    sqlx::migrate!("../migrations/state")
        .run(&state_pool)
        .await
        .context("migrate state db")?;

    tracing::info!("migrations complete");
    Ok(())
}
