//! Worker configuration, mirroring [`peagen_gateway::config::GatewayConfig`]'s
//! clap/env style: parse once at startup, pass `&WorkerConfig` down.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct WorkerConfig {
    #[arg(long, env = "GATEWAY_URL", default_value = "http://127.0.0.1:8080")]
    pub gateway_url: String,

    #[arg(long, env = "WORKER_BIND", default_value = "127.0.0.1:8090")]
    pub worker_bind: String,

    /// Externally reachable base URL the gateway should use for `Work.start`
    /// / `Work.cancel` callbacks. Defaults to `http://<worker_bind>`.
    #[arg(long, env = "WORKER_ENDPOINT")]
    pub worker_endpoint: Option<String>,

    #[arg(long, env = "WORKER_POOL", default_value = "default")]
    pub pool: String,

    /// Comma-separated task `kind` tags this worker can execute.
    #[arg(long, env = "WORKER_CAPABILITIES", default_value = "process", value_delimiter = ',')]
    pub capabilities: Vec<String>,

    #[arg(long, env = "HEARTBEAT_INTERVAL_S", default_value_t = 10)]
    pub heartbeat_interval_s: u64,

    /// Bound on concurrently-executing handlers.
    #[arg(long, env = "WORKER_HANDLER_CONCURRENCY", default_value_t = 4)]
    pub handler_concurrency: usize,

    /// Armored Ed25519 private key seed (base64), for signing outbound RPCs.
    /// Unset means the worker calls the gateway unsigned (relies on the
    /// unsigned-method allowlist covering what this worker needs).
    #[arg(long, env = "WORKER_SIGNING_KEY")]
    pub signing_key: Option<String>,
}

impl WorkerConfig {
    pub fn load() -> anyhow::Result<Self> {
        Ok(Self::parse_from(["peagen-worker"]))
    }

    pub fn endpoint(&self) -> String {
        self.worker_endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.worker_bind))
    }
}
