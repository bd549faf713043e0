use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use peagen_harness::{client, config, gateway, migrate, worker};

#[derive(Parser, Debug)]
#[command(name = "peagen-harness")]
#[command(about = "Local dev harness for the control plane", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run state database migrations.
    Migrate,

    /// Run the gateway in-process until Ctrl-C.
    Gateway,

    /// Run a worker (with a demo "echo" handler) in-process until Ctrl-C.
    Worker,

    /// Fire an ad-hoc RPC call at a running gateway.
    Client {
        #[arg(long, env = "GATEWAY_URL", default_value = "http://127.0.0.1:8080")]
        gateway_url: String,

        #[command(subcommand)]
        command: client::ClientCommand,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Migrate => {
            let cfg = config::HarnessConfig::from_env().context("load harness config")?;
            migrate::run(&cfg).await
        }
        Command::Gateway => gateway::run().await,
        Command::Worker => worker::run().await,
        Command::Client { gateway_url, command } => client::run(&gateway_url, command).await,
    }
}
