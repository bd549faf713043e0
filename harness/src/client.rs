use clap::{Args, Subcommand};
use peagen_client::{GatewayClient, TaskSubmitParams};
use uuid::Uuid;

#[derive(Subcommand, Debug)]
pub enum ClientCommand {
    /// Task.submit
    Submit(SubmitArgs),
    /// Task.get
    Get { task_id: Uuid },
    /// Task.history
    History { task_id: Uuid },
    /// Task.cancel
    Cancel { task_id: Uuid },
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    #[arg(long)]
    pub kind: String,
    #[arg(long, default_value = "default")]
    pub pool: String,
    /// JSON-encoded args object.
    #[arg(long, default_value = "{}")]
    pub args: String,
}

pub async fn run(gateway_url: &str, command: ClientCommand) -> anyhow::Result<()> {
    let client = GatewayClient::new(gateway_url);

    match command {
        ClientCommand::Submit(submit) => {
            let args: serde_json::Value = serde_json::from_str(&submit.args)?;
            let result = client
                .task_submit(TaskSubmitParams {
                    kind: submit.kind,
                    pool: submit.pool,
                    args,
                    client_token: None,
                    parent_task_id: None,
                    design_hash: None,
                    plan_hash: None,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "task_id": result.task_id,
                "rev_hash": result.rev_hash,
            }))?);
        }
        ClientCommand::Get { task_id } => {
            let result = client.task_get(task_id).await?;
            println!("{}", serde_json::to_string_pretty(&result.task)?);
        }
        ClientCommand::History { task_id } => {
            let history = client.task_history(task_id).await?;
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        ClientCommand::Cancel { task_id } => {
            let result = client.task_cancel(task_id).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "rev_hash": result.rev_hash,
            }))?);
        }
    }

    Ok(())
}
