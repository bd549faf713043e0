//! Thin JSON-RPC client used by workers to call the gateway, by the gateway
//! to call workers' reverse `/rpc` endpoint, and by integration tests.
//!
//! A `reqwest::Client` wrapped around a base URL, built around a single
//! `call` primitive plus typed wrappers, since the JSON-RPC surface is
//! uniform across every method rather than a handful of bespoke REST routes.

use anyhow::anyhow;
use peagen_core::rpc::{JSONRPC_VERSION, RpcError};
use peagen_core::signer::{canonicalize, RequestSigner, FINGERPRINT_HEADER, SIGNATURE_HEADER};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String, data: Option<Value> },
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<RpcError> for ClientError {
    fn from(err: RpcError) -> Self {
        ClientError::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

#[derive(Clone)]
pub struct RpcClient {
    base_url: String,
    http: reqwest::Client,
    signer: Option<std::sync::Arc<RequestSigner>>,
}

impl RpcClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: reqwest::Client::new(),
            signer: None,
        }
    }

    pub fn with_signer(mut self, signer: RequestSigner) -> Self {
        self.signer = Some(std::sync::Arc::new(signer));
        self
    }

    pub async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R, ClientError> {
        let id = Value::from(Uuid::new_v4().to_string());
        let params_value = serde_json::to_value(params)?;
        let body = serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "method": method,
            "params": params_value,
            "id": id,
        });
        let canonical = canonicalize(&body);

        let mut request = self.http.post(format!("{}/rpc", self.base_url.trim_end_matches('/'))).json(&body);

        if let Some(signer) = &self.signer {
            let signature = signer.sign(&canonical);
            request = request
                .header(SIGNATURE_HEADER, signature)
                .header(FINGERPRINT_HEADER, signer.fingerprint());
        }

        let resp = request.send().await.map_err(ClientError::Transport)?;
        let resp = resp.error_for_status().map_err(ClientError::Transport)?;
        let envelope: Value = resp.json().await.map_err(ClientError::Transport)?;

        if let Some(error) = envelope.get("error").filter(|v| !v.is_null()) {
            let rpc_error: RpcError = serde_json::from_value(error.clone())?;
            return Err(rpc_error.into());
        }

        let result = envelope
            .get("result")
            .cloned()
            .ok_or_else(|| anyhow!("rpc response missing result"))?;
        Ok(serde_json::from_value(result)?)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSubmitParams {
    pub kind: String,
    pub pool: String,
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub design_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_hash: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskSubmitResult {
    pub task_id: Uuid,
    pub rev_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskUpdateParams {
    pub task_id: Uuid,
    pub patch: Value,
    pub parent_rev_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskUpdateResult {
    pub rev_hash: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskGetResult {
    pub task: Value,
    pub rev_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerRegisterParams {
    pub endpoint: String,
    pub pool: String,
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerRegisterResult {
    pub worker_id: Uuid,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkFinishedParams {
    pub task_id: Uuid,
    pub status: String,
    pub result: Value,
    pub artifacts: Vec<String>,
}

/// Convenience wrapper with one method per gateway RPC call, built on top of
/// [`RpcClient::call`].
#[derive(Clone)]
pub struct GatewayClient {
    rpc: RpcClient,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { rpc: RpcClient::new(base_url) }
    }

    pub fn with_signer(mut self, signer: RequestSigner) -> Self {
        self.rpc = self.rpc.with_signer(signer);
        self
    }

    pub async fn task_submit(&self, params: TaskSubmitParams) -> Result<TaskSubmitResult, ClientError> {
        self.rpc.call("Task.submit", params).await
    }

    pub async fn task_update(&self, params: TaskUpdateParams) -> Result<TaskUpdateResult, ClientError> {
        self.rpc.call("Task.update", params).await
    }

    pub async fn task_get(&self, task_id: Uuid) -> Result<TaskGetResult, ClientError> {
        self.rpc.call("Task.get", serde_json::json!({ "task_id": task_id })).await
    }

    pub async fn task_history(&self, task_id: Uuid) -> Result<Vec<Value>, ClientError> {
        self.rpc.call("Task.history", serde_json::json!({ "task_id": task_id })).await
    }

    pub async fn task_cancel(&self, task_id: Uuid) -> Result<TaskUpdateResult, ClientError> {
        self.rpc.call("Task.cancel", serde_json::json!({ "task_id": task_id })).await
    }

    pub async fn worker_register(&self, params: WorkerRegisterParams) -> Result<WorkerRegisterResult, ClientError> {
        self.rpc.call("Worker.register", params).await
    }

    pub async fn worker_heartbeat(&self, worker_id: Uuid, status: &str) -> Result<Value, ClientError> {
        self.rpc
            .call("Worker.heartbeat", serde_json::json!({ "worker_id": worker_id, "status": status }))
            .await
    }

    pub async fn work_finished(&self, params: WorkFinishedParams) -> Result<TaskUpdateResult, ClientError> {
        self.rpc.call("Work.finished", params).await
    }

    pub async fn secret_add(&self, name: &str, ciphertext: &str, wrapped_keys: Value, pool: &str) -> Result<Value, ClientError> {
        self.rpc
            .call(
                "Secret.add",
                serde_json::json!({ "name": name, "ciphertext": ciphertext, "wrapped_keys": wrapped_keys, "pool": pool }),
            )
            .await
    }

    pub async fn secret_get(&self, name: &str, pool: &str) -> Result<Value, ClientError> {
        self.rpc.call("Secret.get", serde_json::json!({ "name": name, "pool": pool })).await
    }

    pub async fn secret_remove(&self, name: &str, pool: &str) -> Result<Value, ClientError> {
        self.rpc.call("Secret.remove", serde_json::json!({ "name": name, "pool": pool })).await
    }

    pub async fn public_key_upload(&self, armored: &str, role: &str) -> Result<Value, ClientError> {
        self.rpc.call("PublicKey.upload", serde_json::json!({ "armored": armored, "role": role })).await
    }
}

/// Reverse-direction client: the gateway dispatcher calls into a worker's
/// `/rpc` endpoint with `Work.start`/`Work.cancel`.
#[derive(Clone)]
pub struct WorkerClient {
    rpc: RpcClient,
}

impl WorkerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { rpc: RpcClient::new(base_url) }
    }

    pub async fn work_start(&self, envelope: Value) -> Result<Value, ClientError> {
        self.rpc.call("Work.start", serde_json::json!({ "envelope": envelope })).await
    }

    pub async fn work_cancel(&self, task_id: Uuid) -> Result<Value, ClientError> {
        self.rpc.call("Work.cancel", serde_json::json!({ "task_id": task_id })).await
    }
}
