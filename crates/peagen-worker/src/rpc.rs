//! The worker's reverse `/rpc` endpoint: the gateway's dispatcher calls
//! `Work.start`/`Work.cancel` here, the same JSON-RPC envelope shape used
//! everywhere else in this transport. Grounded on the gateway's own
//! `rpc::router`/`dispatch_call` (single POST route, method string picks the
//! handler) rather than introducing a second wire format for the reverse
//! direction.

use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use peagen_core::rpc::{RpcError, JSONRPC_VERSION};
use serde_json::Value;
use uuid::Uuid;

use crate::runtime::WorkerRuntime;

pub fn router(runtime: Arc<WorkerRuntime>) -> Router {
    Router::new().route("/rpc", post(handle)).with_state(runtime)
}

async fn handle(State(runtime): State<Arc<WorkerRuntime>>, Json(body): Json<Value>) -> Json<Value> {
    let id = body.get("id").cloned().unwrap_or(Value::Null);
    let method = body.get("method").and_then(Value::as_str).unwrap_or_default();
    let params = body.get("params").cloned().unwrap_or(Value::Null);

    let result = dispatch(&runtime, method, params).await;
    Json(match result {
        Ok(value) => serde_json::json!({ "jsonrpc": JSONRPC_VERSION, "result": value, "id": id }),
        Err(err) => serde_json::json!({ "jsonrpc": JSONRPC_VERSION, "error": err, "id": id }),
    })
}

async fn dispatch(runtime: &Arc<WorkerRuntime>, method: &str, params: Value) -> Result<Value, RpcError> {
    match method {
        "Work.start" => {
            let envelope = params
                .get("envelope")
                .cloned()
                .ok_or_else(|| RpcError::invalid_params("missing 'envelope'"))?;
            runtime
                .work_start(envelope)
                .map_err(|err| RpcError::internal(err.to_string()))?;
            Ok(serde_json::json!({ "accepted": true }))
        }
        "Work.cancel" => {
            let task_id: Uuid = serde_json::from_value(
                params
                    .get("task_id")
                    .cloned()
                    .ok_or_else(|| RpcError::invalid_params("missing 'task_id'"))?,
            )
            .map_err(|_| RpcError::invalid_params("'task_id' must be a uuid"))?;
            let ack = runtime.work_cancel(task_id).await;
            Ok(serde_json::json!({ "ack": ack }))
        }
        other => Err(RpcError::method_not_found(other)),
    }
}
