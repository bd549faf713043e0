//! The gateway's `/rpc` endpoint: one JSON-RPC 2.0 route dispatching to a
//! method table, a single uniform RPC surface in place of a handful of
//! bespoke REST endpoints.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use axum::{extract::State, http::HeaderMap, response::IntoResponse, routing::post, Json, Router};
use chrono::Utc;
use peagen_core::error::{CoreError, Result as CoreResult};
use peagen_core::model::{PrincipalRole, PublicKeyRecord, WrappedKey};
use peagen_core::queue::Envelope;
use peagen_core::rpc::{method_requires_signature, RpcError, RpcRequest, RpcResponse};
use peagen_core::signer::{canonicalize, fingerprint_of, verify_signature, FINGERPRINT_HEADER, SIGNATURE_HEADER};
use peagen_core::Queue;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::config::GatewayConfig;
use crate::dispatch::TASK_UPDATE_CHANNEL;
use crate::store::{GatewayStore, RegisterWorkerInput, SubmitTaskInput};

pub struct AppState {
    pub store: Arc<dyn GatewayStore>,
    pub queue: Arc<dyn Queue>,
    pub cfg: GatewayConfig,
    /// Pools currently tripped into backpressure; a pool stays in this set
    /// (rejecting `Task.submit` with `queue_unavailable`) from the moment its
    /// depth reaches `queue_high_watermark` until it drains back below
    /// `queue_low_watermark`, per the hysteresis the spec requires — a single
    /// instantaneous high-watermark check would let a pool flap in and out of
    /// backpressure every time depth crosses the high mark by one.
    backpressure_pools: Mutex<HashSet<String>>,
}

impl AppState {
    pub fn new(store: Arc<dyn GatewayStore>, queue: Arc<dyn Queue>, cfg: GatewayConfig) -> Self {
        Self {
            store,
            queue,
            cfg,
            backpressure_pools: Mutex::new(HashSet::new()),
        }
    }

    /// Returns `true` if `pool` should currently reject `Task.submit` with
    /// `queue_unavailable`, updating the tripped-pool set per the
    /// high/low-watermark hysteresis.
    fn check_backpressure(&self, pool: &str, depth: u64) -> bool {
        let mut tripped = self.backpressure_pools.lock().unwrap();
        if tripped.contains(pool) {
            if depth < self.cfg.queue_low_watermark {
                tripped.remove(pool);
                false
            } else {
                true
            }
        } else if depth >= self.cfg.queue_high_watermark {
            tripped.insert(pool.to_string());
            true
        } else {
            false
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new().route("/rpc", post(handle_rpc)).with_state(state)
}

async fn handle_rpc(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(req): Json<RpcRequest>) -> impl IntoResponse {
    let id = req.id.clone();
    match dispatch(&state, &headers, &req).await {
        Ok(result) => Json(RpcResponse::ok(id, result)),
        Err(err) => Json(RpcResponse::err(id, err)),
    }
}

async fn dispatch(state: &AppState, headers: &HeaderMap, req: &RpcRequest) -> Result<Value, RpcError> {
    if req.jsonrpc != peagen_core::rpc::JSONRPC_VERSION {
        return Err(RpcError::invalid_request("unsupported jsonrpc version"));
    }

    let principal = authenticate(state, headers, &req.method, req).await?;

    let result = match req.method.as_str() {
        "Task.submit" => task_submit(state, req.params.clone()).await,
        "Task.update" => task_update(state, req.params.clone()).await,
        "Task.get" => task_get(state, req.params.clone()).await,
        "Task.history" => task_history(state, req.params.clone()).await,
        "Task.cancel" => task_cancel(state, req.params.clone()).await,
        "Worker.register" => worker_register(state, req.params.clone()).await,
        "Worker.heartbeat" => worker_heartbeat(state, req.params.clone()).await,
        "Work.finished" => work_finished(state, req.params.clone()).await,
        "Secret.add" => secret_add(state, req.params.clone()).await,
        "Secret.get" => secret_get(state, req.params.clone(), principal.as_ref()).await,
        "Secret.remove" => secret_remove(state, req.params.clone()).await,
        "PublicKey.upload" => public_key_upload(state, req.params.clone()).await,
        other => return Err(RpcError::method_not_found(other)),
    };

    result.map_err(|err| RpcError::from(&err))
}

/// Verifies the request signature against a registered public key. Methods
/// on [`peagen_core::rpc::UNSIGNED_METHOD_ALLOWLIST`] may be called without
/// one; every other method requires a valid `X-Peagen-Signature` /
/// `X-Peagen-Key-Fingerprint` header pair over the canonical request body.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    method: &str,
    req: &RpcRequest,
) -> Result<Option<PublicKeyRecord>, RpcError> {
    if !method_requires_signature(method) {
        return Ok(None);
    }

    let fingerprint = headers
        .get(FINGERPRINT_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RpcError::unauthorized("missing key fingerprint header"))?;
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RpcError::unauthorized("missing signature header"))?;

    let record = state
        .store
        .public_key_lookup(fingerprint)
        .await
        .map_err(|err| RpcError::from(&err))?
        .ok_or_else(|| RpcError::unauthorized("unknown key fingerprint"))?;

    let canonical_body = canonicalize(&json!({
        "jsonrpc": req.jsonrpc,
        "method": req.method,
        "params": req.params,
        "id": req.id,
    }));

    verify_signature(&record.armored, &canonical_body, signature).map_err(|err| RpcError::from(&err))?;

    Ok(Some(record))
}

async fn publish_update(queue: &dyn Queue, task_id: Uuid, pool: &str, rev_hash: &str, status: &str) {
    let message = json!({ "task_id": task_id, "pool": pool, "rev_hash": rev_hash, "status": status, "ts": Utc::now() });
    if let Err(err) = queue.publish(TASK_UPDATE_CHANNEL, message).await {
        tracing::warn!(error = %err, task_id = %task_id, "failed to publish task:update");
    }
}

#[derive(Debug, Deserialize)]
struct TaskSubmitParams {
    kind: String,
    #[serde(default = "default_pool")]
    pool: String,
    #[serde(default)]
    args: Value,
    #[serde(default)]
    client_token: Option<String>,
    #[serde(default)]
    parent_task_id: Option<Uuid>,
    #[serde(default)]
    design_hash: Option<String>,
    #[serde(default)]
    plan_hash: Option<String>,
}

fn default_pool() -> String {
    "default".to_string()
}

async fn task_submit(state: &AppState, params: Value) -> CoreResult<Value> {
    let p: TaskSubmitParams = serde_json::from_value(params).map_err(|e| CoreError::invalid_request(e.to_string()))?;

    if let Some(token) = &p.client_token {
        let args_bytes = serde_json::to_vec(&p.args).map_err(|e| CoreError::internal(anyhow::Error::from(e)))?;
        let args_hash = peagen_core::revision::payload_hash(&args_bytes);
        if let Some(existing) = state.store.find_idempotent_submit(state.cfg.org_id, token, &args_hash).await? {
            let rev_hash = state.store.current_rev_hash(existing).await?;
            return Ok(json!({ "task_id": existing, "rev_hash": rev_hash }));
        }
    }

    let depth = state.queue.depth(&p.pool).await?;
    if state.check_backpressure(&p.pool, depth) {
        return Err(CoreError::queue_unavailable(format!(
            "pool '{}' depth {depth} has not yet drained below the low watermark",
            p.pool
        )));
    }

    let input = SubmitTaskInput {
        tenant_id: state.cfg.org_id,
        kind: p.kind.clone(),
        pool: p.pool.clone(),
        args: p.args.clone(),
        client_token: p.client_token,
        parent_task_id: p.parent_task_id,
        design_hash: p.design_hash,
        plan_hash: p.plan_hash,
    };
    let (task_id, rev_hash) = state.store.submit_task(input).await?;

    let now = Utc::now();
    let envelope = Envelope {
        id: Uuid::new_v4(),
        task_id,
        kind: p.kind,
        args: p.args,
        attempt: 1,
        submitted_at: now,
        deadline: now + chrono::Duration::seconds(state.cfg.dispatch_task_max_s),
    };
    state.queue.push(&p.pool, envelope).await?;

    Ok(json!({ "task_id": task_id, "rev_hash": rev_hash }))
}

#[derive(Debug, Deserialize)]
struct TaskUpdateParams {
    task_id: Uuid,
    patch: Value,
    parent_rev_hash: String,
}

async fn task_update(state: &AppState, params: Value) -> CoreResult<Value> {
    let p: TaskUpdateParams = serde_json::from_value(params).map_err(|e| CoreError::invalid_request(e.to_string()))?;
    let outcome = state.store.update_task(p.task_id, p.patch.clone(), &p.parent_rev_hash).await?;
    let status = p.patch.get("status").and_then(Value::as_str).unwrap_or(outcome.task.status.as_str());
    publish_update(state.queue.as_ref(), p.task_id, &outcome.task.pool, &outcome.rev_hash, status).await;
    Ok(json!({ "rev_hash": outcome.rev_hash }))
}

#[derive(Debug, Deserialize)]
struct TaskIdParams {
    task_id: Uuid,
}

async fn task_get(state: &AppState, params: Value) -> CoreResult<Value> {
    let p: TaskIdParams = serde_json::from_value(params).map_err(|e| CoreError::invalid_request(e.to_string()))?;
    let (task, rev_hash) = state.store.get_task(p.task_id).await?;
    Ok(json!({ "task": task, "rev_hash": rev_hash }))
}

async fn task_history(state: &AppState, params: Value) -> CoreResult<Value> {
    let p: TaskIdParams = serde_json::from_value(params).map_err(|e| CoreError::invalid_request(e.to_string()))?;
    let revisions = state.store.task_history(p.task_id).await?;
    Ok(json!(revisions))
}

async fn task_cancel(state: &AppState, params: Value) -> CoreResult<Value> {
    let p: TaskIdParams = serde_json::from_value(params).map_err(|e| CoreError::invalid_request(e.to_string()))?;
    let parent_rev_hash = state.store.current_rev_hash(p.task_id).await?;
    let patch = json!({ "status": "cancelled", "reason": "requested" });
    let outcome = state.store.update_task(p.task_id, patch, &parent_rev_hash).await?;
    publish_update(state.queue.as_ref(), p.task_id, &outcome.task.pool, &outcome.rev_hash, "cancelled").await;
    Ok(json!({ "rev_hash": outcome.rev_hash }))
}

#[derive(Debug, Deserialize)]
struct WorkerRegisterParams {
    endpoint: String,
    #[serde(default = "default_pool")]
    pool: String,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    public_key: Option<String>,
}

async fn worker_register(state: &AppState, params: Value) -> CoreResult<Value> {
    let p: WorkerRegisterParams = serde_json::from_value(params).map_err(|e| CoreError::invalid_request(e.to_string()))?;

    state.store.ensure_pool(state.cfg.org_id, &p.pool).await?;

    let input = RegisterWorkerInput {
        tenant_id: state.cfg.org_id,
        pool: p.pool,
        endpoint: p.endpoint,
        capabilities: p.capabilities,
        public_key: p.public_key,
    };
    let worker_id = state.store.register_worker(input).await?;
    Ok(json!({ "worker_id": worker_id }))
}

#[derive(Debug, Deserialize)]
struct WorkerHeartbeatParams {
    worker_id: Uuid,
    status: String,
}

async fn worker_heartbeat(state: &AppState, params: Value) -> CoreResult<Value> {
    let p: WorkerHeartbeatParams = serde_json::from_value(params).map_err(|e| CoreError::invalid_request(e.to_string()))?;
    let status: peagen_core::model::WorkerStatus = p.status.parse().map_err(|e: anyhow::Error| CoreError::invalid_request(e.to_string()).with_field("status"))?;
    state.store.heartbeat_worker(p.worker_id, status).await?;
    Ok(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct WorkFinishedParams {
    task_id: Uuid,
    status: String,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    artifacts: Vec<String>,
}

async fn work_finished(state: &AppState, params: Value) -> CoreResult<Value> {
    let p: WorkFinishedParams = serde_json::from_value(params).map_err(|e| CoreError::invalid_request(e.to_string()))?;

    // Validate against the task model's terminal statuses; `lost` is a
    // scheduler-internal transition, not a worker-reported outcome.
    let status: peagen_core::model::TaskStatus = p.status.parse().map_err(|e: anyhow::Error| CoreError::invalid_request(e.to_string()).with_field("status"))?;
    if !matches!(
        status,
        peagen_core::model::TaskStatus::Succeeded | peagen_core::model::TaskStatus::Failed | peagen_core::model::TaskStatus::Cancelled
    ) {
        return Err(CoreError::invalid_request("Work.finished status must be succeeded, failed, or cancelled").with_field("status"));
    }

    let parent_rev_hash = state.store.current_rev_hash(p.task_id).await?;
    let patch = json!({ "status": p.status, "result": p.result, "artifacts": p.artifacts });
    let outcome = state.store.update_task(p.task_id, patch, &parent_rev_hash).await?;
    publish_update(state.queue.as_ref(), p.task_id, &outcome.task.pool, &outcome.rev_hash, &p.status).await;

    if let Some(worker_id) = outcome.task.worker_id {
        state.store.set_worker_status(worker_id, peagen_core::model::WorkerStatus::Idle).await?;
    }

    if status == peagen_core::model::TaskStatus::Succeeded && outcome.task.kind == "evaluate" {
        append_evaluation_results(state, p.task_id, &p.result).await;
    }

    Ok(json!({ "rev_hash": outcome.rev_hash }))
}

/// Appends one `EvaluationResult` row per entry in `result.evaluations`, per
/// the data model's "`EvaluationResult`… append-on-success" rule for
/// `kind="evaluate"` tasks. Malformed entries are logged and skipped rather
/// than failing the whole `Work.finished` call — the task has already
/// transitioned to `succeeded` by this point.
async fn append_evaluation_results(state: &AppState, task_id: Uuid, result: &Value) {
    let Some(evaluations) = result.get("evaluations").and_then(Value::as_array) else {
        return;
    };

    for entry in evaluations {
        let evaluator_name = entry.get("evaluator_name").and_then(Value::as_str);
        let metric = entry.get("metric").and_then(Value::as_str);
        let value = entry.get("value").and_then(Value::as_f64);
        let unit = entry.get("unit").and_then(Value::as_str).unwrap_or("").to_string();

        let (Some(evaluator_name), Some(metric), Some(value)) = (evaluator_name, metric, value) else {
            tracing::warn!(task_id = %task_id, entry = %entry, "skipping malformed evaluation result entry");
            continue;
        };

        let record = peagen_core::model::EvaluationResult {
            task_id,
            evaluator_name: evaluator_name.to_string(),
            metric: metric.to_string(),
            unit,
            value,
            created_at: Utc::now(),
        };

        if let Err(err) = state.store.append_evaluation_result(record).await {
            tracing::warn!(error = %err, task_id = %task_id, "failed to append evaluation result");
        }
    }
}

#[derive(Debug, Deserialize)]
struct SecretAddParams {
    name: String,
    ciphertext: String,
    wrapped_keys: Vec<WrappedKey>,
    #[serde(default = "default_pool")]
    pool: String,
}

async fn secret_add(state: &AppState, params: Value) -> CoreResult<Value> {
    let p: SecretAddParams = serde_json::from_value(params).map_err(|e| CoreError::invalid_request(e.to_string()))?;
    let _ = &p.pool; // pools scope dispatch, not secrets; accepted for API-shape parity with the other Secret.* methods.

    let recipients = p.wrapped_keys.iter().map(|k| k.recipient_fingerprint.clone()).collect();
    let record = peagen_core::model::SecretRecord {
        name: p.name,
        tenant_id: state.cfg.org_id,
        ciphertext: p.ciphertext,
        wrapped_keys: p.wrapped_keys,
        recipients,
        created_at: Utc::now(),
    };
    state.store.secret_add(record).await?;
    Ok(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct SecretNameParams {
    name: String,
    #[serde(default = "default_pool")]
    pool: String,
}

async fn secret_get(state: &AppState, params: Value, principal: Option<&PublicKeyRecord>) -> CoreResult<Value> {
    let p: SecretNameParams = serde_json::from_value(params).map_err(|e| CoreError::invalid_request(e.to_string()))?;
    let _ = &p.pool;

    let principal = principal.ok_or_else(|| CoreError::unauthorized("Secret.get requires a signed request"))?;
    let record = state
        .store
        .secret_get(state.cfg.org_id, &p.name)
        .await?
        .ok_or_else(|| CoreError::not_found(format!("secret '{}' not found", p.name)))?;

    if !record.recipients.iter().any(|r| r == &principal.fingerprint) {
        return Err(CoreError::unauthorized("principal is not a recipient of this secret"));
    }

    Ok(json!({ "ciphertext": record.ciphertext, "wrapped_keys": record.wrapped_keys }))
}

async fn secret_remove(state: &AppState, params: Value) -> CoreResult<Value> {
    let p: SecretNameParams = serde_json::from_value(params).map_err(|e| CoreError::invalid_request(e.to_string()))?;
    let _ = &p.pool;
    state.store.secret_remove(state.cfg.org_id, &p.name).await?;
    Ok(json!({ "ok": true }))
}

#[derive(Debug, Deserialize)]
struct PublicKeyUploadParams {
    armored: String,
    role: String,
}

async fn public_key_upload(state: &AppState, params: Value) -> CoreResult<Value> {
    let p: PublicKeyUploadParams = serde_json::from_value(params).map_err(|e| CoreError::invalid_request(e.to_string()))?;
    let role: PrincipalRole = p.role.parse().map_err(|e: anyhow::Error| CoreError::invalid_request(e.to_string()).with_field("role"))?;
    let fingerprint = fingerprint_of(&p.armored)?;

    let record = PublicKeyRecord {
        fingerprint: fingerprint.clone(),
        tenant_id: state.cfg.org_id,
        armored: p.armored,
        role,
        created_at: Utc::now(),
    };
    state.store.public_key_upload(record).await?;
    Ok(json!({ "fingerprint": fingerprint }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use peagen_core::queue::in_memory::InMemoryQueue;
    use crate::store::memory::InMemoryStore;

    fn test_state() -> AppState {
        AppState::new(Arc::new(InMemoryStore::new()), Arc::new(InMemoryQueue::new()), GatewayConfig::default())
    }

    #[tokio::test]
    async fn work_finished_appends_evaluation_results_for_evaluate_kind_on_success() {
        let state = test_state();
        state.store.ensure_tenant(state.cfg.org_id, "default").await.unwrap();
        state.store.ensure_pool(state.cfg.org_id, "default").await.unwrap();

        let input = SubmitTaskInput {
            tenant_id: state.cfg.org_id,
            kind: "evaluate".to_string(),
            pool: "default".to_string(),
            args: json!({}),
            client_token: None,
            parent_task_id: None,
            design_hash: None,
            plan_hash: None,
        };
        let (task_id, h0) = state.store.submit_task(input).await.unwrap();
        state.store.update_task(task_id, json!({ "status": "running" }), &h0).await.unwrap();

        let params = json!({
            "task_id": task_id,
            "status": "succeeded",
            "result": {
                "evaluations": [
                    { "evaluator_name": "pytest", "metric": "pass_rate", "unit": "ratio", "value": 0.92 },
                    { "evaluator_name": "pytest", "metric": "missing_value" },
                ]
            },
            "artifacts": [],
        });
        work_finished(&state, params).await.expect("Work.finished");

        let results = state.store.evaluation_results_for_task(task_id).await.unwrap();
        assert_eq!(results.len(), 1, "malformed entries must be skipped, not inserted: {results:?}");
        assert_eq!(results[0].evaluator_name, "pytest");
        assert_eq!(results[0].metric, "pass_rate");
        assert_eq!(results[0].value, 0.92);
    }

    #[tokio::test]
    async fn work_finished_does_not_append_evaluation_results_for_non_evaluate_kinds() {
        let state = test_state();
        state.store.ensure_tenant(state.cfg.org_id, "default").await.unwrap();
        state.store.ensure_pool(state.cfg.org_id, "default").await.unwrap();

        let input = SubmitTaskInput {
            tenant_id: state.cfg.org_id,
            kind: "process".to_string(),
            pool: "default".to_string(),
            args: json!({}),
            client_token: None,
            parent_task_id: None,
            design_hash: None,
            plan_hash: None,
        };
        let (task_id, h0) = state.store.submit_task(input).await.unwrap();
        state.store.update_task(task_id, json!({ "status": "running" }), &h0).await.unwrap();

        let params = json!({
            "task_id": task_id,
            "status": "succeeded",
            "result": { "evaluations": [{ "evaluator_name": "pytest", "metric": "pass_rate", "unit": "ratio", "value": 1.0 }] },
            "artifacts": [],
        });
        work_finished(&state, params).await.expect("Work.finished");

        let results = state.store.evaluation_results_for_task(task_id).await.unwrap();
        assert!(results.is_empty(), "a process-kind task must never populate evaluation_results");
    }

    #[tokio::test]
    async fn backpressure_requires_draining_below_the_low_watermark_before_clearing() {
        let mut cfg = GatewayConfig::default();
        cfg.queue_high_watermark = 10;
        cfg.queue_low_watermark = 5;
        let state = AppState::new(Arc::new(InMemoryStore::new()), Arc::new(InMemoryQueue::new()), cfg);

        assert!(!state.check_backpressure("default", 9), "below the high watermark, submit should succeed");
        assert!(state.check_backpressure("default", 10), "at the high watermark, the pool should trip");
        assert!(state.check_backpressure("default", 7), "tripped pool must stay rejecting above the low watermark");
        assert!(!state.check_backpressure("default", 4), "tripped pool clears once depth drops below the low watermark");
        assert!(!state.check_backpressure("default", 9), "a cleared pool only re-trips at the high watermark again");
    }
}
