//! In-memory `GatewayStore`, for `result_backend.kind = in_memory` local
//! runs and for integration tests that should not require a live Postgres.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use peagen_core::model::{
    EvaluationResult, Manifest, PublicKeyRecord, SecretRecord, Task, TaskRevision, TaskStatus, Worker, WorkerStatus,
};
use peagen_core::revision::{canonicalize_patch, rev_hash};
use peagen_core::{CoreError, Result};
use uuid::Uuid;

use super::{GatewayStore, RegisterWorkerInput, SubmitTaskInput, UpdateOutcome};

#[derive(Default)]
struct State {
    tenants: HashMap<Uuid, String>,
    pools: HashMap<(Uuid, String), ()>,
    tasks: HashMap<Uuid, Task>,
    revisions: HashMap<Uuid, Vec<TaskRevision>>,
    idempotency: HashMap<(Uuid, String, String), Uuid>,
    workers: HashMap<Uuid, Worker>,
    manifests: HashMap<String, Manifest>,
    secrets: HashMap<(Uuid, String), SecretRecord>,
    public_keys: HashMap<String, PublicKeyRecord>,
    evaluation_results: Vec<EvaluationResult>,
}

pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()) }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn head_revision(revisions: &[TaskRevision]) -> Option<&TaskRevision> {
    revisions.last()
}

fn apply_patch(task: &mut Task, patch: &serde_json::Value, now: DateTime<Utc>) -> Result<()> {
    if let Some(status) = patch.get("status").and_then(|v| v.as_str()) {
        task.status = status
            .parse::<TaskStatus>()
            .map_err(|err| CoreError::invalid_request(err.to_string()).with_field("status"))?;
    }
    if let Some(worker_id) = patch.get("worker_id") {
        task.worker_id = match worker_id {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(
                Uuid::parse_str(s).map_err(|err| CoreError::invalid_request(err.to_string()).with_field("worker_id"))?,
            ),
            _ => return Err(CoreError::invalid_request("worker_id must be a string or null").with_field("worker_id")),
        };
    }
    task.updated_at = now;
    Ok(())
}

#[async_trait]
impl GatewayStore for InMemoryStore {
    async fn ensure_tenant(&self, tenant_id: Uuid, slug: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.tenants.entry(tenant_id).or_insert_with(|| slug.to_string());
        state.pools.entry((tenant_id, "default".to_string())).or_insert(());
        Ok(())
    }

    async fn pool_exists(&self, tenant_id: Uuid, pool: &str) -> Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.pools.contains_key(&(tenant_id, pool.to_string())))
    }

    async fn ensure_pool(&self, tenant_id: Uuid, pool: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pools.entry((tenant_id, pool.to_string())).or_insert(());
        Ok(())
    }

    async fn find_idempotent_submit(&self, tenant_id: Uuid, client_token: &str, args_hash: &str) -> Result<Option<Uuid>> {
        let state = self.state.lock().unwrap();
        Ok(state.idempotency.get(&(tenant_id, client_token.to_string(), args_hash.to_string())).copied())
    }

    async fn submit_task(&self, input: SubmitTaskInput) -> Result<(Uuid, String)> {
        if !self.pool_exists(input.tenant_id, &input.pool).await? {
            return Err(CoreError::tenant_missing(format!("pool '{}' is not registered for this tenant", input.pool)));
        }

        let now = Utc::now();
        let task_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "status": "queued",
            "kind": input.kind,
            "pool": input.pool,
            "args": input.args,
        });
        let (encoded, payload_hash) = canonicalize_patch(&payload).map_err(CoreError::from)?;
        let head = rev_hash("", &payload_hash);

        let task = Task {
            id: task_id,
            tenant_id: input.tenant_id,
            kind: input.kind,
            pool: input.pool,
            status: TaskStatus::Queued,
            worker_id: None,
            parent_task_id: input.parent_task_id,
            design_hash: input.design_hash,
            plan_hash: input.plan_hash,
            args: input.args,
            created_at: now,
            updated_at: now,
        };
        let revision = TaskRevision {
            task_id,
            seq: 1,
            payload: encoded,
            payload_hash,
            parent_rev_hash: None,
            rev_hash: head.clone(),
            created_at: now,
        };

        let mut state = self.state.lock().unwrap();
        state.tasks.insert(task_id, task);
        state.revisions.insert(task_id, vec![revision]);
        if let Some(token) = input.client_token {
            let args_hash = {
                let bytes = serde_json::to_vec(&state.tasks[&task_id].args).unwrap_or_default();
                peagen_core::revision::payload_hash(&bytes)
            };
            state.idempotency.insert((input.tenant_id, token, args_hash), task_id);
        }

        Ok((task_id, head))
    }

    async fn update_task(&self, task_id: Uuid, patch: serde_json::Value, parent_rev_hash: &str) -> Result<UpdateOutcome> {
        let mut state = self.state.lock().unwrap();
        let revisions = state.revisions.get(&task_id).ok_or_else(|| CoreError::not_found("task not found"))?;
        let head = head_revision(revisions).ok_or_else(|| CoreError::internal(anyhow::anyhow!("task has no revisions")))?;

        if head.rev_hash != parent_rev_hash {
            return Err(CoreError::hash_mismatch("parent_rev_hash does not match the current head revision"));
        }

        let seq = head.seq + 1;
        let parent = head.rev_hash.clone();
        let (encoded, payload_hash) = canonicalize_patch(&patch).map_err(CoreError::from)?;
        let new_hash = rev_hash(&parent, &payload_hash);
        let now = Utc::now();

        let revision = TaskRevision {
            task_id,
            seq,
            payload: encoded,
            payload_hash,
            parent_rev_hash: Some(parent),
            rev_hash: new_hash.clone(),
            created_at: now,
        };

        let task = state.tasks.get_mut(&task_id).ok_or_else(|| CoreError::not_found("task not found"))?;
        apply_patch(task, &patch, now)?;
        let projected = task.clone();

        state.revisions.get_mut(&task_id).unwrap().push(revision);

        Ok(UpdateOutcome { rev_hash: new_hash, task: projected })
    }

    async fn get_task(&self, task_id: Uuid) -> Result<(Task, String)> {
        let state = self.state.lock().unwrap();
        let task = state.tasks.get(&task_id).cloned().ok_or_else(|| CoreError::not_found("task not found"))?;
        let head = head_revision(state.revisions.get(&task_id).map(Vec::as_slice).unwrap_or_default())
            .map(|r| r.rev_hash.clone())
            .unwrap_or_default();
        Ok((task, head))
    }

    async fn task_history(&self, task_id: Uuid) -> Result<Vec<TaskRevision>> {
        let state = self.state.lock().unwrap();
        state.revisions.get(&task_id).cloned().ok_or_else(|| CoreError::not_found("task not found"))
    }

    async fn current_rev_hash(&self, task_id: Uuid) -> Result<String> {
        let state = self.state.lock().unwrap();
        head_revision(state.revisions.get(&task_id).map(Vec::as_slice).unwrap_or_default())
            .map(|r| r.rev_hash.clone())
            .ok_or_else(|| CoreError::not_found("task not found"))
    }

    async fn register_worker(&self, input: RegisterWorkerInput) -> Result<Uuid> {
        self.ensure_pool(input.tenant_id, &input.pool).await?;
        let mut state = self.state.lock().unwrap();
        let id = Uuid::new_v4();
        let now = Utc::now();
        state.workers.insert(
            id,
            Worker {
                id,
                tenant_id: input.tenant_id,
                pool: input.pool,
                endpoint: input.endpoint,
                capabilities: input.capabilities,
                public_key: input.public_key,
                last_seen_at: now,
                status: WorkerStatus::Idle,
            },
        );
        Ok(id)
    }

    async fn heartbeat_worker(&self, worker_id: Uuid, status: WorkerStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let worker = state.workers.get_mut(&worker_id).ok_or_else(|| CoreError::not_found("worker not found"))?;
        worker.last_seen_at = Utc::now();
        worker.status = status;
        Ok(())
    }

    async fn select_idle_worker(&self, pool: &str, kind: &str, stale_after: DateTime<Utc>) -> Result<Option<Worker>> {
        let state = self.state.lock().unwrap();
        let mut candidates: Vec<&Worker> = state
            .workers
            .values()
            .filter(|w| w.pool == pool && w.status == WorkerStatus::Idle && w.last_seen_at >= stale_after)
            .filter(|w| w.capabilities.iter().any(|c| c == kind))
            .collect();
        candidates.sort_by_key(|w| w.last_seen_at);
        Ok(candidates.into_iter().next().cloned())
    }

    async fn set_worker_status(&self, worker_id: Uuid, status: WorkerStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let worker = state.workers.get_mut(&worker_id).ok_or_else(|| CoreError::not_found("worker not found"))?;
        worker.status = status;
        Ok(())
    }

    async fn get_worker(&self, worker_id: Uuid) -> Result<Option<Worker>> {
        let state = self.state.lock().unwrap();
        Ok(state.workers.get(&worker_id).cloned())
    }

    async fn stale_workers(&self, stale_after: DateTime<Utc>) -> Result<Vec<Worker>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .workers
            .values()
            .filter(|w| w.status != WorkerStatus::Evicted && w.last_seen_at < stale_after)
            .cloned()
            .collect())
    }

    async fn evicted_workers_running_since(&self, evict_after: DateTime<Utc>) -> Result<Vec<Worker>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .workers
            .values()
            .filter(|w| w.status == WorkerStatus::Stale && w.last_seen_at < evict_after)
            .cloned()
            .collect())
    }

    async fn running_tasks_for_worker(&self, worker_id: Uuid) -> Result<Vec<Task>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .values()
            .filter(|t| t.worker_id == Some(worker_id) && t.status == TaskStatus::Running)
            .cloned()
            .collect())
    }

    async fn overdue_running_tasks(&self, pool: &str, deadline_cutoff: DateTime<Utc>) -> Result<Vec<(Task, DateTime<Utc>)>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .tasks
            .values()
            .filter(|t| t.pool == pool && t.status == TaskStatus::Running)
            .filter_map(|t| {
                // Anchor on the `seq=1` revision's timestamp (submission
                // time), matching `deadline = submission_time + T_task_max`;
                // the running-transition revision (seq>1) would let a task
                // that sat queued for a while keep extra runway.
                let revisions = state.revisions.get(&t.id)?;
                let submitted_at = revisions.iter().find(|r| r.seq == 1)?.created_at;
                Some((t.clone(), submitted_at))
            })
            .filter(|(_, submitted_at)| *submitted_at < deadline_cutoff)
            .collect())
    }

    async fn upsert_manifest(&self, manifest: Manifest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.manifests.entry(manifest.hash.clone()).or_insert(manifest);
        Ok(())
    }

    async fn get_manifest(&self, hash: &str) -> Result<Option<Manifest>> {
        let state = self.state.lock().unwrap();
        Ok(state.manifests.get(hash).cloned())
    }

    async fn secret_add(&self, record: SecretRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.secrets.insert((record.tenant_id, record.name.clone()), record);
        Ok(())
    }

    async fn secret_get(&self, tenant_id: Uuid, name: &str) -> Result<Option<SecretRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state.secrets.get(&(tenant_id, name.to_string())).cloned())
    }

    async fn secret_remove(&self, tenant_id: Uuid, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.secrets.remove(&(tenant_id, name.to_string()));
        Ok(())
    }

    async fn public_key_upload(&self, record: PublicKeyRecord) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.public_keys.insert(record.fingerprint.clone(), record);
        Ok(())
    }

    async fn public_key_lookup(&self, fingerprint: &str) -> Result<Option<PublicKeyRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state.public_keys.get(fingerprint).cloned())
    }

    async fn append_evaluation_result(&self, result: EvaluationResult) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let dup = state
            .evaluation_results
            .iter()
            .any(|r| r.task_id == result.task_id && r.evaluator_name == result.evaluator_name && r.metric == result.metric);
        if dup {
            return Ok(false);
        }
        state.evaluation_results.push(result);
        Ok(true)
    }

    async fn evaluation_results_for_task(&self, task_id: Uuid) -> Result<Vec<EvaluationResult>> {
        let state = self.state.lock().unwrap();
        Ok(state.evaluation_results.iter().filter(|r| r.task_id == task_id).cloned().collect())
    }
}
