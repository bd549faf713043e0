//! Result & audit store: the `tasks`/`task_revisions`/`workers`/`manifests`/
//! `secrets`/`public_keys`/`evaluation_results` tables, behind one trait so
//! the gateway can run against Postgres in production or an in-memory
//! backend for local mode and tests (`result_backend.kind`).

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use peagen_core::model::{EvaluationResult, Manifest, PublicKeyRecord, SecretRecord, Task, TaskRevision, Worker, WorkerStatus};
use peagen_core::Result;
use uuid::Uuid;

pub struct SubmitTaskInput {
    pub tenant_id: Uuid,
    pub kind: String,
    pub pool: String,
    pub args: serde_json::Value,
    pub client_token: Option<String>,
    pub parent_task_id: Option<Uuid>,
    pub design_hash: Option<String>,
    pub plan_hash: Option<String>,
}

pub struct RegisterWorkerInput {
    pub tenant_id: Uuid,
    pub pool: String,
    pub endpoint: String,
    pub capabilities: Vec<String>,
    pub public_key: Option<String>,
}

/// Result of a successful `Task.update`-shaped mutation: the new head
/// revision plus the projected task row after the patch is applied.
pub struct UpdateOutcome {
    pub rev_hash: String,
    pub task: Task,
}

#[async_trait]
pub trait GatewayStore: Send + Sync {
    async fn ensure_tenant(&self, tenant_id: Uuid, slug: &str) -> Result<()>;

    async fn pool_exists(&self, tenant_id: Uuid, pool: &str) -> Result<bool>;

    async fn ensure_pool(&self, tenant_id: Uuid, pool: &str) -> Result<()>;

    /// Idempotent submit lookup: `(tenant_id, client_token, args_hash)` ->
    /// an existing task id, if a matching submission was already recorded.
    async fn find_idempotent_submit(&self, tenant_id: Uuid, client_token: &str, args_hash: &str) -> Result<Option<Uuid>>;

    /// Creates the task row plus its seq=1 revision, and records the
    /// idempotency key if one was supplied. Returns `(task_id, rev_hash)`.
    async fn submit_task(&self, input: SubmitTaskInput) -> Result<(Uuid, String)>;

    /// The full `Task.update` algorithm: validates `parent_rev_hash` against
    /// the current head, canonicalizes+hashes the patch, appends a revision,
    /// and projects the patch's `status`/`worker_id` fields onto the task
    /// row — all within one atomic unit. Returns `hash_mismatch` if
    /// `parent_rev_hash` is stale.
    async fn update_task(&self, task_id: Uuid, patch: serde_json::Value, parent_rev_hash: &str) -> Result<UpdateOutcome>;

    async fn get_task(&self, task_id: Uuid) -> Result<(Task, String)>;

    async fn task_history(&self, task_id: Uuid) -> Result<Vec<TaskRevision>>;

    async fn current_rev_hash(&self, task_id: Uuid) -> Result<String>;

    async fn register_worker(&self, input: RegisterWorkerInput) -> Result<Uuid>;

    async fn heartbeat_worker(&self, worker_id: Uuid, status: WorkerStatus) -> Result<()>;

    /// Least-recently-dispatched eligible worker: `status = idle`,
    /// capability includes `kind`, `last_seen_at` within `stale_after`.
    async fn select_idle_worker(&self, pool: &str, kind: &str, stale_after: DateTime<Utc>) -> Result<Option<Worker>>;

    async fn set_worker_status(&self, worker_id: Uuid, status: WorkerStatus) -> Result<()>;

    async fn get_worker(&self, worker_id: Uuid) -> Result<Option<Worker>>;

    /// Workers whose last heartbeat is older than `stale_after` and whose
    /// status is not already `evicted`.
    async fn stale_workers(&self, stale_after: DateTime<Utc>) -> Result<Vec<Worker>>;

    async fn evicted_workers_running_since(&self, evict_after: DateTime<Utc>) -> Result<Vec<Worker>>;

    async fn running_tasks_for_worker(&self, worker_id: Uuid) -> Result<Vec<Task>>;

    /// Tasks currently `running` whose submission-time deadline
    /// (`seq=1` revision timestamp + `T_task_max`) has passed as of
    /// `deadline_cutoff`, for the per-pool watchdog.
    async fn overdue_running_tasks(&self, pool: &str, deadline_cutoff: DateTime<Utc>) -> Result<Vec<(Task, DateTime<Utc>)>>;

    async fn upsert_manifest(&self, manifest: Manifest) -> Result<()>;

    async fn get_manifest(&self, hash: &str) -> Result<Option<Manifest>>;

    async fn secret_add(&self, record: SecretRecord) -> Result<()>;

    async fn secret_get(&self, tenant_id: Uuid, name: &str) -> Result<Option<SecretRecord>>;

    async fn secret_remove(&self, tenant_id: Uuid, name: &str) -> Result<()>;

    async fn public_key_upload(&self, record: PublicKeyRecord) -> Result<()>;

    async fn public_key_lookup(&self, fingerprint: &str) -> Result<Option<PublicKeyRecord>>;

    /// Appends one evaluation metric row, called from `Work.finished` for
    /// `kind="evaluate"` tasks. Returns `false` without inserting if
    /// `(task_id, evaluator_name, metric)` already exists.
    async fn append_evaluation_result(&self, result: EvaluationResult) -> Result<bool>;

    async fn evaluation_results_for_task(&self, task_id: Uuid) -> Result<Vec<EvaluationResult>>;
}
