//! Postgres-backed `GatewayStore`. Rows are read with `Row::try_get`
//! column-by-column rather than a derived `FromRow`, matching the
//! claim/complete transaction style used elsewhere in this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use peagen_core::model::{
    EvaluationResult, Manifest, PublicKeyRecord, SecretRecord, Task, TaskRevision, Worker, WorkerStatus, WrappedKey,
};
use peagen_core::revision::{canonicalize_patch, rev_hash};
use peagen_core::{CoreError, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{GatewayStore, RegisterWorkerInput, SubmitTaskInput, UpdateOutcome};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn task_from_row(row: &sqlx::postgres::PgRow) -> Result<Task> {
    let status: String = row.try_get("status")?;
    Ok(Task {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        kind: row.try_get("kind")?,
        pool: row.try_get("pool")?,
        status: status.parse().map_err(|err: anyhow::Error| CoreError::internal(err))?,
        worker_id: row.try_get("worker_id")?,
        parent_task_id: row.try_get("parent_task_id")?,
        design_hash: row.try_get("design_hash")?,
        plan_hash: row.try_get("plan_hash")?,
        args: row.try_get("args")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn worker_from_row(row: &sqlx::postgres::PgRow) -> Result<Worker> {
    let status: String = row.try_get("status")?;
    Ok(Worker {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        pool: row.try_get("pool")?,
        endpoint: row.try_get("endpoint")?,
        capabilities: row.try_get("capabilities")?,
        public_key: row.try_get("public_key")?,
        last_seen_at: row.try_get("last_seen_at")?,
        status: status.parse().map_err(|err: anyhow::Error| CoreError::internal(err))?,
    })
}

fn revision_from_row(row: &sqlx::postgres::PgRow) -> Result<TaskRevision> {
    Ok(TaskRevision {
        task_id: row.try_get("task_id")?,
        seq: row.try_get("seq")?,
        payload: row.try_get("payload")?,
        payload_hash: row.try_get("payload_hash")?,
        parent_rev_hash: row.try_get("parent_rev_hash")?,
        rev_hash: row.try_get("rev_hash")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl GatewayStore for PostgresStore {
    async fn ensure_tenant(&self, tenant_id: Uuid, slug: &str) -> Result<()> {
        sqlx::query("INSERT INTO tenants (id, slug) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING")
            .bind(tenant_id)
            .bind(slug)
            .execute(&self.pool)
            .await?;
        self.ensure_pool(tenant_id, "default").await
    }

    async fn pool_exists(&self, tenant_id: Uuid, pool: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM pools WHERE tenant_id = $1 AND name = $2")
            .bind(tenant_id)
            .bind(pool)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn ensure_pool(&self, tenant_id: Uuid, pool: &str) -> Result<()> {
        sqlx::query("INSERT INTO pools (tenant_id, name) VALUES ($1, $2) ON CONFLICT (tenant_id, name) DO NOTHING")
            .bind(tenant_id)
            .bind(pool)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_idempotent_submit(&self, tenant_id: Uuid, client_token: &str, args_hash: &str) -> Result<Option<Uuid>> {
        let row = sqlx::query("SELECT task_id FROM idempotency_keys WHERE tenant_id = $1 AND client_token = $2 AND args_hash = $3")
            .bind(tenant_id)
            .bind(client_token)
            .bind(args_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| r.try_get::<Uuid, _>("task_id")).transpose().map_err(CoreError::from)
    }

    async fn submit_task(&self, input: SubmitTaskInput) -> Result<(Uuid, String)> {
        if !self.pool_exists(input.tenant_id, &input.pool).await? {
            return Err(CoreError::tenant_missing(format!("pool '{}' is not registered for this tenant", input.pool)));
        }

        let task_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "status": "queued",
            "kind": input.kind,
            "pool": input.pool,
            "args": input.args,
        });
        let (encoded, payload_hash) = canonicalize_patch(&payload).map_err(CoreError::from)?;
        let head = rev_hash("", &payload_hash);

        let mut tx = self.pool.begin().await.map_err(CoreError::from)?;

        sqlx::query(
            "INSERT INTO tasks (id, tenant_id, kind, pool, status, parent_task_id, design_hash, plan_hash, args) \
             VALUES ($1, $2, $3, $4, 'queued', $5, $6, $7, $8)",
        )
        .bind(task_id)
        .bind(input.tenant_id)
        .bind(&input.kind)
        .bind(&input.pool)
        .bind(input.parent_task_id)
        .bind(&input.design_hash)
        .bind(&input.plan_hash)
        .bind(&input.args)
        .execute(&mut *tx)
        .await
        .map_err(CoreError::from)?;

        sqlx::query(
            "INSERT INTO task_revisions (task_id, seq, payload, payload_hash, parent_rev_hash, rev_hash) \
             VALUES ($1, 1, $2, $3, NULL, $4)",
        )
        .bind(task_id)
        .bind(&encoded)
        .bind(&payload_hash)
        .bind(&head)
        .execute(&mut *tx)
        .await
        .map_err(CoreError::from)?;

        if let Some(token) = input.client_token {
            let args_bytes = serde_json::to_vec(&input.args).unwrap_or_default();
            let args_hash = peagen_core::revision::payload_hash(&args_bytes);
            sqlx::query(
                "INSERT INTO idempotency_keys (tenant_id, client_token, args_hash, task_id) VALUES ($1, $2, $3, $4)",
            )
            .bind(input.tenant_id)
            .bind(token)
            .bind(args_hash)
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .map_err(CoreError::from)?;
        }

        tx.commit().await.map_err(CoreError::from)?;
        Ok((task_id, head))
    }

    async fn update_task(&self, task_id: Uuid, patch: serde_json::Value, parent_rev_hash: &str) -> Result<UpdateOutcome> {
        let mut tx = self.pool.begin().await.map_err(CoreError::from)?;

        let head_row = sqlx::query("SELECT seq, rev_hash FROM task_revisions WHERE task_id = $1 ORDER BY seq DESC LIMIT 1")
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(CoreError::from)?
            .ok_or_else(|| CoreError::not_found("task not found"))?;

        let head_seq: i64 = head_row.try_get("seq").map_err(CoreError::from)?;
        let head_hash: String = head_row.try_get("rev_hash").map_err(CoreError::from)?;

        if head_hash != parent_rev_hash {
            return Err(CoreError::hash_mismatch("parent_rev_hash does not match the current head revision"));
        }

        let seq = head_seq + 1;
        let (encoded, payload_hash) = canonicalize_patch(&patch).map_err(CoreError::from)?;
        let new_hash = rev_hash(&head_hash, &payload_hash);

        // `UNIQUE (task_id, parent_rev_hash)` catches the race a concurrent
        // writer could win between the SELECT above and this INSERT.
        let inserted = sqlx::query(
            "INSERT INTO task_revisions (task_id, seq, payload, payload_hash, parent_rev_hash, rev_hash) \
             VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (task_id, parent_rev_hash) DO NOTHING",
        )
        .bind(task_id)
        .bind(seq)
        .bind(&encoded)
        .bind(&payload_hash)
        .bind(&head_hash)
        .bind(&new_hash)
        .execute(&mut *tx)
        .await
        .map_err(CoreError::from)?;

        if inserted.rows_affected() == 0 {
            return Err(CoreError::hash_mismatch("lost the race to append the next revision"));
        }

        if let Some(status) = patch.get("status").and_then(|v| v.as_str()) {
            sqlx::query("UPDATE tasks SET status = $1, updated_at = now() WHERE id = $2")
                .bind(status)
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(CoreError::from)?;
        }
        if let Some(worker_id) = patch.get("worker_id") {
            let worker_id: Option<Uuid> = match worker_id {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => {
                    Some(Uuid::parse_str(s).map_err(|err| CoreError::invalid_request(err.to_string()).with_field("worker_id"))?)
                }
                _ => return Err(CoreError::invalid_request("worker_id must be a string or null").with_field("worker_id")),
            };
            sqlx::query("UPDATE tasks SET worker_id = $1, updated_at = now() WHERE id = $2")
                .bind(worker_id)
                .bind(task_id)
                .execute(&mut *tx)
                .await
                .map_err(CoreError::from)?;
        }

        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(CoreError::from)?;
        let task = task_from_row(&row)?;

        tx.commit().await.map_err(CoreError::from)?;
        Ok(UpdateOutcome { rev_hash: new_hash, task })
    }

    async fn get_task(&self, task_id: Uuid) -> Result<(Task, String)> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("task not found"))?;
        let task = task_from_row(&row)?;
        let head = self.current_rev_hash(task_id).await?;
        Ok((task, head))
    }

    async fn task_history(&self, task_id: Uuid) -> Result<Vec<TaskRevision>> {
        let rows = sqlx::query("SELECT * FROM task_revisions WHERE task_id = $1 ORDER BY seq ASC")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(revision_from_row).collect()
    }

    async fn current_rev_hash(&self, task_id: Uuid) -> Result<String> {
        let row = sqlx::query("SELECT rev_hash FROM task_revisions WHERE task_id = $1 ORDER BY seq DESC LIMIT 1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found("task not found"))?;
        Ok(row.try_get("rev_hash")?)
    }

    async fn register_worker(&self, input: RegisterWorkerInput) -> Result<Uuid> {
        self.ensure_pool(input.tenant_id, &input.pool).await?;
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO workers (id, tenant_id, pool, endpoint, capabilities, public_key, status) \
             VALUES ($1, $2, $3, $4, $5, $6, 'idle')",
        )
        .bind(id)
        .bind(input.tenant_id)
        .bind(&input.pool)
        .bind(&input.endpoint)
        .bind(&input.capabilities)
        .bind(&input.public_key)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn heartbeat_worker(&self, worker_id: Uuid, status: WorkerStatus) -> Result<()> {
        let affected = sqlx::query("UPDATE workers SET last_seen_at = now(), status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(worker_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(CoreError::not_found("worker not found"));
        }
        Ok(())
    }

    async fn select_idle_worker(&self, pool: &str, kind: &str, stale_after: DateTime<Utc>) -> Result<Option<Worker>> {
        let row = sqlx::query(
            "SELECT * FROM workers WHERE pool = $1 AND status = 'idle' AND last_seen_at >= $2 AND $3 = ANY(capabilities) \
             ORDER BY last_seen_at ASC LIMIT 1",
        )
        .bind(pool)
        .bind(stale_after)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(worker_from_row).transpose()
    }

    async fn set_worker_status(&self, worker_id: Uuid, status: WorkerStatus) -> Result<()> {
        let affected = sqlx::query("UPDATE workers SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(worker_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if affected == 0 {
            return Err(CoreError::not_found("worker not found"));
        }
        Ok(())
    }

    async fn get_worker(&self, worker_id: Uuid) -> Result<Option<Worker>> {
        let row = sqlx::query("SELECT * FROM workers WHERE id = $1")
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(worker_from_row).transpose()
    }

    async fn stale_workers(&self, stale_after: DateTime<Utc>) -> Result<Vec<Worker>> {
        let rows = sqlx::query("SELECT * FROM workers WHERE status != 'evicted' AND last_seen_at < $1")
            .bind(stale_after)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(worker_from_row).collect()
    }

    async fn evicted_workers_running_since(&self, evict_after: DateTime<Utc>) -> Result<Vec<Worker>> {
        let rows = sqlx::query("SELECT * FROM workers WHERE status = 'stale' AND last_seen_at < $1")
            .bind(evict_after)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(worker_from_row).collect()
    }

    async fn running_tasks_for_worker(&self, worker_id: Uuid) -> Result<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM tasks WHERE worker_id = $1 AND status = 'running'")
            .bind(worker_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn overdue_running_tasks(&self, pool: &str, deadline_cutoff: DateTime<Utc>) -> Result<Vec<(Task, DateTime<Utc>)>> {
        // Anchor on the `seq=1` revision's timestamp (submission time),
        // matching `deadline = submission_time + T_task_max`; joining on
        // `seq=2` (the running-transition revision) would let a task that
        // sat queued for a while keep extra runway past its real deadline.
        let rows = sqlx::query(
            "SELECT t.*, r.created_at AS submitted_at FROM tasks t \
             JOIN task_revisions r ON r.task_id = t.id AND r.seq = 1 \
             WHERE t.pool = $1 AND t.status = 'running' AND r.created_at < $2",
        )
        .bind(pool)
        .bind(deadline_cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let task = task_from_row(row)?;
                let submitted_at: DateTime<Utc> = row.try_get("submitted_at")?;
                Ok((task, submitted_at))
            })
            .collect()
    }

    async fn upsert_manifest(&self, manifest: Manifest) -> Result<()> {
        sqlx::query("INSERT INTO manifests (hash, kind, content) VALUES ($1, $2, $3) ON CONFLICT (hash) DO NOTHING")
            .bind(&manifest.hash)
            .bind(&manifest.kind)
            .bind(&manifest.content)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_manifest(&self, hash: &str) -> Result<Option<Manifest>> {
        let row = sqlx::query("SELECT hash, kind, content FROM manifests WHERE hash = $1")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok(Manifest {
                hash: row.try_get("hash")?,
                kind: row.try_get("kind")?,
                content: row.try_get("content")?,
            })
        })
        .transpose()
    }

    async fn secret_add(&self, record: SecretRecord) -> Result<()> {
        let wrapped_keys = serde_json::to_value(&record.wrapped_keys).map_err(|err| CoreError::internal(anyhow::Error::from(err)))?;
        sqlx::query(
            "INSERT INTO secrets (tenant_id, name, ciphertext, wrapped_keys, recipients) VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (tenant_id, name) DO UPDATE SET ciphertext = EXCLUDED.ciphertext, wrapped_keys = EXCLUDED.wrapped_keys, \
             recipients = EXCLUDED.recipients",
        )
        .bind(record.tenant_id)
        .bind(&record.name)
        .bind(&record.ciphertext)
        .bind(&wrapped_keys)
        .bind(&record.recipients)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn secret_get(&self, tenant_id: Uuid, name: &str) -> Result<Option<SecretRecord>> {
        let row = sqlx::query("SELECT * FROM secrets WHERE tenant_id = $1 AND name = $2")
            .bind(tenant_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let wrapped_keys_json: serde_json::Value = row.try_get("wrapped_keys")?;
            let wrapped_keys: Vec<WrappedKey> =
                serde_json::from_value(wrapped_keys_json).map_err(|err| CoreError::internal(anyhow::Error::from(err)))?;
            Ok(SecretRecord {
                name: row.try_get("name")?,
                tenant_id: row.try_get("tenant_id")?,
                ciphertext: row.try_get("ciphertext")?,
                wrapped_keys,
                recipients: row.try_get("recipients")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn secret_remove(&self, tenant_id: Uuid, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM secrets WHERE tenant_id = $1 AND name = $2")
            .bind(tenant_id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn public_key_upload(&self, record: PublicKeyRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO public_keys (fingerprint, tenant_id, armored, role) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (fingerprint) DO UPDATE SET armored = EXCLUDED.armored, role = EXCLUDED.role",
        )
        .bind(&record.fingerprint)
        .bind(record.tenant_id)
        .bind(&record.armored)
        .bind(record.role.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn public_key_lookup(&self, fingerprint: &str) -> Result<Option<PublicKeyRecord>> {
        let row = sqlx::query("SELECT * FROM public_keys WHERE fingerprint = $1")
            .bind(fingerprint)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let role_str: String = row.try_get("role")?;
            let role = role_str.parse().map_err(CoreError::internal)?;
            Ok(PublicKeyRecord {
                fingerprint: row.try_get("fingerprint")?,
                tenant_id: row.try_get("tenant_id")?,
                armored: row.try_get("armored")?,
                role,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }

    async fn append_evaluation_result(&self, result: EvaluationResult) -> Result<bool> {
        let inserted = sqlx::query(
            "INSERT INTO evaluation_results (task_id, evaluator_name, metric, unit, value) VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (task_id, evaluator_name, metric) DO NOTHING",
        )
        .bind(result.task_id)
        .bind(&result.evaluator_name)
        .bind(&result.metric)
        .bind(&result.unit)
        .bind(result.value)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(inserted > 0)
    }

    async fn evaluation_results_for_task(&self, task_id: Uuid) -> Result<Vec<EvaluationResult>> {
        let rows = sqlx::query("SELECT * FROM evaluation_results WHERE task_id = $1 ORDER BY created_at")
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(EvaluationResult {
                    task_id: row.try_get("task_id")?,
                    evaluator_name: row.try_get("evaluator_name")?,
                    metric: row.try_get("metric")?,
                    unit: row.try_get("unit")?,
                    value: row.try_get("value")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect()
    }
}
