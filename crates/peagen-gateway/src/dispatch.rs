//! Per-pool dispatch loop, deadline watchdog, and heartbeat liveness watcher.
//!
//! Background loops spawned alongside the HTTP server, each driven by
//! `tokio::select!` against a shared `watch::Receiver<bool>` shutdown
//! signal, polling on a fixed interval rather than a push notification:
//! one dispatch loop per pool, plus a shared watchdog and heartbeat watcher.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use peagen_client::WorkerClient;
use peagen_core::model::WorkerStatus;
use peagen_core::queue::RequeueReason;
use peagen_core::Queue;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::GatewayConfig;
use crate::store::GatewayStore;

pub const TASK_UPDATE_CHANNEL: &str = "task:update";

pub struct DispatchContext {
    pub store: Arc<dyn GatewayStore>,
    pub queue: Arc<dyn Queue>,
    pub cfg: GatewayConfig,
    known_pools: Mutex<HashSet<String>>,
}

impl DispatchContext {
    pub fn new(store: Arc<dyn GatewayStore>, queue: Arc<dyn Queue>, cfg: GatewayConfig, pools: &[String]) -> Self {
        Self {
            store,
            queue,
            cfg,
            known_pools: Mutex::new(pools.iter().cloned().collect()),
        }
    }
}

/// Spawns one dispatch loop per pool plus the shared watchdog and heartbeat
/// watcher, returning their join handles so the caller can await them on
/// shutdown.
pub fn spawn(ctx: Arc<DispatchContext>, pools: Vec<String>, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(pools.len() + 2);

    for pool in pools {
        handles.push(tokio::spawn(dispatch_loop(ctx.clone(), pool, shutdown_rx.clone())));
    }
    handles.push(tokio::spawn(heartbeat_watcher_loop(ctx.clone(), shutdown_rx.clone())));
    handles.push(tokio::spawn(watchdog_loop(ctx, shutdown_rx)));

    handles
}

async fn dispatch_loop(ctx: Arc<DispatchContext>, pool: String, mut shutdown_rx: watch::Receiver<bool>) {
    let poll_timeout = Duration::from_millis(ctx.cfg.dispatch_poll_ms);
    let backoff = Duration::from_millis(ctx.cfg.dispatch_backoff_ms);

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        let popped = tokio::select! {
            res = ctx.queue.pop_blocking(&pool, poll_timeout) => res,
            _ = shutdown_rx.changed() => continue,
        };

        let envelope = match popped {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(error = %err, pool = %pool, "queue pop failed");
                tokio::time::sleep(backoff).await;
                continue;
            }
        };

        if let Err(err) = dispatch_one(&ctx, &pool, envelope).await {
            tracing::warn!(error = %err, pool = %pool, "dispatch attempt failed");
            tokio::time::sleep(backoff).await;
        }
    }
}

async fn dispatch_one(ctx: &DispatchContext, pool: &str, envelope: peagen_core::Envelope) -> anyhow::Result<()> {
    let stale_after = Utc::now() - chrono::Duration::seconds(ctx.cfg.heartbeat_stale_s);
    let worker = ctx.store.select_idle_worker(pool, &envelope.kind, stale_after).await?;

    let Some(worker) = worker else {
        ctx.queue.requeue(pool, envelope, RequeueReason::NoWorker).await?;
        return Ok(());
    };

    ctx.store.set_worker_status(worker.id, WorkerStatus::Busy).await?;

    let parent_rev_hash = ctx.store.current_rev_hash(envelope.task_id).await?;
    let patch = serde_json::json!({ "status": "running", "worker_id": worker.id, "attempt": envelope.attempt });
    let outcome = ctx.store.update_task(envelope.task_id, patch, &parent_rev_hash).await?;
    publish_update(ctx, envelope.task_id, pool, &outcome.rev_hash, "running").await;

    let client = WorkerClient::new(worker.endpoint.as_str());
    let envelope_json = serde_json::json!({
        "task_id": envelope.task_id,
        "kind": envelope.kind,
        "args": envelope.args,
        "attempt": envelope.attempt,
        "deadline": envelope.deadline,
    });

    let envelope_id = envelope.id;
    let task_id = envelope.task_id;

    match client.work_start(envelope_json).await {
        Ok(_) => {
            ctx.queue.ack(pool, envelope_id).await?;
            Ok(())
        }
        Err(err) => {
            tracing::warn!(error = %err, worker_id = %worker.id, task_id = %task_id, "Work.start failed");
            ctx.store.set_worker_status(worker.id, WorkerStatus::Stale).await?;
            ctx.queue.requeue(pool, envelope, RequeueReason::DispatchFailed).await?;
            Ok(())
        }
    }
}

/// Scans `running` tasks in `pool` whose submission-time deadline has
/// elapsed, cancels them on the owning worker, and marks the worker idle
/// again. Cancellation is best-effort, per the deadline-exceeded policy.
async fn watchdog_loop(ctx: Arc<DispatchContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = Duration::from_millis(ctx.cfg.dispatch_poll_ms.max(1000));

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        if let Err(err) = run_watchdog_once(&ctx).await {
            tracing::warn!(error = %err, "watchdog pass failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

async fn run_watchdog_once(ctx: &DispatchContext) -> anyhow::Result<()> {
    let now = Utc::now();
    let task_max = chrono::Duration::seconds(ctx.cfg.dispatch_task_max_s);

    for (task, _started_at) in collect_overdue(ctx, now, task_max).await? {
        let parent_rev_hash = ctx.store.current_rev_hash(task.id).await?;
        let patch = serde_json::json!({ "status": "cancelled", "reason": "deadline_exceeded" });
        let outcome = ctx.store.update_task(task.id, patch, &parent_rev_hash).await?;
        publish_update(ctx, task.id, &task.pool, &outcome.rev_hash, "cancelled").await;

        if let Some(worker_id) = task.worker_id {
            if let Some(worker) = ctx.store.get_worker(worker_id).await? {
                let client = WorkerClient::new(worker.endpoint.as_str());
                let _ = client.work_cancel(task.id).await;
                ctx.store.set_worker_status(worker_id, WorkerStatus::Idle).await?;
            }
        }
    }
    Ok(())
}

async fn collect_overdue(
    ctx: &DispatchContext,
    now: chrono::DateTime<Utc>,
    task_max: chrono::Duration,
) -> anyhow::Result<Vec<(peagen_core::model::Task, chrono::DateTime<Utc>)>> {
    // `overdue_running_tasks` takes the comparison instant, not the task_max
    // window, so the deadline is applied here per-pool by the caller's
    // config; pools share one `T_task_max` in this configuration surface.
    let mut out = Vec::new();
    for pool in ctx.store_pools().await? {
        let deadline_cutoff = now - task_max;
        out.extend(ctx.store.overdue_running_tasks(&pool, deadline_cutoff).await?);
    }
    Ok(out)
}

/// Every `T_heartbeat/2`, mark workers stale past `T_stale` and evict (plus
/// requeue their in-flight tasks) workers stale past `T_evict`.
async fn heartbeat_watcher_loop(ctx: Arc<DispatchContext>, mut shutdown_rx: watch::Receiver<bool>) {
    let interval = Duration::from_secs(ctx.cfg.heartbeat_interval_s.max(1)) / 2;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        if let Err(err) = run_heartbeat_watch_once(&ctx).await {
            tracing::warn!(error = %err, "heartbeat watcher pass failed");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }
}

async fn run_heartbeat_watch_once(ctx: &DispatchContext) -> anyhow::Result<()> {
    let now = Utc::now();
    let stale_after = now - chrono::Duration::seconds(ctx.cfg.heartbeat_stale_s);
    let evict_after = now - chrono::Duration::seconds(ctx.cfg.heartbeat_evict_s);

    for worker in ctx.store.stale_workers(stale_after).await? {
        ctx.store.set_worker_status(worker.id, WorkerStatus::Stale).await?;
    }

    for worker in ctx.store.evicted_workers_running_since(evict_after).await? {
        ctx.store.set_worker_status(worker.id, WorkerStatus::Evicted).await?;

        for task in ctx.store.running_tasks_for_worker(worker.id).await? {
            let parent_rev_hash = ctx.store.current_rev_hash(task.id).await?;
            let lost_patch = serde_json::json!({ "status": "lost", "reason": "worker_evicted" });
            let outcome = ctx.store.update_task(task.id, lost_patch, &parent_rev_hash).await?;
            publish_update(ctx, task.id, &task.pool, &outcome.rev_hash, "lost").await;

            let attempt = current_attempt(ctx.store.as_ref(), task.id).await?;
            if attempt >= ctx.cfg.dispatch_max_attempts {
                let parent_rev_hash = outcome.rev_hash;
                let failed_patch = serde_json::json!({ "status": "failed", "reason": "exhausted" });
                let outcome = ctx.store.update_task(task.id, failed_patch, &parent_rev_hash).await?;
                publish_update(ctx, task.id, &task.pool, &outcome.rev_hash, "failed").await;
                continue;
            }

            let parent_rev_hash = outcome.rev_hash;
            let requeued_patch = serde_json::json!({ "status": "queued", "worker_id": serde_json::Value::Null });
            let outcome = ctx.store.update_task(task.id, requeued_patch, &parent_rev_hash).await?;
            publish_update(ctx, task.id, &task.pool, &outcome.rev_hash, "queued").await;

            let envelope = peagen_core::Envelope {
                id: uuid::Uuid::new_v4(),
                task_id: task.id,
                kind: task.kind.clone(),
                args: task.args.clone(),
                attempt: attempt + 1,
                submitted_at: now,
                deadline: now + chrono::Duration::seconds(ctx.cfg.dispatch_task_max_s),
            };
            ctx.queue.push(&task.pool, envelope).await?;
        }
    }

    Ok(())
}

/// The current attempt counter, read back from the most recent revision's
/// decoded payload (envelopes don't persist `attempt` anywhere else).
async fn current_attempt(store: &dyn GatewayStore, task_id: uuid::Uuid) -> anyhow::Result<i64> {
    let history = store.task_history(task_id).await?;
    let attempt = history
        .last()
        .and_then(|r| base64::engine::general_purpose::STANDARD.decode(&r.payload).ok())
        .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
        .and_then(|v| v.get("attempt").and_then(|a| a.as_i64()))
        .unwrap_or(1);
    Ok(attempt)
}

async fn publish_update(ctx: &DispatchContext, task_id: uuid::Uuid, pool: &str, rev_hash: &str, status: &str) {
    let message = serde_json::json!({
        "task_id": task_id,
        "pool": pool,
        "rev_hash": rev_hash,
        "status": status,
        "ts": Utc::now(),
    });
    if let Err(err) = ctx.queue.publish(TASK_UPDATE_CHANNEL, message).await {
        tracing::warn!(error = %err, task_id = %task_id, "failed to publish task:update");
    }
}

impl DispatchContext {
    /// Pools with at least one registered worker. The dispatch loop set is
    /// fixed at startup (one loop per known pool); newly-registered pools
    /// pick up dispatch on the next gateway restart, consistent with "pools
    /// must exist before task submission" being a startup-time concern.
    async fn store_pools(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.known_pools.lock().unwrap().iter().cloned().collect())
    }
}
