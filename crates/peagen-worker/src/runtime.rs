//! Worker runtime: registers with the gateway, runs the heartbeat loop, and
//! executes dispatched work through the handler registry.
//!
//! A `tokio::select!` loop over a shutdown signal and inbound work, reporting
//! back over HTTP. The worker exposes a reverse `/rpc` endpoint
//! (`Work.start`/`Work.cancel`) that the gateway's dispatcher calls into, and
//! reports completion back via `Work.finished`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use peagen_client::{GatewayClient, WorkFinishedParams, WorkerRegisterParams};
use serde_json::Value;
use tokio::sync::{watch, Mutex, Semaphore};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::handler::{new_cancel_pair, HandlerContext, HandlerRegistry};

struct InFlight {
    cancel_tx: watch::Sender<bool>,
}

pub struct WorkerRuntime {
    pub cfg: WorkerConfig,
    pub gateway: GatewayClient,
    pub registry: HandlerRegistry,
    pub worker_id: Uuid,
    in_flight: Mutex<HashMap<Uuid, InFlight>>,
    handler_slots: Semaphore,
}

impl WorkerRuntime {
    /// Registers with the gateway (`Worker.register`) and returns a runtime
    /// ready to accept `Work.start` calls.
    pub async fn register(cfg: WorkerConfig, registry: HandlerRegistry) -> anyhow::Result<Arc<Self>> {
        let gateway = GatewayClient::new(cfg.gateway_url.clone());
        let capabilities = if registry.capabilities().is_empty() { cfg.capabilities.clone() } else { registry.capabilities() };

        let result = gateway
            .worker_register(WorkerRegisterParams {
                endpoint: cfg.endpoint(),
                pool: cfg.pool.clone(),
                capabilities,
                public_key: None,
            })
            .await?;

        tracing::info!(worker_id = %result.worker_id, pool = %cfg.pool, "worker registered");

        let handler_concurrency = cfg.handler_concurrency.max(1);
        Ok(Arc::new(Self {
            cfg,
            gateway,
            registry,
            worker_id: result.worker_id,
            in_flight: Mutex::new(HashMap::new()),
            handler_slots: Semaphore::new(handler_concurrency),
        }))
    }

    /// Every `heartbeat.interval_s`, reports liveness to the gateway. Runs
    /// until `shutdown_rx` fires.
    pub async fn heartbeat_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.cfg.heartbeat_interval_s.max(1));
        loop {
            if *shutdown_rx.borrow() {
                return;
            }
            let status = if self.handler_slots.available_permits() == 0 { "busy" } else { "idle" };
            if let Err(err) = self.gateway.worker_heartbeat(self.worker_id, status).await {
                tracing::warn!(error = %err, "heartbeat failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
    }

    /// `Work.start`: accepts the envelope and spawns the handler immediately,
    /// returning without waiting for it to finish. Unknown `kind`s or a full
    /// handler pool are reported back as a failed `Work.finished` rather than
    /// rejecting the RPC, since the gateway already committed the dispatch.
    pub fn work_start(self: &Arc<Self>, envelope: Value) -> anyhow::Result<()> {
        let task_id: Uuid = serde_json::from_value(envelope["task_id"].clone())?;
        let kind: String = serde_json::from_value(envelope["kind"].clone())?;
        let args = envelope.get("args").cloned().unwrap_or(Value::Null);
        let attempt = envelope.get("attempt").and_then(Value::as_i64).unwrap_or(1);

        let this = self.clone();
        tokio::spawn(async move {
            this.run_one(task_id, kind, attempt, args).await;
        });
        Ok(())
    }

    async fn run_one(self: Arc<Self>, task_id: Uuid, kind: String, attempt: i64, args: Value) {
        let (cancel_tx, cancel) = new_cancel_pair();
        self.in_flight.lock().await.insert(task_id, InFlight { cancel_tx });

        let outcome = {
            let Ok(_permit) = self.handler_slots.acquire().await else {
                self.report_finished(task_id, crate::handler::HandlerOutcome::failed("worker shutting down")).await;
                self.in_flight.lock().await.remove(&task_id);
                return;
            };

            let Some(handler) = self.registry.get(&kind) else {
                self.report_finished(task_id, crate::handler::HandlerOutcome::failed(format!("no handler registered for kind '{kind}'"))).await;
                self.in_flight.lock().await.remove(&task_id);
                return;
            };

            let ctx = HandlerContext { task_id, kind, attempt, gateway: self.gateway.clone(), cancel };
            handler.handle(ctx, args).await
        };

        self.in_flight.lock().await.remove(&task_id);
        self.report_finished(task_id, outcome).await;
    }

    async fn report_finished(&self, task_id: Uuid, outcome: crate::handler::HandlerOutcome) {
        let params = WorkFinishedParams {
            task_id,
            status: outcome.status.as_str().to_string(),
            result: outcome.result,
            artifacts: outcome.artifacts,
        };
        if let Err(err) = self.gateway.work_finished(params).await {
            tracing::warn!(error = %err, task_id = %task_id, "Work.finished report failed");
        }
    }

    /// `Work.cancel`: flips the cooperative cancellation flag for `task_id`,
    /// if it's still in flight here. Advisory only — a handler that never
    /// observes the signal simply runs to completion.
    pub async fn work_cancel(&self, task_id: Uuid) -> bool {
        let in_flight = self.in_flight.lock().await;
        match in_flight.get(&task_id) {
            Some(entry) => {
                let _ = entry.cancel_tx.send(true);
                true
            }
            None => false,
        }
    }
}
