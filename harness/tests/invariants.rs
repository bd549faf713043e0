//! End-to-end tests driving a gateway (and, for dispatch scenarios, a worker)
//! over real HTTP loopback, using the in-memory store/queue so no Postgres
//! or Redis is required. Mirrors the old dispatcher-integration test's shape
//! (a running server plus a `reqwest`-backed client hitting it) but against
//! the control-plane JSON-RPC surface instead of REST routes.

use std::net::TcpListener as StdTcpListener;
use std::time::Duration;

use base64::Engine;
use ed25519_dalek::SigningKey;
use futures_util::{SinkExt, StreamExt};
use peagen_client::{GatewayClient, TaskSubmitParams, WorkerRegisterParams};
use peagen_core::signer::RequestSigner;
use peagen_core::vault::{self, Recipient};
use peagen_gateway::config::GatewayConfig;
use peagen_worker::config::WorkerConfig;
use peagen_worker::handler::{FnHandler, HandlerOutcome, HandlerRegistry};
use tokio::sync::{watch, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

/// Every test parses its own env-derived config via clap's `env` feature;
/// since `std::env` is process-global, tests must not mutate it concurrently.
async fn env_lock() -> tokio::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::OnceLock<Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().await
}

fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local_addr").port()
}

struct RunningGateway {
    base_url: String,
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl RunningGateway {
    async fn start(configure: impl FnOnce(&mut GatewayConfig)) -> Self {
        std::env::set_var("GATEWAY_BIND", format!("127.0.0.1:{}", free_port()));
        std::env::set_var("QUEUE_KIND", "in_memory");
        std::env::set_var("RESULT_BACKEND_KIND", "in_memory");
        std::env::set_var("SHUTDOWN_DRAIN_S", "1");
        std::env::remove_var("CONFIG_FILE");

        let mut cfg = GatewayConfig::load().expect("load gateway config");
        configure(&mut cfg);
        let base_url = format!("http://{}", cfg.gateway_bind);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            if let Err(err) = peagen_gateway::run(cfg, shutdown_rx).await {
                panic!("gateway exited with error: {err}");
            }
        });

        wait_for_listener(&base_url).await;
        Self { base_url, shutdown_tx, handle }
    }

    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

async fn wait_for_listener(base_url: &str) {
    let client = reqwest::Client::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if client.get(base_url).send().await.is_ok() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("gateway never started listening at {base_url}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

struct RunningWorker {
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl RunningWorker {
    async fn start(gateway_base: &str, pool: &str) -> Self {
        std::env::set_var("GATEWAY_URL", gateway_base);
        std::env::set_var("WORKER_BIND", format!("127.0.0.1:{}", free_port()));
        std::env::remove_var("WORKER_ENDPOINT");
        std::env::set_var("WORKER_POOL", pool);
        std::env::set_var("WORKER_CAPABILITIES", "process");
        std::env::set_var("HEARTBEAT_INTERVAL_S", "1");

        let cfg = WorkerConfig::load().expect("load worker config");

        let mut registry = HandlerRegistry::new();
        registry.register(
            "process",
            FnHandler::boxed(|_ctx, args| async move { HandlerOutcome::succeeded(args, Vec::new()) }),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            if let Err(err) = peagen_worker::run(cfg, registry, shutdown_rx).await {
                panic!("worker exited with error: {err}");
            }
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        Self { shutdown_tx, handle }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

async fn poll_status(client: &GatewayClient, task_id: Uuid, want: &str, timeout: Duration) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let got = client.task_get(task_id).await.expect("Task.get");
        if got.task.get("status").and_then(|v| v.as_str()) == Some(want) {
            return got.task;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for status '{want}', last task: {:?}", got.task);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn submit_dispatch_finish_chain_is_valid_and_streamed_over_websocket() {
    let _lock = env_lock().await;
    let gateway = RunningGateway::start(|_| {}).await;
    let client = GatewayClient::new(gateway.base_url.clone());
    let worker = RunningWorker::start(&gateway.base_url, "default").await;

    let (ws_stream, _) =
        tokio_tungstenite::connect_async(format!("{}/ws/tasks", gateway.base_url.replacen("http://", "ws://", 1)))
            .await
            .expect("connect ws");
    let (mut ws_write, mut ws_read) = ws_stream.split();
    let _ = ws_write.send(WsMessage::Ping(Vec::new())).await;

    let submitted = client
        .task_submit(TaskSubmitParams {
            kind: "process".to_string(),
            pool: "default".to_string(),
            args: serde_json::json!({ "x": 1 }),
            client_token: None,
            parent_task_id: None,
            design_hash: None,
            plan_hash: None,
        })
        .await
        .expect("Task.submit");

    poll_status(&client, submitted.task_id, "succeeded", Duration::from_secs(10)).await;

    let history = client.task_history(submitted.task_id).await.expect("Task.history");
    assert!(history.len() >= 3, "expected >= 3 revisions (queued, running, succeeded), got {}", history.len());

    let mut prev_rev_hash: Option<String> = None;
    for revision in &history {
        let parent = revision.get("parent_rev_hash").and_then(|v| v.as_str()).map(str::to_string);
        assert_eq!(parent, prev_rev_hash, "revision chain broken: {revision:?}");
        prev_rev_hash = revision.get("rev_hash").and_then(|v| v.as_str()).map(str::to_string);
    }

    let mut seen_statuses = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while seen_statuses.len() < 3 && tokio::time::Instant::now() < deadline {
        let Ok(Some(Ok(WsMessage::Text(text)))) = tokio::time::timeout(Duration::from_millis(500), ws_read.next()).await else {
            continue;
        };
        let message: serde_json::Value = serde_json::from_str(&text).expect("decode ws message");
        if message.get("task_id").and_then(|v| v.as_str()) == Some(submitted.task_id.to_string()).as_deref() {
            seen_statuses.push(message["status"].as_str().unwrap_or_default().to_string());
        }
    }
    assert!(seen_statuses.len() >= 3, "expected >= 3 task:update messages, got {seen_statuses:?}");

    worker.stop().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn concurrent_updates_with_same_parent_rev_hash_fence_to_one_winner() {
    let _lock = env_lock().await;
    let gateway = RunningGateway::start(|_| {}).await;
    let client = GatewayClient::new(gateway.base_url.clone());

    let submitted = client
        .task_submit(TaskSubmitParams {
            kind: "process".to_string(),
            pool: "default".to_string(),
            args: serde_json::json!({}),
            client_token: None,
            parent_task_id: None,
            design_hash: None,
            plan_hash: None,
        })
        .await
        .expect("Task.submit");

    let rpc = peagen_client::RpcClient::new(gateway.base_url.clone());
    let h0 = submitted.rev_hash.clone();

    let call = |h: String| {
        let rpc = rpc.clone();
        let task_id = submitted.task_id;
        async move {
            rpc.call::<_, serde_json::Value>(
                "Task.update",
                serde_json::json!({ "task_id": task_id, "patch": { "status": "running" }, "parent_rev_hash": h }),
            )
            .await
        }
    };

    let (r1, r2) = tokio::join!(call(h0.clone()), call(h0));
    let outcomes = [r1, r2];

    let ok_count = outcomes.iter().filter(|r| r.is_ok()).count();
    let mismatch_count = outcomes
        .iter()
        .filter(|r| matches!(r, Err(peagen_client::ClientError::Rpc { code, .. }) if *code == -32010))
        .count();

    assert_eq!(ok_count, 1, "expected exactly one winner, got {outcomes:?}");
    assert_eq!(mismatch_count, 1, "expected exactly one hash_mismatch, got {outcomes:?}");

    gateway.shutdown().await;
}

#[tokio::test]
async fn worker_eviction_requeues_task_for_a_fresh_attempt() {
    let _lock = env_lock().await;
    let gateway = RunningGateway::start(|cfg| {
        cfg.heartbeat_stale_s = 1;
        cfg.heartbeat_evict_s = 1;
        cfg.dispatch_poll_ms = 50;
    })
    .await;
    let client = GatewayClient::new(gateway.base_url.clone());

    let dying_worker = RunningWorker::start(&gateway.base_url, "default").await;

    let submitted = client
        .task_submit(TaskSubmitParams {
            kind: "process".to_string(),
            pool: "default".to_string(),
            args: serde_json::json!({}),
            client_token: None,
            parent_task_id: None,
            design_hash: None,
            plan_hash: None,
        })
        .await
        .expect("Task.submit");

    poll_status(&client, submitted.task_id, "running", Duration::from_secs(5)).await;

    // Kill the worker without a graceful Work.finished report: its heartbeat
    // stops, so the gateway's liveness watcher must mark it stale, evict its
    // in-flight task back to queued, and bump the attempt counter.
    dying_worker.stop().await;

    poll_status(&client, submitted.task_id, "queued", Duration::from_secs(10)).await;

    let history_after_eviction = client.task_history(submitted.task_id).await.expect("Task.history");
    let saw_lost_revision = history_after_eviction.iter().any(|r| {
        // Every revision's `payload` is the base64-encoded JSON patch applied
        // at that step; the eviction path applies `{"status": "lost", ...}`
        // before requeuing, mirroring the gateway's own `current_attempt`
        // decode of the same field.
        r.get("payload")
            .and_then(|v| v.as_str())
            .and_then(|encoded| base64::engine::general_purpose::STANDARD.decode(encoded).ok())
            .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
            .and_then(|patch| patch.get("status").and_then(|s| s.as_str()).map(str::to_string))
            == Some("lost".to_string())
    });
    assert!(saw_lost_revision, "expected a 'lost' revision from eviction, got {history_after_eviction:?}");

    let fresh_worker = RunningWorker::start(&gateway.base_url, "default").await;
    poll_status(&client, submitted.task_id, "succeeded", Duration::from_secs(10)).await;

    fresh_worker.stop().await;
    gateway.shutdown().await;
}

#[tokio::test]
async fn queue_backpressure_rejects_past_high_watermark_then_recovers() {
    let _lock = env_lock().await;
    let gateway = RunningGateway::start(|cfg| {
        cfg.queue_high_watermark = 10;
    })
    .await;
    let client = GatewayClient::new(gateway.base_url.clone());

    // Registering a worker for a new pool only registers the pool itself
    // (`ensure_pool`); the gateway spawns a dispatch loop per pool once at
    // startup and only for "default", so nothing ever pops from
    // "backpressure" and queue depth tracks submission count exactly. The
    // endpoint is never dialed since nothing dispatches to it.
    client
        .worker_register(WorkerRegisterParams {
            endpoint: "http://127.0.0.1:1".to_string(),
            pool: "backpressure".to_string(),
            capabilities: vec!["process".to_string()],
            public_key: None,
        })
        .await
        .expect("register pool");

    for n in 0..10 {
        client
            .task_submit(TaskSubmitParams {
                kind: "process".to_string(),
                pool: "backpressure".to_string(),
                args: serde_json::json!({ "n": n }),
                client_token: None,
                parent_task_id: None,
                design_hash: None,
                plan_hash: None,
            })
            .await
            .unwrap_or_else(|err| panic!("submit {n} should succeed: {err}"));
    }

    let eleventh = client
        .task_submit(TaskSubmitParams {
            kind: "process".to_string(),
            pool: "backpressure".to_string(),
            args: serde_json::json!({ "n": 10 }),
            client_token: None,
            parent_task_id: None,
            design_hash: None,
            plan_hash: None,
        })
        .await;

    let err = eleventh.expect_err("11th submit should be rejected once depth reaches the watermark");
    assert!(
        matches!(err, peagen_client::ClientError::Rpc { code: -32020, .. }),
        "expected queue_unavailable, got {err:?}"
    );

    gateway.shutdown().await;
}

#[tokio::test]
async fn idempotent_submit_with_same_client_token_returns_same_task() {
    let _lock = env_lock().await;
    let gateway = RunningGateway::start(|_| {}).await;
    let client = GatewayClient::new(gateway.base_url.clone());

    let params = || TaskSubmitParams {
        kind: "process".to_string(),
        pool: "default".to_string(),
        args: serde_json::json!({ "a": 1 }),
        client_token: Some("resubmit-abc".to_string()),
        parent_task_id: None,
        design_hash: None,
        plan_hash: None,
    };

    let first = client.task_submit(params()).await.expect("first submit");
    let second = client.task_submit(params()).await.expect("second submit");

    assert_eq!(first.task_id, second.task_id);
    assert_eq!(first.rev_hash, second.rev_hash);

    let history = client.task_history(first.task_id).await.expect("Task.history");
    assert_eq!(history.len(), 1, "idempotent resubmit must not create a second revision");

    gateway.shutdown().await;
}

#[tokio::test]
async fn secret_round_trips_for_recipient_and_rejects_other_principals() {
    let _lock = env_lock().await;
    let gateway = RunningGateway::start(|_| {}).await;
    let anon = GatewayClient::new(gateway.base_url.clone());

    let worker_signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let intruder_signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let worker_fingerprint = RequestSigner::new(worker_signing_key.clone()).fingerprint();

    anon.public_key_upload(&RequestSigner::new(worker_signing_key.clone()).armored_public_key(), "worker")
        .await
        .expect("upload worker key");
    anon.public_key_upload(&RequestSigner::new(intruder_signing_key.clone()).armored_public_key(), "user")
        .await
        .expect("upload intruder key");

    // Ed25519 signing identity and X25519 vault identity are separate
    // keypairs, tied together only by the shared fingerprint string: the
    // gateway's Secret.get recipient check looks up the signer's fingerprint,
    // while vault::encrypt/decrypt wraps keys to an X25519 public key.
    let (worker_x25519_secret, worker_x25519_public) = vault::generate_keypair();

    let encrypted = vault::encrypt(
        b"db-password-xyz",
        &[Recipient { fingerprint: &worker_fingerprint, x25519_public_key: &worker_x25519_public }],
    )
    .expect("encrypt secret");
    let wrapped_keys_json = serde_json::to_value(&encrypted.wrapped_keys).expect("serialize wrapped keys");

    // Any already-registered key may call Secret.add; the recipient list
    // gates Secret.get, not the submitter's identity.
    let submitter = GatewayClient::new(gateway.base_url.clone()).with_signer(RequestSigner::new(intruder_signing_key.clone()));
    submitter
        .secret_add("db-password", &encrypted.ciphertext, wrapped_keys_json, "default")
        .await
        .expect("Secret.add");

    let worker_client = GatewayClient::new(gateway.base_url.clone()).with_signer(RequestSigner::new(worker_signing_key.clone()));
    let fetched = worker_client.secret_get("db-password", "default").await.expect("Secret.get as recipient");

    let fetched_ciphertext = fetched.get("ciphertext").and_then(|v| v.as_str()).expect("ciphertext field").to_string();
    let fetched_wrapped_keys: Vec<vault::WrappedKey> =
        serde_json::from_value(fetched.get("wrapped_keys").cloned().expect("wrapped_keys field")).expect("decode wrapped keys");
    let fetched_encrypted = vault::EncryptedSecret {
        ciphertext: fetched_ciphertext,
        nonce: encrypted.nonce.clone(),
        wrapped_keys: fetched_wrapped_keys,
    };

    let plaintext = vault::decrypt(&fetched_encrypted, &worker_fingerprint, &worker_x25519_secret).expect("decrypt as recipient");
    assert_eq!(plaintext, b"db-password-xyz");

    let intruder_client = GatewayClient::new(gateway.base_url.clone()).with_signer(RequestSigner::new(intruder_signing_key));
    let err = intruder_client.secret_get("db-password", "default").await.expect_err("intruder must be rejected");
    assert!(
        matches!(err, peagen_client::ClientError::Rpc { code: -32001, .. }),
        "expected unauthorized, got {err:?}"
    );

    gateway.shutdown().await;
}
