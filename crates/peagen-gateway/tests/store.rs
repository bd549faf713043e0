//! Direct tests of the `GatewayStore` contract against the in-memory
//! backend: no HTTP, no Postgres, exercising store-layer algorithms
//! directly rather than only through the router. The `/rpc` surface built
//! on top of this trait (auth, queue interaction, dispatch) is covered
//! end-to-end in `harness/tests/invariants.rs` instead.

use chrono::Utc;
use peagen_core::model::{EvaluationResult, PrincipalRole, PublicKeyRecord, SecretRecord, WorkerStatus};
use peagen_gateway::store::{GatewayStore, RegisterWorkerInput, SubmitTaskInput};
use peagen_gateway::store::memory::InMemoryStore;
use uuid::Uuid;

fn submit_input(tenant_id: Uuid, pool: &str) -> SubmitTaskInput {
    SubmitTaskInput {
        tenant_id,
        kind: "process".to_string(),
        pool: pool.to_string(),
        args: serde_json::json!({ "a": 1 }),
        client_token: None,
        parent_task_id: None,
        design_hash: None,
        plan_hash: None,
    }
}

#[tokio::test]
async fn submit_requires_an_existing_pool() {
    let store = InMemoryStore::new();
    let tenant_id = Uuid::new_v4();

    let err = store.submit_task(submit_input(tenant_id, "ghost")).await.unwrap_err();
    assert_eq!(err.kind(), peagen_core::ErrorKind::TenantMissing);

    store.ensure_pool(tenant_id, "ghost").await.unwrap();
    store.submit_task(submit_input(tenant_id, "ghost")).await.expect("submit succeeds once the pool exists");
}

#[tokio::test]
async fn revision_chain_links_by_rev_hash_and_starts_with_an_empty_parent() {
    let store = InMemoryStore::new();
    let tenant_id = Uuid::new_v4();
    store.ensure_pool(tenant_id, "default").await.unwrap();

    let (task_id, h0) = store.submit_task(submit_input(tenant_id, "default")).await.unwrap();
    let outcome1 = store.update_task(task_id, serde_json::json!({ "status": "running" }), &h0).await.unwrap();
    let outcome2 = store
        .update_task(task_id, serde_json::json!({ "status": "succeeded" }), &outcome1.rev_hash)
        .await
        .unwrap();

    let history = store.task_history(task_id).await.unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].parent_rev_hash, None);
    assert_eq!(history[1].parent_rev_hash.as_deref(), Some(h0.as_str()));
    assert_eq!(history[2].parent_rev_hash.as_deref(), Some(outcome1.rev_hash.as_str()));
    assert_eq!(history[2].rev_hash, outcome2.rev_hash);

    let current = store.current_rev_hash(task_id).await.unwrap();
    assert_eq!(current, outcome2.rev_hash);
}

#[tokio::test]
async fn update_task_rejects_a_stale_parent_rev_hash() {
    let store = InMemoryStore::new();
    let tenant_id = Uuid::new_v4();
    store.ensure_pool(tenant_id, "default").await.unwrap();

    let (task_id, h0) = store.submit_task(submit_input(tenant_id, "default")).await.unwrap();
    store.update_task(task_id, serde_json::json!({ "status": "running" }), &h0).await.unwrap();

    let err = store.update_task(task_id, serde_json::json!({ "status": "running" }), &h0).await.unwrap_err();
    assert_eq!(err.kind(), peagen_core::ErrorKind::HashMismatch);
}

#[tokio::test]
async fn idempotent_submit_returns_the_same_task_for_a_repeated_client_token() {
    let store = InMemoryStore::new();
    let tenant_id = Uuid::new_v4();
    store.ensure_pool(tenant_id, "default").await.unwrap();

    let args = serde_json::json!({ "a": 1 });
    let args_hash = peagen_core::revision::payload_hash(&serde_json::to_vec(&args).unwrap());

    let mut input = submit_input(tenant_id, "default");
    input.client_token = Some("dedupe-me".to_string());
    input.args = args.clone();
    let (task_id, _) = store.submit_task(input).await.unwrap();

    let found = store.find_idempotent_submit(tenant_id, "dedupe-me", &args_hash).await.unwrap();
    assert_eq!(found, Some(task_id));

    let not_found = store.find_idempotent_submit(tenant_id, "dedupe-me", "different-hash").await.unwrap();
    assert_eq!(not_found, None);
}

#[tokio::test]
async fn select_idle_worker_excludes_busy_and_stale_workers() {
    let store = InMemoryStore::new();
    let tenant_id = Uuid::new_v4();
    store.ensure_pool(tenant_id, "default").await.unwrap();

    let worker_id = store
        .register_worker(RegisterWorkerInput {
            tenant_id,
            pool: "default".to_string(),
            endpoint: "http://127.0.0.1:9".to_string(),
            capabilities: vec!["process".to_string()],
            public_key: None,
        })
        .await
        .unwrap();

    let recent = Utc::now() - chrono::Duration::seconds(5);
    let found = store.select_idle_worker("default", "process", recent).await.unwrap();
    assert_eq!(found.map(|w| w.id), Some(worker_id));

    store.set_worker_status(worker_id, WorkerStatus::Busy).await.unwrap();
    assert!(store.select_idle_worker("default", "process", recent).await.unwrap().is_none());

    store.set_worker_status(worker_id, WorkerStatus::Idle).await.unwrap();
    let long_ago = Utc::now() - chrono::Duration::seconds(600);
    // Worker registered well after `long_ago`, so it does not satisfy a
    // stale_after cutoff that predates its last heartbeat.
    assert!(store.select_idle_worker("default", "process", long_ago).await.unwrap().is_some());

    // A capability that was never registered never matches.
    assert!(store.select_idle_worker("default", "evolve", recent).await.unwrap().is_none());
}

#[tokio::test]
async fn secret_get_is_scoped_by_recipient_list() {
    let store = InMemoryStore::new();
    let tenant_id = Uuid::new_v4();

    store
        .secret_add(SecretRecord {
            name: "db-password".to_string(),
            tenant_id,
            ciphertext: "opaque".to_string(),
            wrapped_keys: Vec::new(),
            recipients: vec!["worker-fp".to_string()],
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let found = store.secret_get(tenant_id, "db-password").await.unwrap().expect("secret exists");
    assert_eq!(found.recipients, vec!["worker-fp".to_string()]);
    assert!(!found.recipients.contains(&"intruder-fp".to_string()));

    store.secret_remove(tenant_id, "db-password").await.unwrap();
    assert!(store.secret_get(tenant_id, "db-password").await.unwrap().is_none());
}

#[tokio::test]
async fn public_key_lookup_round_trips_by_fingerprint() {
    let store = InMemoryStore::new();
    let tenant_id = Uuid::new_v4();
    let record = PublicKeyRecord {
        fingerprint: "abc123".to_string(),
        tenant_id,
        armored: "base64-key".to_string(),
        role: PrincipalRole::Worker,
        created_at: Utc::now(),
    };

    store.public_key_upload(record).await.unwrap();
    let found = store.public_key_lookup("abc123").await.unwrap().expect("key exists");
    assert_eq!(found.role.as_str(), "worker");
    assert!(store.public_key_lookup("unknown").await.unwrap().is_none());
}

#[tokio::test]
async fn evaluation_results_append_on_success_and_dedupe_by_task_evaluator_metric() {
    let store = InMemoryStore::new();
    let task_id = Uuid::new_v4();

    let row = EvaluationResult {
        task_id,
        evaluator_name: "pytest".to_string(),
        metric: "pass_rate".to_string(),
        unit: "ratio".to_string(),
        value: 0.92,
        created_at: Utc::now(),
    };

    let inserted = store.append_evaluation_result(row.clone()).await.unwrap();
    assert!(inserted, "first insert for a (task, evaluator, metric) triple should succeed");

    // A repeat of the same (task_id, evaluator_name, metric) triple is a
    // duplicate report, not a new metric — it must not create a second row.
    let duplicate = store.append_evaluation_result(row).await.unwrap();
    assert!(!duplicate, "repeated (task, evaluator, metric) triple should not insert again");

    let other_metric = EvaluationResult {
        task_id,
        evaluator_name: "pytest".to_string(),
        metric: "duration_s".to_string(),
        unit: "s".to_string(),
        value: 12.5,
        created_at: Utc::now(),
    };
    store.append_evaluation_result(other_metric).await.unwrap();

    let results = store.evaluation_results_for_task(task_id).await.unwrap();
    assert_eq!(results.len(), 2, "expected one row per distinct metric, got {results:?}");
    assert!(results.iter().any(|r| r.metric == "pass_rate" && r.value == 0.92));
    assert!(results.iter().any(|r| r.metric == "duration_s" && r.value == 12.5));

    let other_task = store.evaluation_results_for_task(Uuid::new_v4()).await.unwrap();
    assert!(other_task.is_empty());
}
