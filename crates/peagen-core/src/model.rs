//! Shared domain types for the control plane's entities.
//!
//! These are plain structs; the gateway's Postgres store reads/writes their
//! fields column-by-column (`Row::try_get`) rather than via a derived
//! `FromRow`, keeping SQL row shape and domain struct shape decoupled.

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Lost,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Lost => "lost",
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "queued" => TaskStatus::Queued,
            "running" => TaskStatus::Running,
            "succeeded" => TaskStatus::Succeeded,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            "lost" => TaskStatus::Lost,
            other => return Err(anyhow!("unknown task status: {other}")),
        })
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Idle,
    Busy,
    Stale,
    Evicted,
}

impl WorkerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Active => "active",
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Stale => "stale",
            WorkerStatus::Evicted => "evicted",
        }
    }
}

impl std::str::FromStr for WorkerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "active" => WorkerStatus::Active,
            "idle" => WorkerStatus::Idle,
            "busy" => WorkerStatus::Busy,
            "stale" => WorkerStatus::Stale,
            "evicted" => WorkerStatus::Evicted,
            other => return Err(anyhow!("unknown worker status: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalRole {
    User,
    Worker,
    Gateway,
}

impl PrincipalRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PrincipalRole::User => "user",
            PrincipalRole::Worker => "worker",
            PrincipalRole::Gateway => "gateway",
        }
    }
}

impl std::str::FromStr for PrincipalRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "user" => PrincipalRole::User,
            "worker" => PrincipalRole::Worker,
            "gateway" => PrincipalRole::Gateway,
            other => return Err(anyhow!("unknown principal role: {other}")),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub kind: String,
    pub pool: String,
    pub status: TaskStatus,
    pub worker_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
    pub design_hash: Option<String>,
    pub plan_hash: Option<String>,
    pub args: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRevision {
    pub task_id: Uuid,
    pub seq: i64,
    pub payload: String,
    pub payload_hash: String,
    pub parent_rev_hash: Option<String>,
    pub rev_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub pool: String,
    pub endpoint: String,
    pub capabilities: Vec<String>,
    pub public_key: Option<String>,
    pub last_seen_at: DateTime<Utc>,
    pub status: WorkerStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub hash: String,
    pub kind: String,
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub task_id: Uuid,
    pub evaluator_name: String,
    pub metric: String,
    pub unit: String,
    pub value: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyRecord {
    pub fingerprint: String,
    pub tenant_id: Uuid,
    pub armored: String,
    pub role: PrincipalRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    pub name: String,
    pub tenant_id: Uuid,
    pub ciphertext: String,
    pub wrapped_keys: Vec<WrappedKey>,
    pub recipients: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    pub recipient_fingerprint: String,
    pub ephemeral_public_key: String,
    pub wrapped_cek: String,
    pub nonce: String,
}
