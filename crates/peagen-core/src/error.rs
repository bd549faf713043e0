//! Shared error type for the control plane.
//!
//! Every RPC-visible failure carries an [`ErrorKind`], which maps 1:1 onto a
//! JSON-RPC error code. Internal plumbing errors
//! (`anyhow`, `sqlx`, `redis`) are wrapped with [`ErrorKind::Internal`] unless
//! a call site has a more specific kind to attach.

use std::fmt;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    Unauthorized,
    NotFound,
    HashMismatch,
    QueueUnavailable,
    WorkerUnavailable,
    TenantMissing,
    Conflict,
    DeadlineExceeded,
    Exhausted,
    Internal,
}

impl ErrorKind {
    /// JSON-RPC 2.0 error code for this kind.
    pub fn code(self) -> i64 {
        match self {
            ErrorKind::InvalidRequest => -32600,
            ErrorKind::Unauthorized => -32001,
            // Not `-32601`: that code is reserved for JSON-RPC "method not
            // found", assigned directly by `RpcError::method_not_found`.
            ErrorKind::NotFound => -32041,
            ErrorKind::HashMismatch => -32010,
            ErrorKind::QueueUnavailable => -32020,
            ErrorKind::WorkerUnavailable => -32030,
            ErrorKind::TenantMissing => -32040,
            ErrorKind::Conflict => -32011,
            ErrorKind::DeadlineExceeded => -32050,
            ErrorKind::Exhausted => -32051,
            ErrorKind::Internal => -32000,
        }
    }
}

#[derive(Debug)]
pub struct CoreError {
    kind: ErrorKind,
    inner: anyhow::Error,
    /// Optional field path for `-32602 invalid_params`-style validation errors.
    pub field: Option<String>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            inner: anyhow::anyhow!(message.into()),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn hash_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::HashMismatch, message)
    }

    pub fn queue_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::QueueUnavailable, message)
    }

    pub fn worker_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::WorkerUnavailable, message)
    }

    pub fn tenant_missing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TenantMissing, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        Self {
            kind: ErrorKind::Internal,
            inner: err.into(),
            field: None,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

impl std::error::Error for CoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal(value)
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(value: sqlx::Error) -> Self {
        match &value {
            sqlx::Error::RowNotFound => Self::not_found("row not found"),
            _ => Self::internal(anyhow::Error::from(value)),
        }
    }
}

#[cfg(feature = "redis-queue")]
impl From<redis::RedisError> for CoreError {
    fn from(value: redis::RedisError) -> Self {
        Self::new(ErrorKind::QueueUnavailable, value.to_string())
    }
}
