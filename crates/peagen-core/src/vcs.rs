//! Git/VCS adapter interface consumed by task handlers.
//!
//! This is interface-only: the core defines the contract a handler can rely
//! on for commit/tag/branch operations against whatever repository a task
//! operates on, but ships no implementation. Concrete adapters (e.g. a
//! `git2`-backed one, or a remote-API-backed one) live outside the core, the
//! same way `Queue` and `ObjectStore` implementations can be swapped without
//! the dispatcher or worker runtime changing.

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub repo_ref: String,
    pub branch: String,
    pub message: String,
    pub files: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone)]
pub struct CommitResult {
    pub sha: String,
}

#[async_trait]
pub trait VcsAdapter: Send + Sync {
    async fn commit(&self, req: CommitRequest) -> Result<CommitResult>;

    async fn tag(&self, repo_ref: &str, sha: &str, tag_name: &str) -> Result<()>;

    async fn branch(&self, repo_ref: &str, from_sha: &str, branch_name: &str) -> Result<()>;

    async fn resolve_ref(&self, repo_ref: &str, ref_name: &str) -> Result<String>;
}
