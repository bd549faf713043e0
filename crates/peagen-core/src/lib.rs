//! Shared cross-crate contracts for the Peagen control plane.
//!
//! This crate defines the transport envelope, the pluggable queue and object
//! store traits, request-signing primitives, the revision-chain hash
//! functions, and the domain model shared by the gateway, worker, and
//! client crates. It is an internal crate (`publish = false`).

pub mod error;
pub mod model;
pub mod object_store;
pub mod queue;
pub mod revision;
pub mod rpc;
pub mod signer;
pub mod vault;
pub mod vcs;

pub use error::{CoreError, ErrorKind, Result};
pub use object_store::ObjectStore;
pub use queue::{Envelope, Queue, RequeueReason};
pub use vcs::VcsAdapter;
