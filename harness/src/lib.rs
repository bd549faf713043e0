//! Local dev CLI for the control plane: run migrations, a gateway, a worker
//! (with a demo handler registered), or fire ad-hoc RPC calls at a running
//! gateway — without standing up containers.

pub mod client;
pub mod config;
pub mod gateway;
pub mod migrate;
pub mod worker;
