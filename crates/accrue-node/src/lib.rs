//! # accrue-node: RocksDB storage, JSON-RPC and background maintenance.
//!
//! Composes the reward engine into a running node:
//! - [`storage::RocksStore`]: persistent reward state backed by RocksDB
//! - [`rpc`]: JSON-RPC server for external access
//! - [`scheduler::Scheduler`]: rollover / auto-claim and reconciliation loops
//! - [`config::NodeConfig`]: layered node configuration

pub mod config;
pub mod error;
pub mod rpc;
pub mod scheduler;
pub mod storage;

pub use config::NodeConfig;
pub use error::NodeError;
pub use rpc::start_rpc_server;
pub use scheduler::Scheduler;
pub use storage::RocksStore;
