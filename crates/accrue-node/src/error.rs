//! Errors raised while assembling and running a node.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("config: {0}")] Config(String),
    #[error("storage: {0}")] Storage(String),
    #[error("rpc server: {0}")] Rpc(String),
}

impl From<config::ConfigError> for NodeError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
