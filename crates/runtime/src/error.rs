//! Errors raised while wiring or driving the service.

use adcp_config::ConfigError;
use adcp_core::error::{MemoryError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backing store error: {0}")]
    Store(#[from] StoreError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Unknown {kind} backend: {name}")]
    UnknownBackend { kind: &'static str, name: String },

    #[error("No instructions found for agent: {0}")]
    MissingInstructions(String),

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}
