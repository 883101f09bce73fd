//! Error types for the ADCP domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error type; crates further out wrap
//! them in their own enums.

use crate::config::SourceTier;
use thiserror::Error;

/// Failures reported by a backing store tier.
///
/// `NotFound` is a normal outcome and may be cached negatively. `TransientIo`
/// and `Unavailable` mean the tier could not answer and must not be cached.
/// `Malformed` means a record was found but could not be parsed.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transient I/O failure in {tier}: {reason}")]
    TransientIo { tier: SourceTier, reason: String },

    #[error("Source unavailable: {tier}: {reason}")]
    Unavailable { tier: SourceTier, reason: String },

    #[error("Malformed record {key} in {tier}: {reason}")]
    Malformed {
        tier: SourceTier,
        key: String,
        reason: String,
    },
}

impl StoreError {
    /// Whether the failure means "this tier could not answer" rather than
    /// "this tier answered with nothing".
    pub fn is_outage(&self) -> bool {
        matches!(self, Self::TransientIo { .. } | Self::Unavailable { .. })
    }

    /// The tier that produced the error, if known.
    pub fn tier(&self) -> Option<SourceTier> {
        match self {
            Self::NotFound(_) => None,
            Self::TransientIo { tier, .. }
            | Self::Unavailable { tier, .. }
            | Self::Malformed { tier, .. } => Some(*tier),
        }
    }
}

/// Failures reported by the durable conversation memory service.
#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    #[error("Memory service unavailable: {0}")]
    Unavailable(String),

    #[error("Memory request timed out after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid turn: {0}")]
    InvalidTurn(String),
}
