//! # ADCP Runtime
//!
//! Wires the configuration cache, backing stores, session context store and
//! durable memory into one [`ServiceContext`], built once at startup and
//! handed to request handlers. [`OrchestratorSession`] drives one
//! conversation through agent switches on top of it.

pub mod context;
pub mod error;
pub mod logging;
pub mod session;

pub use context::ServiceContext;
pub use error::RuntimeError;
pub use session::{Activation, HistorySource, OrchestratorSession};
