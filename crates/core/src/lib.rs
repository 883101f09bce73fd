//! # ADCP Core
//!
//! Domain types, traits, and error definitions for the ADCP agent
//! orchestration service. This crate has **no framework dependencies**. It
//! defines the domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every remote collaborator (key/value store, object store, durable
//! conversation memory) is defined as a trait here. Implementations live in
//! their respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with in-memory stand-ins
//! - Clean dependency graph (all crates depend inward on core)

pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod message;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use config::{ConfigEntry, ConfigKey, ConfigType, ConsistencyMode, SourceTier};
pub use error::{MemoryError, StoreError};
pub use event::{DomainEvent, EventBus};
pub use memory::{
    ConversationalMessage, MemoryService, MemorySession, StoredMessage, Turn, group_into_turns,
};
pub use message::{ActorId, ConversationTurn, MemoryId, Role, SessionId};
pub use store::{KeyValueStore, ObjectStore, StoreItem};
