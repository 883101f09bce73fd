//! Durable conversation memory services for ADCP.
//!
//! Both services store each `add_turns` call as one event and regroup the
//! stored messages into turns on read, a new turn starting at every user
//! message.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::{InMemoryMemoryService, MemoryFault};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteMemoryService;
