//! Backing stores for ADCP configuration and the chain that consults them.
//!
//! Resolution order is fixed: key/value store, then object store, then the
//! local library directory. The first tier with a non-empty value wins.

pub mod chain;
pub mod directory;
pub mod in_memory;
pub mod library;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use chain::{BackingStoreChain, ConfigSource, KeyValueSource, LibrarySource, ObjectSource};
pub use directory::DirectoryObjectStore;
pub use in_memory::{Fault, FaultTarget, InMemoryKvStore, InMemoryObjectStore};
pub use library::{LocalLibrary, normalize_name};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteKvStore;
