//! # ADCP Cache
//!
//! The configuration side of the service: an in-process cache with explicit
//! negative entries, the [`ConfigLoader`] that resolves misses through the
//! backing-store chain, and the [`RefreshOrchestrator`] that clears and
//! reloads everything on demand.

pub mod loader;
pub mod refresh;
pub mod tier;
pub mod visualization;

pub use loader::{ConfigLoader, PreloadReport};
pub use refresh::{RefreshCounts, RefreshItemError, RefreshOrchestrator, RefreshReport};
pub use tier::{CacheRecord, CacheStats, ConfigCacheTier, FillOutcome, FillPolicy};
pub use visualization::{TemplateRef, TemplateSummary, VisualizationMap};
