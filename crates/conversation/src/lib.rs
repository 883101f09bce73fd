//! # ADCP Conversation
//!
//! Conversation state for multi-agent sessions.
//!
//! - [`SessionContextStore`]: per-session, per-agent history saved across
//!   agent switches, bounded per agent and LRU-bounded per session.
//! - [`ConversationPersistenceManager`]: mirrors an agent's live messages
//!   into durable memory behind a monotonic cursor.
//! - [`reducer`]: what happens to the live history when it outgrows the
//!   model's context budget.
//! - [`history`]: renders restored turns as a prompt section.

pub mod history;
pub mod persistence;
pub mod reducer;
pub mod session_store;

pub use history::{history_context, is_conversational};
pub use persistence::{
    BindingState, ConversationPersistenceManager, PersistenceOptions, PersistenceState,
};
pub use reducer::{
    ContextReducer, ExtractiveSummarizer, ReduceTrigger, Reduction, SlidingWindowReducer,
    SummarizeError, SummarizingReducer, TurnSummarizer,
};
pub use session_store::{
    SavedContext, SessionBounds, SessionContextStore, SessionStats, trim_turns,
};
