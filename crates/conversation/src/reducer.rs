//! Context reduction: shrinking a live history that no longer fits the
//! model's context budget.
//!
//! Two strategies:
//!
//! - [`SlidingWindowReducer`] keeps the newest `window` turns, oldest
//!   dropped first.
//! - [`SummarizingReducer`] folds the oldest share of the history into a
//!   single summary turn, never touching the most recent turns. The summary
//!   text comes from a [`TurnSummarizer`]; production wires an LLM-backed
//!   one, [`ExtractiveSummarizer`] is the built-in default.

use adcp_core::message::{ConversationTurn, Role};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::history::is_conversational;

/// Why a reduction was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceTrigger {
    /// The model rejected the request for exceeding its context window
    ContextOverflow,
    Manual,
}

/// What a reduction did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reduction {
    /// Turns taken out of the history (summarized or dropped)
    pub removed: usize,
    /// Whether a summary turn replaced them
    pub summarized: bool,
}

#[derive(Debug, Clone, Error)]
pub enum SummarizeError {
    #[error("Summarizer failed: {0}")]
    Failed(String),

    #[error("Nothing to summarize")]
    Empty,
}

/// Strategy for shrinking a live history in place.
#[async_trait]
pub trait ContextReducer: Send + Sync {
    fn name(&self) -> &str;

    async fn reduce(&self, turns: &mut Vec<ConversationTurn>, trigger: ReduceTrigger)
    -> Reduction;
}

// ── Sliding window ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct SlidingWindowReducer {
    window: usize,
}

impl SlidingWindowReducer {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }
}

impl Default for SlidingWindowReducer {
    fn default() -> Self {
        Self::new(10)
    }
}

#[async_trait]
impl ContextReducer for SlidingWindowReducer {
    fn name(&self) -> &str {
        "sliding_window"
    }

    async fn reduce(
        &self,
        turns: &mut Vec<ConversationTurn>,
        trigger: ReduceTrigger,
    ) -> Reduction {
        let removed = turns.len().saturating_sub(self.window);
        if removed > 0 {
            turns.drain(..removed);
            info!(removed, kept = turns.len(), ?trigger, "Reduced context by removing oldest turns");
        }
        Reduction {
            removed,
            summarized: false,
        }
    }
}

// ── Summarizing ───────────────────────────────────────────────────────────

/// Produces the text of a summary turn.
#[async_trait]
pub trait TurnSummarizer: Send + Sync {
    async fn summarize(&self, turns: &[ConversationTurn]) -> Result<String, SummarizeError>;
}

/// Summary built from the first line of every conversational turn.
#[derive(Debug, Clone, Copy)]
pub struct ExtractiveSummarizer {
    /// Per-line cap, in characters
    pub line_chars: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self { line_chars: 200 }
    }
}

#[async_trait]
impl TurnSummarizer for ExtractiveSummarizer {
    async fn summarize(&self, turns: &[ConversationTurn]) -> Result<String, SummarizeError> {
        let lines: Vec<String> = turns
            .iter()
            .filter(|turn| is_conversational(turn.text()))
            .map(|turn| {
                let first_line = turn.text().lines().next().unwrap_or_default().trim();
                let excerpt: String = first_line.chars().take(self.line_chars).collect();
                let who = match turn.role() {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                };
                format!("- {who}: {excerpt}")
            })
            .collect();
        if lines.is_empty() {
            return Err(SummarizeError::Empty);
        }
        Ok(format!(
            "Summary of the earlier conversation:\n{}",
            lines.join("\n")
        ))
    }
}

/// Folds the oldest `summary_ratio` of the history into one assistant turn.
pub struct SummarizingReducer {
    summary_ratio: f32,
    preserve_recent: usize,
    summarizer: Arc<dyn TurnSummarizer>,
}

impl SummarizingReducer {
    pub fn new(summary_ratio: f32, preserve_recent: usize) -> Self {
        Self {
            summary_ratio: summary_ratio.clamp(0.1, 0.8),
            preserve_recent,
            summarizer: Arc::new(ExtractiveSummarizer::default()),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn TurnSummarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// How many of the oldest turns to fold: at least one, never reaching
    /// into the preserved tail.
    fn fold_count(&self, len: usize) -> usize {
        let by_ratio = ((len as f32) * self.summary_ratio) as usize;
        by_ratio.max(1).min(len.saturating_sub(self.preserve_recent))
    }
}

impl Default for SummarizingReducer {
    fn default() -> Self {
        Self::new(0.3, 5)
    }
}

#[async_trait]
impl ContextReducer for SummarizingReducer {
    fn name(&self) -> &str {
        "summarizing"
    }

    async fn reduce(
        &self,
        turns: &mut Vec<ConversationTurn>,
        trigger: ReduceTrigger,
    ) -> Reduction {
        let count = self.fold_count(turns.len());
        if count == 0 {
            warn!(
                turns = turns.len(),
                preserve_recent = self.preserve_recent,
                "History too short to reduce"
            );
            return Reduction::default();
        }

        match self.summarizer.summarize(&turns[..count]).await {
            Ok(summary) => {
                turns.splice(..count, [ConversationTurn::assistant(summary)]);
                info!(folded = count, kept = turns.len(), ?trigger, "Summarized oldest turns");
                Reduction {
                    removed: count,
                    summarized: true,
                }
            }
            Err(e) => {
                warn!(error = %e, dropped = count, "Summarizer failed, dropping oldest turns");
                turns.drain(..count);
                Reduction {
                    removed: count,
                    summarized: false,
                }
            }
        }
    }
}
