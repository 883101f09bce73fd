//! Prompt rendering of restored conversation history.

use adcp_core::message::{ConversationTurn, Role};

/// Substrings that mark a message as tool-call plumbing rather than
/// conversation.
const TOOL_MARKERS: [&str; 4] = ["toolUse", "toolResult", "tooluse_", "tool_use_id"];

/// Messages shorter than this (after trimming) carry no useful context.
const MIN_TEXT_CHARS: usize = 3;

/// Per-message cap inside the rendered section.
pub const HISTORY_MESSAGE_CHARS: usize = 500;

/// Only the most recent messages are rendered.
pub const HISTORY_MAX_MESSAGES: usize = 10;

/// True when `text` is real conversation: not tool plumbing and not
/// near-empty.
pub fn is_conversational(text: &str) -> bool {
    if TOOL_MARKERS.iter().any(|marker| text.contains(marker)) {
        return false;
    }
    text.trim().chars().count() >= MIN_TEXT_CHARS
}

fn label(role: Role) -> &'static str {
    match role {
        Role::User => "User",
        Role::Assistant => "Assistant",
    }
}

/// Render `turns` as a "Recent Conversation History" section to append to a
/// system prompt. Returns `None` when nothing conversational remains.
pub fn history_context(turns: &[ConversationTurn]) -> Option<String> {
    let lines: Vec<String> = turns
        .iter()
        .filter(|turn| is_conversational(turn.text()))
        .map(|turn| {
            let text: String = turn.text().chars().take(HISTORY_MESSAGE_CHARS).collect();
            format!("{}: {text}", label(turn.role()))
        })
        .collect();

    if lines.is_empty() {
        return None;
    }

    let skip = lines.len().saturating_sub(HISTORY_MAX_MESSAGES);
    Some(format!(
        "\n\n## Recent Conversation History\n{}\n\nContinue the conversation naturally based on this context.",
        lines[skip..].join("\n")
    ))
}
