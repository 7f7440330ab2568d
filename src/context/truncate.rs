//! Sliding-window truncation used when summarization is unavailable.

use crate::llm::{ApiMessage, ContentBlock, Role};
use std::collections::HashSet;

use super::estimator::TokenEstimator;

const RESULTS_REMOVED: &str = "[Earlier tool results were removed to fit the context window]";

#[derive(Debug, Clone)]
pub struct TruncationOutcome {
    pub messages: Vec<ApiMessage>,
    pub removed: usize,
    /// Estimated tokens freed.
    pub freed_tokens: u64,
}

/// Drop the oldest non-summary turns, two at a time, until at least
/// `excess_tokens` have been freed.
///
/// The first message and the most recent message are never removed, and
/// summary turns are skipped. Tool results left without their tool use are
/// stripped afterwards.
#[must_use]
pub fn truncate_conversation(messages: &[ApiMessage], excess_tokens: u64) -> TruncationOutcome {
    let mut kept = messages.to_vec();
    let mut removed = 0;
    let mut freed_tokens = 0;
    let mut index = 1;

    while freed_tokens < excess_tokens && index + 2 < kept.len() {
        if kept[index].is_summary {
            index += 1;
            continue;
        }
        let span = if kept[index + 1].is_summary { 1 } else { 2 };
        for message in kept.drain(index..index + span) {
            freed_tokens += TokenEstimator::estimate_message(&message);
            removed += 1;
        }
    }

    repair_tool_pairing(&mut kept);

    log::debug!(
        "Truncated conversation removed={removed} freed_tokens={freed_tokens} excess_tokens={excess_tokens}"
    );

    TruncationOutcome {
        messages: kept,
        removed,
        freed_tokens,
    }
}

/// Remove tool-result blocks whose tool use is not in the directly preceding
/// assistant turn. A user turn left empty gets a short placeholder.
pub fn repair_tool_pairing(messages: &mut [ApiMessage]) {
    let mut previous_tool_ids: HashSet<String> = HashSet::new();

    for message in messages.iter_mut() {
        match message.role {
            Role::Assistant => {
                previous_tool_ids = message.tool_use_ids().map(str::to_string).collect();
            }
            Role::User => {
                let before = message.content.len();
                message.content.retain(|block| match block {
                    ContentBlock::ToolResult { tool_use_id, .. } => {
                        previous_tool_ids.contains(tool_use_id)
                    }
                    _ => true,
                });
                if message.content.is_empty() && before > 0 {
                    message.content.push(ContentBlock::text(RESULTS_REMOVED));
                }
                previous_tool_ids.clear();
            }
        }
    }
}
