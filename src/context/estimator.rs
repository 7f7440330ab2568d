//! Token estimation for context size calculation.

use crate::llm::{ApiMessage, ContentBlock};

/// Estimates token counts with a ~4 characters per token heuristic.
///
/// Used when a transport cannot count tokens itself.
pub struct TokenEstimator;

impl TokenEstimator {
    const CHARS_PER_TOKEN: u64 = 4;

    /// Overhead tokens per message (role, formatting).
    const MESSAGE_OVERHEAD: u64 = 4;

    /// Overhead for tool use blocks (id, name, formatting).
    const TOOL_USE_OVERHEAD: u64 = 20;

    /// Overhead for tool result blocks (id, formatting).
    const TOOL_RESULT_OVERHEAD: u64 = 10;

    /// Flat cost of an image block.
    const IMAGE_TOKENS: u64 = 1_000;

    #[must_use]
    pub const fn estimate_text(text: &str) -> u64 {
        (text.len() as u64).div_ceil(Self::CHARS_PER_TOKEN)
    }

    #[must_use]
    pub fn estimate_block(block: &ContentBlock) -> u64 {
        match block {
            ContentBlock::Text { text } | ContentBlock::Reasoning { text } => {
                Self::estimate_text(text)
            }
            ContentBlock::ToolUse { name, input, .. } => {
                let input_str = serde_json::to_string(input).unwrap_or_default();
                Self::estimate_text(name)
                    + Self::estimate_text(&input_str)
                    + Self::TOOL_USE_OVERHEAD
            }
            ContentBlock::ToolResult { content, .. } => {
                Self::estimate_blocks(content) + Self::TOOL_RESULT_OVERHEAD
            }
            ContentBlock::Image { .. } => Self::IMAGE_TOKENS,
        }
    }

    #[must_use]
    pub fn estimate_blocks(blocks: &[ContentBlock]) -> u64 {
        blocks.iter().map(Self::estimate_block).sum()
    }

    #[must_use]
    pub fn estimate_message(message: &ApiMessage) -> u64 {
        Self::estimate_blocks(&message.content) + Self::MESSAGE_OVERHEAD
    }

    #[must_use]
    pub fn estimate_history(messages: &[ApiMessage]) -> u64 {
        messages.iter().map(Self::estimate_message).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use serde_json::json;

    #[test]
    fn test_estimate_text() {
        assert_eq!(TokenEstimator::estimate_text(""), 0);
        assert_eq!(TokenEstimator::estimate_text("hi"), 1);
        assert_eq!(TokenEstimator::estimate_text("test"), 1);
        assert_eq!(TokenEstimator::estimate_text("hello"), 2);
        assert_eq!(TokenEstimator::estimate_text("hello world!"), 3);
    }

    #[test]
    fn test_estimate_text_message() {
        // 19 chars = 5 tokens, + 4 overhead
        let message = ApiMessage::user("Hello, how are you?", 1);
        assert_eq!(TokenEstimator::estimate_message(&message), 9);
    }

    #[test]
    fn test_estimate_tool_result() {
        let message = ApiMessage::new(
            Role::User,
            vec![ContentBlock::tool_result("tool_123", "File contents here...", false)],
            1,
        );
        // 6 content + 10 result overhead + 4 message overhead
        assert_eq!(TokenEstimator::estimate_message(&message), 20);
    }

    #[test]
    fn test_estimate_tool_use_counts_overhead() {
        let block = ContentBlock::ToolUse {
            id: "tool_123".to_string(),
            name: "read".to_string(),
            input: json!({"path": "/test.txt"}),
        };
        assert!(TokenEstimator::estimate_block(&block) > 25);
    }

    #[test]
    fn test_estimate_history() {
        let messages = vec![
            ApiMessage::user("Hello", 1),
            ApiMessage::assistant("Hi there!", 2),
            ApiMessage::user("How are you?", 3),
        ];
        assert_eq!(TokenEstimator::estimate_history(&messages), 20);
        assert_eq!(TokenEstimator::estimate_history(&[]), 0);
    }
}
