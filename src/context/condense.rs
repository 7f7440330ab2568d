//! Summarization of older history into a single summary turn.

use crate::llm::{
    ApiMessage, ApiRequest, ContentBlock, ModelTransport, RequestMetadata, Role, collect_response,
};
use std::fmt::{self, Write};

use super::estimator::TokenEstimator;

pub const SUMMARY_SYSTEM_PROMPT: &str = "You are a precise summarizer. Your task is to create \
concise but complete summaries of conversations, preserving all technical details that would be \
needed to continue the work.";

const CONTINUE_FROM_SUMMARY: &str = "Please continue from the following summary:";

/// Why a summarization attempt produced no usable summary.
#[derive(Debug, Clone, PartialEq)]
pub enum CondenseError {
    NotEnoughMessages,
    /// A summary is already among the most recent messages.
    CondensedRecently,
    EmptySummary,
    /// The summary did not make the context smaller.
    ContextGrew { prev: u64, new: u64 },
    Transport(String),
}

impl fmt::Display for CondenseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotEnoughMessages => f.write_str("Not enough messages to condense the context"),
            Self::CondensedRecently => f.write_str("Context was condensed recently; skipping"),
            Self::EmptySummary => f.write_str("Failed to condense context: empty summary"),
            Self::ContextGrew { prev, new } => write!(
                f,
                "Condensing did not reduce the context size ({prev} -> {new} tokens)"
            ),
            Self::Transport(message) => write!(f, "Failed to condense context: {message}"),
        }
    }
}

impl std::error::Error for CondenseError {}

/// Input to [`summarize_conversation`].
pub struct SummarizeRequest<'a> {
    pub messages: &'a [ApiMessage],
    pub transport: &'a dyn ModelTransport,
    /// The task's own system prompt, counted toward the new context size.
    pub system_prompt: &'a str,
    pub task_id: &'a str,
    pub prev_context_tokens: u64,
    pub custom_prompt: Option<&'a str>,
    pub messages_to_keep: usize,
}

#[derive(Debug, Clone)]
pub struct SummarizeOutcome {
    pub messages: Vec<ApiMessage>,
    pub summary: String,
    pub cost: f64,
    pub new_context_tokens: u64,
}

/// Messages from the most recent summary onward, or all messages if there
/// is none. A leading summary turn is preceded by a user turn so the slice
/// still opens with the user role.
#[must_use]
pub fn messages_since_last_summary(messages: &[ApiMessage]) -> Vec<ApiMessage> {
    let Some(index) = messages.iter().rposition(|m| m.is_summary) else {
        return messages.to_vec();
    };
    let since = &messages[index..];
    let mut result = Vec::with_capacity(since.len() + 1);
    if since[0].role == Role::Assistant {
        result.push(ApiMessage::user(CONTINUE_FROM_SUMMARY, since[0].ts));
    }
    result.extend_from_slice(since);
    result
}

/// Replace the history between the first message and the most recent
/// `messages_to_keep` with one assistant summary turn.
pub async fn summarize_conversation(
    request: SummarizeRequest<'_>,
) -> Result<SummarizeOutcome, CondenseError> {
    let SummarizeRequest {
        messages,
        transport,
        system_prompt,
        task_id,
        prev_context_tokens,
        custom_prompt,
        messages_to_keep,
    } = request;

    let split = messages.len().saturating_sub(messages_to_keep);
    let to_summarize = messages_since_last_summary(&messages[..split]);
    if to_summarize.len() <= 1 {
        return Err(CondenseError::NotEnoughMessages);
    }

    let keep = &messages[split..];
    if keep.iter().any(|m| m.is_summary) {
        return Err(CondenseError::CondensedRecently);
    }

    let instructions = custom_prompt
        .filter(|p| !p.trim().is_empty())
        .unwrap_or(SUMMARY_INSTRUCTIONS);
    let prompt = build_summary_prompt(instructions, &format_messages_for_summary(&to_summarize));

    let model = transport.model_info();
    let stream = transport.create_message(ApiRequest {
        system_prompt: SUMMARY_SYSTEM_PROMPT.to_string(),
        messages: vec![ApiMessage::user(prompt, 0)],
        metadata: RequestMetadata {
            task_id: task_id.to_string(),
            mode: String::new(),
            suppress_previous_response_id: true,
        },
    });
    let response = collect_response(stream)
        .await
        .map_err(|e| CondenseError::Transport(format!("{e:#}")))?;

    let summary = response.text.trim().to_string();
    if summary.is_empty() {
        return Err(CondenseError::EmptySummary);
    }
    let cost = response
        .usage
        .total_cost
        .unwrap_or_else(|| model.calculate_cost(&response.usage));

    let first = messages[0].clone();
    let summary_message = ApiMessage {
        is_summary: true,
        ..ApiMessage::assistant(summary.clone(), keep.first().map_or(first.ts, |m| m.ts))
    };

    let mut context_blocks = vec![ContentBlock::text(system_prompt)];
    context_blocks.extend(first.content.iter().cloned());
    let output_tokens = if response.usage.output_tokens > 0 {
        response.usage.output_tokens
    } else {
        context_blocks.extend(summary_message.content.iter().cloned());
        0
    };
    context_blocks.extend(keep.iter().flat_map(|m| m.content.iter().cloned()));
    let counted = transport
        .count_tokens(&context_blocks)
        .await
        .unwrap_or_else(|e| {
            log::debug!("Token counting failed, estimating instead error={e:#}");
            TokenEstimator::estimate_blocks(&context_blocks)
        });
    let new_context_tokens = output_tokens + counted;

    if new_context_tokens >= prev_context_tokens {
        return Err(CondenseError::ContextGrew {
            prev: prev_context_tokens,
            new: new_context_tokens,
        });
    }

    let mut new_messages = Vec::with_capacity(2 + keep.len());
    new_messages.push(first);
    new_messages.push(summary_message);
    new_messages.extend_from_slice(keep);

    log::info!(
        "Condensed context task_id={task_id} prev_tokens={prev_context_tokens} new_tokens={new_context_tokens} removed_messages={}",
        messages.len() - new_messages.len()
    );

    Ok(SummarizeOutcome {
        messages: new_messages,
        summary,
        cost,
        new_context_tokens,
    })
}

const SUMMARY_INSTRUCTIONS: &str = "Summarize this conversation concisely, preserving:
- Key decisions and conclusions reached
- Important file paths, code changes, and technical details
- Current task context and what has been accomplished
- Any pending items, errors encountered, or next steps

Be specific about technical details (file names, function names, error messages) as these are \
critical for continuing the work.";

fn build_summary_prompt(instructions: &str, messages_text: &str) -> String {
    format!("{instructions}\n\nConversation:\n{messages_text}\n\nProvide the summary:")
}

fn format_messages_for_summary(messages: &[ApiMessage]) -> String {
    let mut output = String::new();

    for message in messages {
        let role = match message.role {
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        let _ = write!(output, "{role}: ");

        for block in &message.content {
            match block {
                ContentBlock::Text { text } => {
                    let _ = writeln!(output, "{text}");
                }
                ContentBlock::Reasoning { text } => {
                    let _ = writeln!(output, "[Thinking: {text}]");
                }
                ContentBlock::ToolUse { name, input, .. } => {
                    let _ = writeln!(
                        output,
                        "[Called tool: {name} with input: {}]",
                        serde_json::to_string(input).unwrap_or_default()
                    );
                }
                ContentBlock::ToolResult {
                    content, is_error, ..
                } => {
                    let status = if is_error.unwrap_or(false) {
                        "error"
                    } else {
                        "success"
                    };
                    let text = content
                        .iter()
                        .filter_map(|b| match b {
                            ContentBlock::Text { text } => Some(text.as_str()),
                            _ => None,
                        })
                        .collect::<Vec<_>>()
                        .join("\n");
                    // Unicode-safe truncation
                    let truncated = if text.chars().count() > 500 {
                        let prefix: String = text.chars().take(500).collect();
                        format!("{prefix}... (truncated)")
                    } else {
                        text
                    };
                    let _ = writeln!(output, "[Tool result ({status}): {truncated}]");
                }
                ContentBlock::Image { media_type, .. } => {
                    let _ = writeln!(output, "[Image: {media_type}]");
                }
            }
        }
        output.push('\n');
    }

    output
}
