//! Context window management.
//!
//! Before each request the task calls [`manage_context`], which decides
//! whether the API history still fits the model's context window:
//!
//! 1. Measure the context size (last reported usage plus the pending user turn)
//! 2. If auto-condense is on and usage reached the threshold, summarize
//!    older turns into one summary turn
//! 3. If summarization is off or failed and the window is still exceeded,
//!    drop the oldest turns
//!
//! Summarization failures are reported back as an error string; they never
//! stop the task.

mod condense;
mod config;
mod estimator;
mod truncate;

pub use condense::{
    CondenseError, SUMMARY_SYSTEM_PROMPT, SummarizeOutcome, SummarizeRequest,
    messages_since_last_summary, summarize_conversation,
};
pub use config::CondenseConfig;
pub use estimator::TokenEstimator;
pub use truncate::{TruncationOutcome, repair_tool_pairing, truncate_conversation};

use crate::llm::{ApiMessage, ModelInfo, ModelTransport, Role};
use crate::messages::ContextCondense;

/// Input to [`manage_context`].
pub struct ContextRequest<'a> {
    pub messages: Vec<ApiMessage>,
    /// Context size reported by the most recent request.
    pub context_tokens: u64,
    pub model: &'a ModelInfo,
    pub config: &'a CondenseConfig,
    /// The task's own transport, used for token counting and, when no
    /// condensing transport is set, for summarization.
    pub transport: &'a dyn ModelTransport,
    /// Separate transport for summary requests.
    pub condensing_transport: Option<&'a dyn ModelTransport>,
    pub system_prompt: &'a str,
    pub task_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct ContextOutcome {
    pub messages: Vec<ApiMessage>,
    pub condense: Option<ContextCondense>,
    pub truncated: bool,
    /// Summarization failure, shown to the user.
    pub error: Option<String>,
    pub prev_context_tokens: u64,
}

impl ContextOutcome {
    /// Whether the history differs from the input.
    #[must_use]
    pub const fn rewritten(&self) -> bool {
        self.condense.is_some() || self.truncated
    }
}

/// Tokens available to the conversation after the safety buffer and the
/// reserved output budget.
#[must_use]
pub fn allowed_tokens(model: &ModelInfo, config: &CondenseConfig) -> u64 {
    let usable = model.context_window * u64::from(100 - config.buffer_percent.min(100)) / 100;
    let reserved = model.max_tokens.unwrap_or(config.default_max_tokens);
    usable.saturating_sub(reserved)
}

pub async fn manage_context(request: ContextRequest<'_>) -> ContextOutcome {
    let ContextRequest {
        messages,
        context_tokens,
        model,
        config,
        transport,
        condensing_transport,
        system_prompt,
        task_id,
    } = request;

    // The reported usage predates the pending user turn.
    let pending_tokens = match messages.last() {
        Some(last) if last.role == Role::User => transport
            .count_tokens(&last.content)
            .await
            .unwrap_or_else(|_| TokenEstimator::estimate_message(last)),
        _ => 0,
    };
    let prev_context_tokens = context_tokens + pending_tokens;
    let allowed = allowed_tokens(model, config);

    let mut error = None;
    if config.auto_condense && model.context_window > 0 {
        let percent = prev_context_tokens.saturating_mul(100) / model.context_window;
        if percent >= u64::from(config.effective_threshold()) || prev_context_tokens > allowed {
            log::debug!(
                "Context threshold reached task_id={task_id} tokens={prev_context_tokens} percent={percent} allowed={allowed}"
            );
            match summarize_conversation(SummarizeRequest {
                messages: &messages,
                transport: condensing_transport.unwrap_or(transport),
                system_prompt,
                task_id,
                prev_context_tokens,
                custom_prompt: config.custom_prompt.as_deref(),
                messages_to_keep: config.messages_to_keep,
            })
            .await
            {
                Ok(outcome) => {
                    return ContextOutcome {
                        messages: outcome.messages,
                        condense: Some(ContextCondense {
                            prev_context_tokens,
                            new_context_tokens: outcome.new_context_tokens,
                            cost: outcome.cost,
                            summary: outcome.summary,
                        }),
                        truncated: false,
                        error: None,
                        prev_context_tokens,
                    };
                }
                Err(e) => {
                    log::warn!("Context condensation failed task_id={task_id} error={e}");
                    error = Some(e.to_string());
                }
            }
        }
    }

    if prev_context_tokens > allowed {
        let outcome = truncate_conversation(&messages, prev_context_tokens - allowed);
        return ContextOutcome {
            truncated: outcome.removed > 0,
            messages: outcome.messages,
            condense: None,
            error,
            prev_context_tokens,
        };
    }

    ContextOutcome {
        messages,
        condense: None,
        truncated: false,
        error,
        prev_context_tokens,
    }
}
