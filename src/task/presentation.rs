//! Presenting streamed assistant blocks.
//!
//! After every chunk the accumulated text is re-parsed and the blocks not yet
//! fully presented are walked in order. Text is shown as it grows; tool uses
//! are previewed while partial and executed once complete. Only one tool
//! runs per response, and nothing runs after a rejected tool.

use crate::llm::{ContentBlock, UsageChunk};
use crate::messages::SayKind;
use crate::tools::{ToolOutput, ToolUseRequest};
use crate::types::TaskError;

use super::Task;
use super::helpers::interrupted_tool_results;
use super::interaction::SayOptions;
use super::parser::{
    AssistantBlock, parse_assistant_message, strip_thinking_tags, strip_trailing_partial_tag,
};

/// Accumulated state of one streamed response.
#[derive(Debug, Default)]
pub(super) struct StreamState {
    pub(super) assistant_text: String,
    pub(super) reasoning: String,
    pub(super) reasoning_done: bool,
    pub(super) native_calls: Vec<ToolUseRequest>,
    pub(super) blocks: Vec<AssistantBlock>,
    /// Index of the first block not yet completely presented.
    pub(super) presented: usize,
    pub(super) did_reject_tool: bool,
    pub(super) did_already_use_tool: bool,
    /// Content for the next user turn.
    pub(super) tool_results: Vec<ContentBlock>,
    pub(super) usage: UsageChunk,
}

impl StreamState {
    pub(super) fn reparse(&mut self, tool_names: &[String]) {
        let mut blocks = parse_assistant_message(&self.assistant_text, tool_names);
        if !self.native_calls.is_empty() {
            // Text preceding a native call is complete.
            for block in &mut blocks {
                if matches!(block, AssistantBlock::Text { .. }) {
                    block.finalize();
                }
            }
            blocks.extend(self.native_calls.iter().cloned().map(AssistantBlock::ToolUse));
        }
        self.blocks = blocks;
    }

    pub(super) fn finalize_blocks(&mut self) {
        for block in &mut self.blocks {
            block.finalize();
        }
    }

    pub(super) fn did_use_tool(&self) -> bool {
        self.blocks
            .iter()
            .any(|block| matches!(block, AssistantBlock::ToolUse(_)))
    }

    pub(super) fn add_usage(&mut self, usage: &UsageChunk) {
        self.usage.input_tokens += usage.input_tokens;
        self.usage.output_tokens += usage.output_tokens;
        if let Some(writes) = usage.cache_write_tokens {
            *self.usage.cache_write_tokens.get_or_insert(0) += writes;
        }
        if let Some(reads) = usage.cache_read_tokens {
            *self.usage.cache_read_tokens.get_or_insert(0) += reads;
        }
        if let Some(cost) = usage.total_cost {
            *self.usage.total_cost.get_or_insert(0.0) += cost;
        }
    }

    /// Every native call in the assistant turn needs a result in the next
    /// user turn, even if it never ran.
    pub(super) fn close_unanswered_native_calls(&mut self) {
        let answered: Vec<String> = self
            .tool_results
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                _ => None,
            })
            .collect();
        let missing: Vec<&str> = self
            .native_calls
            .iter()
            .filter_map(|call| call.id.as_deref())
            .filter(|id| !answered.iter().any(|a| a == id))
            .collect();
        let results = interrupted_tool_results(missing);
        self.tool_results.extend(results);
    }

    /// The assistant turn as it will be recorded in the API history.
    pub(super) fn assistant_content(&self) -> Vec<ContentBlock> {
        let mut content = Vec::new();
        if !self.assistant_text.is_empty() {
            content.push(ContentBlock::text(self.assistant_text.clone()));
        }
        for call in &self.native_calls {
            if let Some(id) = &call.id {
                content.push(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: call.name.clone(),
                    input: call.input.clone(),
                });
            }
        }
        content
    }

    fn push_tool_result(&mut self, request: &ToolUseRequest, output: ToolOutput) {
        if let Some(id) = &request.id {
            self.tool_results.push(ContentBlock::ToolResult {
                tool_use_id: id.clone(),
                content: output.content,
                is_error: output.is_error.then_some(true),
            });
            return;
        }

        self.tool_results
            .push(ContentBlock::text(format!("{} Result:", request.description())));
        if output.content.is_empty() {
            self.tool_results
                .push(ContentBlock::text("(tool did not return anything)"));
        } else {
            self.tool_results.extend(output.content);
        }
    }

    fn push_skipped(&mut self, request: &ToolUseRequest, text: String) {
        match &request.id {
            Some(id) => self
                .tool_results
                .push(ContentBlock::tool_result(id.clone(), text, false)),
            None => self.tool_results.push(ContentBlock::text(text)),
        }
    }
}

fn as_task_error(error: &anyhow::Error) -> Option<&TaskError> {
    error.downcast_ref::<TaskError>()
}

#[allow(clippy::needless_pass_by_value)]
fn invalid_pattern(error: anyhow::Error) -> TaskError {
    TaskError::InvariantViolation(format!("{error:#}"))
}

impl Task {
    /// Present every block from `state.presented` on, stopping at the first
    /// partial block.
    pub(super) async fn present(&self, state: &mut StreamState) -> Result<(), TaskError> {
        while let Some(block) = state.blocks.get(state.presented).cloned() {
            if self.is_aborted() {
                return Err(TaskError::Aborted);
            }

            let partial = block.is_partial();
            match block {
                AssistantBlock::Text { content, partial } => {
                    self.present_text(state, &content, partial).await?;
                }
                AssistantBlock::ToolUse(request) => {
                    self.present_tool_use(state, &request).await?;
                }
            }

            if partial {
                break;
            }
            state.presented += 1;
        }
        Ok(())
    }

    async fn present_text(
        &self,
        state: &StreamState,
        content: &str,
        partial: bool,
    ) -> Result<(), TaskError> {
        if state.did_reject_tool || state.did_already_use_tool {
            return Ok(());
        }

        let mut text = strip_thinking_tags(content).map_err(invalid_pattern)?;
        if partial {
            text = strip_trailing_partial_tag(&text).map_err(invalid_pattern)?;
        }
        if text.trim().is_empty() {
            return Ok(());
        }

        self.say_with(SayKind::Text, Some(text), SayOptions::partial(partial))
            .await?;
        Ok(())
    }

    async fn present_tool_use(
        &self,
        state: &mut StreamState,
        request: &ToolUseRequest,
    ) -> Result<(), TaskError> {
        if state.did_reject_tool {
            if !request.partial {
                state.push_skipped(
                    request,
                    format!(
                        "Skipping tool {} due to user rejecting a previous tool.",
                        request.description()
                    ),
                );
            }
            return Ok(());
        }

        if state.did_already_use_tool {
            if !request.partial {
                state.push_skipped(
                    request,
                    format!(
                        "Tool [{}] was not executed because a tool has already been used in this \
message. Only one tool may be used per message. You must assess the first tool's result before \
proceeding to use the next tool.",
                        request.name
                    ),
                );
            }
            return Ok(());
        }

        if request.partial {
            if let Err(e) = self.presenter.preview(self, request).await {
                match as_task_error(&e) {
                    Some(TaskError::Aborted) => return Err(TaskError::Aborted),
                    Some(err) if err.is_recoverable() => {}
                    _ => log::debug!(
                        "Tool preview failed task_id={} tool={} error={e:#}",
                        self.id,
                        request.name
                    ),
                }
            }
            return Ok(());
        }

        self.store.record_tool_usage(&request.name).await;
        let (output, recorded) = match self.presenter.execute(self, request).await {
            Ok(output) => (output, false),
            Err(e) => {
                if matches!(as_task_error(&e), Some(TaskError::Aborted)) {
                    return Err(TaskError::Aborted);
                }
                let message = format!("Error executing {}: {e:#}", request.description());
                log::warn!(
                    "Tool execution failed task_id={} tool={} error={e:#}",
                    self.id,
                    request.name
                );
                self.store.record_tool_error(&request.name, &message).await;
                self.say(SayKind::Error, message.clone()).await?;
                (ToolOutput::error(message), true)
            }
        };
        if output.is_error && !recorded {
            let message = output
                .content
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            self.store.record_tool_error(&request.name, &message).await;
        }

        let rejected = output.rejected;
        state.push_tool_result(request, output);
        if rejected {
            log::debug!(
                "Tool rejected task_id={} tool={}",
                self.id,
                request.name
            );
            state.did_reject_tool = true;
        }
        state.did_already_use_tool = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn native(id: &str) -> ToolUseRequest {
        ToolUseRequest {
            id: Some(id.to_string()),
            name: "read_file".to_string(),
            input: json!({ "path": "a.rs" }),
            partial: false,
        }
    }

    #[test]
    fn native_calls_follow_completed_text() {
        let mut state = StreamState {
            assistant_text: "Reading".to_string(),
            native_calls: vec![native("call_1")],
            ..StreamState::default()
        };
        state.reparse(&[]);

        assert_eq!(state.blocks.len(), 2);
        assert!(!state.blocks[0].is_partial());
        assert!(state.did_use_tool());
    }

    #[test]
    fn unanswered_native_calls_get_interrupted_results() {
        let mut state = StreamState {
            native_calls: vec![native("call_1"), native("call_2")],
            ..StreamState::default()
        };
        state.push_tool_result(&native("call_1"), ToolOutput::text("ok"));
        state.close_unanswered_native_calls();

        let ids: Vec<&str> = state
            .tool_results
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["call_1", "call_2"]);
    }

    #[test]
    fn markup_tool_result_is_labelled() {
        let mut state = StreamState::default();
        let request = ToolUseRequest {
            id: None,
            ..native("ignored")
        };
        state.push_tool_result(&request, ToolOutput::default());

        assert_eq!(
            state.tool_results,
            vec![
                ContentBlock::text("[read_file for 'a.rs'] Result:"),
                ContentBlock::text("(tool did not return anything)"),
            ]
        );
    }

    #[test]
    fn usage_accumulates_optional_counters() {
        let mut state = StreamState::default();
        state.add_usage(&UsageChunk {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: Some(3),
            ..UsageChunk::default()
        });
        state.add_usage(&UsageChunk {
            input_tokens: 1,
            total_cost: Some(0.5),
            ..UsageChunk::default()
        });

        assert_eq!(state.usage.input_tokens, 11);
        assert_eq!(state.usage.cache_read_tokens, Some(3));
        assert_eq!(state.usage.cache_write_tokens, None);
        assert_eq!(state.usage.total_cost, Some(0.5));
    }
}
