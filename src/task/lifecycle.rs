use crate::context::{CondenseConfig, SummarizeRequest, TokenEstimator, summarize_conversation};
use crate::conversation::unix_millis;
use crate::events::TaskEvent;
use crate::llm::{ApiMessage, ContentBlock, Role};
use crate::messages::{AskKind, AskResponse, ContextCondense, SayKind};
use crate::types::TaskError;

use super::Task;
use super::helpers::{describe_elapsed, interrupted_tool_results};
use super::interaction::SayOptions;

impl Task {
    /// Start a fresh task and run the request loop.
    ///
    /// Returns the loop's result: `true` if it ended on its own, `false` if
    /// the task was aborted.
    pub async fn start_task(&self, task: &str, images: Vec<String>) -> Result<bool, TaskError> {
        self.store.overwrite_api(Vec::new()).await;
        self.store.overwrite_ui(Vec::new()).await;
        let mode = self.modes.current_mode().await;
        self.store.set_mode(&mode).await;

        log::info!("Starting task task_id={} mode={mode}", self.id);
        self.events.emit(TaskEvent::started(self.id.clone())).await;

        self.say_with(
            SayKind::Text,
            Some(task.to_string()),
            SayOptions::default().with_images(images.clone()),
        )
        .await?;

        let mut content = vec![ContentBlock::text(format!("<task>\n{task}\n</task>"))];
        content.extend(ContentBlock::images(&images));
        Ok(self.initiate_task_loop(content).await)
    }

    /// Resume a persisted task.
    ///
    /// Loads both logs, drops bookkeeping left by the interrupted run, asks
    /// the user whether to continue, pairs every unanswered tool use with an
    /// interrupted result and re-enters the request loop.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvariantViolation`] if the history cannot be loaded or
    /// is empty.
    pub async fn resume_task_from_history(&self) -> Result<bool, TaskError> {
        self.store.load().await.map_err(|e| {
            TaskError::InvariantViolation(format!("failed to load task history: {e:#}"))
        })?;

        let mut api = self.store.api_messages().await;
        if api.is_empty() {
            return Err(TaskError::InvariantViolation(
                "no API conversation history to resume".to_string(),
            ));
        }

        let mut ui = self.store.ui_messages().await;
        while ui.last().is_some_and(|m| {
            m.is_ask(AskKind::ResumeTask) || m.is_ask(AskKind::ResumeCompletedTask)
        }) {
            ui.pop();
        }
        // A request that never finished has no cost and no cancel reason.
        if let Some(index) = ui.iter().rposition(|m| m.is_say(SayKind::ApiReqStarted)) {
            let unfinished = ui[index]
                .api_request
                .as_ref()
                .is_none_or(|info| info.cost.is_none() && info.cancel_reason.is_none());
            if unfinished {
                ui.remove(index);
            }
        }

        let last_ts = ui.last().map_or(0, |m| m.ts);
        let ask = if ui.last().is_some_and(|m| m.is_ask(AskKind::CompletionResult)) {
            AskKind::ResumeCompletedTask
        } else {
            AskKind::ResumeTask
        };
        self.store.overwrite_ui(ui).await;

        let mode = self.modes.current_mode().await;
        self.store.set_mode(&mode).await;
        log::info!(
            "Resuming task task_id={} instance_id={} messages={}",
            self.id,
            self.instance_id,
            api.len()
        );
        self.events.emit(TaskEvent::started(self.id.clone())).await;

        let reply = self.ask(ask, None, None).await?;
        let (feedback, images) = if reply.response == AskResponse::MessageResponse {
            self.say_with(
                SayKind::UserFeedback,
                reply.text.clone(),
                SayOptions::default().with_images(reply.images.clone()),
            )
            .await?;
            (reply.text, reply.images)
        } else {
            (None, Vec::new())
        };

        let mut content = close_interrupted_turn(&mut api);

        let ago = describe_elapsed(unix_millis() - last_ts);
        let mut notice = format!(
            "[TASK RESUMPTION] This task was interrupted {ago}. It may or may not be complete, so \
please reassess the task context. Be aware that the project state may have changed since then. \
If the task has not been completed, retry the last step before interruption and proceed with \
completing the task.\n\nNote: If you previously attempted a tool use that the user did not \
provide a result for, you should assume the tool use was not successful and assess whether you \
should retry."
        );
        if let Some(feedback) = feedback.filter(|text| !text.is_empty()) {
            notice.push_str(&format!(
                "\n\nNew instructions for task continuation:\n<user_message>\n{feedback}\n</user_message>"
            ));
        }
        content.push(ContentBlock::text(notice));
        content.extend(ContentBlock::images(&images));

        self.store.overwrite_api(api).await;
        Ok(self.initiate_task_loop(content).await)
    }

    /// Summarize the conversation now, regardless of the auto-condense
    /// threshold. Failures are shown to the user, not returned.
    pub async fn condense_context(&self) -> Result<(), TaskError> {
        if self.is_aborted() {
            return Err(TaskError::Aborted);
        }

        let settings = self.modes.settings().await;
        let mode = self.modes.current_mode().await;
        let system_prompt = self.environment.system_prompt(&mode).await.map_err(|e| {
            TaskError::Configuration(format!("failed to build system prompt: {e:#}"))
        })?;
        let messages = self.store.api_messages().await;
        let context_tokens = self.store.token_usage().await.context_tokens;
        let prev_context_tokens = if context_tokens > 0 {
            context_tokens
        } else {
            TokenEstimator::estimate_history(&messages) + TokenEstimator::estimate_text(&system_prompt)
        };
        let config = CondenseConfig::from_settings(&settings, &self.config.api_profile);

        let result = summarize_conversation(SummarizeRequest {
            messages: &messages,
            transport: self
                .condensing_transport
                .as_deref()
                .unwrap_or(self.transport.as_ref()),
            system_prompt: &system_prompt,
            task_id: self.id.as_str(),
            prev_context_tokens,
            custom_prompt: config.custom_prompt.as_deref(),
            messages_to_keep: config.messages_to_keep,
        })
        .await;

        match result {
            Ok(outcome) => {
                self.store.overwrite_api(outcome.messages).await;
                self.store.mark_history_rewritten();
                self.announce_condense(ContextCondense {
                    prev_context_tokens,
                    new_context_tokens: outcome.new_context_tokens,
                    cost: outcome.cost,
                    summary: outcome.summary,
                })
                .await
            }
            Err(e) => {
                log::warn!("Manual condense failed task_id={} error={e}", self.id);
                self.say(SayKind::CondenseContextError, e.to_string())
                    .await?;
                Ok(())
            }
        }
    }
}

/// Build the start of the resumed user turn so that every tool use in the
/// last assistant turn has a result.
///
/// A trailing user turn is removed from `api` and its content carried over.
fn close_interrupted_turn(api: &mut Vec<ApiMessage>) -> Vec<ContentBlock> {
    let trailing_user = api.last().is_some_and(|m| m.role == Role::User);
    if !trailing_user {
        return api
            .last()
            .map(|last| interrupted_tool_results(last.tool_use_ids()))
            .unwrap_or_default();
    }

    let Some(user) = api.pop() else {
        return Vec::new();
    };
    let missing = api
        .last()
        .filter(|m| m.role == Role::Assistant)
        .map(|assistant| {
            let answered: Vec<&str> = user.tool_result_ids().collect();
            interrupted_tool_results(
                assistant
                    .tool_use_ids()
                    .filter(|id| !answered.contains(id)),
            )
        })
        .unwrap_or_default();

    let mut content = user.content;
    content.extend(missing);
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_use(id: &str) -> ContentBlock {
        ContentBlock::ToolUse {
            id: id.to_string(),
            name: "read_file".to_string(),
            input: json!({ "path": "a.rs" }),
        }
    }

    #[test]
    fn trailing_assistant_tool_uses_get_results() {
        let mut api = vec![
            ApiMessage::user("go", 1),
            ApiMessage::new(Role::Assistant, vec![tool_use("t1")], 2),
        ];
        let content = close_interrupted_turn(&mut api);

        assert_eq!(api.len(), 2);
        assert_eq!(content.len(), 1);
        assert!(matches!(
            &content[0],
            ContentBlock::ToolResult { tool_use_id, .. } if tool_use_id == "t1"
        ));
    }

    #[test]
    fn trailing_user_turn_is_merged_with_missing_results() {
        let mut api = vec![
            ApiMessage::user("go", 1),
            ApiMessage::new(Role::Assistant, vec![tool_use("t1"), tool_use("t2")], 2),
            ApiMessage::new(
                Role::User,
                vec![ContentBlock::tool_result("t1", "done", false)],
                3,
            ),
        ];
        let content = close_interrupted_turn(&mut api);

        assert_eq!(api.len(), 2);
        let ids: Vec<&str> = content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["t1", "t2"]);
    }

    #[test]
    fn plain_assistant_turn_needs_nothing() {
        let mut api = vec![ApiMessage::user("go", 1), ApiMessage::assistant("hi", 2)];
        assert!(close_interrupted_turn(&mut api).is_empty());
    }
}
