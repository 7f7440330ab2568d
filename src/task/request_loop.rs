//! The request loop.
//!
//! Each round appends the user turn, manages the context window, passes the
//! approval and rate gates, streams the model response while presenting it,
//! and records the assistant turn. The tool results gathered during
//! presentation become the next round's user turn.

use crate::approval::ApprovalDecision;
use crate::context::{CondenseConfig, ContextRequest, manage_context};
use crate::events::TaskEvent;
use crate::llm::{
    ApiChunk, ApiMessage, ApiRequest, ApiStream, ContentBlock, RequestMetadata, Role, UsageChunk,
};
use crate::messages::{
    ApiRequestInfo, AskKind, AskResponse, CancelReason, ContextCondense, SayKind,
};
use crate::rate_limit::retry_delay_seconds;
use crate::tools::ToolUseRequest;
use crate::types::{TaskError, TaskSettings};
use futures::StreamExt;
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::helpers::{
    EMPTY_RESPONSE_ERROR, EMPTY_RESPONSE_TURN, INTERRUPTED_BY_FEEDBACK, INTERRUPTED_BY_TOOL_USE,
    MISTAKE_LIMIT_PROMPT, NO_TOOLS_USED, lock, too_many_mistakes,
};
use super::interaction::SayOptions;
use super::presentation::StreamState;
use super::{LoopPhase, Task};

/// How a round ended.
#[derive(Debug)]
pub(super) enum RoundOutcome {
    /// Continue with this user content.
    Next(Vec<ContentBlock>),
    /// The model returned nothing; the loop ends.
    Ended,
}

/// Per-round facts fixed before the request is opened.
struct RoundRecord {
    suppress_previous_response_id: bool,
    api_req_ts: i64,
    mode: String,
    system_prompt: String,
}

enum StreamStep {
    Chunk(ApiChunk),
    Failed(anyhow::Error),
    Finished,
    Aborted,
}

impl Task {
    /// Run rounds until the loop ends or the task is aborted.
    ///
    /// Returns `true` when the loop ended on its own: an empty response, a
    /// declined limit, or an unexpected error. Returns `false` when the task
    /// was aborted.
    pub(super) async fn initiate_task_loop(&self, content: Vec<ContentBlock>) -> bool {
        let mut next = content;
        let mut include_file_details = true;

        loop {
            if self.is_aborted() {
                return false;
            }

            match self.run_round(next, include_file_details).await {
                Ok(RoundOutcome::Next(content)) => {
                    next = content;
                    include_file_details = false;
                }
                Ok(RoundOutcome::Ended) => {
                    self.set_phase(LoopPhase::Ending);
                    return true;
                }
                Err(TaskError::Aborted) => {
                    log::debug!("Task loop stopped by abort task_id={}", self.id);
                    return false;
                }
                Err(e) => {
                    log::error!("Task loop ended task_id={} error={e}", self.id);
                    self.set_phase(LoopPhase::Ending);
                    return true;
                }
            }
        }
    }

    async fn run_round(
        &self,
        user_content: Vec<ContentBlock>,
        include_file_details: bool,
    ) -> Result<RoundOutcome, TaskError> {
        self.set_phase(LoopPhase::BuildingRequest);
        let settings = self.modes.settings().await;
        let mut user_content = user_content;

        self.check_mistake_limit(&settings, &mut user_content)
            .await?;
        self.resume_if_paused().await?;

        let mode = self.modes.current_mode().await;
        self.store.set_mode(&mode).await;
        let api_req_ts = self
            .append_user_turn(user_content, include_file_details)
            .await?;

        if let Err(e) = self.hooks.save_checkpoint(&self.id).await {
            log::warn!("Checkpoint save failed task_id={} error={e:#}", self.id);
        }

        let system_prompt = self
            .environment
            .system_prompt(&mode)
            .await
            .map_err(|e| TaskError::Configuration(format!("failed to build system prompt: {e:#}")))?;
        self.manage_context_window(&settings, &system_prompt)
            .await?;

        let record = RoundRecord {
            suppress_previous_response_id: self.store.take_history_rewritten(),
            api_req_ts,
            mode,
            system_prompt,
        };

        self.check_auto_approval(&settings).await?;

        let (stream, first) = self.open_stream(&settings, &record).await?;
        self.set_phase(LoopPhase::Streaming);
        self.consume_stream(&record, stream, first).await
    }

    // ===================
    // Round preparation
    // ===================

    async fn check_mistake_limit(
        &self,
        settings: &TaskSettings,
        user_content: &mut Vec<ContentBlock>,
    ) -> Result<(), TaskError> {
        let limit = settings.consecutive_mistake_limit;
        if limit == 0 || self.consecutive_mistakes() < limit {
            return Ok(());
        }

        let reply = self
            .ask(
                AskKind::MistakeLimitReached,
                Some(MISTAKE_LIMIT_PROMPT.to_string()),
                None,
            )
            .await?;
        if reply.response == AskResponse::MessageResponse {
            let feedback = reply.text.unwrap_or_default();
            self.say_with(
                SayKind::UserFeedback,
                Some(feedback.clone()),
                SayOptions::default().with_images(reply.images.clone()),
            )
            .await?;
            user_content.push(ContentBlock::text(too_many_mistakes(&feedback)));
            user_content.extend(ContentBlock::images(&reply.images));
        }
        self.consecutive_mistakes.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn resume_if_paused(&self) -> Result<(), TaskError> {
        if !self.is_paused() {
            return Ok(());
        }

        match self.wait_for_resume().await {
            Ok(()) => {}
            Err(TaskError::PauseTimeout(after)) => {
                log::warn!(
                    "Sub-task wait timed out task_id={} after_secs={}",
                    self.id,
                    after.as_secs()
                );
                self.say(
                    SayKind::Error,
                    format!(
                        "Sub-task did not finish within {} seconds. Resuming without its result.",
                        after.as_secs()
                    ),
                )
                .await?;
                let child = lock(&self.child).take();
                if let Some(child) = child {
                    child.abort_task(true).await;
                }
                self.unpause().await;
            }
            Err(e) => return Err(e),
        }

        self.restore_paused_mode().await;
        Ok(())
    }

    /// Resolve and record the user turn. Returns the ts of the
    /// `api_req_started` entry for this round.
    async fn append_user_turn(
        &self,
        user_content: Vec<ContentBlock>,
        include_file_details: bool,
    ) -> Result<i64, TaskError> {
        let mut content = user_content;
        content.append(&mut lock(&self.pending_user_content));

        let mut content = match self
            .environment
            .resolve_user_content(content.clone())
            .await
        {
            Ok(resolved) => resolved,
            Err(e) => {
                log::warn!("Failed to resolve user content task_id={} error={e:#}", self.id);
                content
            }
        };
        match self
            .environment
            .environment_details(include_file_details)
            .await
        {
            Ok(Some(details)) => content.push(ContentBlock::text(details)),
            Ok(None) => {}
            Err(e) => {
                log::warn!("Failed to collect environment details task_id={} error={e:#}", self.id);
            }
        }

        let message = ApiMessage::new(Role::User, content, 0);
        let preview = message.text();
        self.store.append_api(message).await;

        self.say_with(
            SayKind::ApiReqStarted,
            None,
            SayOptions {
                api_request: Some(ApiRequestInfo {
                    request: Some(preview),
                    ..ApiRequestInfo::default()
                }),
                ..SayOptions::default()
            },
        )
        .await
    }

    async fn manage_context_window(
        &self,
        settings: &TaskSettings,
        system_prompt: &str,
    ) -> Result<(), TaskError> {
        let model = self.transport.model_info();
        let config = CondenseConfig::from_settings(settings, &self.config.api_profile);
        let messages = self.store.api_messages().await;
        let context_tokens = self.store.token_usage().await.context_tokens;

        let outcome = manage_context(ContextRequest {
            messages,
            context_tokens,
            model: &model,
            config: &config,
            transport: self.transport.as_ref(),
            condensing_transport: self.condensing_transport.as_deref(),
            system_prompt,
            task_id: self.id.as_str(),
        })
        .await;

        let rewritten = outcome.rewritten();
        if let Some(error) = outcome.error {
            self.say(SayKind::CondenseContextError, error).await?;
        }
        if rewritten {
            if outcome.truncated {
                log::info!(
                    "Truncated conversation task_id={} prev_tokens={}",
                    self.id,
                    outcome.prev_context_tokens
                );
            }
            self.store.overwrite_api(outcome.messages).await;
            self.store.mark_history_rewritten();
        }
        if let Some(condense) = outcome.condense {
            self.announce_condense(condense).await?;
        }
        Ok(())
    }

    pub(super) async fn announce_condense(&self, condense: ContextCondense) -> Result<(), TaskError> {
        let (prev, new) = (condense.prev_context_tokens, condense.new_context_tokens);
        log::info!(
            "Condensed context task_id={} prev_tokens={prev} new_tokens={new}",
            self.id
        );
        self.say_with(
            SayKind::CondenseContext,
            None,
            SayOptions {
                context_condense: Some(condense),
                ..SayOptions::default()
            }
            .non_interactive(),
        )
        .await?;
        self.events
            .emit(TaskEvent::context_condensed(self.id.clone(), prev, new))
            .await;
        Ok(())
    }

    async fn check_auto_approval(&self, settings: &TaskSettings) -> Result<(), TaskError> {
        let messages = self.store.ui_messages().await;
        let decision = lock(&self.approval).check(settings, &messages);
        let ApprovalDecision::Exceeded(limit) = decision else {
            return Ok(());
        };

        log::info!("Auto-approval limit reached task_id={} limit={limit:?}", self.id);
        let reply = self
            .ask(AskKind::AutoApprovalMaxReqReached, Some(limit.ask_text()), None)
            .await?;
        if !reply.is_yes() {
            return Err(TaskError::UserDeclined(
                "auto-approval limit reached".to_string(),
            ));
        }

        let len = self.store.ui_messages().await.len();
        lock(&self.approval).reset(len);
        Ok(())
    }

    // ===================
    // Opening the stream
    // ===================

    fn build_request(&self, record: &RoundRecord, messages: Vec<ApiMessage>) -> ApiRequest {
        ApiRequest {
            system_prompt: record.system_prompt.clone(),
            messages,
            metadata: RequestMetadata {
                task_id: self.id.to_string(),
                mode: record.mode.clone(),
                suppress_previous_response_id: record.suppress_previous_response_id,
            },
        }
    }

    /// Open the stream and pull its first item, retrying failures that
    /// happen before any chunk arrives.
    async fn open_stream(
        &self,
        settings: &TaskSettings,
        record: &RoundRecord,
    ) -> Result<(ApiStream<'_>, Option<ApiChunk>), TaskError> {
        let mut attempt: u32 = 0;

        loop {
            if attempt == 0 {
                let delay = self
                    .rate_limiter
                    .delay_owed_seconds(settings.rate_limit_seconds);
                if delay > 0 {
                    self.countdown(
                        delay,
                        |remaining| format!("Rate limiting for {remaining} seconds..."),
                        "Rate limit delay elapsed.".to_string(),
                    )
                    .await?;
                }
            }

            self.rate_limiter.mark_request();
            let messages = self.store.api_messages().await;
            let mut stream = self
                .transport
                .create_message(self.build_request(record, messages));

            let first = tokio::select! {
                biased;
                () = self.aborted_signal() => return Err(TaskError::Aborted),
                item = stream.next() => item,
            };
            let error = match first {
                Some(Ok(chunk)) => return Ok((stream, Some(chunk))),
                None => return Ok((stream, None)),
                Some(Err(e)) => e,
            };

            let message = format!("{error:#}");
            log::warn!(
                "API request failed task_id={} attempt={attempt} error={message}",
                self.id
            );

            if settings.auto_retry() {
                let rate_limit_delay = self
                    .rate_limiter
                    .delay_owed_seconds(settings.rate_limit_seconds);
                let delay = retry_delay_seconds(
                    &error,
                    settings.request_delay_seconds,
                    attempt,
                    self.config.backoff_cap_seconds,
                    rate_limit_delay,
                );
                self.countdown(
                    delay,
                    |remaining| format!("{message}\n\nRetrying in {remaining} seconds..."),
                    format!("{message}\n\nRetrying now..."),
                )
                .await?;
                attempt = attempt.saturating_add(1);
                continue;
            }

            let reply = self
                .ask(AskKind::ApiReqFailed, Some(message.clone()), None)
                .await?;
            if !reply.is_yes() {
                return Err(TaskError::UserDeclined(message));
            }
            self.say_with(SayKind::ApiReqRetried, None, SayOptions::default())
                .await?;
            attempt = 0;
        }
    }

    /// Count down one second at a time in a single partial entry.
    async fn countdown(
        &self,
        seconds: u64,
        text: impl Fn(u64) -> String,
        done: String,
    ) -> Result<(), TaskError> {
        for remaining in (1..=seconds).rev() {
            self.say_with(
                SayKind::ApiReqRetryDelayed,
                Some(text(remaining)),
                SayOptions::partial(true),
            )
            .await?;
            tokio::select! {
                biased;
                () = self.aborted_signal() => return Err(TaskError::Aborted),
                () = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
        self.say_with(
            SayKind::ApiReqRetryDelayed,
            Some(done),
            SayOptions::partial(false),
        )
        .await?;
        Ok(())
    }

    /// Resolves once the abort flag is set.
    async fn aborted_signal(&self) {
        let mut rx = self.abort.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // ===================
    // Consuming the stream
    // ===================

    async fn consume_stream(
        &self,
        record: &RoundRecord,
        mut stream: ApiStream<'_>,
        first: Option<ApiChunk>,
    ) -> Result<RoundOutcome, TaskError> {
        let mut state = StreamState::default();
        let mut pending = first;
        let mut aborted = false;
        let mut failure = None;

        let abort = self.aborted_signal();
        tokio::pin!(abort);

        loop {
            let step = match pending.take() {
                Some(chunk) => StreamStep::Chunk(chunk),
                None => tokio::select! {
                    biased;
                    () = &mut abort => StreamStep::Aborted,
                    item = stream.next() => match item {
                        Some(Ok(chunk)) => StreamStep::Chunk(chunk),
                        Some(Err(e)) => StreamStep::Failed(e),
                        None => StreamStep::Finished,
                    },
                },
            };

            match step {
                // Usage arrives last; it is recorded even after a tool ran.
                StreamStep::Chunk(ApiChunk::Usage(usage)) => state.add_usage(&usage),
                StreamStep::Chunk(_) if state.did_reject_tool => {
                    state.assistant_text.push_str(INTERRUPTED_BY_FEEDBACK);
                    break;
                }
                StreamStep::Chunk(_) if state.did_already_use_tool => {
                    state.assistant_text.push_str(INTERRUPTED_BY_TOOL_USE);
                    break;
                }
                StreamStep::Chunk(chunk) => match self.handle_chunk(&mut state, chunk).await {
                    Ok(()) => {}
                    Err(TaskError::Aborted) => {
                        aborted = true;
                        break;
                    }
                    Err(e) => return Err(e),
                },
                StreamStep::Failed(e) => {
                    failure = Some(e);
                    break;
                }
                StreamStep::Finished => break,
                StreamStep::Aborted => {
                    aborted = true;
                    break;
                }
            }
        }
        drop(stream);

        if aborted || self.is_aborted() {
            if !self.is_abandoned() {
                self.abort_stream(record, &state, CancelReason::UserCancelled, None)
                    .await;
            }
            return Err(TaskError::Aborted);
        }

        if let Some(error) = failure {
            let message = format!("{error:#}");
            log::warn!("Stream failed mid-response task_id={} error={message}", self.id);
            if !self.is_abandoned() {
                self.abort_task(false).await;
                self.abort_stream(
                    record,
                    &state,
                    CancelReason::StreamingFailed,
                    Some(message),
                )
                .await;
                if let Err(e) = self.hooks.restart_from_history(&self.id).await {
                    log::warn!("Failed to restart task from history task_id={} error={e:#}", self.id);
                }
            }
            return Err(TaskError::Aborted);
        }

        self.finish_round(record, state).await
    }

    async fn handle_chunk(&self, state: &mut StreamState, chunk: ApiChunk) -> Result<(), TaskError> {
        match chunk {
            ApiChunk::Reasoning(text) => {
                state.reasoning.push_str(&text);
                self.say_with(
                    SayKind::Reasoning,
                    Some(state.reasoning.clone()),
                    SayOptions::partial(true),
                )
                .await?;
            }
            ApiChunk::Usage(usage) => state.add_usage(&usage),
            ApiChunk::Text(text) => {
                self.finish_reasoning(state).await?;
                state.assistant_text.push_str(&text);
                self.present_streamed(state).await?;
            }
            ApiChunk::ToolCall { id, name, input } => {
                self.finish_reasoning(state).await?;
                state.native_calls.push(ToolUseRequest {
                    id: Some(id),
                    name,
                    input,
                    partial: false,
                });
                self.present_streamed(state).await?;
            }
        }
        Ok(())
    }

    async fn present_streamed(&self, state: &mut StreamState) -> Result<(), TaskError> {
        state.reparse(&self.config.tool_names);
        self.set_phase(LoopPhase::Presenting);
        let result = self.present(state).await;
        self.set_phase(LoopPhase::Streaming);
        result
    }

    async fn finish_reasoning(&self, state: &mut StreamState) -> Result<(), TaskError> {
        if state.reasoning.is_empty() || state.reasoning_done {
            return Ok(());
        }
        state.reasoning_done = true;
        self.say_with(
            SayKind::Reasoning,
            Some(state.reasoning.clone()),
            SayOptions::partial(false),
        )
        .await?;
        Ok(())
    }

    async fn finish_round(
        &self,
        record: &RoundRecord,
        mut state: StreamState,
    ) -> Result<RoundOutcome, TaskError> {
        self.finish_reasoning(&mut state).await?;
        state.finalize_blocks();
        self.set_phase(LoopPhase::Presenting);
        self.present(&mut state).await?;
        state.close_unanswered_native_calls();
        self.update_request_info(record.api_req_ts, &state.usage, None, None)
            .await;

        if state.assistant_text.is_empty() && state.native_calls.is_empty() {
            log::warn!("Model returned an empty response task_id={}", self.id);
            self.say(SayKind::Error, EMPTY_RESPONSE_ERROR).await?;
            self.store
                .append_api(ApiMessage::assistant(EMPTY_RESPONSE_TURN, 0))
                .await;
            return Ok(RoundOutcome::Ended);
        }

        self.store
            .append_api(ApiMessage::new(
                Role::Assistant,
                state.assistant_content(),
                0,
            ))
            .await;

        let used_tool = state.did_use_tool();
        let mut next = state.tool_results;
        if !used_tool {
            next.push(ContentBlock::text(NO_TOOLS_USED));
            let mistakes = self.consecutive_mistakes.fetch_add(1, Ordering::SeqCst) + 1;
            log::debug!("No tool used task_id={} consecutive_mistakes={mistakes}", self.id);
        }
        Ok(RoundOutcome::Next(next))
    }

    // ===================
    // Interrupted streams
    // ===================

    /// Record an interrupted response: close the trailing partial entry,
    /// stamp the request with its cancel reason and save the partial
    /// assistant turn with an annotation.
    ///
    /// Only called once the abort flag is set, so [`Task::dispose`] has
    /// already reverted pending edits.
    async fn abort_stream(
        &self,
        record: &RoundRecord,
        state: &StreamState,
        reason: CancelReason,
        failure: Option<String>,
    ) {
        self.store.finalize_trailing_partial().await;
        self.update_request_info(record.api_req_ts, &state.usage, Some(reason), failure)
            .await;

        let text = format!("{}\n\n{}", state.assistant_text, reason.annotation());
        self.store.append_api(ApiMessage::assistant(text, 0)).await;
        log::info!(
            "Recorded interrupted response task_id={} reason={reason:?}",
            self.id
        );
    }

    async fn update_request_info(
        &self,
        api_req_ts: i64,
        usage: &UsageChunk,
        cancel_reason: Option<CancelReason>,
        failure: Option<String>,
    ) {
        let cost = usage
            .total_cost
            .unwrap_or_else(|| self.transport.model_info().calculate_cost(usage));
        self.store
            .update_ui(api_req_ts, |message| {
                let info = message.api_request.get_or_insert_with(ApiRequestInfo::default);
                info.tokens_in = usage.input_tokens;
                info.tokens_out = usage.output_tokens;
                info.cache_writes = usage.cache_write_tokens.unwrap_or(0);
                info.cache_reads = usage.cache_read_tokens.unwrap_or(0);
                info.cost = Some(cost);
                info.cancel_reason = cancel_reason;
                info.streaming_failed_message = failure;
            })
            .await;
    }
}
