//! The ask/say protocol.
//!
//! `say` records informational entries; `ask` records a question and, unless
//! the ask is partial, waits for [`Task::handle_response`]. Both merge
//! streamed partial entries into one log entry.

use crate::conversation::Coalesced;
use crate::events::TaskEvent;
use crate::messages::{
    ApiRequestInfo, AskKind, AskReply, ContextCondense, ProgressStatus, SayKind, UiMessage,
};
use crate::types::TaskError;

use super::Task;
use super::helpers::lock;

/// Optional parts of a `say`.
#[derive(Clone, Debug, Default)]
pub struct SayOptions {
    pub images: Vec<String>,
    pub partial: Option<bool>,
    pub progress_status: Option<ProgressStatus>,
    /// Leave the last-message watermark alone so a pending ask is not
    /// superseded.
    pub non_interactive: bool,
    pub api_request: Option<ApiRequestInfo>,
    pub context_condense: Option<ContextCondense>,
}

impl SayOptions {
    #[must_use]
    pub fn partial(partial: bool) -> Self {
        Self {
            partial: Some(partial),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    #[must_use]
    pub const fn non_interactive(mut self) -> Self {
        self.non_interactive = true;
        self
    }
}

impl Task {
    /// Ask a question and wait for the answer.
    ///
    /// A partial ask (`partial == Some(true)`) only records the entry and
    /// returns [`TaskError::AskIgnored`]; the caller is expected to ask again
    /// with the next chunk. A complete ask waits until a response arrives or
    /// a newer message supersedes it (also [`TaskError::AskIgnored`]).
    ///
    /// Fails with [`TaskError::Aborted`] without waiting once the task is
    /// aborted.
    pub async fn ask(
        &self,
        kind: AskKind,
        text: Option<String>,
        partial: Option<bool>,
    ) -> Result<AskReply, TaskError> {
        if self.is_aborted() {
            return Err(TaskError::Aborted);
        }

        let message = UiMessage::ask(kind).with_text(text).with_partial(partial);

        if partial == Some(true) {
            if let Coalesced::Appended(ts) = self.store.coalesce(message).await {
                self.set_watermark(ts);
            }
            return Err(TaskError::AskIgnored);
        }

        lock(&self.ask_state).response = None;
        let ask_ts = self.store.coalesce(message).await.ts();
        self.set_watermark(ask_ts);

        let blocking = kind.is_blocking();
        if blocking {
            lock(&self.ask_state).blocking_ask = Some(kind);
            self.events.emit(TaskEvent::idle(self.id.clone(), kind)).await;
        }

        let outcome = self.wait_for_reply(ask_ts).await;

        if blocking {
            lock(&self.ask_state).blocking_ask = None;
            if !self.is_aborted() {
                self.events.emit(TaskEvent::active(self.id.clone())).await;
            }
        }

        outcome
    }

    /// Deliver the answer to the pending ask.
    pub fn handle_response(&self, reply: AskReply) {
        lock(&self.ask_state).response = Some(reply);
        self.ask_signal.notify_waiters();
    }

    /// Record a complete informational entry.
    pub async fn say(&self, kind: SayKind, text: impl Into<String>) -> Result<i64, TaskError> {
        self.say_with(kind, Some(text.into()), SayOptions::default())
            .await
    }

    /// Record an informational entry, merging partial updates. Returns the
    /// entry's ts.
    pub async fn say_with(
        &self,
        kind: SayKind,
        text: Option<String>,
        options: SayOptions,
    ) -> Result<i64, TaskError> {
        if self.is_aborted() {
            return Err(TaskError::Aborted);
        }

        let SayOptions {
            images,
            partial,
            progress_status,
            non_interactive,
            api_request,
            context_condense,
        } = options;

        let message = UiMessage {
            progress_status,
            api_request,
            context_condense,
            ..UiMessage::say(kind)
                .with_text(text)
                .with_images(images)
                .with_partial(partial)
        };

        let outcome = self.store.coalesce(message).await;
        match outcome {
            Coalesced::Updated(_) => {}
            Coalesced::Finalized(ts) | Coalesced::Appended(ts) => {
                if !non_interactive {
                    self.set_watermark(ts);
                }
            }
        }
        Ok(outcome.ts())
    }

    fn set_watermark(&self, ts: i64) {
        lock(&self.ask_state).last_message_ts = ts;
        self.ask_signal.notify_waiters();
    }

    async fn wait_for_reply(&self, ask_ts: i64) -> Result<AskReply, TaskError> {
        loop {
            let notified = self.ask_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = lock(&self.ask_state);
                if state.last_message_ts != ask_ts {
                    log::debug!(
                        "Ask superseded by a newer message task_id={} ask_ts={ask_ts}",
                        self.id
                    );
                    return Err(TaskError::AskIgnored);
                }
                if let Some(reply) = state.response.take() {
                    return Ok(reply);
                }
            }

            if self.is_aborted() {
                return Err(TaskError::Aborted);
            }

            let _ = tokio::time::timeout(self.config.ask_poll_interval, notified).await;
        }
    }
}
