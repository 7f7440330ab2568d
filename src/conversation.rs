//! Owner of a task's two message logs.
//!
//! All mutation of the API history and the UI history goes through
//! [`ConversationStore`]. Each operation updates the in-memory log and then
//! persists it while still holding the log lock, so writes for one task reach
//! the backing store in call order. Persistence and telemetry failures are
//! logged and swallowed.

use crate::events::{EventSink, MessageAction, TaskEvent};
use crate::hooks::TaskHooks;
use crate::llm::ApiMessage;
use crate::messages::{AskKind, UiMessage, api_metrics};
use crate::stores::TaskPersistence;
use crate::types::{HistoryItem, TaskId, TokenUsage, ToolUsage};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use time::OffsetDateTime;
use tokio::sync::Mutex;

/// What [`ConversationStore::coalesce`] did with a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Coalesced {
    /// A trailing partial entry was updated in place (not persisted).
    Updated(i64),
    /// A trailing partial entry was completed in place.
    Finalized(i64),
    /// A new entry was appended.
    Appended(i64),
}

impl Coalesced {
    pub(crate) const fn ts(self) -> i64 {
        match self {
            Self::Updated(ts) | Self::Finalized(ts) | Self::Appended(ts) => ts,
        }
    }
}

/// Lineage recorded in the persisted history item.
#[derive(Clone, Debug, Default)]
pub(crate) struct Lineage {
    pub(crate) parent_task_id: Option<TaskId>,
    pub(crate) root_task_id: Option<TaskId>,
}

struct Logs {
    api: Vec<ApiMessage>,
    ui: Vec<UiMessage>,
    tool_usage: ToolUsage,
    mode: String,
}

pub(crate) struct ConversationStore {
    task_id: TaskId,
    lineage: Lineage,
    logs: Mutex<Logs>,
    persistence: Arc<dyn TaskPersistence>,
    hooks: Arc<dyn TaskHooks>,
    events: EventSink,
    last_ts: AtomicI64,
    history_rewritten: AtomicBool,
}

pub(crate) fn unix_millis() -> i64 {
    i64::try_from(OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000).unwrap_or(i64::MAX)
}

impl ConversationStore {
    pub(crate) fn new(
        task_id: TaskId,
        lineage: Lineage,
        mode: String,
        persistence: Arc<dyn TaskPersistence>,
        hooks: Arc<dyn TaskHooks>,
        events: EventSink,
    ) -> Self {
        Self {
            task_id,
            lineage,
            logs: Mutex::new(Logs {
                api: Vec::new(),
                ui: Vec::new(),
                tool_usage: ToolUsage::default(),
                mode,
            }),
            persistence,
            hooks,
            events,
            last_ts: AtomicI64::new(0),
            history_rewritten: AtomicBool::new(false),
        }
    }

    /// Wall-clock milliseconds, strictly greater than any ts handed out before.
    pub(crate) fn next_ts(&self) -> i64 {
        let now = unix_millis();
        let prev = self
            .last_ts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .unwrap_or(now);
        now.max(prev + 1)
    }

    fn observe_ts(&self, ts: i64) {
        self.last_ts.fetch_max(ts, Ordering::SeqCst);
    }

    /// Replace both in-memory logs with what the backing store holds.
    pub(crate) async fn load(&self) -> anyhow::Result<()> {
        let api = self.persistence.load_api_messages(&self.task_id).await?;
        let ui = self.persistence.load_ui_messages(&self.task_id).await?;
        if let Some(max) = api.iter().map(|m| m.ts).chain(ui.iter().map(|m| m.ts)).max() {
            self.observe_ts(max);
        }
        let mut logs = self.logs.lock().await;
        logs.api = api;
        logs.ui = ui;
        Ok(())
    }

    pub(crate) async fn api_messages(&self) -> Vec<ApiMessage> {
        self.logs.lock().await.api.clone()
    }

    pub(crate) async fn ui_messages(&self) -> Vec<UiMessage> {
        self.logs.lock().await.ui.clone()
    }

    pub(crate) async fn last_ui_message(&self) -> Option<UiMessage> {
        self.logs.lock().await.ui.last().cloned()
    }

    pub(crate) async fn token_usage(&self) -> TokenUsage {
        api_metrics(&self.logs.lock().await.ui)
    }

    pub(crate) async fn tool_usage(&self) -> ToolUsage {
        self.logs.lock().await.tool_usage.clone()
    }

    pub(crate) async fn set_mode(&self, mode: &str) {
        self.logs.lock().await.mode = mode.to_string();
    }

    // ===================
    // API history
    // ===================

    pub(crate) async fn append_api(&self, mut message: ApiMessage) {
        if message.ts == 0 {
            message.ts = self.next_ts();
        } else {
            self.observe_ts(message.ts);
        }
        let mut logs = self.logs.lock().await;
        logs.api.push(message);
        self.persist_api(&logs.api).await;
    }

    pub(crate) async fn overwrite_api(&self, messages: Vec<ApiMessage>) {
        let mut logs = self.logs.lock().await;
        logs.api = messages;
        self.persist_api(&logs.api).await;
    }

    /// Record that the API history was rewritten; the next request must not
    /// link to a previous provider response.
    pub(crate) fn mark_history_rewritten(&self) {
        self.history_rewritten.store(true, Ordering::SeqCst);
    }

    /// Consume the rewritten flag. Returns `true` at most once per rewrite.
    pub(crate) fn take_history_rewritten(&self) -> bool {
        self.history_rewritten.swap(false, Ordering::SeqCst)
    }

    // ===================
    // UI history
    // ===================

    /// Append a complete or partial entry, assigning its ts if unset.
    pub(crate) async fn append_ui(&self, mut message: UiMessage) -> i64 {
        if message.ts == 0 {
            message.ts = self.next_ts();
        } else {
            self.observe_ts(message.ts);
        }
        let ts = message.ts;
        let usage = {
            let mut logs = self.logs.lock().await;
            logs.ui.push(message.clone());
            self.persist_ui(&logs).await;
            (api_metrics(&logs.ui), logs.tool_usage.clone())
        };
        self.announce(MessageAction::Created, message, Some(usage)).await;
        ts
    }

    pub(crate) async fn overwrite_ui(&self, messages: Vec<UiMessage>) {
        let mut logs = self.logs.lock().await;
        logs.ui = messages;
        self.persist_ui(&logs).await;
    }

    /// Merge a message into the log following the partial-streaming rules.
    ///
    /// - `partial == Some(true)` updates a trailing partial entry of the same
    ///   kind in place, or appends a new partial entry.
    /// - `partial == Some(false)` completes a trailing partial entry of the
    ///   same kind in place (keeping its ts), or appends a complete entry.
    /// - `partial == None` always appends.
    pub(crate) async fn coalesce(&self, message: UiMessage) -> Coalesced {
        let mut logs = self.logs.lock().await;
        let trailing = logs
            .ui
            .len()
            .checked_sub(1)
            .filter(|&i| logs.ui[i].is_partial() && logs.ui[i].kind == message.kind);

        match (message.partial, trailing) {
            (Some(true), Some(index)) => {
                let last = &mut logs.ui[index];
                merge_content(last, message);
                let updated = last.clone();
                drop(logs);
                let ts = updated.ts;
                self.announce(MessageAction::Updated, updated, None).await;
                Coalesced::Updated(ts)
            }
            (Some(false), Some(index)) => {
                let last = &mut logs.ui[index];
                merge_content(last, message);
                last.partial = Some(false);
                let finalized = last.clone();
                self.persist_ui(&logs).await;
                let usage = (api_metrics(&logs.ui), logs.tool_usage.clone());
                drop(logs);
                let ts = finalized.ts;
                self.announce(MessageAction::Updated, finalized, Some(usage))
                    .await;
                Coalesced::Finalized(ts)
            }
            (partial, _) => {
                drop(logs);
                let message = UiMessage {
                    partial: partial.filter(|p| *p),
                    ..message
                };
                Coalesced::Appended(self.append_ui(message).await)
            }
        }
    }

    /// Mutate the entry with the given ts, then persist and notify.
    pub(crate) async fn update_ui<F>(&self, ts: i64, update: F) -> bool
    where
        F: FnOnce(&mut UiMessage),
    {
        let mut logs = self.logs.lock().await;
        let Some(message) = logs.ui.iter_mut().rev().find(|m| m.ts == ts) else {
            return false;
        };
        update(message);
        let updated = message.clone();
        self.persist_ui(&logs).await;
        let usage = (api_metrics(&logs.ui), logs.tool_usage.clone());
        drop(logs);
        self.announce(MessageAction::Updated, updated, Some(usage))
            .await;
        true
    }

    /// Mark a trailing partial entry complete. Used when a stream is cut off.
    pub(crate) async fn finalize_trailing_partial(&self) {
        let mut logs = self.logs.lock().await;
        if let Some(last) = logs.ui.last_mut().filter(|m| m.is_partial()) {
            last.partial = Some(false);
            self.persist_ui(&logs).await;
        }
    }

    /// Persist both logs as they stand.
    pub(crate) async fn persist_all(&self) {
        let logs = self.logs.lock().await;
        self.persist_api(&logs.api).await;
        self.persist_ui(&logs).await;
    }

    // ===================
    // Tool usage
    // ===================

    pub(crate) async fn record_tool_usage(&self, tool: &str) {
        let snapshot = {
            let mut logs = self.logs.lock().await;
            logs.tool_usage.record_attempt(tool);
            (api_metrics(&logs.ui), logs.tool_usage.clone())
        };
        self.emit_usage(snapshot).await;
    }

    pub(crate) async fn record_tool_error(&self, tool: &str, error: &str) {
        let snapshot = {
            let mut logs = self.logs.lock().await;
            logs.tool_usage.record_failure(tool);
            (api_metrics(&logs.ui), logs.tool_usage.clone())
        };
        self.events
            .emit(TaskEvent::tool_failed(self.task_id.clone(), tool, error))
            .await;
        self.emit_usage(snapshot).await;
    }

    // ===================
    // Internals
    // ===================

    async fn persist_api(&self, messages: &[ApiMessage]) {
        if let Err(e) = self
            .persistence
            .save_api_messages(&self.task_id, messages)
            .await
        {
            log::warn!("Failed to save API history task_id={} error={e:#}", self.task_id);
        }
    }

    async fn persist_ui(&self, logs: &Logs) {
        if let Err(e) = self
            .persistence
            .save_ui_messages(&self.task_id, &logs.ui)
            .await
        {
            log::warn!("Failed to save UI history task_id={} error={e:#}", self.task_id);
            return;
        }
        let Some(item) = self.history_item(logs) else {
            return;
        };
        if let Err(e) = self.persistence.save_history_item(&item).await {
            log::warn!("Failed to save history item task_id={} error={e:#}", self.task_id);
        }
    }

    fn history_item(&self, logs: &Logs) -> Option<HistoryItem> {
        let first = logs.ui.first()?;
        let ts = logs
            .ui
            .iter()
            .rev()
            .find(|m| !m.is_ask(AskKind::ResumeTask) && !m.is_ask(AskKind::ResumeCompletedTask))
            .map_or(first.ts, |m| m.ts);
        let usage = api_metrics(&logs.ui);

        Some(HistoryItem {
            id: self.task_id.clone(),
            parent_task_id: self.lineage.parent_task_id.clone(),
            root_task_id: self.lineage.root_task_id.clone(),
            ts,
            task: first.text.clone().unwrap_or_default(),
            tokens_in: usage.total_tokens_in,
            tokens_out: usage.total_tokens_out,
            cache_writes: usage.total_cache_writes,
            cache_reads: usage.total_cache_reads,
            total_cost: usage.total_cost,
            mode: logs.mode.clone(),
        })
    }

    async fn announce(
        &self,
        action: MessageAction,
        message: UiMessage,
        usage: Option<(TokenUsage, ToolUsage)>,
    ) {
        if !message.is_partial() {
            if let Err(e) = self.hooks.capture_message(&self.task_id, &message).await {
                log::warn!("Telemetry capture failed task_id={} error={e:#}", self.task_id);
            }
        }
        self.events
            .emit(TaskEvent::message(self.task_id.clone(), action, message))
            .await;
        if let Some(usage) = usage {
            self.emit_usage(usage).await;
        }
    }

    async fn emit_usage(&self, (token_usage, tool_usage): (TokenUsage, ToolUsage)) {
        self.events
            .emit(TaskEvent::usage_updated(
                self.task_id.clone(),
                token_usage,
                tool_usage,
            ))
            .await;
    }
}

fn merge_content(target: &mut UiMessage, source: UiMessage) {
    target.text = source.text;
    target.images = source.images;
    target.progress_status = source.progress_status;
    if source.api_request.is_some() {
        target.api_request = source.api_request;
    }
    if source.context_condense.is_some() {
        target.context_condense = source.context_condense;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::DefaultHooks;
    use crate::messages::SayKind;
    use crate::stores::InMemoryTaskStore;
    use anyhow::{Result, bail};
    use async_trait::async_trait;

    fn store_with(persistence: Arc<dyn TaskPersistence>) -> ConversationStore {
        ConversationStore::new(
            TaskId::from_string("task-1"),
            Lineage::default(),
            "code".to_string(),
            persistence,
            Arc::new(DefaultHooks),
            EventSink::new(Arc::new(DefaultHooks), None),
        )
    }

    fn text(kind: SayKind, text: &str, partial: Option<bool>) -> UiMessage {
        UiMessage::say(kind)
            .with_text(Some(text.to_string()))
            .with_partial(partial)
    }

    #[tokio::test]
    async fn partial_burst_collapses_into_one_entry() -> Result<()> {
        let persistence = Arc::new(InMemoryTaskStore::new());
        let store = store_with(persistence.clone());

        let first = store.coalesce(text(SayKind::Text, "He", Some(true))).await;
        let second = store.coalesce(text(SayKind::Text, "Hello", Some(true))).await;
        let done = store.coalesce(text(SayKind::Text, "Hello!", Some(false))).await;

        assert!(matches!(first, Coalesced::Appended(_)));
        assert_eq!(second, Coalesced::Updated(first.ts()));
        assert_eq!(done, Coalesced::Finalized(first.ts()));

        let saved = persistence
            .load_ui_messages(&TaskId::from_string("task-1"))
            .await?;
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].ts, first.ts());
        assert_eq!(saved[0].text.as_deref(), Some("Hello!"));
        assert_eq!(saved[0].partial, Some(false));
        Ok(())
    }

    #[tokio::test]
    async fn partial_of_other_kind_starts_new_entry() {
        let store = store_with(Arc::new(InMemoryTaskStore::new()));

        let reasoning = store
            .coalesce(text(SayKind::Reasoning, "thinking", Some(true)))
            .await;
        let answer = store.coalesce(text(SayKind::Text, "answer", Some(true))).await;

        assert!(matches!(answer, Coalesced::Appended(_)));
        assert_ne!(reasoning.ts(), answer.ts());
        assert_eq!(store.ui_messages().await.len(), 2);
    }

    #[tokio::test]
    async fn completion_without_partial_appends_atomic_entry() {
        let store = store_with(Arc::new(InMemoryTaskStore::new()));

        let outcome = store.coalesce(text(SayKind::Text, "done", Some(false))).await;
        assert!(matches!(outcome, Coalesced::Appended(_)));

        let last = store.last_ui_message().await.expect("entry");
        assert_eq!(last.partial, None);
    }

    #[tokio::test]
    async fn timestamps_are_strictly_increasing() {
        let store = store_with(Arc::new(InMemoryTaskStore::new()));
        let mut previous = 0;
        for _ in 0..50 {
            let ts = store.append_ui(text(SayKind::Text, "x", None)).await;
            assert!(ts > previous);
            previous = ts;
        }
    }

    #[tokio::test]
    async fn history_item_tracks_first_message_and_mode() -> Result<()> {
        let persistence = Arc::new(InMemoryTaskStore::new());
        let store = store_with(persistence.clone());
        store.set_mode("architect").await;

        store.append_ui(text(SayKind::Text, "list files", None)).await;
        store.append_ui(UiMessage::ask(AskKind::ResumeTask)).await;

        let item = persistence
            .load_history_item(&TaskId::from_string("task-1"))
            .await?
            .expect("history item");
        assert_eq!(item.task, "list files");
        assert_eq!(item.mode, "architect");
        assert_eq!(item.ts, store.ui_messages().await[0].ts);
        Ok(())
    }

    #[tokio::test]
    async fn rewritten_flag_is_consumed_once() {
        let store = store_with(Arc::new(InMemoryTaskStore::new()));
        assert!(!store.take_history_rewritten());
        store.mark_history_rewritten();
        assert!(store.take_history_rewritten());
        assert!(!store.take_history_rewritten());
    }

    struct FailingStore;

    #[async_trait]
    impl TaskPersistence for FailingStore {
        async fn save_api_messages(&self, _: &TaskId, _: &[ApiMessage]) -> Result<()> {
            bail!("disk full")
        }
        async fn load_api_messages(&self, _: &TaskId) -> Result<Vec<ApiMessage>> {
            bail!("disk full")
        }
        async fn save_ui_messages(&self, _: &TaskId, _: &[UiMessage]) -> Result<()> {
            bail!("disk full")
        }
        async fn load_ui_messages(&self, _: &TaskId) -> Result<Vec<UiMessage>> {
            bail!("disk full")
        }
        async fn save_history_item(&self, _: &HistoryItem) -> Result<()> {
            bail!("disk full")
        }
        async fn load_history_item(&self, _: &TaskId) -> Result<Option<HistoryItem>> {
            bail!("disk full")
        }
    }

    #[tokio::test]
    async fn persistence_failures_do_not_lose_in_memory_state() {
        let store = store_with(Arc::new(FailingStore));

        store.append_api(ApiMessage::user("hello", 0)).await;
        store.append_ui(text(SayKind::Text, "hello", None)).await;

        assert_eq!(store.api_messages().await.len(), 1);
        assert_eq!(store.ui_messages().await.len(), 1);
        assert!(store.load().await.is_err());
    }
}
