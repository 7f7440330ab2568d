//! Task events for external observers.
//!
//! The [`TaskEvent`] enum represents every lifecycle change a host may want
//! to react to: new or updated log entries, usage changes, idle/active
//! transitions while an ask is pending, pause/resume around sub-tasks and
//! abort. Events reach the host through [`crate::TaskHooks::on_event`] and,
//! optionally, an mpsc channel of [`TaskEventEnvelope`]s.

use crate::hooks::TaskHooks;
use crate::messages::{AskKind, UiMessage};
use crate::types::{TaskId, TokenUsage, ToolUsage};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageAction {
    Created,
    Updated,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// The request loop started or resumed.
    Started { task_id: TaskId },

    /// The task is driving requests again after waiting on a blocking ask.
    Active { task_id: TaskId },

    /// The task is suspended on a blocking ask.
    Idle { task_id: TaskId, ask: AskKind },

    /// A human-facing log entry was created or updated in place.
    Message {
        task_id: TaskId,
        action: MessageAction,
        message: UiMessage,
    },

    /// Token or tool counters changed.
    UsageUpdated {
        task_id: TaskId,
        token_usage: TokenUsage,
        tool_usage: ToolUsage,
    },

    /// A tool reported an error.
    ToolFailed {
        task_id: TaskId,
        tool: String,
        error: String,
    },

    /// History was condensed.
    ContextCondensed {
        task_id: TaskId,
        prev_context_tokens: u64,
        new_context_tokens: u64,
    },

    ModeSwitched { task_id: TaskId, mode: String },

    /// Paused while a sub-task runs.
    Paused { task_id: TaskId },

    Unpaused { task_id: TaskId },

    SpawnedSubtask { task_id: TaskId, child_id: TaskId },

    SubtaskCompleted { task_id: TaskId, child_id: TaskId },

    Aborted { task_id: TaskId, abandoned: bool },
}

impl TaskEvent {
    #[must_use]
    pub const fn started(task_id: TaskId) -> Self {
        Self::Started { task_id }
    }

    #[must_use]
    pub const fn active(task_id: TaskId) -> Self {
        Self::Active { task_id }
    }

    #[must_use]
    pub const fn idle(task_id: TaskId, ask: AskKind) -> Self {
        Self::Idle { task_id, ask }
    }

    #[must_use]
    pub const fn message(task_id: TaskId, action: MessageAction, message: UiMessage) -> Self {
        Self::Message {
            task_id,
            action,
            message,
        }
    }

    #[must_use]
    pub const fn usage_updated(
        task_id: TaskId,
        token_usage: TokenUsage,
        tool_usage: ToolUsage,
    ) -> Self {
        Self::UsageUpdated {
            task_id,
            token_usage,
            tool_usage,
        }
    }

    #[must_use]
    pub fn tool_failed(task_id: TaskId, tool: impl Into<String>, error: impl Into<String>) -> Self {
        Self::ToolFailed {
            task_id,
            tool: tool.into(),
            error: error.into(),
        }
    }

    #[must_use]
    pub const fn context_condensed(
        task_id: TaskId,
        prev_context_tokens: u64,
        new_context_tokens: u64,
    ) -> Self {
        Self::ContextCondensed {
            task_id,
            prev_context_tokens,
            new_context_tokens,
        }
    }

    #[must_use]
    pub fn mode_switched(task_id: TaskId, mode: impl Into<String>) -> Self {
        Self::ModeSwitched {
            task_id,
            mode: mode.into(),
        }
    }

    #[must_use]
    pub const fn aborted(task_id: TaskId, abandoned: bool) -> Self {
        Self::Aborted { task_id, abandoned }
    }
}

/// Monotonically increasing per-task counter for event ordering.
///
/// `Ordering::Relaxed` is sufficient because the mpsc channel provides the
/// happens-before ordering guarantee between sender and receiver.
#[derive(Clone, Debug)]
pub struct SequenceCounter(Arc<AtomicU64>);

impl SequenceCounter {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    #[must_use]
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Envelope wrapping every [`TaskEvent`] with delivery metadata.
///
/// The `event` field is flattened in JSON so that `event_id`, `sequence`,
/// `timestamp`, and the event's `type` discriminant all appear at the same level.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskEventEnvelope {
    pub event_id: uuid::Uuid,
    pub sequence: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(flatten)]
    pub event: TaskEvent,
}

impl TaskEventEnvelope {
    #[must_use]
    pub fn wrap(event: TaskEvent, seq: &SequenceCounter) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4(),
            sequence: seq.next(),
            timestamp: OffsetDateTime::now_utc(),
            event,
        }
    }
}

const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Fan-out point for task events: hooks first, then the optional channel.
#[derive(Clone)]
pub(crate) struct EventSink {
    hooks: Arc<dyn TaskHooks>,
    tx: Option<mpsc::Sender<TaskEventEnvelope>>,
    seq: SequenceCounter,
}

impl EventSink {
    pub(crate) fn new(hooks: Arc<dyn TaskHooks>, tx: Option<mpsc::Sender<TaskEventEnvelope>>) -> Self {
        Self {
            hooks,
            tx,
            seq: SequenceCounter::new(),
        }
    }

    /// Deliver an event without letting a slow or vanished consumer stall
    /// the task.
    ///
    /// 1. First attempts a non-blocking send via `try_send`
    /// 2. If the channel is full, waits up to 30 seconds for space
    /// 3. If the channel is closed, logs and continues
    pub(crate) async fn emit(&self, event: TaskEvent) {
        self.hooks.on_event(&event).await;

        let Some(tx) = &self.tx else {
            return;
        };
        let envelope = TaskEventEnvelope::wrap(event, &self.seq);

        match tx.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                log::debug!("Event channel full, waiting for consumer...");
                match tokio::time::timeout(SEND_TIMEOUT, tx.send(envelope)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => {
                        log::warn!("Event channel closed while sending - consumer disconnected");
                    }
                    Err(_) => {
                        log::error!("Timeout waiting to send event - consumer may be deadlocked");
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Event channel closed - consumer disconnected");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::DefaultHooks;
    use std::collections::HashSet;

    // ===================
    // SequenceCounter
    // ===================

    #[test]
    fn sequence_counter_increments_monotonically() {
        let seq = SequenceCounter::new();
        for expected in 0..100 {
            assert_eq!(seq.next(), expected);
        }
    }

    #[test]
    fn sequence_counter_clones_share_state() {
        let seq = SequenceCounter::new();
        let clone = seq.clone();

        assert_eq!(seq.next(), 0);
        assert_eq!(clone.next(), 1);
        assert_eq!(seq.next(), 2);
    }

    // ===================
    // TaskEventEnvelope
    // ===================

    fn sample_event() -> TaskEvent {
        TaskEvent::started(TaskId::from_string("task-1"))
    }

    #[test]
    fn wrap_assigns_unique_event_ids() {
        let seq = SequenceCounter::new();
        let ids: HashSet<uuid::Uuid> = (0..100)
            .map(|_| TaskEventEnvelope::wrap(sample_event(), &seq).event_id)
            .collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn envelope_serializes_flat_json() {
        let seq = SequenceCounter::new();
        let envelope = TaskEventEnvelope::wrap(
            TaskEvent::idle(TaskId::from_string("task-1"), AskKind::Followup),
            &seq,
        );
        let json: serde_json::Value = serde_json::to_value(&envelope).expect("serialize");

        assert!(json.get("event_id").is_some());
        assert_eq!(json.get("sequence").and_then(serde_json::Value::as_u64), Some(0));
        assert_eq!(json.get("type").and_then(|v| v.as_str()), Some("idle"));
        assert_eq!(json.get("ask").and_then(|v| v.as_str()), Some("followup"));
        assert_eq!(json.get("task_id").and_then(|v| v.as_str()), Some("task-1"));
        assert!(json.get("event").is_none());
    }

    #[test]
    fn envelope_timestamp_is_rfc3339_string() {
        let seq = SequenceCounter::new();
        let envelope = TaskEventEnvelope::wrap(sample_event(), &seq);
        let json: serde_json::Value = serde_json::to_value(&envelope).expect("serialize");

        let ts_str = json.get("timestamp").and_then(|v| v.as_str()).expect("timestamp");
        time::OffsetDateTime::parse(ts_str, &time::format_description::well_known::Rfc3339)
            .expect("timestamp should be valid RFC 3339");
    }

    // ===================
    // EventSink
    // ===================

    #[tokio::test]
    async fn sink_delivers_in_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let sink = EventSink::new(Arc::new(DefaultHooks), Some(tx));

        sink.emit(sample_event()).await;
        sink.emit(TaskEvent::aborted(TaskId::from_string("task-1"), false)).await;

        let first = rx.recv().await.expect("first");
        let second = rx.recv().await.expect("second");
        assert_eq!(first.sequence, 0);
        assert_eq!(second.sequence, 1);
        assert!(matches!(second.event, TaskEvent::Aborted { abandoned: false, .. }));
    }

    #[tokio::test]
    async fn sink_tolerates_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sink = EventSink::new(Arc::new(DefaultHooks), Some(tx));
        sink.emit(sample_event()).await;
    }
}
