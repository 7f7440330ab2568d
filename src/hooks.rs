//! Task lifecycle hooks.
//!
//! Hooks receive fire-and-forget notifications from the task loop:
//!
//! - [`TaskHooks::on_event`] - Observe every [`TaskEvent`]
//! - [`TaskHooks::capture_message`] - Telemetry for completed log entries
//! - [`TaskHooks::save_checkpoint`] - Snapshot the workspace before a request
//! - [`TaskHooks::revert_pending_edits`] - Undo an edit left open by an abort
//! - [`TaskHooks::restart_from_history`] - Re-create a task after a stream failure
//!
//! Failures returned from these methods are logged by the task and never
//! fail it.
//!
//! # Built-in Implementations
//!
//! - [`DefaultHooks`] - No-op
//! - [`LoggingHooks`] - Debug logging for all events

use crate::events::TaskEvent;
use crate::messages::UiMessage;
use crate::types::TaskId;
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait TaskHooks: Send + Sync {
    /// Called for every emitted event.
    async fn on_event(&self, _event: &TaskEvent) {}

    /// Called for each non-partial message appended to the human-facing log.
    async fn capture_message(&self, _task_id: &TaskId, _message: &UiMessage) -> Result<()> {
        Ok(())
    }

    async fn save_checkpoint(&self, _task_id: &TaskId) -> Result<()> {
        Ok(())
    }

    async fn revert_pending_edits(&self, _task_id: &TaskId) -> Result<()> {
        Ok(())
    }

    /// Called after a mid-stream failure has been persisted; the host is
    /// expected to build a fresh task from the saved history.
    async fn restart_from_history(&self, _task_id: &TaskId) -> Result<()> {
        Ok(())
    }
}

pub struct DefaultHooks;

#[async_trait]
impl TaskHooks for DefaultHooks {}

/// Hooks that log all events (useful for debugging)
pub struct LoggingHooks;

#[async_trait]
impl TaskHooks for LoggingHooks {
    async fn on_event(&self, event: &TaskEvent) {
        tracing::debug!(?event, "Task event");
    }

    async fn capture_message(&self, task_id: &TaskId, message: &UiMessage) -> Result<()> {
        tracing::debug!(%task_id, ts = message.ts, kind = ?message.kind, "Message captured");
        Ok(())
    }

    async fn save_checkpoint(&self, task_id: &TaskId) -> Result<()> {
        tracing::debug!(%task_id, "Checkpoint requested");
        Ok(())
    }

    async fn revert_pending_edits(&self, task_id: &TaskId) -> Result<()> {
        tracing::debug!(%task_id, "Revert pending edits");
        Ok(())
    }

    async fn restart_from_history(&self, task_id: &TaskId) -> Result<()> {
        tracing::info!(%task_id, "Restart from history requested");
        Ok(())
    }
}
