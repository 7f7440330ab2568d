//! Abort, pause and sub-task delegation.

use crate::events::TaskEvent;
use crate::llm::ContentBlock;
use crate::messages::SayKind;
use crate::types::TaskError;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::time::Instant;

use super::builder::TaskBuilder;
use super::helpers::{lock, subtask_result};
use super::{LoopPhase, Task};

/// An external resource owned by a task: a terminal, an open editor
/// session, a browser. Released once when the task is disposed.
#[async_trait]
pub trait TaskResource: Send + Sync {
    fn name(&self) -> &str;

    async fn release(&self) -> anyhow::Result<()>;
}

impl Task {
    /// Stop the task.
    ///
    /// Sets the abort flag, wakes every suspension point, releases owned
    /// resources and persists both logs. A running sub-task is aborted as
    /// abandoned. `abandoned` marks an instance the caller will not wait on;
    /// its in-flight stream is dropped without writing an interrupted turn.
    pub async fn abort_task(&self, abandoned: bool) {
        let mut descendants = Vec::new();
        let mut next = lock(&self.child).take();
        while let Some(child) = next {
            next = lock(&child.child).take();
            descendants.push(child);
        }

        self.abort_instance(abandoned).await;
        for child in descendants {
            child.abort_instance(true).await;
        }
    }

    async fn abort_instance(&self, abandoned: bool) {
        if abandoned {
            self.abandoned.store(true, Ordering::SeqCst);
        }
        if self.abort.send_replace(true) {
            return;
        }

        log::info!(
            "Aborting task task_id={} instance_id={} abandoned={abandoned}",
            self.id,
            self.instance_id
        );
        self.set_phase(LoopPhase::Aborted);
        self.ask_signal.notify_waiters();
        self.resume_signal.notify_waiters();

        self.events
            .emit(TaskEvent::aborted(self.id.clone(), abandoned))
            .await;
        self.dispose().await;
        self.store.persist_all().await;
    }

    /// Release every registered resource and revert pending edits. Each
    /// step is isolated; failures are logged. Resources are released at
    /// most once.
    pub async fn dispose(&self) {
        let resources = std::mem::take(&mut *lock(&self.resources));
        for resource in resources {
            if let Err(e) = resource.release().await {
                log::warn!(
                    "Failed to release resource task_id={} resource={} error={e:#}",
                    self.id,
                    resource.name()
                );
            }
        }

        if let Err(e) = self.hooks.revert_pending_edits(&self.id).await {
            log::warn!("Failed to revert pending edits task_id={} error={e:#}", self.id);
        }
    }

    /// Track a resource to be released by [`Task::dispose`].
    pub fn register_resource(&self, resource: impl TaskResource + 'static) {
        lock(&self.resources).push(Box::new(resource));
    }

    /// Wait until the task is no longer paused.
    ///
    /// Re-checks every `pause_poll_interval` and whenever the pause is
    /// cleared. Fails with [`TaskError::PauseTimeout`] once the configured
    /// sub-task wait timeout passes, and with [`TaskError::Aborted`] if the
    /// task is aborted while waiting.
    pub async fn wait_for_resume(&self) -> Result<(), TaskError> {
        let started = Instant::now();
        loop {
            let notified = self.resume_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_aborted() {
                return Err(TaskError::Aborted);
            }
            if !self.is_paused() {
                return Ok(());
            }

            let mut wait = self.config.pause_poll_interval;
            if let Some(limit) = self.config.subtask_wait_timeout {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    return Err(TaskError::PauseTimeout(limit));
                }
                wait = wait.min(limit - elapsed);
            }
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    /// Start a sub-task and pause this task until it finishes.
    ///
    /// The child shares this task's collaborators and rate limiter. When
    /// `mode` is given the host switches to it; the current mode is
    /// restored when this task resumes.
    pub async fn spawn_subtask(
        self: &Arc<Self>,
        message: impl Into<String>,
        mode: Option<&str>,
        images: Vec<String>,
    ) -> Result<Arc<Self>, TaskError> {
        if self.is_aborted() {
            return Err(TaskError::Aborted);
        }

        let current_mode = self.modes.current_mode().await;
        *lock(&self.paused_mode) = Some(current_mode);
        if let Some(mode) = mode {
            match self.modes.switch_mode(mode).await {
                Ok(()) => {
                    tokio::time::sleep(self.config.mode_switch_settle).await;
                    self.events
                        .emit(TaskEvent::mode_switched(self.id.clone(), mode))
                        .await;
                }
                Err(e) => {
                    log::warn!("Mode switch for sub-task failed task_id={} mode={mode} error={e:#}", self.id);
                }
            }
        }

        let child = TaskBuilder::subtask_of(self).build()?;
        *lock(&self.child) = Some(Arc::clone(&child));
        self.paused.store(true, Ordering::SeqCst);

        log::info!(
            "Spawned sub-task task_id={} child_id={}",
            self.id,
            child.id
        );
        self.events
            .emit(TaskEvent::Paused {
                task_id: self.id.clone(),
            })
            .await;
        self.events
            .emit(TaskEvent::SpawnedSubtask {
                task_id: self.id.clone(),
                child_id: child.id.clone(),
            })
            .await;

        let runner = Arc::clone(&child);
        let message = message.into();
        tokio::spawn(async move {
            match runner.start_task(&message, images).await {
                Ok(ended) => log::debug!("Sub-task loop exited task_id={} ended={ended}", runner.id),
                Err(e) => log::warn!("Sub-task failed task_id={} error={e}", runner.id),
            }
        });

        Ok(child)
    }

    /// Complete the running sub-task with `result` and resume this task.
    ///
    /// The child is aborted as abandoned. The result is shown to the user
    /// and added to this task's next user turn.
    pub async fn finish_subtask(&self, result: &str) -> Result<(), TaskError> {
        let child = lock(&self.child).take();
        if let Some(child) = child {
            child.abort_task(true).await;
            self.events
                .emit(TaskEvent::SubtaskCompleted {
                    task_id: self.id.clone(),
                    child_id: child.id.clone(),
                })
                .await;
        }

        lock(&self.pending_user_content).push(ContentBlock::text(subtask_result(result)));
        let said = self.say(SayKind::SubtaskResult, result).await;
        self.unpause().await;
        said.map(|_| ())
    }

    pub(super) async fn unpause(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            self.resume_signal.notify_waiters();
            self.events
                .emit(TaskEvent::Unpaused {
                    task_id: self.id.clone(),
                })
                .await;
        }
    }

    /// Switch back to the mode recorded when the task paused.
    pub(super) async fn restore_paused_mode(&self) {
        let Some(mode) = lock(&self.paused_mode).take() else {
            return;
        };
        if self.modes.current_mode().await == mode {
            return;
        }
        if let Err(e) = self.modes.switch_mode(&mode).await {
            log::warn!("Failed to restore mode task_id={} mode={mode} error={e:#}", self.id);
            return;
        }
        tokio::time::sleep(self.config.mode_switch_settle).await;
        self.store.set_mode(&mode).await;
        self.events
            .emit(TaskEvent::mode_switched(self.id.clone(), mode))
            .await;
    }
}
