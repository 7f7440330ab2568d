use crate::approval::AutoApprovalLimiter;
use crate::conversation::{ConversationStore, Lineage};
use crate::environment::{ModeProvider, NullEnvironment, StaticModeProvider, TaskEnvironment};
use crate::events::{EventSink, TaskEventEnvelope};
use crate::hooks::{DefaultHooks, TaskHooks};
use crate::llm::ModelTransport;
use crate::rate_limit::RequestRateLimiter;
use crate::stores::{InMemoryTaskStore, TaskPersistence};
use crate::tools::{ToolPresenter, UnavailableTools};
use crate::types::{TaskConfig, TaskError, TaskId, TaskSettings};
use std::sync::atomic::{AtomicBool, AtomicU32};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Notify, mpsc, watch};
use uuid::Uuid;

use super::{AskState, LoopPhase, Task};

/// Builder for constructing a [`Task`].
///
/// Only the transport is required. Every other collaborator falls back to
/// an inert default.
///
/// # Example
///
/// ```ignore
/// let task = Task::builder()
///     .transport(Arc::new(my_transport))
///     .presenter(Arc::new(my_tools))
///     .config(TaskConfig::default().with_tool_names(["read_file"]))
///     .build()?;
/// ```
#[derive(Default)]
pub struct TaskBuilder {
    task_id: Option<TaskId>,
    config: Option<TaskConfig>,
    transport: Option<Arc<dyn ModelTransport>>,
    condensing_transport: Option<Arc<dyn ModelTransport>>,
    presenter: Option<Arc<dyn ToolPresenter>>,
    environment: Option<Arc<dyn TaskEnvironment>>,
    modes: Option<Arc<dyn ModeProvider>>,
    persistence: Option<Arc<dyn TaskPersistence>>,
    hooks: Option<Arc<dyn TaskHooks>>,
    rate_limiter: Option<RequestRateLimiter>,
    event_tx: Option<mpsc::Sender<TaskEventEnvelope>>,
    parent: Option<Weak<Task>>,
    lineage: Lineage,
}

impl TaskBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse an existing task id, e.g. to resume a persisted task.
    #[must_use]
    pub fn task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    #[must_use]
    pub fn config(mut self, config: TaskConfig) -> Self {
        self.config = Some(config);
        self
    }

    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn ModelTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Send context summary requests here instead of the main transport.
    #[must_use]
    pub fn condensing_transport(mut self, transport: Arc<dyn ModelTransport>) -> Self {
        self.condensing_transport = Some(transport);
        self
    }

    #[must_use]
    pub fn presenter(mut self, presenter: Arc<dyn ToolPresenter>) -> Self {
        self.presenter = Some(presenter);
        self
    }

    #[must_use]
    pub fn environment(mut self, environment: Arc<dyn TaskEnvironment>) -> Self {
        self.environment = Some(environment);
        self
    }

    #[must_use]
    pub fn modes(mut self, modes: Arc<dyn ModeProvider>) -> Self {
        self.modes = Some(modes);
        self
    }

    #[must_use]
    pub fn persistence(mut self, persistence: Arc<dyn TaskPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: Arc<dyn TaskHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Share a limiter between tasks so request spacing applies across
    /// all of them. Tasks built without one get their own.
    #[must_use]
    pub fn rate_limiter(mut self, limiter: RequestRateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Also deliver events as envelopes on this channel.
    #[must_use]
    pub fn event_channel(mut self, tx: mpsc::Sender<TaskEventEnvelope>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// A builder for a sub-task of `parent`, sharing its collaborators.
    pub(super) fn subtask_of(parent: &Arc<Task>) -> Self {
        Self {
            task_id: None,
            config: Some(parent.config.clone()),
            transport: Some(Arc::clone(&parent.transport)),
            condensing_transport: parent.condensing_transport.clone(),
            presenter: Some(Arc::clone(&parent.presenter)),
            environment: Some(Arc::clone(&parent.environment)),
            modes: Some(Arc::clone(&parent.modes)),
            persistence: Some(Arc::clone(&parent.persistence)),
            hooks: Some(Arc::clone(&parent.hooks)),
            rate_limiter: Some(parent.rate_limiter.clone()),
            event_tx: parent.event_tx.clone(),
            parent: Some(Arc::downgrade(parent)),
            lineage: Lineage {
                parent_task_id: Some(parent.id.clone()),
                root_task_id: Some(parent.root_id.clone()),
            },
        }
    }

    /// Build the task.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::Configuration`] if no transport was set or the
    /// ask poll interval is zero.
    pub fn build(self) -> Result<Arc<Task>, TaskError> {
        let transport = self
            .transport
            .ok_or_else(|| TaskError::Configuration("a model transport is required".into()))?;
        let config = self.config.unwrap_or_default();
        if config.ask_poll_interval.is_zero() {
            return Err(TaskError::Configuration(
                "ask_poll_interval must be non-zero".into(),
            ));
        }

        let id = self.task_id.unwrap_or_default();
        let root_id = self
            .lineage
            .root_task_id
            .clone()
            .unwrap_or_else(|| id.clone());
        let hooks = self.hooks.unwrap_or_else(|| Arc::new(DefaultHooks));
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let events = EventSink::new(Arc::clone(&hooks), self.event_tx.clone());
        let store = ConversationStore::new(
            id.clone(),
            self.lineage,
            TaskSettings::default().mode,
            Arc::clone(&persistence),
            Arc::clone(&hooks),
            events.clone(),
        );

        log::debug!("Building task task_id={id} root_id={root_id}");

        Ok(Arc::new(Task {
            id,
            instance_id: Uuid::new_v4().to_string(),
            root_id,
            parent: self.parent,
            config,
            transport,
            condensing_transport: self.condensing_transport,
            presenter: self.presenter.unwrap_or_else(|| Arc::new(UnavailableTools)),
            environment: self.environment.unwrap_or_else(|| Arc::new(NullEnvironment)),
            modes: self
                .modes
                .unwrap_or_else(|| Arc::new(StaticModeProvider::default())),
            persistence,
            hooks,
            rate_limiter: self.rate_limiter.unwrap_or_default(),
            event_tx: self.event_tx,
            events,
            store,
            phase: Mutex::new(LoopPhase::Idle),
            abort: watch::channel(false).0,
            abandoned: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            paused_mode: Mutex::new(None),
            resume_signal: Notify::new(),
            ask_state: Mutex::new(AskState::default()),
            ask_signal: Notify::new(),
            consecutive_mistakes: AtomicU32::new(0),
            approval: Mutex::new(AutoApprovalLimiter::new()),
            pending_user_content: Mutex::new(Vec::new()),
            resources: Mutex::new(Vec::new()),
            child: Mutex::new(None),
        }))
    }
}
