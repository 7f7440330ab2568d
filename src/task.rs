//! The agent task.
//!
//! A [`Task`] drives one agent run: it sends the conversation to the model,
//! streams the response back, hands tool uses to the [`ToolPresenter`] and
//! feeds their results into the next request. The loop runs until the task
//! is aborted, a safety limit is declined by the user, or the model returns
//! an empty response.
//!
//! # Suspension points
//!
//! The loop only waits in a few places, each of which re-checks the abort
//! flag when it wakes:
//!
//! - a blocking [`Task::ask`]
//! - [`Task::wait_for_resume`] while a sub-task runs
//! - rate-limit and retry countdowns
//! - presentation of streamed tool uses
//!
//! # Example
//!
//! ```ignore
//! let task = Task::builder()
//!     .transport(transport)
//!     .presenter(presenter)
//!     .build()?;
//!
//! tokio::spawn({
//!     let task = Arc::clone(&task);
//!     async move { task.start_task("list files", Vec::new()).await }
//! });
//!
//! // Later, from the host:
//! task.handle_response(AskReply::yes());
//! task.abort_task(false).await;
//! ```

mod builder;
mod control;
mod helpers;
mod interaction;
mod lifecycle;
mod parser;
mod presentation;
mod request_loop;

#[cfg(test)]
mod test_utils;

pub use builder::TaskBuilder;
pub use control::TaskResource;
pub use interaction::SayOptions;
pub use parser::{
    AssistantBlock, parse_assistant_message, strip_thinking_tags, strip_trailing_partial_tag,
};

use crate::approval::AutoApprovalLimiter;
use crate::conversation::ConversationStore;
use crate::environment::{ModeProvider, TaskEnvironment};
use crate::events::{EventSink, TaskEventEnvelope};
use crate::hooks::TaskHooks;
use crate::llm::{ApiMessage, ContentBlock, ModelTransport};
use crate::messages::{AskKind, AskReply, UiMessage};
use crate::rate_limit::RequestRateLimiter;
use crate::stores::TaskPersistence;
use crate::tools::ToolPresenter;
use crate::types::{TaskConfig, TaskId, TokenUsage, ToolUsage};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{Notify, mpsc, watch};

use helpers::lock;

/// Where the request loop currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    BuildingRequest,
    Streaming,
    Presenting,
    Ending,
    Aborted,
}

/// Shared slot a pending ask waits on.
#[derive(Debug, Default)]
struct AskState {
    /// Timestamp of the newest interactive message. A pending ask whose ts
    /// no longer matches has been superseded.
    last_message_ts: i64,
    response: Option<AskReply>,
    blocking_ask: Option<AskKind>,
}

pub struct Task {
    id: TaskId,
    /// Distinguishes in-memory instances driving the same persisted task.
    instance_id: String,
    root_id: TaskId,
    parent: Option<Weak<Task>>,
    config: TaskConfig,

    transport: Arc<dyn ModelTransport>,
    /// Summaries go here when set, otherwise to `transport`.
    condensing_transport: Option<Arc<dyn ModelTransport>>,
    presenter: Arc<dyn ToolPresenter>,
    environment: Arc<dyn TaskEnvironment>,
    modes: Arc<dyn ModeProvider>,
    persistence: Arc<dyn TaskPersistence>,
    hooks: Arc<dyn TaskHooks>,
    rate_limiter: RequestRateLimiter,
    event_tx: Option<mpsc::Sender<TaskEventEnvelope>>,
    events: EventSink,
    store: ConversationStore,

    phase: Mutex<LoopPhase>,
    abort: watch::Sender<bool>,
    abandoned: AtomicBool,
    paused: AtomicBool,
    /// Mode that was active when the task paused for a sub-task.
    paused_mode: Mutex<Option<String>>,
    resume_signal: Notify,
    ask_state: Mutex<AskState>,
    ask_signal: Notify,
    consecutive_mistakes: AtomicU32,
    approval: Mutex<AutoApprovalLimiter>,
    /// Content queued for the next user turn, e.g. a sub-task result.
    pending_user_content: Mutex<Vec<ContentBlock>>,
    resources: Mutex<Vec<Box<dyn TaskResource>>>,
    child: Mutex<Option<Arc<Task>>>,
}

impl Task {
    #[must_use]
    pub fn builder() -> TaskBuilder {
        TaskBuilder::new()
    }

    #[must_use]
    pub const fn id(&self) -> &TaskId {
        &self.id
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Id of the top-level task in a sub-task chain; the task's own id for a
    /// top-level task.
    #[must_use]
    pub const fn root_id(&self) -> &TaskId {
        &self.root_id
    }

    #[must_use]
    pub fn parent(&self) -> Option<Arc<Self>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// The running sub-task, if any.
    #[must_use]
    pub fn child(&self) -> Option<Arc<Self>> {
        lock(&self.child).clone()
    }

    #[must_use]
    pub const fn config(&self) -> &TaskConfig {
        &self.config
    }

    #[must_use]
    pub const fn rate_limiter(&self) -> &RequestRateLimiter {
        &self.rate_limiter
    }

    #[must_use]
    pub fn phase(&self) -> LoopPhase {
        *lock(&self.phase)
    }

    fn set_phase(&self, phase: LoopPhase) {
        let mut current = lock(&self.phase);
        if *current != LoopPhase::Aborted {
            *current = phase;
        }
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        *self.abort.borrow()
    }

    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// The ask kind the task is suspended on, if it is waiting on a
    /// blocking ask.
    #[must_use]
    pub fn blocking_ask(&self) -> Option<AskKind> {
        lock(&self.ask_state).blocking_ask
    }

    #[must_use]
    pub fn consecutive_mistakes(&self) -> u32 {
        self.consecutive_mistakes.load(Ordering::SeqCst)
    }

    pub async fn api_messages(&self) -> Vec<ApiMessage> {
        self.store.api_messages().await
    }

    pub async fn ui_messages(&self) -> Vec<UiMessage> {
        self.store.ui_messages().await
    }

    /// Token and cost totals derived from the UI log.
    pub async fn token_usage(&self) -> TokenUsage {
        self.store.token_usage().await
    }

    pub async fn tool_usage(&self) -> ToolUsage {
        self.store.tool_usage().await
    }

    /// Count a tool failure reported outside of [`ToolPresenter::execute`].
    pub async fn record_tool_error(&self, tool: &str, error: &str) {
        self.store.record_tool_error(tool, error).await;
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("instance_id", &self.instance_id)
            .field("phase", &self.phase())
            .field("aborted", &self.is_aborted())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}
