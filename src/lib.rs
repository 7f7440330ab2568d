//! Agent task runtime - the request loop behind a coding assistant.
//!
//! This crate drives one agent task from a user prompt to completion:
//! - Streaming requests to a model transport and presenting the response
//!   as it arrives, text and tool uses alike
//! - Two persisted logs per task: the API history sent to the model and the
//!   human-facing UI history
//! - Ask/say interaction with the host, abort, pause and sub-task delegation
//! - Context condensing and truncation, rate limiting, retry backoff and
//!   auto-approval limits
//!
//! Tool execution, prompt construction and persistence are collaborators
//! supplied by the host through traits.
//!
//! # Example
//!
//! ```ignore
//! use agent_task::{AskReply, Task, TaskConfig};
//!
//! let task = Task::builder()
//!     .config(TaskConfig::default().with_tool_names(["read_file", "list_files"]))
//!     .transport(transport)
//!     .presenter(presenter)
//!     .event_channel(tx)
//!     .build()?;
//!
//! let runner = tokio::spawn({
//!     let task = Arc::clone(&task);
//!     async move { task.start_task("Summarize the README", Vec::new()).await }
//! });
//!
//! while let Some(envelope) = rx.recv().await {
//!     if let TaskEvent::Idle { .. } = envelope.event {
//!         task.handle_response(AskReply::yes());
//!     }
//! }
//! ```

#![forbid(unsafe_code)]

pub mod approval;
pub mod context;
mod conversation;
pub mod environment;
pub mod events;
pub mod hooks;
pub mod llm;
pub mod messages;
pub mod rate_limit;
pub mod stores;
pub mod task;
pub mod tools;
pub mod types;

pub use environment::{ModeProvider, NullEnvironment, StaticModeProvider, TaskEnvironment};
pub use events::{MessageAction, TaskEvent, TaskEventEnvelope};
pub use hooks::{DefaultHooks, LoggingHooks, TaskHooks};
pub use llm::{ApiChunk, ApiMessage, ContentBlock, ModelTransport, ProviderError};
pub use messages::{AskKind, AskReply, AskResponse, SayKind, UiMessage};
pub use rate_limit::RequestRateLimiter;
pub use stores::{InMemoryTaskStore, TaskPersistence};
pub use task::{LoopPhase, SayOptions, Task, TaskBuilder, TaskResource};
pub use tools::{ToolOutput, ToolPresenter, ToolUseRequest};
pub use types::{
    HistoryItem, TaskConfig, TaskError, TaskId, TaskSettings, TokenUsage, ToolUsage,
};
