//! Tool presentation seam.
//!
//! The request loop does not execute tools itself. Each tool-use block the
//! model produces is handed to a [`ToolPresenter`]: partial blocks go to
//! [`ToolPresenter::preview`] while the model is still streaming them, and
//! complete blocks go to [`ToolPresenter::execute`]. A presenter may ask the
//! user for approval through the task it is given and reports a rejection
//! via [`ToolOutput::rejected`].

use crate::llm::ContentBlock;
use crate::task::Task;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// A tool invocation as parsed from the model's output.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolUseRequest {
    /// Present for native tool calls; `None` for calls written as markup.
    pub id: Option<String>,
    pub name: String,
    /// Parameters as a JSON object.
    pub input: Value,
    /// Still being streamed.
    pub partial: bool,
}

impl ToolUseRequest {
    /// String parameter by name.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&str> {
        self.input.get(name).and_then(Value::as_str)
    }

    /// Short label used in tool-result headers, e.g. `[read_file for 'a.rs']`.
    #[must_use]
    pub fn description(&self) -> String {
        let target = ["path", "command", "query", "url"]
            .iter()
            .find_map(|key| self.param(key));
        match target {
            Some(target) => format!("[{} for '{target}']", self.name),
            None => format!("[{}]", self.name),
        }
    }
}

/// Result of executing one tool.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolOutput {
    pub content: Vec<ContentBlock>,
    /// The user declined the tool. Further tools in the same response are
    /// skipped and the stream is cut off.
    pub rejected: bool,
    pub is_error: bool,
}

impl ToolOutput {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![ContentBlock::text(text)],
            ..Self::default()
        }
    }

    #[must_use]
    pub fn rejected(feedback: impl Into<String>) -> Self {
        Self {
            rejected: true,
            ..Self::text(feedback)
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(message)
        }
    }

    #[must_use]
    pub fn with_content(mut self, content: Vec<ContentBlock>) -> Self {
        self.content = content;
        self
    }
}

#[async_trait]
pub trait ToolPresenter: Send + Sync {
    /// Show a tool use that is still streaming. Errors are logged.
    async fn preview(&self, _task: &Task, _request: &ToolUseRequest) -> Result<()> {
        Ok(())
    }

    /// Execute a complete tool use.
    async fn execute(&self, task: &Task, request: &ToolUseRequest) -> Result<ToolOutput>;
}

/// Presenter used when none is configured; every tool reports an error.
pub struct UnavailableTools;

#[async_trait]
impl ToolPresenter for UnavailableTools {
    async fn execute(&self, _task: &Task, request: &ToolUseRequest) -> Result<ToolOutput> {
        Ok(ToolOutput::error(format!(
            "Tool {} is not available in this environment.",
            request.name
        )))
    }
}
