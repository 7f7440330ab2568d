//! Core types shared across the task loop.
//!
//! - [`TaskId`]: Identifier of a persisted task
//! - [`TaskConfig`]: Static knobs fixed at construction
//! - [`TaskSettings`]: Live settings re-read from the mode provider every round
//! - [`TokenUsage`] / [`ToolUsage`]: Aggregates derived from the message logs
//! - [`HistoryItem`]: Task metadata persisted alongside the logs
//! - [`TaskError`]: Failures surfaced by core operations

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a persisted task.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Static configuration for a task instance.
///
/// # Example
///
/// ```
/// use agent_task::TaskConfig;
/// use std::time::Duration;
///
/// let config = TaskConfig::default()
///     .with_ask_poll_interval(Duration::from_millis(50))
///     .with_tool_names(["list_files", "read_file"]);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Re-check interval while suspended on an ask.
    pub ask_poll_interval: Duration,
    /// Re-check interval while paused for a sub-task.
    pub pause_poll_interval: Duration,
    /// Upper bound on a paused wait. `None` waits until resumed or aborted.
    pub subtask_wait_timeout: Option<Duration>,
    /// Delay after a mode switch before issuing the next request.
    pub mode_switch_settle: Duration,
    /// Cap on the exponential retry delay, in seconds.
    pub backoff_cap_seconds: u64,
    /// Tool names recognised in text-form tool calls.
    pub tool_names: Vec<String>,
    /// API configuration profile the task runs under.
    pub api_profile: String,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            ask_poll_interval: Duration::from_millis(100),
            pause_poll_interval: Duration::from_secs(1),
            subtask_wait_timeout: None,
            mode_switch_settle: Duration::from_millis(500),
            backoff_cap_seconds: 600,
            tool_names: Vec::new(),
            api_profile: String::from("default"),
        }
    }
}

impl TaskConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_ask_poll_interval(mut self, interval: Duration) -> Self {
        self.ask_poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_pause_poll_interval(mut self, interval: Duration) -> Self {
        self.pause_poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_subtask_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.subtask_wait_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_mode_switch_settle(mut self, settle: Duration) -> Self {
        self.mode_switch_settle = settle;
        self
    }

    #[must_use]
    pub const fn with_backoff_cap_seconds(mut self, seconds: u64) -> Self {
        self.backoff_cap_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_tool_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tool_names = names.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_api_profile(mut self, profile: impl Into<String>) -> Self {
        self.api_profile = profile.into();
        self
    }
}

/// Settings owned by the host and re-read before each request.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    pub mode: String,
    pub auto_approval_enabled: bool,
    /// Retry failed requests without asking.
    pub always_approve_resubmit: bool,
    /// Base of the exponential retry delay, in seconds.
    pub request_delay_seconds: u64,
    /// Minimum spacing between requests across all tasks, in seconds.
    pub rate_limit_seconds: u64,
    pub allowed_max_requests: Option<u64>,
    pub allowed_max_cost: Option<f64>,
    pub auto_condense_context: bool,
    /// Context usage percentage that triggers condensation.
    pub auto_condense_context_percent: u8,
    /// Per-profile trigger overrides keyed by profile id.
    pub profile_thresholds: HashMap<String, u8>,
    pub custom_condensing_prompt: Option<String>,
    /// Zero disables the limit.
    pub consecutive_mistake_limit: u32,
    pub experiments: HashMap<String, bool>,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            mode: String::from("code"),
            auto_approval_enabled: false,
            always_approve_resubmit: false,
            request_delay_seconds: 5,
            rate_limit_seconds: 0,
            allowed_max_requests: None,
            allowed_max_cost: None,
            auto_condense_context: true,
            auto_condense_context_percent: 100,
            profile_thresholds: HashMap::new(),
            custom_condensing_prompt: None,
            consecutive_mistake_limit: 3,
            experiments: HashMap::new(),
        }
    }
}

impl TaskSettings {
    #[must_use]
    pub fn experiment_enabled(&self, name: &str) -> bool {
        self.experiments.get(name).copied().unwrap_or(false)
    }

    /// Retry without asking only when both auto-approval and resubmit are on.
    #[must_use]
    pub const fn auto_retry(&self) -> bool {
        self.auto_approval_enabled && self.always_approve_resubmit
    }
}

/// Token and cost totals derived from the human-facing log.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_cache_writes: u64,
    pub total_cache_reads: u64,
    pub total_cost: f64,
    /// Size of the context sent with the most recent request.
    pub context_tokens: u64,
}

/// Per-tool attempt and failure counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsage(pub BTreeMap<String, ToolUsageEntry>);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUsageEntry {
    pub attempts: u32,
    pub failures: u32,
}

impl ToolUsage {
    pub fn record_attempt(&mut self, tool: &str) {
        self.0.entry(tool.to_string()).or_default().attempts += 1;
    }

    pub fn record_failure(&mut self, tool: &str) {
        self.0.entry(tool.to_string()).or_default().failures += 1;
    }

    #[must_use]
    pub fn get(&self, tool: &str) -> ToolUsageEntry {
        self.0.get(tool).copied().unwrap_or_default()
    }
}

/// Task metadata persisted with every save of the human-facing log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_task_id: Option<TaskId>,
    /// Timestamp of the latest relevant message, unix milliseconds.
    pub ts: i64,
    pub task: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_writes: u64,
    pub cache_reads: u64,
    pub total_cost: f64,
    pub mode: String,
}

/// Errors surfaced by task operations.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskError {
    /// The task's abort flag is set.
    Aborted,
    /// A partial ask was recorded, or a newer message superseded a pending ask.
    AskIgnored,
    /// The user declined to continue.
    UserDeclined(String),
    /// Persisted state is inconsistent.
    InvariantViolation(String),
    /// The model transport failed.
    Api(String),
    /// A paused wait exceeded its configured timeout.
    PauseTimeout(Duration),
    /// The task could not be assembled.
    Configuration(String),
}

impl TaskError {
    /// Whether the request loop may keep running after this error.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::AskIgnored | Self::PauseTimeout(_))
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted => f.write_str("task aborted"),
            Self::AskIgnored => f.write_str("current ask promise was ignored"),
            Self::UserDeclined(reason) => write!(f, "user declined: {reason}"),
            Self::InvariantViolation(detail) => write!(f, "unexpected state: {detail}"),
            Self::Api(message) => write!(f, "API request failed: {message}"),
            Self::PauseTimeout(after) => {
                write!(f, "sub-task did not resume within {}s", after.as_secs())
            }
            Self::Configuration(detail) => write!(f, "invalid task configuration: {detail}"),
        }
    }
}

impl std::error::Error for TaskError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
        assert_eq!(TaskId::from_string("abc").to_string(), "abc");
    }

    #[test]
    fn config_defaults_match_poll_policy() {
        let config = TaskConfig::default();
        assert_eq!(config.ask_poll_interval, Duration::from_millis(100));
        assert_eq!(config.pause_poll_interval, Duration::from_secs(1));
        assert_eq!(config.subtask_wait_timeout, None);
        assert_eq!(config.mode_switch_settle, Duration::from_millis(500));
        assert_eq!(config.backoff_cap_seconds, 600);
    }

    #[test]
    fn config_builder_pattern() {
        let config = TaskConfig::new()
            .with_subtask_wait_timeout(Some(Duration::from_secs(30)))
            .with_backoff_cap_seconds(60)
            .with_tool_names(["list_files"])
            .with_api_profile("fast");

        assert_eq!(config.subtask_wait_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.backoff_cap_seconds, 60);
        assert_eq!(config.tool_names, vec!["list_files".to_string()]);
        assert_eq!(config.api_profile, "fast");
    }

    #[test]
    fn auto_retry_needs_both_flags() {
        let mut settings = TaskSettings {
            always_approve_resubmit: true,
            ..TaskSettings::default()
        };
        assert!(!settings.auto_retry());
        settings.auto_approval_enabled = true;
        assert!(settings.auto_retry());
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: TaskSettings =
            serde_json::from_str(r#"{"mode":"architect","rate_limit_seconds":10}"#)
                .expect("deserialize");
        assert_eq!(settings.mode, "architect");
        assert_eq!(settings.rate_limit_seconds, 10);
        assert_eq!(settings.request_delay_seconds, 5);
        assert!(settings.auto_condense_context);
    }

    #[test]
    fn tool_usage_counts_attempts_and_failures() {
        let mut usage = ToolUsage::default();
        usage.record_attempt("read_file");
        usage.record_attempt("read_file");
        usage.record_failure("read_file");

        assert_eq!(
            usage.get("read_file"),
            ToolUsageEntry {
                attempts: 2,
                failures: 1
            }
        );
        assert_eq!(usage.get("missing"), ToolUsageEntry::default());
    }

    #[test]
    fn only_ignored_and_pause_timeout_are_recoverable() {
        assert!(TaskError::AskIgnored.is_recoverable());
        assert!(TaskError::PauseTimeout(Duration::from_secs(1)).is_recoverable());
        assert!(!TaskError::Aborted.is_recoverable());
        assert!(!TaskError::UserDeclined("no".into()).is_recoverable());
    }
}
