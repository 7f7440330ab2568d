//! Human-facing message log entries.
//!
//! Every [`UiMessage`] is either an `ask` (the task wants a decision) or a
//! `say` (informational). The `ts` field is the message's identity: it is
//! assigned once and never changes, including when a partial entry is
//! finalized in place.

use crate::types::TokenUsage;
use serde::{Deserialize, Serialize};

/// Kinds of questions the task can ask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    Followup,
    Command,
    CommandOutput,
    CompletionResult,
    Tool,
    ApiReqFailed,
    ResumeTask,
    ResumeCompletedTask,
    MistakeLimitReached,
    AutoApprovalMaxReqReached,
}

impl AskKind {
    pub const ALL: [Self; 10] = [
        Self::Followup,
        Self::Command,
        Self::CommandOutput,
        Self::CompletionResult,
        Self::Tool,
        Self::ApiReqFailed,
        Self::ResumeTask,
        Self::ResumeCompletedTask,
        Self::MistakeLimitReached,
        Self::AutoApprovalMaxReqReached,
    ];

    /// Asks that need a human decision put the task into the idle state
    /// while they wait. Command output is advisory.
    #[must_use]
    pub const fn is_blocking(self) -> bool {
        !matches!(self, Self::CommandOutput)
    }
}

/// Kinds of informational messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    Text,
    Reasoning,
    Tool,
    ApiReqStarted,
    ApiReqRetried,
    ApiReqRetryDelayed,
    Error,
    UserFeedback,
    CompletionResult,
    CondenseContext,
    CondenseContextError,
    SubtaskResult,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageKind {
    Ask { ask: AskKind },
    Say { say: SayKind },
}

impl MessageKind {
    #[must_use]
    pub const fn ask_kind(self) -> Option<AskKind> {
        match self {
            Self::Ask { ask } => Some(ask),
            Self::Say { .. } => None,
        }
    }

    #[must_use]
    pub const fn say_kind(self) -> Option<SayKind> {
        match self {
            Self::Say { say } => Some(say),
            Self::Ask { .. } => None,
        }
    }
}

/// Progress indicator attached to a streaming entry.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Why a streamed response was cut short.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserCancelled,
    StreamingFailed,
}

impl CancelReason {
    /// Annotation appended to the interrupted assistant turn.
    #[must_use]
    pub const fn annotation(self) -> &'static str {
        match self {
            Self::UserCancelled => "[Response interrupted by user]",
            Self::StreamingFailed => "[Response interrupted by API Error]",
        }
    }
}

/// Accounting attached to an `api_req_started` entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiRequestInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cache_writes: u64,
    pub cache_reads: u64,
    /// Set once the request finished or was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_failed_message: Option<String>,
}

/// Record of one summarization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextCondense {
    pub prev_context_tokens: u64,
    pub new_context_tokens: u64,
    pub cost: f64,
    pub summary: String,
}

/// One entry in the human-facing log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub ts: i64,
    #[serde(flatten)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// `Some(true)` while streaming, `Some(false)` once completed, `None`
    /// for atomic messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_status: Option<ProgressStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_request: Option<ApiRequestInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_condense: Option<ContextCondense>,
}

impl UiMessage {
    #[must_use]
    pub fn new(kind: MessageKind) -> Self {
        Self {
            ts: 0,
            kind,
            text: None,
            images: Vec::new(),
            partial: None,
            progress_status: None,
            api_request: None,
            context_condense: None,
        }
    }

    #[must_use]
    pub fn ask(kind: AskKind) -> Self {
        Self::new(MessageKind::Ask { ask: kind })
    }

    #[must_use]
    pub fn say(kind: SayKind) -> Self {
        Self::new(MessageKind::Say { say: kind })
    }

    #[must_use]
    pub fn with_text(mut self, text: Option<String>) -> Self {
        self.text = text;
        self
    }

    #[must_use]
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    #[must_use]
    pub const fn with_partial(mut self, partial: Option<bool>) -> Self {
        self.partial = partial;
        self
    }

    #[must_use]
    pub const fn with_ts(mut self, ts: i64) -> Self {
        self.ts = ts;
        self
    }

    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.partial == Some(true)
    }

    #[must_use]
    pub fn is_ask(&self, kind: AskKind) -> bool {
        self.kind.ask_kind() == Some(kind)
    }

    #[must_use]
    pub fn is_say(&self, kind: SayKind) -> bool {
        self.kind.say_kind() == Some(kind)
    }
}

/// How the caller answered an ask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskResponse {
    YesButtonClicked,
    NoButtonClicked,
    MessageResponse,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskReply {
    pub response: AskResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl AskReply {
    #[must_use]
    pub const fn yes() -> Self {
        Self {
            response: AskResponse::YesButtonClicked,
            text: None,
            images: Vec::new(),
        }
    }

    #[must_use]
    pub const fn no() -> Self {
        Self {
            response: AskResponse::NoButtonClicked,
            text: None,
            images: Vec::new(),
        }
    }

    #[must_use]
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            response: AskResponse::MessageResponse,
            text: Some(text.into()),
            images: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_yes(&self) -> bool {
        self.response == AskResponse::YesButtonClicked
    }
}

/// Recompute token and cost totals from the log.
///
/// Context size comes from whichever is later: the last request that
/// reported tokens, or the last condensation.
#[must_use]
pub fn api_metrics(messages: &[UiMessage]) -> TokenUsage {
    let mut usage = TokenUsage::default();

    for message in messages {
        if let Some(info) = message.api_request.as_ref().filter(|_| message.is_say(SayKind::ApiReqStarted)) {
            usage.total_tokens_in += info.tokens_in;
            usage.total_tokens_out += info.tokens_out;
            usage.total_cache_writes += info.cache_writes;
            usage.total_cache_reads += info.cache_reads;
            usage.total_cost += info.cost.unwrap_or(0.0);
        } else if let Some(condense) = message.context_condense.as_ref() {
            usage.total_cost += condense.cost;
        }
    }

    usage.context_tokens = messages
        .iter()
        .rev()
        .find_map(|message| {
            if let Some(condense) = &message.context_condense {
                return Some(condense.new_context_tokens);
            }
            message
                .api_request
                .as_ref()
                .filter(|info| info.tokens_in + info.tokens_out > 0)
                .map(|info| info.tokens_in + info.tokens_out + info.cache_writes + info.cache_reads)
        })
        .unwrap_or(0);

    usage
}
