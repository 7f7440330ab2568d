use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Outbound request handed to a [`super::ModelTransport`].
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub system_prompt: String,
    pub messages: Vec<ApiMessage>,
    pub metadata: RequestMetadata,
}

/// Per-request hints for the transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub task_id: String,
    pub mode: String,
    /// When set, the transport must not link this request to a previous
    /// provider-side response (the history was rewritten).
    pub suppress_previous_response_id: bool,
}

/// One turn in the model-facing conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    /// Creation time in unix milliseconds.
    pub ts: i64,
    /// Marks a condensation summary turn.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_summary: bool,
}

impl ApiMessage {
    #[must_use]
    pub fn new(role: Role, content: Vec<ContentBlock>, ts: i64) -> Self {
        Self {
            role,
            content,
            ts,
            is_summary: false,
        }
    }

    #[must_use]
    pub fn user(text: impl Into<String>, ts: i64) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)], ts)
    }

    #[must_use]
    pub fn assistant(text: impl Into<String>, ts: i64) -> Self {
        Self::new(Role::Assistant, vec![ContentBlock::text(text)], ts)
    }

    /// Ids of every tool-use block in this turn, in order.
    pub fn tool_use_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolUse { id, .. } => Some(id.as_str()),
            _ => None,
        })
    }

    /// Ids referenced by tool-result blocks in this turn.
    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
            _ => None,
        })
    }

    #[must_use]
    pub fn has_tool_use(&self) -> bool {
        self.tool_use_ids().next().is_some()
    }

    /// Concatenated text of all text blocks.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User => f.write_str("user"),
            Self::Assistant => f.write_str("assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },

    Reasoning {
        text: String,
    },

    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    ToolResult {
        tool_use_id: String,
        content: Vec<ContentBlock>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },

    Image {
        media_type: String,
        /// Base64 payload.
        data: String,
    },
}

impl ContentBlock {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    #[must_use]
    pub fn tool_result(tool_use_id: impl Into<String>, text: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: vec![Self::text(text)],
            is_error: is_error.then_some(true),
        }
    }

    /// Build image blocks from data URLs (`data:<mime>;base64,<payload>`).
    /// Entries that are not data URLs are sent as `image/png` payloads.
    #[must_use]
    pub fn images(images: &[String]) -> Vec<Self> {
        images
            .iter()
            .map(|image| {
                let (media_type, data) = image
                    .strip_prefix("data:")
                    .and_then(|rest| rest.split_once(";base64,"))
                    .map_or(("image/png", image.as_str()), |(mime, data)| (mime, data));
                Self::Image {
                    media_type: media_type.to_string(),
                    data: data.to_string(),
                }
            })
            .collect()
    }

    #[must_use]
    pub const fn is_tool_result(&self) -> bool {
        matches!(self, Self::ToolResult { .. })
    }
}

/// One item of a streamed model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiChunk {
    Text(String),
    Reasoning(String),
    /// A complete native tool call.
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    Usage(UsageChunk),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageChunk {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_write_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    /// Provider-reported cost; computed from pricing when absent.
    pub total_cost: Option<f64>,
}

/// Static facts about the model behind a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub context_window: u64,
    pub max_tokens: Option<u64>,
    /// USD per million input tokens.
    pub input_price: f64,
    /// USD per million output tokens.
    pub output_price: f64,
    pub cache_writes_price: Option<f64>,
    pub cache_reads_price: Option<f64>,
}

impl Default for ModelInfo {
    fn default() -> Self {
        Self {
            id: String::from("unknown"),
            context_window: 128_000,
            max_tokens: Some(8192),
            input_price: 0.0,
            output_price: 0.0,
            cache_writes_price: None,
            cache_reads_price: None,
        }
    }
}

impl ModelInfo {
    /// Cost of a request in USD.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn calculate_cost(&self, usage: &UsageChunk) -> f64 {
        let per_token = |price: f64, tokens: u64| price / 1_000_000.0 * tokens as f64;
        per_token(self.input_price, usage.input_tokens)
            + per_token(self.output_price, usage.output_tokens)
            + per_token(
                self.cache_writes_price.unwrap_or(self.input_price),
                usage.cache_write_tokens.unwrap_or(0),
            )
            + per_token(
                self.cache_reads_price.unwrap_or(0.0),
                usage.cache_read_tokens.unwrap_or(0),
            )
    }
}

/// Transport failure carrying an optional machine-readable retry hint.
///
/// Transports return this inside an `anyhow::Error`; the retry controller
/// recovers it with `downcast_ref`.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub message: String,
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
}

impl ProviderError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    #[must_use]
    pub fn rate_limited(message: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            message: message.into(),
            status: Some(429),
            retry_after: Some(retry_after),
        }
    }

    #[must_use]
    pub const fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status} {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ProviderError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn images_split_data_urls() {
        let blocks = ContentBlock::images(&[
            "data:image/jpeg;base64,QUJD".to_string(),
            "RAW".to_string(),
        ]);
        assert_eq!(
            blocks[0],
            ContentBlock::Image {
                media_type: "image/jpeg".to_string(),
                data: "QUJD".to_string()
            }
        );
        assert!(matches!(&blocks[1], ContentBlock::Image { media_type, .. } if media_type == "image/png"));
    }

    #[test]
    fn tool_ids_are_collected_in_order() {
        let message = ApiMessage::new(
            Role::Assistant,
            vec![
                ContentBlock::text("checking"),
                ContentBlock::ToolUse {
                    id: "a".to_string(),
                    name: "list".to_string(),
                    input: json!({}),
                },
                ContentBlock::ToolUse {
                    id: "b".to_string(),
                    name: "read".to_string(),
                    input: json!({"path": "x"}),
                },
            ],
            1,
        );
        assert_eq!(message.tool_use_ids().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(message.has_tool_use());
    }

    #[test]
    fn summary_flag_is_omitted_when_false() {
        let value = serde_json::to_value(ApiMessage::user("hi", 5)).expect("serialize");
        assert!(value.get("is_summary").is_none());
        assert_eq!(value["content"][0]["type"], "text");
    }

    #[test]
    fn cost_uses_per_million_pricing() {
        let model = ModelInfo {
            input_price: 3.0,
            output_price: 15.0,
            cache_reads_price: Some(0.3),
            ..ModelInfo::default()
        };
        let usage = UsageChunk {
            input_tokens: 1_000_000,
            output_tokens: 100_000,
            cache_read_tokens: Some(1_000_000),
            ..UsageChunk::default()
        };
        let cost = model.calculate_cost(&usage);
        assert!((cost - 4.8).abs() < 1e-9);
    }

    #[test]
    fn provider_error_survives_anyhow_downcast() {
        let err = anyhow::Error::new(ProviderError::rate_limited(
            "slow down",
            Duration::from_secs(7),
        ));
        let hint = err
            .downcast_ref::<ProviderError>()
            .and_then(|e| e.retry_after);
        assert_eq!(hint, Some(Duration::from_secs(7)));
        assert_eq!(err.to_string(), "429 slow down");
    }
}
