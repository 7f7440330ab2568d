pub mod types;

pub use types::*;

use crate::context::TokenEstimator;
use anyhow::Result;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// Boxed stream of response chunks.
pub type ApiStream<'a> = Pin<Box<dyn Stream<Item = Result<ApiChunk>> + Send + 'a>>;

/// Transport that carries requests to a language model.
///
/// A failure before the first chunk is reported as the stream's first item.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    fn create_message(&self, request: ApiRequest) -> ApiStream<'_>;

    fn model_info(&self) -> ModelInfo;

    /// Count tokens in a content list. Defaults to a character heuristic.
    async fn count_tokens(&self, content: &[ContentBlock]) -> Result<u64> {
        Ok(TokenEstimator::estimate_blocks(content))
    }
}

/// Text and usage accumulated from a fully drained stream.
#[derive(Debug, Default)]
pub struct CollectedResponse {
    pub text: String,
    pub usage: UsageChunk,
}

/// Drain a stream, keeping text and summing usage. Reasoning and tool calls
/// are dropped.
pub async fn collect_response(mut stream: ApiStream<'_>) -> Result<CollectedResponse> {
    let mut collected = CollectedResponse::default();
    while let Some(chunk) = stream.next().await {
        match chunk? {
            ApiChunk::Text(text) => collected.text.push_str(&text),
            ApiChunk::Usage(usage) => {
                collected.usage.input_tokens += usage.input_tokens;
                collected.usage.output_tokens += usage.output_tokens;
                if let Some(cost) = usage.total_cost {
                    *collected.usage.total_cost.get_or_insert(0.0) += cost;
                }
            }
            ApiChunk::Reasoning(_) | ApiChunk::ToolCall { .. } => {}
        }
    }
    Ok(collected)
}
