use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use weave_core::errors::ProviderError;
use weave_core::stream::StreamChunk;
use weave_core::tools::ToolDefinition;
use weave_core::turns::Turn;

use crate::wire::WireFormat;

/// The chunk stream handed back by a provider. Mid-stream transport
/// failures surface as `Err` items.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// One outgoing request: the (already filtered, compressed, packed) turn
/// sequence plus the tools the model may call.
#[derive(Clone, Debug)]
pub struct ProviderRequest {
    pub system: Option<String>,
    pub turns: Vec<Turn>,
    pub tools: Vec<ToolDefinition>,
}

impl ProviderRequest {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self {
            system: None,
            turns,
            tools: Vec::new(),
        }
    }
}

/// Options controlling generation behavior.
#[derive(Clone, Debug)]
pub struct StreamOptions {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub tool_choice: ToolChoice,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_tokens: None,
            temperature: None,
            tool_choice: ToolChoice::Auto,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Required,
    None,
}

impl ToolChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Required => "required",
            Self::None => "none",
        }
    }
}

/// Trait implemented by each model provider adapter.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    fn context_window(&self) -> usize;

    /// Which structural contract this provider's wire format imposes.
    fn wire_format(&self) -> WireFormat;

    async fn stream(
        &self,
        request: &ProviderRequest,
        options: &StreamOptions,
    ) -> Result<ChunkStream, ProviderError>;
}
