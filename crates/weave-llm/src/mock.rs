use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use weave_core::errors::ProviderError;
use weave_core::stream::{FinishReason, StreamChunk, ToolCallFragment};

use crate::provider::{ChatProvider, ChunkStream, ProviderRequest, StreamOptions};
use crate::wire::WireFormat;

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone)]
pub enum MockResponse {
    /// Yield a sequence of chunks.
    Stream(Vec<StreamChunk>),
    /// Return an error from the stream() call itself.
    Error(ProviderError),
    /// Yield chunks, then an error item mid-stream.
    StreamThenError(Vec<StreamChunk>, ProviderError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// Convenience: a plain text response ending in `stop`.
    pub fn stream_text(text: &str) -> Self {
        Self::Stream(vec![
            StreamChunk::text(text),
            StreamChunk::finish(FinishReason::Stop),
        ])
    }

    /// Convenience: one complete tool call split into two argument
    /// fragments, ending in `tool_calls`.
    pub fn stream_tool_call(id: &str, name: &str, arguments: &str) -> Self {
        let mut mid = arguments.len() / 2;
        while mid > 0 && !arguments.is_char_boundary(mid) {
            mid -= 1;
        }
        let (head, tail) = arguments.split_at(mid);
        Self::Stream(vec![
            StreamChunk::tool_fragment(
                ToolCallFragment::new(0).with_id(id).with_name(name).with_arguments(head),
            ),
            StreamChunk::tool_fragment(ToolCallFragment::new(0).with_arguments(tail)),
            StreamChunk::finish(FinishReason::ToolCalls),
        ])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence.
pub struct MockProvider {
    responses: Mutex<Vec<MockResponse>>,
    call_count: AtomicUsize,
    wire_format: WireFormat,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses),
            call_count: AtomicUsize::new(0),
            wire_format: WireFormat::ToolRole,
        }
    }

    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn context_window(&self) -> usize {
        200_000
    }

    fn wire_format(&self) -> WireFormat {
        self.wire_format
    }

    async fn stream(
        &self,
        _request: &ProviderRequest,
        _options: &StreamOptions,
    ) -> Result<ChunkStream, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let response = {
            let responses = self.responses.lock();
            responses.get(idx).cloned()
        };

        let Some(response) = response else {
            return Err(ProviderError::Rejected {
                status: 400,
                body: format!("MockProvider: no response configured for call {idx}"),
            });
        };

        resolve_response(response).await
    }
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_response(response: MockResponse) -> Result<ChunkStream, ProviderError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(chunks) => {
                let items: Vec<Result<StreamChunk, ProviderError>> =
                    chunks.into_iter().map(Ok).collect();
                return Ok(Box::pin(stream::iter(items)));
            }
            MockResponse::StreamThenError(chunks, error) => {
                let mut items: Vec<Result<StreamChunk, ProviderError>> =
                    chunks.into_iter().map(Ok).collect();
                items.push(Err(error));
                return Ok(Box::pin(stream::iter(items)));
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
