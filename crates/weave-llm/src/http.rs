use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use serde::Deserialize;
use tracing::instrument;

use weave_core::errors::ProviderError;
use weave_core::stream::{ChunkDelta, FinishReason, StreamChunk, ToolCallFragment};

use crate::provider::{ChatProvider, ChunkStream, ProviderRequest, StreamOptions};
use crate::wire::{self, WireFormat};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Streaming HTTP adapter for providers speaking the tool-role chunk
/// protocol: a POST returning `data:` lines, each carrying a delta with
/// optional text and tool-call fragments, terminated by a finish reason.
pub struct HttpProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    context_window: usize,
}

impl HttpProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            context_window: 200_000,
        }
    }

    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = window;
        self
    }
}

#[async_trait]
impl ChatProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    fn wire_format(&self) -> WireFormat {
        WireFormat::ToolRole
    }

    #[instrument(skip(self, request, options), fields(model = %self.model))]
    async fn stream(
        &self,
        request: &ProviderRequest,
        options: &StreamOptions,
    ) -> Result<ChunkStream, ProviderError> {
        let body = wire::build_request_body(request, options, &self.model, WireFormat::ToolRole);
        let url = format!("{}/chat/completions", self.base_url);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        Ok(Box::pin(DeltaStream::new(resp.bytes_stream())))
    }
}

/// Parse one `data:` payload into chunks. A payload may yield both a
/// delta and a finish chunk; `[DONE]` and unparseable keep-alives yield
/// nothing.
pub fn parse_data_payload(data: &str) -> Vec<StreamChunk> {
    if data.trim() == "[DONE]" {
        return Vec::new();
    }
    let parsed: WireChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };

    let mut chunks = Vec::new();
    for choice in parsed.choices {
        let mut delta = ChunkDelta::default();
        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                delta.text = Some(text);
            }
        }
        for tc in choice.delta.tool_calls.unwrap_or_default() {
            let mut fragment = ToolCallFragment::new(tc.index);
            fragment.id = tc.id;
            if let Some(f) = tc.function {
                fragment.name = f.name;
                fragment.arguments = f.arguments;
            }
            delta.tool_calls.push(fragment);
        }
        if delta.text.is_some() || !delta.tool_calls.is_empty() {
            chunks.push(StreamChunk::Delta(delta));
        }
        if let Some(reason) = choice.finish_reason.as_deref().and_then(FinishReason::from_wire) {
            chunks.push(StreamChunk::Finish { reason });
        }
    }
    chunks
}

/// Wraps a byte stream and yields parsed chunks. Includes an idle
/// timeout — if no data arrives within the window, the stream yields a
/// `StreamInterrupted` error.
struct DeltaStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: String,
    pending: VecDeque<Result<StreamChunk, ProviderError>>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    done: bool,
}

impl DeltaStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self::with_idle_timeout(byte_stream, STREAM_IDLE_TIMEOUT)
    }

    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: String::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            done: false,
        }
    }

    fn drain_buffer_lines(&mut self) {
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim().to_string();
            self.buffer.drain(..=pos);

            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                for chunk in parse_data_payload(data.trim_start()) {
                    self.pending.push_back(Ok(chunk));
                }
            }
        }
    }
}

impl Stream for DeltaStream {
    type Item = Result<StreamChunk, ProviderError>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return std::task::Poll::Ready(Some(item));
            }
            if self.done {
                return std::task::Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                std::task::Poll::Ready(Some(Ok(bytes))) => {
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    self.buffer.push_str(&text);
                    self.drain_buffer_lines();
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return std::task::Poll::Ready(Some(Err(ProviderError::StreamInterrupted(
                        e.to_string(),
                    ))));
                }
                std::task::Poll::Ready(None) => {
                    self.done = true;
                    if !self.buffer.ends_with('\n') {
                        self.buffer.push('\n');
                    }
                    self.drain_buffer_lines();
                }
                std::task::Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.done = true;
                        return std::task::Poll::Ready(Some(Err(
                            ProviderError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        )));
                    }
                    return std::task::Poll::Pending;
                }
            }
        }
    }
}

// --- Deserialization types for the chunk protocol ---

#[derive(Deserialize)]
struct WireChunk {
    choices: Vec<WireChoice>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: WireDelta,
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct WireDelta {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCallDelta>>,
}

#[derive(Deserialize)]
struct WireToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<WireFunctionDelta>,
}

#[derive(Deserialize)]
struct WireFunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn parse_text_delta() {
        let chunks = parse_data_payload(
            r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#,
        );
        assert_eq!(chunks, vec![StreamChunk::text("Hello")]);
    }

    #[test]
    fn parse_tool_call_fragments() {
        let chunks = parse_data_payload(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"web_search","arguments":"{\"que"}}]},"finish_reason":null}]}"#,
        );
        assert_eq!(chunks.len(), 1);
        match &chunks[0] {
            StreamChunk::Delta(delta) => {
                let frag = &delta.tool_calls[0];
                assert_eq!(frag.index, 0);
                assert_eq!(frag.id.as_deref(), Some("call_1"));
                assert_eq!(frag.name.as_deref(), Some("web_search"));
                assert_eq!(frag.arguments.as_deref(), Some("{\"que"));
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn parse_finish_reason() {
        let chunks = parse_data_payload(
            r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#,
        );
        assert_eq!(
            chunks,
            vec![StreamChunk::finish(FinishReason::ToolCalls)]
        );
    }

    #[test]
    fn parse_delta_and_finish_together() {
        let chunks = parse_data_payload(
            r#"{"choices":[{"delta":{"content":"bye"},"finish_reason":"stop"}]}"#,
        );
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], StreamChunk::text("bye"));
        assert_eq!(chunks[1], StreamChunk::finish(FinishReason::Stop));
    }

    #[test]
    fn done_marker_yields_nothing() {
        assert!(parse_data_payload("[DONE]").is_empty());
        assert!(parse_data_payload("not json at all").is_empty());
    }

    #[tokio::test]
    async fn delta_stream_parses_lines_across_chunk_boundaries() {
        let payload = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\ndata: {\"choices\":[{\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n";
        // Split mid-line to exercise buffering.
        let (a, b) = payload.split_at(40);
        let byte_stream = futures::stream::iter(vec![
            Ok::<_, reqwest::Error>(bytes::Bytes::from(a.to_string())),
            Ok(bytes::Bytes::from(b.to_string())),
        ]);

        let stream = DeltaStream::new(byte_stream);
        let chunks: Vec<_> = stream.collect().await;
        let chunks: Vec<StreamChunk> = chunks.into_iter().map(|c| c.unwrap()).collect();

        assert_eq!(
            chunks,
            vec![
                StreamChunk::text("Hel"),
                StreamChunk::text("lo"),
                StreamChunk::finish(FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn delta_stream_handles_trailing_line_without_newline() {
        let byte_stream = futures::stream::iter(vec![Ok::<_, reqwest::Error>(bytes::Bytes::from(
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}",
        ))]);
        let stream = DeltaStream::new(byte_stream);
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(
            chunks[0],
            Ok(StreamChunk::Finish { reason: FinishReason::Stop })
        ));
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_no_data() {
        tokio::time::pause();

        let byte_stream = futures::stream::pending::<Result<bytes::Bytes, reqwest::Error>>();
        let mut stream = Box::pin(DeltaStream::with_idle_timeout(
            byte_stream,
            Duration::from_secs(5),
        ));

        tokio::time::advance(Duration::from_secs(6)).await;

        let item = stream.next().await;
        assert!(
            matches!(&item, Some(Err(ProviderError::StreamInterrupted(msg))) if msg.contains("idle timeout")),
            "expected idle timeout error, got: {item:?}"
        );
        // Stream terminates after the error.
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn provider_properties() {
        let provider = HttpProvider::new("https://api.example.com/v1", "key", "test-model")
            .with_context_window(128_000);
        assert_eq!(provider.name(), "http");
        assert_eq!(provider.model(), "test-model");
        assert_eq!(provider.context_window(), 128_000);
        assert_eq!(provider.wire_format(), WireFormat::ToolRole);
    }
}
