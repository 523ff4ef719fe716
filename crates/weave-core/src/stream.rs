use serde::{Deserialize, Serialize};

/// One chunk of an incrementally delivered model response.
///
/// Ordering contract: any number of `Delta` chunks, then exactly one
/// `Finish`. A delta may carry a text fragment, tool-call fragments, or
/// both.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamChunk {
    Delta(ChunkDelta),
    Finish { reason: FinishReason },
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChunkDelta {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCallFragment>,
}

/// A partial update to the tool call at `index`. Fragments for the same
/// index accumulate; none of the optional fields is complete on its own.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ToolCallFragment {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    Cancelled,
    ToolCalls,
}

impl FinishReason {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "stop" => Some(Self::Stop),
            "length" => Some(Self::Length),
            "cancelled" => Some(Self::Cancelled),
            "tool_calls" => Some(Self::ToolCalls),
            _ => None,
        }
    }

    /// Whether generation stopped for a reason the orchestrator may resume
    /// from in a follow-up request.
    pub fn continues_run(&self) -> bool {
        matches!(self, Self::Length | Self::ToolCalls)
    }
}

impl StreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self::Delta(ChunkDelta {
            text: Some(delta.into()),
            tool_calls: Vec::new(),
        })
    }

    pub fn tool_fragment(fragment: ToolCallFragment) -> Self {
        Self::Delta(ChunkDelta {
            text: None,
            tool_calls: vec![fragment],
        })
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self::Finish { reason }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. })
    }
}

impl ToolCallFragment {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = Some(arguments.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(StreamChunk::finish(FinishReason::Stop).is_terminal());
        assert!(!StreamChunk::text("x").is_terminal());
    }

    #[test]
    fn finish_reason_from_wire() {
        assert_eq!(FinishReason::from_wire("stop"), Some(FinishReason::Stop));
        assert_eq!(FinishReason::from_wire("length"), Some(FinishReason::Length));
        assert_eq!(
            FinishReason::from_wire("tool_calls"),
            Some(FinishReason::ToolCalls)
        );
        assert_eq!(FinishReason::from_wire("content_filter"), None);
    }

    #[test]
    fn continuation_reasons() {
        assert!(FinishReason::Length.continues_run());
        assert!(FinishReason::ToolCalls.continues_run());
        assert!(!FinishReason::Stop.continues_run());
        assert!(!FinishReason::Cancelled.continues_run());
    }

    #[test]
    fn fragment_builder() {
        let frag = ToolCallFragment::new(2)
            .with_id("call_1")
            .with_name("search")
            .with_arguments("{\"q\"");
        assert_eq!(frag.index, 2);
        assert_eq!(frag.id.as_deref(), Some("call_1"));
        assert_eq!(frag.arguments.as_deref(), Some("{\"q\""));
    }

    #[test]
    fn finish_reason_serde() {
        let json = serde_json::to_string(&FinishReason::ToolCalls).unwrap();
        assert_eq!(json, r#""tool_calls""#);
        let parsed: FinishReason = serde_json::from_str(r#""length""#).unwrap();
        assert_eq!(parsed, FinishReason::Length);
    }
}
