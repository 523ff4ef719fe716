use serde::{Deserialize, Serialize};

use crate::ids::{InvocationId, RunId, ThreadId};
use crate::stream::FinishReason;

/// Events emitted to the UI/transport collaborator while a run executes.
///
/// Only the persisted turns are authoritative; `ContentChunk` is the sole
/// event whose final accumulated value matters, and `ToolCallChunk` is
/// transient — it is never persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    #[serde(rename = "run_start")]
    RunStart { thread_id: ThreadId, run_id: RunId },

    #[serde(rename = "content_chunk")]
    ContentChunk { run_id: RunId, delta: String },

    #[serde(rename = "tool_call_chunk")]
    ToolCallChunk {
        run_id: RunId,
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        arguments_delta: Option<String>,
    },

    #[serde(rename = "tool_started")]
    ToolStarted {
        run_id: RunId,
        invocation_id: InvocationId,
        tool_name: String,
    },

    #[serde(rename = "tool_completed")]
    ToolCompleted {
        run_id: RunId,
        invocation_id: InvocationId,
        success: bool,
        duration_ms: u64,
    },

    #[serde(rename = "run_end")]
    RunEnd {
        run_id: RunId,
        #[serde(skip_serializing_if = "Option::is_none")]
        finish_reason: Option<FinishReason>,
        steps: u32,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStart { run_id, .. }
            | Self::ContentChunk { run_id, .. }
            | Self::ToolCallChunk { run_id, .. }
            | Self::ToolStarted { run_id, .. }
            | Self::ToolCompleted { run_id, .. }
            | Self::RunEnd { run_id, .. } => run_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStart { .. } => "run_start",
            Self::ContentChunk { .. } => "content_chunk",
            Self::ToolCallChunk { .. } => "tool_call_chunk",
            Self::ToolStarted { .. } => "tool_started",
            Self::ToolCompleted { .. } => "tool_completed",
            Self::RunEnd { .. } => "run_end",
        }
    }

    /// Transient events carry no durability guarantee.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ToolCallChunk { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_accessor() {
        let rid = RunId::new();
        let evt = RunEvent::ContentChunk {
            run_id: rid.clone(),
            delta: "hi".into(),
        };
        assert_eq!(evt.run_id(), &rid);
    }

    #[test]
    fn event_type_strings() {
        let evt = RunEvent::ToolStarted {
            run_id: RunId::new(),
            invocation_id: InvocationId::from_raw("call_1"),
            tool_name: "search".into(),
        };
        assert_eq!(evt.event_type(), "tool_started");
    }

    #[test]
    fn tool_call_chunk_is_transient() {
        let evt = RunEvent::ToolCallChunk {
            run_id: RunId::new(),
            index: 0,
            arguments_delta: Some("{".into()),
        };
        assert!(evt.is_transient());

        let evt = RunEvent::RunStart {
            thread_id: ThreadId::new(),
            run_id: RunId::new(),
        };
        assert!(!evt.is_transient());
    }

    #[test]
    fn serde_roundtrip() {
        let events = vec![
            RunEvent::RunStart {
                thread_id: ThreadId::new(),
                run_id: RunId::new(),
            },
            RunEvent::ToolCompleted {
                run_id: RunId::new(),
                invocation_id: InvocationId::from_raw("call_2"),
                success: false,
                duration_ms: 42,
            },
            RunEvent::RunEnd {
                run_id: RunId::new(),
                finish_reason: Some(FinishReason::Stop),
                steps: 3,
            },
        ];

        for evt in &events {
            let json = serde_json::to_string(evt).unwrap();
            let parsed: RunEvent = serde_json::from_str(&json).unwrap();
            let json2 = serde_json::to_string(&parsed).unwrap();
            assert_eq!(json, json2);
        }
    }
}
