use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{InvocationId, TurnId};

/// One persisted entry in a conversation thread.
///
/// Turns are immutable after append with one exception: a tool turn's
/// `linked_turn_id` may be attached later, once the owning assistant turn
/// is known.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub role: Role,
    pub content: TurnContent,
    /// Tool calls requested by this turn. Assistant turns only.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub invocations: Vec<Invocation>,
    /// The invocation this turn answers. Tool turns only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<InvocationId>,
    /// The assistant turn that owns the answered invocation. Tool turns only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub linked_turn_id: Option<TurnId>,
    #[serde(default, skip_serializing_if = "TurnMetadata::is_empty")]
    pub metadata: TurnMetadata,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "tool" => Ok(Self::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// Turn content is either plain text or a sequence of typed segments —
/// never an untyped runtime shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnContent {
    Text { text: String },
    Segments { segments: Vec<Segment> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Segment {
    Text {
        text: String,
    },
    ToolUse {
        invocation: Invocation,
    },
    ToolResult {
        invocation_id: InvocationId,
        output: Value,
        is_error: bool,
    },
}

/// One tool call requested by the model. `arguments` is always a fully
/// parsed JSON object — partially accumulated text never reaches this type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub id: InvocationId,
    pub tool_name: String,
    pub arguments: Value,
}

/// Result of executing one invocation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub invocation_id: InvocationId,
    pub success: bool,
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(invocation_id: InvocationId, output: impl Into<Value>) -> Self {
        Self {
            invocation_id,
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(invocation_id: InvocationId, error: impl Into<String>) -> Self {
        Self {
            invocation_id,
            success: false,
            output: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Structural markers that must round-trip losslessly through the store.
///
/// `packed` is the cache-block marker: a packed turn is validated history
/// and bypasses compatibility filtering. `carried_invocations` preserves
/// the identities of tool turns that were merged away by compression, so
/// later stages can still match them against open invocations.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetadata {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub packed: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub carried_invocations: Vec<InvocationId>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub flagged: bool,
}

impl TurnMetadata {
    pub fn is_empty(&self) -> bool {
        !self.packed && !self.compressed && !self.flagged && self.carried_invocations.is_empty()
    }
}

// --- Convenience constructors ---

impl Turn {
    fn base(role: Role, content: TurnContent) -> Self {
        Self {
            id: TurnId::new(),
            role,
            content,
            invocations: Vec::new(),
            invocation_id: None,
            linked_turn_id: None,
            metadata: TurnMetadata::default(),
            created_at: Utc::now(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::base(Role::System, TurnContent::Text { text: text.into() })
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::base(Role::User, TurnContent::Text { text: text.into() })
    }

    pub fn assistant(text: impl Into<String>, invocations: Vec<Invocation>) -> Self {
        let mut turn = Self::base(Role::Assistant, TurnContent::Text { text: text.into() });
        turn.invocations = invocations;
        turn
    }

    /// Build the tool turn answering one outcome. `linked_turn_id` is
    /// attached separately, once resolved against the log.
    pub fn tool_outcome(outcome: &ToolOutcome) -> Self {
        let mut turn = Self::base(
            Role::Tool,
            TurnContent::Segments {
                segments: vec![Segment::ToolResult {
                    invocation_id: outcome.invocation_id.clone(),
                    output: outcome.output.clone(),
                    is_error: !outcome.success,
                }],
            },
        );
        turn.invocation_id = Some(outcome.invocation_id.clone());
        turn
    }

    pub fn is_packed(&self) -> bool {
        self.metadata.packed
    }

    pub fn has_invocations(&self) -> bool {
        !self.invocations.is_empty()
    }

    /// Concatenated text of all plain-text content.
    pub fn text_content(&self) -> String {
        match &self.content {
            TurnContent::Text { text } => text.clone(),
            TurnContent::Segments { segments } => segments
                .iter()
                .filter_map(|s| match s {
                    Segment::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}
