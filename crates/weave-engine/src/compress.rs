use tracing::debug;

use weave_core::ids::InvocationId;
use weave_core::turns::{Role, Segment, Turn, TurnContent};

/// Configuration for the context compressor.
#[derive(Clone, Debug)]
pub struct CompressorConfig {
    /// Most recent user turns kept intact.
    pub keep_recent_user: usize,
    /// Most recent assistant turns kept intact.
    pub keep_recent_assistant: usize,
    /// Max bytes of an old tool output before truncation.
    pub max_tool_output: usize,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            keep_recent_user: 4,
            keep_recent_assistant: 4,
            max_tool_output: 2048,
        }
    }
}

/// Rewrites old turns into a smaller token footprint while preserving the
/// identity information later stages need.
///
/// Pure with respect to the conversation log: operates on a copy built
/// for one outgoing request and never writes back.
pub struct ContextCompressor {
    config: CompressorConfig,
}

impl ContextCompressor {
    pub fn new(config: CompressorConfig) -> Self {
        Self { config }
    }

    /// Compress `turns` to fit `token_budget`. Recent turns pass through
    /// byte-identical; older turns are first truncated, then merged into
    /// a single user-role transcript turn if truncation is not enough.
    pub fn compress(&self, turns: &[Turn], token_budget: usize) -> Vec<Turn> {
        if estimate_turns_tokens(turns) <= token_budget {
            return turns.to_vec();
        }

        let boundary = self.tail_boundary(turns);
        if boundary == 0 {
            return turns.to_vec();
        }

        // Pass 1: truncate long tool outputs in the old region.
        let mut result: Vec<Turn> = Vec::with_capacity(turns.len());
        for (i, turn) in turns.iter().enumerate() {
            if i < boundary && turn.role == Role::Tool && !turn.is_packed() {
                result.push(truncate_tool_output(turn, self.config.max_tool_output));
            } else {
                result.push(turn.clone());
            }
        }

        if estimate_turns_tokens(&result) <= token_budget {
            debug!(boundary, "tool-output truncation was sufficient");
            return result;
        }

        // Pass 2: merge the old region into one transcript turn. System
        // and packed turns are not merged; they pass through in place.
        let mut merged_text: Vec<String> = Vec::new();
        let mut carried: Vec<InvocationId> = Vec::new();
        let mut output: Vec<Turn> = Vec::new();
        let mut merge_slot: Option<usize> = None;

        for (i, turn) in result.iter().enumerate() {
            if i >= boundary || turn.role == Role::System || turn.is_packed() {
                output.push(turn.clone());
                continue;
            }

            if merge_slot.is_none() {
                merge_slot = Some(output.len());
            }
            merged_text.push(render_transcript_line(turn));
            if let Some(invocation_id) = &turn.invocation_id {
                carried.push(invocation_id.clone());
            }
            carried.extend(turn.metadata.carried_invocations.iter().cloned());
        }

        if let Some(slot) = merge_slot {
            let mut merged = Turn::user_text(merged_text.join("\n\n"));
            merged.metadata.compressed = true;
            merged.metadata.carried_invocations = carried;
            output.insert(slot, merged);
        }

        debug!(
            before = turns.len(),
            after = output.len(),
            "merged old turns into transcript"
        );
        output
    }

    /// Index where the kept tail begins: enough recent user and
    /// assistant turns, moved back so a tool turn never starts the tail
    /// split from the assistant turn that owns it.
    fn tail_boundary(&self, turns: &[Turn]) -> usize {
        let mut users = 0;
        let mut assistants = 0;
        let mut boundary = turns.len();

        for (i, turn) in turns.iter().enumerate().rev() {
            match turn.role {
                Role::User => users += 1,
                Role::Assistant => assistants += 1,
                _ => {}
            }
            boundary = i;
            if users >= self.config.keep_recent_user
                && assistants >= self.config.keep_recent_assistant
            {
                break;
            }
        }

        while boundary > 0 && turns[boundary].role == Role::Tool {
            boundary -= 1;
        }
        boundary
    }
}

impl Default for ContextCompressor {
    fn default() -> Self {
        Self::new(CompressorConfig::default())
    }
}

/// Approximate token count: chars / 4, plus a small per-turn overhead.
pub fn estimate_turn_tokens(turn: &Turn) -> usize {
    let mut total = 4;
    match &turn.content {
        TurnContent::Text { text } => total += text.len() / 4,
        TurnContent::Segments { segments } => {
            for segment in segments {
                total += match segment {
                    Segment::Text { text } => text.len() / 4,
                    Segment::ToolUse { invocation } => {
                        (invocation.tool_name.len() + invocation.arguments.to_string().len()) / 4
                    }
                    Segment::ToolResult { output, .. } => output.to_string().len() / 4,
                };
            }
        }
    }
    for invocation in &turn.invocations {
        total += (invocation.tool_name.len() + invocation.arguments.to_string().len()) / 4;
    }
    total
}

pub fn estimate_turns_tokens(turns: &[Turn]) -> usize {
    turns.iter().map(estimate_turn_tokens).sum()
}

/// Truncate a tool turn's output, appending an explicit marker. No-op if
/// the output fits.
fn truncate_tool_output(turn: &Turn, max_bytes: usize) -> Turn {
    let mut truncated = turn.clone();
    if let TurnContent::Segments { segments } = &mut truncated.content {
        for segment in segments {
            if let Segment::ToolResult { output, .. } = segment {
                let text = match output {
                    serde_json::Value::String(s) => s.clone(),
                    ref other => other.to_string(),
                };
                if text.len() > max_bytes {
                    let boundary = floor_char_boundary(&text, max_bytes);
                    *output = serde_json::Value::String(format!(
                        "{}\n[tool output truncated: {} -> {} bytes]",
                        &text[..boundary],
                        text.len(),
                        boundary
                    ));
                }
            }
        }
    }
    truncated
}

/// Human-readable transcript line for a merged or packed rendering of a
/// turn. The structural role of the output is carried in metadata, never
/// inferred from this text.
pub(crate) fn render_transcript_line(turn: &Turn) -> String {
    let label = match turn.role {
        Role::System => "System",
        Role::User => "User",
        Role::Assistant => "Assistant",
        Role::Tool => "Tool",
    };

    let mut text = turn.text_content();
    if turn.role == Role::Tool {
        if let TurnContent::Segments { segments } = &turn.content {
            for segment in segments {
                if let Segment::ToolResult { output, .. } = segment {
                    text = match output {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                }
            }
        }
    }
    if turn.role == Role::Assistant && turn.has_invocations() {
        let names: Vec<&str> = turn.invocations.iter().map(|i| i.tool_name.as_str()).collect();
        if text.is_empty() {
            text = format!("[called {}]", names.join(", "));
        } else {
            text = format!("{text}\n[called {}]", names.join(", "));
        }
    }

    format!("{label}: {text}")
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
