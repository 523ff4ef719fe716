use std::collections::BTreeMap;

use serde_json::Value;

use weave_core::ids::InvocationId;
use weave_core::stream::ToolCallFragment;
use weave_core::turns::Invocation;

/// Completion state reported after each observed fragment.
#[derive(Clone, Debug, PartialEq)]
pub enum Completion {
    Incomplete,
    Complete(Invocation),
}

/// Assembles fragmented tool-call descriptors into complete, validated
/// invocations. One record per stream index; owned exclusively by one
/// orchestrator instance — never shared across conversations.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    records: BTreeMap<usize, PendingCall>,
}

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
    reported: bool,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the fragment to its index's record and re-check completion.
    ///
    /// A record completes exactly once: when its accumulated argument
    /// text parses as a JSON object (a bare string or a failed parse is
    /// never "good enough to execute") and both id and name are present.
    pub fn observe(&mut self, fragment: &ToolCallFragment) -> Completion {
        let record = self.records.entry(fragment.index).or_default();

        if let Some(id) = &fragment.id {
            record.id.push_str(id);
        }
        if let Some(name) = &fragment.name {
            record.name.push_str(name);
        }
        if let Some(arguments) = &fragment.arguments {
            record.arguments.push_str(arguments);
        }

        if record.reported {
            return Completion::Incomplete;
        }

        match try_complete(record) {
            Some(invocation) => {
                record.reported = true;
                Completion::Complete(invocation)
            }
            None => Completion::Incomplete,
        }
    }

    /// Indices that never reached completion (truncated stream).
    pub fn unfinished(&self) -> Vec<usize> {
        self.records
            .iter()
            .filter(|(_, r)| !r.reported)
            .map(|(idx, _)| *idx)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn try_complete(record: &PendingCall) -> Option<Invocation> {
    if record.id.is_empty() || record.name.is_empty() {
        return None;
    }

    // Explicit two-outcome parse: a failure or a non-object result both
    // leave the record incomplete.
    let parsed: Value = serde_json::from_str(&record.arguments).ok()?;
    if !parsed.is_object() {
        return None;
    }

    Some(Invocation {
        id: InvocationId::from_raw(&record.id),
        tool_name: record.name.clone(),
        arguments: unwrap_double_encoded(parsed),
    })
}

/// Some providers double-encode argument values: a string field whose
/// content is itself a JSON object. Unwrap one level only — repeated
/// unwrapping would loop forever on adversarial input.
fn unwrap_double_encoded(mut arguments: Value) -> Value {
    if let Value::Object(map) = &mut arguments {
        for value in map.values_mut() {
            if let Value::String(s) = value {
                if let Ok(inner @ Value::Object(_)) = serde_json::from_str::<Value>(s) {
                    *value = inner;
                }
            }
        }
    }
    arguments
}
