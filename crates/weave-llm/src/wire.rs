use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use weave_core::turns::{Role, Segment, Turn, TurnContent};

use crate::provider::{ProviderRequest, StreamOptions, ToolChoice};

/// The two structural contracts a provider may impose on the outgoing
/// turn sequence.
///
/// `ToolRole`: tool calls ride as a list on the assistant message, with
/// results as separate `tool`-role messages keyed by invocation id, and
/// call arguments serialized as a JSON string.
///
/// `InlineSegments`: tool calls are typed blocks inside the assistant
/// message content, with results as typed blocks inside a `user`-role
/// message, and call arguments kept as a JSON object.
///
/// The canonical `Turn` model is the source from which both are derived;
/// arguments stay structured internally and are only stringified here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    ToolRole,
    InlineSegments,
}

/// Render a full request body for the given wire format.
pub fn build_request_body(
    request: &ProviderRequest,
    options: &StreamOptions,
    model: &str,
    format: WireFormat,
) -> Value {
    match format {
        WireFormat::ToolRole => build_tool_role_body(request, options, model),
        WireFormat::InlineSegments => build_inline_body(request, options, model),
    }
}

// --- Variant A: tool-role wire format ---

fn build_tool_role_body(request: &ProviderRequest, options: &StreamOptions, model: &str) -> Value {
    let mut body = json!({
        "model": model,
        "stream": true,
    });

    if let Some(max) = options.max_tokens {
        body["max_tokens"] = json!(max);
    }
    if let Some(temp) = options.temperature {
        body["temperature"] = json!(temp);
    }

    let mut messages = Vec::new();
    if let Some(system) = &request.system {
        messages.push(json!({"role": "system", "content": system}));
    }
    for turn in &request.turns {
        messages.push(tool_role_message(turn));
    }
    body["messages"] = json!(messages);

    if !request.tools.is_empty() && options.tool_choice != ToolChoice::None {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    }
                })
            })
            .collect();
        body["tools"] = json!(tools);
        body["tool_choice"] = json!(options.tool_choice.as_str());
    }

    body
}

fn tool_role_message(turn: &Turn) -> Value {
    match turn.role {
        Role::System => json!({"role": "system", "content": turn.text_content()}),
        Role::User => json!({"role": "user", "content": turn.text_content()}),
        Role::Assistant => {
            let text = turn.text_content();
            let content = if text.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            };
            if turn.invocations.is_empty() {
                json!({"role": "assistant", "content": content})
            } else {
                let tool_calls: Vec<Value> = turn
                    .invocations
                    .iter()
                    .map(|inv| {
                        json!({
                            "id": inv.id,
                            "type": "function",
                            "function": {
                                "name": inv.tool_name,
                                // Arguments cross the wire as a JSON string
                                // in this variant.
                                "arguments": inv.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                json!({"role": "assistant", "content": content, "tool_calls": tool_calls})
            }
        }
        Role::Tool => {
            let (output, _is_error) = tool_output(turn);
            json!({
                "role": "tool",
                "tool_call_id": turn.invocation_id,
                "content": output_as_string(&output),
            })
        }
    }
}

// --- Variant B: inline-segment wire format ---

fn build_inline_body(request: &ProviderRequest, options: &StreamOptions, model: &str) -> Value {
    let mut body = json!({
        "model": model,
        "stream": true,
        "max_tokens": options.max_tokens.unwrap_or(8192),
    });

    if let Some(temp) = options.temperature {
        body["temperature"] = json!(temp);
    }

    // System turns fold into the system string; this format has no system
    // role inside `messages`.
    let mut system_parts: Vec<String> = Vec::new();
    if let Some(system) = &request.system {
        system_parts.push(system.clone());
    }

    let mut messages = Vec::new();
    for turn in &request.turns {
        match turn.role {
            Role::System => system_parts.push(turn.text_content()),
            Role::User => messages.push(inline_user_message(turn)),
            Role::Assistant => messages.push(inline_assistant_message(turn)),
            Role::Tool => messages.push(inline_tool_result(turn)),
        }
    }
    if !system_parts.is_empty() {
        body["system"] = json!(system_parts.join("\n\n"));
    }
    body["messages"] = json!(messages);

    if !request.tools.is_empty() && options.tool_choice != ToolChoice::None {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters_schema,
                })
            })
            .collect();
        body["tools"] = json!(tools);
        body["tool_choice"] = match options.tool_choice {
            ToolChoice::Auto => json!({"type": "auto"}),
            ToolChoice::Required => json!({"type": "any"}),
            ToolChoice::None => Value::Null,
        };
    }

    body
}

fn inline_user_message(turn: &Turn) -> Value {
    let mut blocks = vec![json!({"type": "text", "text": turn.text_content()})];

    // Packed history is a cache block: mark its last content block so the
    // provider can cache the prefix.
    if turn.is_packed() {
        if let Some(last) = blocks.last_mut() {
            last["cache_control"] = json!({"type": "ephemeral"});
        }
    }

    json!({"role": "user", "content": blocks})
}

fn inline_assistant_message(turn: &Turn) -> Value {
    let mut blocks = Vec::new();

    let text = turn.text_content();
    if !text.is_empty() {
        blocks.push(json!({"type": "text", "text": text}));
    }
    for inv in &turn.invocations {
        blocks.push(json!({
            "type": "tool_use",
            "id": inv.id,
            "name": inv.tool_name,
            "input": inv.arguments,
        }));
    }

    json!({"role": "assistant", "content": blocks})
}

fn inline_tool_result(turn: &Turn) -> Value {
    let (output, is_error) = tool_output(turn);
    json!({
        "role": "user",
        "content": [{
            "type": "tool_result",
            "tool_use_id": turn.invocation_id,
            "content": [{"type": "text", "text": output_as_string(&output)}],
            "is_error": is_error,
        }]
    })
}

// --- Shared helpers ---

fn tool_output(turn: &Turn) -> (Value, bool) {
    if let TurnContent::Segments { segments } = &turn.content {
        for segment in segments {
            if let Segment::ToolResult { output, is_error, .. } = segment {
                return (output.clone(), *is_error);
            }
        }
    }
    (Value::String(turn.text_content()), false)
}

fn output_as_string(output: &Value) -> String {
    match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
