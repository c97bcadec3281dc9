//! Backend-independent checks run by every message translator before any
//! network I/O.

use super::error::ProviderError;
use crate::types::{Message, Role, ToolDefinition};
use serde_json::Value;

/// Reject any role outside `user`/`assistant`/`tool`, and tool turns without
/// a `tool_name`.
pub fn validate_messages(messages: &[Message]) -> Result<(), ProviderError> {
    for msg in messages {
        match &msg.role {
            Role::User | Role::Assistant => {}
            Role::Tool => {
                tool_name(msg)?;
            }
            Role::Other(role) => return Err(ProviderError::invalid_role(role)),
        }
    }
    Ok(())
}

/// The non-empty `tool_name` of a tool turn.
pub fn tool_name(msg: &Message) -> Result<&str, ProviderError> {
    match msg.tool_name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(ProviderError::invalid_tool_result(
            "tool message is missing tool_name",
        )),
    }
}

/// Call id a tool result answers: the explicit `tool_call_id`, or the id of
/// the latest call with the same name among the preceding assistant turns.
pub fn resolve_tool_call_id(
    messages: &[Message],
    position: usize,
) -> Result<String, ProviderError> {
    let msg = &messages[position];
    if let Some(id) = msg.tool_call_id.as_deref().filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }
    let name = tool_name(msg)?;
    messages[..position]
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls.iter().rev())
        .find(|call| call.name == name)
        .map(|call| call.id.clone())
        .ok_or_else(|| {
            ProviderError::invalid_tool_result(&format!(
                "no preceding tool call named {:?} to bind the result to",
                name
            ))
        })
}

/// A schema is usable when it is a JSON object describing an object (an
/// absent `type` is read as `object`) whose `properties`, if present, is an
/// object too.
pub fn is_valid_tool(tool: &ToolDefinition) -> bool {
    if tool.name.trim().is_empty() {
        return false;
    }
    let Value::Object(schema) = &tool.parameters else {
        return false;
    };
    let type_ok = match schema.get("type") {
        None => true,
        Some(Value::String(t)) => t == "object",
        Some(_) => false,
    };
    let properties_ok = match schema.get("properties") {
        None => true,
        Some(p) => p.is_object(),
    };
    type_ok && properties_ok
}

/// Drop tool definitions whose schema is malformed. The rest of the tool set
/// keeps working and no error is surfaced.
pub fn usable_tools<'a>(
    provider: &'static str,
    tools: &'a [ToolDefinition],
) -> Vec<&'a ToolDefinition> {
    tools
        .iter()
        .filter(|tool| {
            let ok = is_valid_tool(tool);
            if !ok {
                tracing::debug!(provider, tool = %tool.name, "dropping tool with malformed parameter schema");
            }
            ok
        })
        .collect()
}

/// Decode a tool's JSON argument text; malformed text becomes an empty
/// object.
pub fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::Object(Default::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::error::ErrorCode;
    use crate::types::ToolCall;
    use serde_json::json;

    fn tool(name: &str, parameters: Value) -> ToolDefinition {
        ToolDefinition {
            name: name.into(),
            description: String::new(),
            parameters,
        }
    }

    #[test]
    fn system_role_in_messages_is_rejected() {
        let msgs = vec![Message::user("hi"), Message::new("system", "be nice")];
        let err = validate_messages(&msgs).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRole);
        assert!(err.message.contains("system"));
    }

    #[test]
    fn tool_message_without_name_is_rejected() {
        let msgs = vec![Message::new(Role::Tool, "result")];
        let err = validate_messages(&msgs).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidToolResult);
    }

    #[test]
    fn resolves_call_id_from_latest_matching_call() {
        let msgs = vec![
            Message::user("read it"),
            Message::assistant_with_tools(
                "",
                vec![
                    ToolCall { id: "a".into(), name: "file_read".into(), input: json!({}) },
                    ToolCall { id: "b".into(), name: "file_read".into(), input: json!({}) },
                ],
            ),
            Message::tool_result("file_read", "contents"),
        ];
        assert_eq!(resolve_tool_call_id(&msgs, 2).unwrap(), "b");
    }

    #[test]
    fn explicit_call_id_wins() {
        let msgs = vec![Message::tool_result("x", "r").with_tool_call_id("call_9")];
        assert_eq!(resolve_tool_call_id(&msgs, 0).unwrap(), "call_9");
    }

    #[test]
    fn unresolvable_call_id_is_invalid_tool_result() {
        let msgs = vec![Message::user("hi"), Message::tool_result("ghost", "r")];
        let err = resolve_tool_call_id(&msgs, 1).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidToolResult);
    }

    #[test]
    fn malformed_schemas_are_dropped() {
        let tools = vec![
            tool("ok", json!({"type": "object", "properties": {"path": {"type": "string"}}})),
            tool("no_type", json!({"properties": {}})),
            tool("string_schema", json!("not a schema")),
            tool("array_type", json!({"type": "array"})),
            tool("bad_props", json!({"type": "object", "properties": []})),
            tool("", json!({"type": "object"})),
        ];
        let names: Vec<_> = usable_tools("test", &tools).iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["ok", "no_type"]);
    }

    #[test]
    fn parse_arguments_tolerates_garbage() {
        assert_eq!(parse_arguments(r#"{"path":"a"}"#), json!({"path": "a"}));
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments("{oops"), json!({}));
    }
}
