//! Inline tool-call extraction from assistant text.
//!
//! The model emits tool calls as bare JSON objects mixed into prose.
//! This scanner walks the text, attempts a JSON parse at every
//! top-level `{`, and keeps the objects that look like tool calls.

use serde_json::Value;

use pv_domain::tool::ToolCall;

/// Parse every tool-call object out of a block of assistant text.
///
/// Two accepted shapes:
/// - `{"tool_name": "...", "service_name"?: "...", ...}` — MCP call;
///   `service_name` defaults to the tool name.
/// - `{"agentType": "agent", "agent_name": "...", "prompt": "..."}` —
///   agent handoff.
///
/// Full-width braces (CJK input methods) are skipped rather than
/// parsed. Call ids are allocated sequentially as `call_<n>`.
pub fn parse_tool_calls(content: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();
    let mut pos = 0;

    while let Some(offset) = content[pos..].find(['{', '｛']) {
        let start = pos + offset;
        // Advance past full-width braces; standard model output does
        // not use them for JSON.
        if content[start..].starts_with('｛') {
            pos = start + '｛'.len_utf8();
            continue;
        }

        let mut stream = serde_json::Deserializer::from_str(&content[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let consumed = stream.byte_offset().max(1);
                pos = start + consumed;
                if let Value::Object(_) = value {
                    process_candidate(value, &mut calls);
                }
            }
            _ => {
                pos = start + 1;
            }
        }
    }

    calls
}

fn process_candidate(value: Value, calls: &mut Vec<ToolCall>) {
    let agent_type = value
        .get("agentType")
        .and_then(|v| v.as_str())
        .unwrap_or("mcp")
        .to_lowercase();

    if agent_type == "agent" {
        let has_agent = value.get("agent_name").and_then(|v| v.as_str()).is_some();
        let has_prompt = value.get("prompt").and_then(|v| v.as_str()).is_some();
        if has_agent && has_prompt {
            let id = format!("call_{}", calls.len() + 1);
            calls.push(ToolCall {
                id,
                name: "agent_call".to_string(),
                args: value,
            });
        }
        return;
    }

    let Some(tool_name) = value.get("tool_name").and_then(|v| v.as_str()).map(str::to_string)
    else {
        return;
    };

    let mut args = value;
    if let Value::Object(map) = &mut args {
        if !map.contains_key("service_name") {
            map.insert(
                "service_name".to_string(),
                Value::String(tool_name.clone()),
            );
        }
        map.entry("agentType".to_string())
            .or_insert_with(|| Value::String("mcp".to_string()));
    }

    let id = format!("call_{}", calls.len() + 1);
    calls.push(ToolCall {
        id,
        name: tool_name,
        args,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multiple_calls_in_prose() {
        let content = r#"
        Thinking about weather...
        { "tool_name": "search", "args": { "query": "weather" } }
        Also checking calendar...
        { "tool_name": "calendar", "action": "list" }
        "#;
        let calls = parse_tool_calls(content);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[1].name, "calendar");
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[1].id, "call_2");
    }

    #[test]
    fn service_name_defaults_to_tool_name() {
        let calls = parse_tool_calls(r#"{"tool_name": "search", "q": "x"}"#);
        assert_eq!(calls[0].args["service_name"], "search");
        assert_eq!(calls[0].args["agentType"], "mcp");
    }

    #[test]
    fn explicit_service_name_is_kept() {
        let calls =
            parse_tool_calls(r#"{"tool_name": "press_keys", "service_name": "desktop"}"#);
        assert_eq!(calls[0].args["service_name"], "desktop");
    }

    #[test]
    fn agent_handoff_shape() {
        let calls = parse_tool_calls(
            r#"{"agentType": "agent", "agent_name": "researcher", "prompt": "dig in"}"#,
        );
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "agent_call");
        assert_eq!(calls[0].args["agent_name"], "researcher");
    }

    #[test]
    fn agent_handoff_without_prompt_is_ignored() {
        let calls = parse_tool_calls(r#"{"agentType": "agent", "agent_name": "researcher"}"#);
        assert!(calls.is_empty());
    }

    #[test]
    fn nested_braces_parse_as_one_object() {
        let calls =
            parse_tool_calls(r#"{"tool_name": "search", "filters": {"site": {"lang": "en"}}}"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args["filters"]["site"]["lang"], "en");
    }

    #[test]
    fn objects_without_tool_name_are_ignored() {
        let calls = parse_tool_calls(r#"The answer is {"recall": true} as requested."#);
        assert!(calls.is_empty());
    }

    #[test]
    fn broken_json_is_skipped() {
        let calls = parse_tool_calls(r#"{broken {"tool_name": "search"}"#);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
    }

    #[test]
    fn full_width_braces_are_skipped() {
        let calls = parse_tool_calls("｛不是调用｝ {\"tool_name\": \"search\"}");
        assert_eq!(calls.len(), 1);
    }
}
