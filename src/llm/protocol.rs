//! 文本工具调用协议
//!
//! 候选工具与调用格式渲染进一条 system 消息；模型回复中的 `{"tool": ..., "args": {...}}`
//! （裸 JSON 或 ```json 代码块）解析为 InvokeTool，纯文本解析为 FinalAnswer。

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::llm::{BackendError, Decision, ToolSpec};
use crate::tools::schema::tool_call_schema_json;

static FENCED_RE: OnceLock<Regex> = OnceLock::new();

/// 渲染候选工具目录与调用格式说明
pub fn render_tool_catalog(tools: &[ToolSpec], constraint: Option<&str>) -> String {
    let mut out = String::from("## Available tools\n");
    for t in tools {
        out.push_str(&format!("- {}: {}\n  parameters: {}\n", t.name, t.description, t.parameters));
    }
    if let Some(only) = constraint {
        out.push_str(&format!("\nThis step must be completed by calling the tool `{only}`.\n"));
    }
    out.push_str("\n## Tool call format\nReply with a single JSON object matching this schema:\n");
    out.push_str(&tool_call_schema_json());
    out.push_str("\nExample: {\"tool\": \"echo\", \"args\": {\"text\": \"hello\"}}\n");
    out
}

/// 解析模型回复
pub fn parse_reply(output: &str) -> Result<Decision, BackendError> {
    let trimmed = output.trim();

    let fenced = FENCED_RE
        .get_or_init(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").unwrap())
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str());

    let json_str = match fenced {
        Some(s) => s,
        None => match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if start < end => &trimmed[start..=end],
            _ => return Ok(Decision::FinalAnswer(trimmed.to_string())),
        },
    };

    let value: Value = match serde_json::from_str(json_str) {
        Ok(v) => v,
        Err(e) => {
            if json_str.contains("\"tool\"") {
                return Err(BackendError::Protocol(format!("{e}: {json_str}")));
            }
            return Ok(Decision::FinalAnswer(trimmed.to_string()));
        }
    };

    let Some(obj) = value.as_object() else {
        return Ok(Decision::FinalAnswer(trimmed.to_string()));
    };
    let tool = match obj.get("tool") {
        None => return Ok(Decision::FinalAnswer(trimmed.to_string())),
        Some(Value::String(s)) if s.trim().is_empty() => {
            return Ok(Decision::FinalAnswer(trimmed.to_string()))
        }
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => {
            return Err(BackendError::Protocol(format!("\"tool\" must be a string, got {other}")))
        }
    };

    let arguments = match obj.get("args").or_else(|| obj.get("arguments")) {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(v @ Value::Object(_)) => v.clone(),
        Some(other) => {
            return Err(BackendError::Protocol(format!("\"args\" must be an object, got {other}")))
        }
    };

    Ok(Decision::InvokeTool { tool, arguments })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bare_json_tool_call() {
        let d = parse_reply(r#"{"tool": "echo", "args": {"text": "hi"}}"#).unwrap();
        assert_eq!(
            d,
            Decision::InvokeTool {
                tool: "echo".into(),
                arguments: json!({"text": "hi"})
            }
        );
    }

    #[test]
    fn test_fenced_json_with_prose() {
        let out = "I'll build it now.\n```json\n{\"tool\": \"build\", \"args\": {}}\n```\nDone.";
        match parse_reply(out).unwrap() {
            Decision::InvokeTool { tool, .. } => assert_eq!(tool, "build"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_plain_text_is_final_answer() {
        let d = parse_reply("The image is built.").unwrap();
        assert_eq!(d, Decision::FinalAnswer("The image is built.".into()));
    }

    #[test]
    fn test_malformed_tool_json_is_protocol_error() {
        let err = parse_reply(r#"{"tool": "echo", "args": {"text": }"#).unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)));
    }

    #[test]
    fn test_other_tool_is_a_decision_not_an_error() {
        // 是否越界由状态机按候选集判断
        let d = parse_reply(r#"{"tool": "shell", "args": {}}"#).unwrap();
        assert!(matches!(d, Decision::InvokeTool { ref tool, .. } if tool == "shell"));
    }

    #[test]
    fn test_missing_args_defaults_to_empty_object() {
        let d = parse_reply(r#"{"tool": "echo"}"#).unwrap();
        assert_eq!(
            d,
            Decision::InvokeTool {
                tool: "echo".into(),
                arguments: json!({})
            }
        );
    }

    #[test]
    fn test_catalog_lists_tools() {
        let tools = vec![ToolSpec {
            name: "echo".into(),
            description: "Echo text".into(),
            parameters: json!({"type": "object"}),
        }];
        let s = render_tool_catalog(&tools, Some("echo"));
        assert!(s.contains("- echo: Echo text"));
        assert!(s.contains("must be completed by calling the tool `echo`"));
    }
}
