//! 工具调用 JSON Schema 生成（schemars）
//!
//! 用于将「合法 tool call」的 JSON 结构注入 system prompt，减少模型输出格式错误。

use schemars::{schema_for, JsonSchema};
use serde_json::Value;
use std::collections::BTreeMap;

/// 工具调用请求格式：与解析器接受的 `{"tool": "...", "args": {...}}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，必须是候选工具之一
    pub tool: String,
    /// 工具参数，结构由该工具的 input schema 决定
    pub args: BTreeMap<String, Value>,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// 无参数工具使用的空对象 schema
pub fn empty_object_schema() -> Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

/// 由参数名列表生成「全部为字符串且必填」的简单 schema（插件与 prompt 模板使用）
pub fn string_params_schema(params: &[String]) -> Value {
    let properties: serde_json::Map<String, Value> = params
        .iter()
        .map(|p| (p.clone(), serde_json::json!({ "type": "string" })))
        .collect();
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_mentions_tool_and_args() {
        let s = tool_call_schema_json();
        assert!(s.contains("\"tool\""));
        assert!(s.contains("\"args\""));
    }

    #[test]
    fn test_string_params_schema() {
        let s = string_params_schema(&["target".to_string()]);
        assert_eq!(s["properties"]["target"]["type"], "string");
        assert_eq!(s["required"][0], "target");
    }
}
