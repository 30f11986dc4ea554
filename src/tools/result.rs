//! 工具结果约定
//!
//! 工具输出按约定分类为成功或失败：
//! - JSON 对象：`returncode` / `exit_code` 非 0、`status` 为 error|failure|failed、`is_error` 为真 → 失败
//! - 结构化检查未发现错误时，对完整输出（含 JSON）检查 `STATUS: FAILURE`、`CRITICAL ERROR`、`❌` → 失败
//! - 其它一律成功

use serde_json::Value;

const FAILURE_MARKERS: &[&str] = &["STATUS: FAILURE", "CRITICAL ERROR", "❌"];
const FAILURE_STATUSES: &[&str] = &["error", "failure", "failed"];

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(String),
    Failure(String),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolOutcome::Success(_))
    }

    pub fn text(&self) -> &str {
        match self {
            ToolOutcome::Success(s) | ToolOutcome::Failure(s) => s,
        }
    }
}

/// 按结果约定分类工具输出
pub fn classify(output: &str) -> ToolOutcome {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(output.trim()) {
        let nonzero = |key: &str| match obj.get(key) {
            Some(Value::Number(n)) => n.as_i64().map_or(true, |c| c != 0),
            Some(Value::String(s)) => s.trim().parse::<i64>().map_or(false, |c| c != 0),
            _ => false,
        };
        let status_failed = obj
            .get("status")
            .and_then(Value::as_str)
            .map(|s| FAILURE_STATUSES.contains(&s.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        let is_error = match obj.get("is_error") {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_i64().map_or(false, |v| v != 0),
            Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };
        if nonzero("returncode") || nonzero("exit_code") || status_failed || is_error {
            return ToolOutcome::Failure(output.to_string());
        }
    }

    if FAILURE_MARKERS.iter().any(|m| output.contains(m)) {
        ToolOutcome::Failure(output.to_string())
    } else {
        ToolOutcome::Success(output.to_string())
    }
}

/// 进程型工具（shell / 插件）的统一输出：符合结果约定的 JSON
pub fn process_report(returncode: Option<i32>, stdout: &str, stderr: &str) -> String {
    serde_json::json!({
        "returncode": returncode.unwrap_or(-1),
        "stdout": stdout.trim(),
        "stderr": stderr.trim(),
    })
    .to_string()
}
