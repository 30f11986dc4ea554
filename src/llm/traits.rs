//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock / Scripted）实现 LlmClient：给定对话与候选工具，返回一个 Decision。
//! 客户端自身从不重试，重试策略由步骤状态机统一掌握。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::memory::Message;

/// 模型对一次请求给出的决定（封闭枚举，调用方必须穷举分支）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// 调用某个工具
    InvokeTool { tool: String, arguments: Value },
    /// 只给出文本回答
    FinalAnswer(String),
}

impl Decision {
    /// 用于尝试记录的一行摘要
    pub fn summary(&self) -> String {
        match self {
            Decision::InvokeTool { tool, arguments } => format!("call {tool} {arguments}"),
            Decision::FinalAnswer(text) => format!("answer: {}", truncate(text, 200)),
        }
    }
}

/// 后端错误：Unavailable 可按调用方策略重试，Protocol 不重试
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("malformed backend response: {0}")]
    Protocol(String),
}

/// 暴露给模型的候选工具
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 后端名称（日志与尝试记录用）
    fn name(&self) -> &str;

    /// 一次对话补全。`constraint` 为步骤限定的唯一工具名
    async fn complete(
        &self,
        conversation: &[Message],
        tools: &[ToolSpec],
        constraint: Option<&str>,
    ) -> Result<Decision, BackendError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decision_summary() {
        let d = Decision::InvokeTool {
            tool: "echo".into(),
            arguments: json!({"text": "hi"}),
        };
        assert_eq!(d.summary(), r#"call echo {"text":"hi"}"#);
        let a = Decision::FinalAnswer("done".into());
        assert_eq!(a.summary(), "answer: done");
    }

    #[test]
    fn test_truncate_multibyte() {
        assert_eq!(truncate("你好世界", 2), "你好...");
        assert_eq!(truncate("abc", 5), "abc");
    }
}
