//! Mock / Scripted LLM 客户端（用于测试与离线运行，无需 API）
//!
//! - MockLlmClient：确定性地调用受限工具（或第一个候选工具），参数为步骤目标文本
//! - ScriptedLlmClient：按预设队列依次返回决定或错误，并记录收到的每份对话

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{BackendError, Decision, LlmClient, ToolSpec};
use crate::memory::{Message, Role};

/// Mock 客户端
#[derive(Debug, Default)]
pub struct MockLlmClient;

impl MockLlmClient {
    fn decide(conversation: &[Message], tools: &[ToolSpec], constraint: Option<&str>) -> Decision {
        // 第一条 user 消息即步骤目标
        let goal = conversation
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no goal)");

        let tool = constraint
            .map(String::from)
            .or_else(|| tools.first().map(|t| t.name.clone()));

        match tool {
            Some(tool) => Decision::InvokeTool {
                tool,
                arguments: json!({ "text": goal }),
            },
            None => Decision::FinalAnswer(format!("Echo from Mock: {goal}")),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        conversation: &[Message],
        tools: &[ToolSpec],
        constraint: Option<&str>,
    ) -> Result<Decision, BackendError> {
        Ok(Self::decide(conversation, tools, constraint))
    }
}

/// 脚本化客户端：队列为空后退化为 Mock 行为
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<Decision, BackendError>>>,
    received: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedLlmClient {
    pub fn new(script: impl IntoIterator<Item = Result<Decision, BackendError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            received: Mutex::new(Vec::new()),
        }
    }

    /// 追加一个预设结果
    pub fn push(&self, next: Result<Decision, BackendError>) {
        if let Ok(mut q) = self.script.lock() {
            q.push_back(next);
        }
    }

    /// 便捷构造：调用工具
    pub fn invoke(tool: &str, arguments: serde_json::Value) -> Result<Decision, BackendError> {
        Ok(Decision::InvokeTool {
            tool: tool.to_string(),
            arguments,
        })
    }

    /// 迄今为止收到的全部对话（按调用顺序）
    pub fn received(&self) -> Vec<Vec<Message>> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.received.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// 剩余未消费的脚本条数
    pub fn remaining(&self) -> usize {
        self.script.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        conversation: &[Message],
        tools: &[ToolSpec],
        constraint: Option<&str>,
    ) -> Result<Decision, BackendError> {
        if let Ok(mut r) = self.received.lock() {
            r.push(conversation.to_vec());
        }
        let next = self.script.lock().ok().and_then(|mut q| q.pop_front());
        match next {
            Some(result) => result,
            None => Ok(MockLlmClient::decide(conversation, tools, constraint)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: String::new(),
            parameters: json!({}),
        }
    }

    #[tokio::test]
    async fn test_mock_prefers_constraint() {
        let convo = vec![Message::system("sys"), Message::user("build the image")];
        let d = MockLlmClient
            .complete(&convo, &[spec("echo"), spec("build")], Some("build"))
            .await
            .unwrap();
        assert_eq!(
            d,
            Decision::InvokeTool {
                tool: "build".into(),
                arguments: json!({"text": "build the image"})
            }
        );
    }

    #[tokio::test]
    async fn test_mock_without_tools_answers() {
        let convo = vec![Message::user("hi")];
        let d = MockLlmClient.complete(&convo, &[], None).await.unwrap();
        assert!(matches!(d, Decision::FinalAnswer(_)));
    }

    #[tokio::test]
    async fn test_scripted_replays_then_falls_back() {
        let client = ScriptedLlmClient::new(vec![
            Err(BackendError::Unavailable("down".into())),
            ScriptedLlmClient::invoke("echo", json!({"text": "x"})),
        ]);
        let convo = vec![Message::user("goal")];
        assert!(client.complete(&convo, &[spec("echo")], None).await.is_err());
        assert!(client.complete(&convo, &[spec("echo")], None).await.is_ok());
        assert_eq!(client.remaining(), 0);
        let d = client.complete(&convo, &[spec("echo")], None).await.unwrap();
        assert!(matches!(d, Decision::InvokeTool { .. }));
        assert_eq!(client.calls(), 3);
        assert_eq!(client.received()[0], convo);
    }
}
