//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 工具调用走文本协议（见 `llm::protocol`），不依赖各家 function-calling 字段的差异。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::llm::protocol::{parse_reply, render_tool_catalog};
use crate::llm::{BackendError, Decision, LlmClient, ToolSpec};
use crate::memory::{Message, Role};

/// Token 使用统计（累计值）
#[derive(Debug, Clone, Default)]
pub struct TokenUsage {
    pub prompt_tokens: Arc<AtomicU64>,
    pub completion_tokens: Arc<AtomicU64>,
    pub total_tokens: Arc<AtomicU64>,
}

impl TokenUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, prompt: u64, completion: u64) {
        self.prompt_tokens.fetch_add(prompt, Ordering::Relaxed);
        self.completion_tokens.fetch_add(completion, Ordering::Relaxed);
        self.total_tokens.fetch_add(prompt + completion, Ordering::Relaxed);
    }

    pub fn get(&self) -> (u64, u64, u64) {
        (
            self.prompt_tokens.load(Ordering::Relaxed),
            self.completion_tokens.load(Ordering::Relaxed),
            self.total_tokens.load(Ordering::Relaxed),
        )
    }
}

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    label: String,
    /// 累计 token 使用统计
    pub usage: TokenUsage,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            label: "openai".to_string(),
            usage: TokenUsage::new(),
        }
    }

    /// 覆盖日志/记录里显示的后端名称
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn to_openai_messages(
        &self,
        messages: &[Message],
        catalog: String,
    ) -> Result<Vec<ChatCompletionRequestMessage>, BackendError> {
        let protocol_err = |e: async_openai::error::OpenAIError| BackendError::Protocol(e.to_string());

        let mut out = Vec::with_capacity(messages.len() + 1);
        out.push(ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessageArgs::default()
                .content(catalog)
                .build()
                .map_err(protocol_err)?,
        ));
        for m in messages {
            let msg = match m.role {
                Role::System => ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(protocol_err)?,
                ),
                Role::User => ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(protocol_err)?,
                ),
                Role::Assistant => ChatCompletionRequestMessage::Assistant(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(m.content.clone())
                        .build()
                        .map_err(protocol_err)?,
                ),
            };
            out.push(msg);
        }
        Ok(out)
    }
}

/// 响应无法解析、请求参数非法 → 协议错误（不重试）；网络、鉴权与服务端错误 → 暂不可用
fn backend_error(e: OpenAIError) -> BackendError {
    match e {
        OpenAIError::JSONDeserialize(..) | OpenAIError::InvalidArgument(_) => {
            BackendError::Protocol(e.to_string())
        }
        other => BackendError::Unavailable(other.to_string()),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        &self.label
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.usage.get()
    }

    async fn complete(
        &self,
        conversation: &[Message],
        tools: &[ToolSpec],
        constraint: Option<&str>,
    ) -> Result<Decision, BackendError> {
        let messages = self.to_openai_messages(conversation, render_tool_catalog(tools, constraint))?;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .build()
            .map_err(|e| BackendError::Protocol(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(backend_error)?;

        if let Some(usage) = &response.usage {
            self.usage
                .add(usage.prompt_tokens as u64, usage.completion_tokens as u64);
        }

        let content = response
            .choices
            .first()
            .ok_or_else(|| BackendError::Protocol("response contained no choices".to_string()))?
            .message
            .content
            .clone()
            .unwrap_or_default();

        tracing::debug!(backend = %self.label, model = %self.model, reply_len = content.len(), "completion received");
        parse_reply(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_accumulates() {
        let usage = TokenUsage::new();
        usage.add(10, 5);
        usage.add(1, 1);
        assert_eq!(usage.get(), (11, 6, 17));
    }

    #[test]
    fn test_error_mapping() {
        let garbled = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        assert!(matches!(
            backend_error(OpenAIError::JSONDeserialize(garbled, "not json".into())),
            BackendError::Protocol(_)
        ));
        assert!(matches!(
            backend_error(OpenAIError::InvalidArgument("model".into())),
            BackendError::Protocol(_)
        ));
        let api = async_openai::error::ApiError {
            message: "invalid api key".into(),
            r#type: Some("auth".into()),
            param: None,
            code: None,
        };
        assert!(matches!(
            backend_error(OpenAIError::ApiError(api)),
            BackendError::Unavailable(_)
        ));
    }

    /// 服务端返回 200 但正文不是 JSON
    #[tokio::test]
    async fn test_garbled_reply_is_protocol_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let _ = sock.read(&mut buf).await;
            let body = "this is not json";
            let reply = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            let _ = sock.write_all(reply.as_bytes()).await;
            let _ = sock.shutdown().await;
        });

        let client = OpenAiClient::new(Some(&format!("http://{addr}/v1")), "m", Some("k"));
        let err = client
            .complete(&[Message::user("hi")], &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Protocol(_)), "{err:?}");
    }

    #[test]
    fn test_messages_prepend_catalog() {
        let client = OpenAiClient::new(Some("http://localhost:1"), "m", Some("k"));
        let msgs = client
            .to_openai_messages(&[Message::user("hi")], "catalog".to_string())
            .unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0], ChatCompletionRequestMessage::System(_)));
        assert!(matches!(msgs[1], ChatCompletionRequestMessage::User(_)));
        assert_eq!(client.name(), "openai");
    }
}
