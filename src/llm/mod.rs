//! LLM 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock / Scripted）

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod protocol;
pub mod traits;

use std::sync::Arc;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{BackendError, Decision, LlmClient, ToolSpec};

use crate::config::LlmSection;
use crate::core::EngineError;

/// 支持的后端名称
pub const SUPPORTED_PROVIDERS: &[&str] = &["mock", "openai", "deepseek"];

/// 根据 [llm] 段选择后端；未知 provider 为配置错误
pub fn create_llm_from_config(cfg: &LlmSection) -> Result<Arc<dyn LlmClient>, EngineError> {
    let provider = cfg.provider.to_lowercase();
    match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM");
            Ok(Arc::new(MockLlmClient))
        }
        "deepseek" => {
            let model = cfg.model.clone().unwrap_or_else(|| DEEPSEEK_CHAT.to_string());
            if std::env::var("DEEPSEEK_API_KEY").is_err() && std::env::var("OPENAI_API_KEY").is_err() {
                tracing::warn!("DEEPSEEK_API_KEY not set; requests will fail as unavailable");
            }
            tracing::info!("Using DeepSeek LLM ({})", model);
            Ok(Arc::new(create_deepseek_client(
                Some(&model),
                cfg.base_url.as_deref(),
            )))
        }
        "openai" => {
            let model = cfg.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            if std::env::var("OPENAI_API_KEY").is_err() {
                tracing::warn!("OPENAI_API_KEY not set; requests will fail as unavailable");
            }
            tracing::info!("Using OpenAI LLM ({})", model);
            Ok(Arc::new(OpenAiClient::new(
                cfg.base_url.as_deref(),
                &model,
                std::env::var("OPENAI_API_KEY").ok().as_deref(),
            )))
        }
        other => Err(EngineError::Config(format!(
            "unknown llm provider '{}' (supported: {})",
            other,
            SUPPORTED_PROVIDERS.join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_provider() {
        let cfg = LlmSection {
            provider: "Mock".into(),
            ..Default::default()
        };
        let llm = create_llm_from_config(&cfg).unwrap();
        assert_eq!(llm.name(), "mock");
    }

    #[test]
    fn test_unknown_provider_lists_supported() {
        let cfg = LlmSection {
            provider: "gemini".into(),
            ..Default::default()
        };
        let err = create_llm_from_config(&cfg).err().unwrap();
        assert!(err.to_string().contains("mock, openai, deepseek"));
    }
}
