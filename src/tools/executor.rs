//! 工具执行器
//!
//! 调用已解析的 ToolDescriptor：工具返回 Err 为普通失败，工具 panic 被捕获并单独报告；
//! 每次调用输出结构化审计日志（JSON）。超时由步骤状态机在整个尝试上统一施加。

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use futures_util::FutureExt;
use serde_json::Value;

use crate::tools::ToolDescriptor;

/// 一次工具调用的原始结果
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Returned(String),
    Failed(String),
    Panicked(String),
}

#[derive(Debug, Default, Clone)]
pub struct ToolExecutor;

impl ToolExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn invoke(&self, descriptor: &ToolDescriptor, args: Value) -> Invocation {
        let start = Instant::now();
        let preview = args_preview(&args);
        let callable = descriptor.callable.clone();

        let result = AssertUnwindSafe(async move { callable.execute(args).await })
            .catch_unwind()
            .await;

        let invocation = match result {
            Ok(Ok(content)) => Invocation::Returned(content),
            Ok(Err(e)) => Invocation::Failed(e),
            Err(payload) => Invocation::Panicked(panic_message(payload.as_ref())),
        };

        let outcome = match &invocation {
            Invocation::Returned(_) => "ok",
            Invocation::Failed(_) => "error",
            Invocation::Panicked(_) => "panic",
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": descriptor.name,
            "source": descriptor.source,
            "ok": outcome == "ok",
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        invocation
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::tools::{EchoTool, Tool};

    struct Exploding;

    #[async_trait]
    impl Tool for Exploding {
        fn name(&self) -> &str {
            "explode"
        }
        fn description(&self) -> &str {
            "panics"
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            panic!("kaboom")
        }
    }

    #[tokio::test]
    async fn test_invoke_returns_output() {
        let d = ToolDescriptor::from_tool(Arc::new(EchoTool), "builtin");
        let r = ToolExecutor::new()
            .invoke(&d, serde_json::json!({"text": "hi"}))
            .await;
        assert_eq!(r, Invocation::Returned("hi".into()));
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let d = ToolDescriptor::from_tool(Arc::new(Exploding), "test");
        let r = ToolExecutor::new().invoke(&d, Value::Null).await;
        assert_eq!(r, Invocation::Panicked("kaboom".into()));
    }
}
