//! 引擎错误类型与单次尝试的故障分类
//!
//! - EngineError：会让整个运行失败的硬错误（计划完整性、存储不可用、配置）
//! - AttemptFault：单次尝试内部的故障，交给 RecoveryEngine 决定重试 / 耗尽 / 升级为 Errored

use std::time::Duration;

use thiserror::Error;

use crate::llm::BackendError;
use crate::store::StoreError;
use crate::tools::RegistryError;
use crate::workflow::PlanError;

/// 运行级别的硬错误：只有计划完整性与存储故障会穿透 Run Manager
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Unknown engine '{kind}' (supported: {supported})")]
    UnknownEngine { kind: String, supported: String },

    #[error("Cannot resume run {run_id}: {reason}")]
    Resume { run_id: String, reason: String },
}

impl EngineError {
    /// 是否属于基础设施故障（与计划/配置这类输入错误区分，用于退出码）
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            EngineError::Store(e) if !matches!(e, StoreError::NotFound(_) | StoreError::InvalidUri { .. })
        )
    }
}

/// 单次尝试中出现的故障（永不跨越步骤边界传播）
#[derive(Error, Debug, Clone)]
pub enum AttemptFault {
    /// 工具按结果约定返回失败（status / returncode 等）
    #[error("Tool reported failure: {0}")]
    ToolFailure(String),

    /// 模型只给出文本回答，没有调用工具
    #[error("Model answered without calling a tool: {0}")]
    FinalAnswerOnly(String),

    /// 模型选择了候选集合之外的工具
    #[error("Tool '{tool}' is not available for this step (allowed: {allowed})")]
    ToolOutsideCandidates { tool: String, allowed: String },

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Attempt timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Backend protocol error: {0}")]
    BackendProtocol(String),

    #[error("Tool '{tool}' panicked: {message}")]
    ToolPanicked { tool: String, message: String },

    #[error("Capability cannot be resolved: {0}")]
    Unresolvable(String),

    /// 进入 Deciding 之前的准备工作失败（persona 渲染等）
    #[error("Step preparation failed: {0}")]
    Preparation(String),
}

impl AttemptFault {
    /// 领域内可重试的失败；其余为基础设施/契约故障，不自动重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AttemptFault::ToolFailure(_)
                | AttemptFault::FinalAnswerOnly(_)
                | AttemptFault::ToolOutsideCandidates { .. }
                | AttemptFault::BackendUnavailable(_)
                | AttemptFault::TimedOut(_)
        )
    }
}

impl From<BackendError> for AttemptFault {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unavailable(msg) => AttemptFault::BackendUnavailable(msg),
            BackendError::Protocol(msg) => AttemptFault::BackendProtocol(msg),
        }
    }
}

/// 恢复引擎根据故障与剩余预算给出的动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 把纠正信息追加进对话，回到 Deciding 再试一次
    RetryWithFeedback(String),
    /// 预算用尽，步骤进入 Exhausted
    Exhaust,
    /// 基础设施故障，步骤进入 Errored
    Escalate,
}
