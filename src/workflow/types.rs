//! 计划类型定义
//!
//! Plan / Step / Transition 以及计划完整性错误。Plan 在加载时完成校验与默认值填充，
//! 运行期只读：默认后继、终止别名等都已解析成显式的 Transition。

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type StepId = String;

/// 保留的转移目标，不能用作步骤名
pub const RESERVED_NAMES: &[&str] = &["end", "abort", "retry", "success", "failed"];

/// 步骤结束后的去向
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// 跳到指定步骤
    Step(StepId),
    /// 运行完成
    End,
    /// 运行中止
    Abort,
    /// 以新的访问重跑当前步骤（预算重置）
    Retry,
}

impl Transition {
    /// 解析转移目标；`success` 是 `end` 的别名，`failed` 是 `abort` 的别名
    pub fn parse(target: &str) -> Self {
        match target.trim() {
            "end" | "success" => Transition::End,
            "abort" | "failed" => Transition::Abort,
            "retry" => Transition::Retry,
            other => Transition::Step(other.to_string()),
        }
    }

    pub fn target(&self) -> &str {
        match self {
            Transition::Step(s) => s,
            Transition::End => "end",
            Transition::Abort => "abort",
            Transition::Retry => "retry",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.target())
    }
}

/// 计划级运行策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPolicy {
    /// 步骤未声明 retries 时的预算
    pub default_retries: u32,
    /// 步骤未声明 timeout_secs 时的单次尝试超时
    pub attempt_timeout: Duration,
    /// 终止策略：一次运行内步骤访问总数上限
    pub max_step_visits: u32,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            default_retries: 2,
            attempt_timeout: Duration::from_secs(300),
            max_step_visits: 50,
        }
    }
}

/// 步骤类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// 由模型决定调用哪个工具、传什么参数
    #[default]
    Agent,
    /// 确定性步骤：以静态 args 直接调用固定工具，不经过模型
    Tool,
}

/// 计划中的一个步骤
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: StepId,
    pub kind: StepKind,
    pub goal: String,
    /// 固定工具：模型只能调用这一个
    pub tool: Option<String>,
    /// 工具白名单；为空表示所有 tool 类能力
    pub allowed_tools: Vec<String>,
    /// persona prompt 能力名
    pub prompt: Option<String>,
    pub retries: u32,
    pub timeout: Duration,
    pub inputs: BTreeMap<String, Value>,
    /// tool 步骤的调用参数（可含 {{ key }} 模板）
    pub args: BTreeMap<String, Value>,
    pub on_success: Transition,
    pub on_failure: Transition,
    /// 仅用于 Errored；缺省时沿用 on_failure
    pub on_error: Option<Transition>,
}

impl Step {
    /// Errored 步骤的去向
    pub fn error_transition(&self) -> &Transition {
        self.on_error.as_ref().unwrap_or(&self.on_failure)
    }
}

/// 已校验的计划
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub name: String,
    pub description: Option<String>,
    /// 来源引用（文件路径或 "inline"）
    pub source: String,
    pub inputs: BTreeMap<String, Value>,
    pub policy: RunPolicy,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn first(&self) -> Option<&Step> {
        self.steps.first()
    }
}

/// 计划加载 / 校验错误；运行前致命，永不重试
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan integrity error{}: field '{field}': {reason}", at_step(.step))]
    Integrity {
        step: Option<String>,
        field: String,
        reason: String,
    },

    #[error("cannot read plan {path}: {reason}")]
    Read { path: String, reason: String },
}

fn at_step(step: &Option<String>) -> String {
    step.as_ref()
        .map(|s| format!(" in step '{s}'"))
        .unwrap_or_default()
}

impl PlanError {
    pub fn integrity(step: Option<&str>, field: &str, reason: impl Into<String>) -> Self {
        PlanError::Integrity {
            step: step.map(String::from),
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_aliases() {
        assert_eq!(Transition::parse("success"), Transition::End);
        assert_eq!(Transition::parse("failed"), Transition::Abort);
        assert_eq!(Transition::parse("retry"), Transition::Retry);
        assert_eq!(Transition::parse(" deploy "), Transition::Step("deploy".into()));
        assert_eq!(Transition::End.to_string(), "end");
    }

    #[test]
    fn test_integrity_error_message() {
        let e = PlanError::integrity(Some("build"), "timeout_secs", "must be greater than zero");
        assert_eq!(
            e.to_string(),
            "plan integrity error in step 'build': field 'timeout_secs': must be greater than zero"
        );
        let e = PlanError::integrity(None, "steps", "plan has no steps");
        assert_eq!(e.to_string(), "plan integrity error: field 'steps': plan has no steps");
    }

    #[test]
    fn test_error_transition_falls_back_to_failure() {
        let mut step = Step {
            name: "s".into(),
            kind: StepKind::Agent,
            goal: "g".into(),
            tool: Some("a".into()),
            allowed_tools: vec!["a".into(), "b".into()],
            prompt: None,
            retries: 0,
            timeout: Duration::from_secs(1),
            inputs: BTreeMap::new(),
            args: BTreeMap::new(),
            on_success: Transition::End,
            on_failure: Transition::Abort,
            on_error: None,
        };
        assert_eq!(step.error_transition(), &Transition::Abort);
        step.on_error = Some(Transition::Step("cleanup".into()));
        assert_eq!(step.error_transition(), &Transition::Step("cleanup".into()));
    }
}
