//! 计划构建器
//!
//! 提供流畅的 API 在代码中构建计划；build 走与文档加载相同的校验路径。

use serde_json::Value;

use crate::workflow::loader::{PlanDocument, StepDocument};
use crate::workflow::types::{Plan, PlanError, RunPolicy, StepKind};

/// 计划构建器
pub struct PlanBuilder {
    doc: PlanDocument,
    defaults: RunPolicy,
}

impl PlanBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            doc: PlanDocument {
                name: name.into(),
                ..Default::default()
            },
            defaults: RunPolicy::default(),
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.doc.description = Some(desc.into());
        self
    }

    /// 计划级重试预算
    pub fn retries(mut self, retries: u32) -> Self {
        self.doc.retries = Some(retries);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.doc.timeout_secs = Some(secs);
        self
    }

    pub fn max_step_visits(mut self, visits: u32) -> Self {
        self.doc.max_step_visits = Some(visits);
        self
    }

    pub fn input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.doc.inputs.insert(key.into(), value.into());
        self
    }

    /// 未在计划上声明的值从这里取
    pub fn defaults(mut self, defaults: RunPolicy) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn step(mut self, step: StepBuilder) -> Self {
        self.doc.steps.push(step.doc);
        self
    }

    pub fn build(self) -> Result<Plan, PlanError> {
        self.doc.into_plan("inline", &self.defaults)
    }
}

/// 步骤构建器
pub struct StepBuilder {
    doc: StepDocument,
}

impl StepBuilder {
    pub fn new(name: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            doc: StepDocument {
                name: name.into(),
                goal: goal.into(),
                ..Default::default()
            },
        }
    }

    pub fn tool(mut self, tool: impl Into<String>) -> Self {
        self.doc.tool = Some(tool.into());
        self
    }

    /// 确定性步骤：不经过模型，以静态参数直接调用固定工具
    pub fn call(mut self, tool: impl Into<String>) -> Self {
        self.doc.kind = StepKind::Tool;
        self.doc.tool = Some(tool.into());
        self
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.doc.args.insert(key.into(), value.into());
        self
    }

    pub fn allow(mut self, tool: impl Into<String>) -> Self {
        self.doc.tools.push(tool.into());
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.doc.prompt = Some(prompt.into());
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.doc.retries = Some(retries);
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.doc.timeout_secs = Some(secs);
        self
    }

    pub fn input(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.doc.inputs.insert(key.into(), value.into());
        self
    }

    pub fn on_success(mut self, target: impl Into<String>) -> Self {
        self.doc.transitions.insert("success".into(), target.into());
        self
    }

    pub fn on_failure(mut self, target: impl Into<String>) -> Self {
        self.doc.transitions.insert("failure".into(), target.into());
        self
    }

    pub fn on_error(mut self, target: impl Into<String>) -> Self {
        self.doc.transitions.insert("error".into(), target.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Transition;

    #[test]
    fn test_builder_matches_loader_rules() {
        let plan = PlanBuilder::new("deploy")
            .retries(1)
            .input("env", "staging")
            .step(StepBuilder::new("build", "Build it").tool("echo").retries(3))
            .step(StepBuilder::new("ship", "Ship it").on_failure("retry"))
            .build()
            .unwrap();
        assert_eq!(plan.source, "inline");
        assert_eq!(plan.steps[0].retries, 3);
        assert_eq!(plan.steps[1].retries, 1);
        assert_eq!(plan.steps[0].on_success, Transition::Step("ship".into()));
        assert_eq!(plan.steps[1].on_failure, Transition::Retry);
    }

    #[test]
    fn test_builder_tool_step() {
        let plan = PlanBuilder::new("p")
            .step(StepBuilder::new("greet", "Say hi").call("echo").arg("text", "hi"))
            .build()
            .unwrap();
        assert_eq!(plan.steps[0].kind, StepKind::Tool);
        assert_eq!(plan.steps[0].tool.as_deref(), Some("echo"));
        assert_eq!(plan.steps[0].args["text"], "hi");
    }

    #[test]
    fn test_builder_rejects_unknown_target() {
        let err = PlanBuilder::new("p")
            .step(StepBuilder::new("a", "g").on_success("missing"))
            .build()
            .unwrap_err();
        assert!(matches!(err, PlanError::Integrity { .. }));
    }
}
