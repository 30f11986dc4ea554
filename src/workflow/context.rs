//! 运行共享上下文（黑板）
//!
//! 计划输入 + 每个成功步骤的输出（能解析为 JSON 时按 JSON 保存），键为 `<step>_result` 与 `result`（最近一次）。
//! 渲染进后续步骤的对话，也作为 persona prompt 的参数。
//! 步骤执行前，其 inputs / args 中的 `{{ key }}`、`{{ key.field }}` 按上下文渲染。

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use crate::tools::plugin::value_text;
use crate::workflow::run::{AttemptStatus, RunRecord};
use crate::workflow::types::{Plan, Step};

static TEMPLATE_RE: OnceLock<Regex> = OnceLock::new();

fn template_re() -> &'static Regex {
    TEMPLATE_RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}").unwrap()
    })
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunContext {
    values: BTreeMap<String, Value>,
}

impl RunContext {
    pub fn new(plan: &Plan) -> Self {
        Self {
            values: plan.inputs.clone(),
        }
    }

    /// 从已记录的尝试重建（续跑）
    pub fn rebuild(plan: &Plan, record: &RunRecord) -> Self {
        let mut ctx = Self::new(plan);
        for a in &record.attempts {
            if a.status != AttemptStatus::Succeeded {
                continue;
            }
            if let Some(output) = a.invocation.as_ref().and_then(|i| i.result.as_deref()) {
                ctx.record_success(&a.step_id, output);
            }
        }
        ctx
    }

    pub fn record_success(&mut self, step: &str, output: &str) {
        let value = serde_json::from_str::<Value>(output.trim())
            .unwrap_or_else(|_| Value::String(output.to_string()));
        self.values.insert(format!("{step}_result"), value.clone());
        self.values.insert("result".to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// 按点分路径取值：`build_result.image`、`hosts.0`
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut cur = self.values.get(parts.next()?)?;
        for part in parts {
            cur = match cur {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(cur)
    }

    /// 渲染值中的模板。整串只有一个占位符时保留被引用值的类型；未知路径原样保留
    pub fn render_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.render_str(s),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.render_value(v)).collect()),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    fn render_str(&self, text: &str) -> Value {
        let trimmed = text.trim();
        if let Some(c) = template_re().captures(trimmed) {
            let whole = c.get(0).is_some_and(|m| m.start() == 0 && m.end() == trimmed.len());
            if whole {
                if let Some(v) = self.lookup(&c[1]) {
                    return v.clone();
                }
            }
        }
        let rendered = template_re().replace_all(text, |c: &Captures<'_>| {
            self.lookup(&c[1])
                .map(value_text)
                .unwrap_or_else(|| c[0].to_string())
        });
        Value::String(rendered.into_owned())
    }

    /// 步骤的副本，inputs 与 args 已按当前上下文渲染
    pub fn resolve_step(&self, step: &Step) -> Step {
        let render_map = |m: &BTreeMap<String, Value>| -> BTreeMap<String, Value> {
            m.iter().map(|(k, v)| (k.clone(), self.render_value(v))).collect()
        };
        let mut resolved = step.clone();
        resolved.inputs = render_map(&step.inputs);
        resolved.args = render_map(&step.args);
        resolved
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// 上下文叠加步骤输入（步骤输入优先），作为 persona prompt 的参数
    pub fn merged_inputs(&self, step: &Step) -> Value {
        let mut map: Map<String, Value> = self
            .values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in &step.inputs {
            map.insert(k.clone(), v.clone());
        }
        map.insert("goal".to_string(), Value::String(step.goal.clone()));
        Value::Object(map)
    }

    pub fn render(&self) -> String {
        serde_json::to_string_pretty(&self.values).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{PlanBuilder, StepBuilder};
    use serde_json::json;

    fn plan() -> Plan {
        PlanBuilder::new("p")
            .input("repo", "planrun")
            .step(StepBuilder::new("build", "Build").input("tag", "v1"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_record_success_parses_json() {
        let mut ctx = RunContext::new(&plan());
        ctx.record_success("build", r#"{"returncode": 0, "stdout": "ok"}"#);
        assert_eq!(ctx.get("build_result").unwrap()["stdout"], "ok");
        assert_eq!(ctx.get("result"), ctx.get("build_result"));
        ctx.record_success("notify", "sent");
        assert_eq!(ctx.get("result"), Some(&json!("sent")));
    }

    #[test]
    fn test_merged_inputs_step_wins() {
        let p = plan();
        let ctx = RunContext::new(&p);
        let merged = ctx.merged_inputs(&p.steps[0]);
        assert_eq!(merged["repo"], "planrun");
        assert_eq!(merged["tag"], "v1");
        assert_eq!(merged["goal"], "Build");
    }

    #[test]
    fn test_resolve_step_renders_from_previous_output() {
        let p = PlanBuilder::new("p")
            .input("repo", "planrun")
            .step(StepBuilder::new("build", "Build").call("echo"))
            .step(
                StepBuilder::new("run", "Run the image")
                    .input("image", "{{ build_result.image }}")
                    .input("ports", "{{build_result.ports}}")
                    .input("banner", "{{ repo }} runs {{ build_result.image }} on {{ build_result.ports.0 }}")
                    .input("unknown", "{{ missing.key }}"),
            )
            .build()
            .unwrap();
        let mut ctx = RunContext::new(&p);
        ctx.record_success("build", r#"{"image": "planrun:1.2", "ports": [8080, 9090]}"#);

        let run = ctx.resolve_step(&p.steps[1]);
        assert_eq!(run.inputs["image"], "planrun:1.2");
        assert_eq!(run.inputs["ports"], json!([8080, 9090]));
        assert_eq!(run.inputs["banner"], "planrun runs planrun:1.2 on 8080");
        assert_eq!(run.inputs["unknown"], "{{ missing.key }}");
        // 原步骤不变
        assert_eq!(p.steps[1].inputs["image"], "{{ build_result.image }}");
    }

    #[test]
    fn test_render_nested_args() {
        let p = plan();
        let ctx = RunContext::new(&p);
        let rendered = ctx.render_value(&json!({"cmd": ["git", "clone", "{{ repo }}"], "depth": 1}));
        assert_eq!(rendered, json!({"cmd": ["git", "clone", "planrun"], "depth": 1}));
    }
}
