//! 计划文档加载与校验
//!
//! 按扩展名解析 YAML / TOML / JSON 文档为 PlanDocument，再校验并填充默认值得到 Plan。
//! 校验失败一律为 PlanError::Integrity，指明步骤与字段。

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::graph::unreachable_steps;
use crate::workflow::types::{
    Plan, PlanError, RunPolicy, Step, StepKind, Transition, RESERVED_NAMES,
};

const TRANSITION_KEYS: &[&str] = &["success", "failure", "error"];

/// 计划文档格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanFormat {
    Yaml,
    Toml,
    Json,
}

impl PlanFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Some(PlanFormat::Yaml),
            "toml" => Some(PlanFormat::Toml),
            "json" => Some(PlanFormat::Json),
            _ => None,
        }
    }
}

/// 计划文档（磁盘格式）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanDocument {
    #[serde(default)]
    pub name: String,
    pub description: Option<String>,
    pub retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub max_step_visits: Option<u32>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub steps: Vec<StepDocument>,
}

/// 步骤文档
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepDocument {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: StepKind,
    #[serde(default, alias = "description")]
    pub goal: String,
    pub tool: Option<String>,
    /// tool 步骤的静态参数
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
    #[serde(default)]
    pub tools: Vec<String>,
    pub prompt: Option<String>,
    pub retries: Option<u32>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub transitions: BTreeMap<String, String>,
}

/// 从文件加载计划
pub fn load_plan(path: &Path, defaults: &RunPolicy) -> Result<Plan, PlanError> {
    let display = path.display().to_string();
    let format = PlanFormat::from_path(path).ok_or_else(|| PlanError::Read {
        path: display.clone(),
        reason: "unsupported extension (expected .yaml, .yml, .toml or .json)".to_string(),
    })?;
    let text = std::fs::read_to_string(path).map_err(|e| PlanError::Read {
        path: display.clone(),
        reason: e.to_string(),
    })?;
    parse_plan(&text, format, &display, defaults)
}

/// 从文本解析计划
pub fn parse_plan(
    text: &str,
    format: PlanFormat,
    source: &str,
    defaults: &RunPolicy,
) -> Result<Plan, PlanError> {
    let malformed = |reason: String| PlanError::integrity(None, "document", reason);
    let doc: PlanDocument = match format {
        PlanFormat::Yaml => serde_yaml_bw::from_str(text).map_err(|e| malformed(e.to_string()))?,
        PlanFormat::Toml => toml::from_str(text).map_err(|e| malformed(e.to_string()))?,
        PlanFormat::Json => serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?,
    };
    doc.into_plan(source, defaults)
}

impl PlanDocument {
    /// 校验并填充默认值
    pub fn into_plan(self, source: &str, defaults: &RunPolicy) -> Result<Plan, PlanError> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(PlanError::integrity(None, "name", "plan name is required"));
        }
        if self.steps.is_empty() {
            return Err(PlanError::integrity(None, "steps", "plan has no steps"));
        }
        if self.timeout_secs == Some(0) {
            return Err(PlanError::integrity(None, "timeout_secs", "must be greater than zero"));
        }
        if self.max_step_visits == Some(0) {
            return Err(PlanError::integrity(None, "max_step_visits", "must be greater than zero"));
        }

        let policy = RunPolicy {
            default_retries: self.retries.unwrap_or(defaults.default_retries),
            attempt_timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.attempt_timeout),
            max_step_visits: self.max_step_visits.unwrap_or(defaults.max_step_visits),
        };

        let mut seen = HashSet::new();
        for s in &self.steps {
            let step_name = s.name.trim();
            if step_name.is_empty() {
                return Err(PlanError::integrity(None, "steps.name", "every step needs a name"));
            }
            if RESERVED_NAMES.contains(&step_name) {
                return Err(PlanError::integrity(
                    Some(step_name),
                    "name",
                    format!("'{step_name}' is a reserved transition target"),
                ));
            }
            if !seen.insert(step_name.to_string()) {
                return Err(PlanError::integrity(Some(step_name), "name", "duplicate step name"));
            }
        }

        let names: Vec<String> = self.steps.iter().map(|s| s.name.trim().to_string()).collect();
        let mut steps = Vec::with_capacity(self.steps.len());
        for (i, doc) in self.steps.into_iter().enumerate() {
            let default_next = match names.get(i + 1) {
                Some(next) => Transition::Step(next.clone()),
                None => Transition::End,
            };
            steps.push(doc.into_step(&names, default_next, &policy)?);
        }

        let plan = Plan {
            name,
            description: self.description.filter(|d| !d.trim().is_empty()),
            source: source.to_string(),
            inputs: self.inputs,
            policy,
            steps,
        };

        let unreachable = unreachable_steps(&plan);
        if !unreachable.is_empty() {
            tracing::warn!(plan = %plan.name, steps = ?unreachable, "steps unreachable from the first step");
        }
        Ok(plan)
    }
}

impl StepDocument {
    fn into_step(
        self,
        names: &[String],
        default_next: Transition,
        policy: &RunPolicy,
    ) -> Result<Step, PlanError> {
        let name = self.name.trim().to_string();
        let at = Some(name.as_str());

        let goal = self.goal.trim().to_string();
        if goal.is_empty() {
            return Err(PlanError::integrity(at, "goal", "goal must not be empty"));
        }
        if self.timeout_secs == Some(0) {
            return Err(PlanError::integrity(at, "timeout_secs", "must be greater than zero"));
        }

        let tool = clean_name(self.tool);
        let prompt = clean_name(self.prompt);
        let allowed_tools: Vec<String> = self
            .tools
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if let Some(t) = &tool {
            if !allowed_tools.is_empty() && !allowed_tools.contains(t) {
                return Err(PlanError::integrity(
                    at,
                    "tool",
                    format!("fixed tool '{t}' is not in the step's tools allowlist"),
                ));
            }
        }
        match self.kind {
            StepKind::Tool => {
                if tool.is_none() {
                    return Err(PlanError::integrity(at, "tool", "tool steps need a fixed tool"));
                }
                if prompt.is_some() {
                    return Err(PlanError::integrity(
                        at,
                        "prompt",
                        "tool steps call their tool directly and take no persona prompt",
                    ));
                }
            }
            StepKind::Agent => {
                if !self.args.is_empty() {
                    return Err(PlanError::integrity(at, "args", "args only apply to steps of type tool"));
                }
            }
        }

        for key in self.transitions.keys() {
            if !TRANSITION_KEYS.contains(&key.as_str()) {
                return Err(PlanError::integrity(
                    at,
                    &format!("transitions.{key}"),
                    "unknown transition key (expected success, failure or error)",
                ));
            }
        }

        let target = |key: &str| -> Result<Option<Transition>, PlanError> {
            let Some(raw) = self.transitions.get(key) else {
                return Ok(None);
            };
            let field = format!("transitions.{key}");
            if raw.trim().is_empty() {
                return Err(PlanError::integrity(at, &field, "empty transition target"));
            }
            let t = Transition::parse(raw);
            let allowed = match (&t, key) {
                (Transition::Step(s), _) => {
                    if !names.contains(s) {
                        return Err(PlanError::integrity(
                            at,
                            &field,
                            format!("unknown target step '{s}'"),
                        ));
                    }
                    true
                }
                (Transition::End, "success") => true,
                (Transition::Retry | Transition::Abort, "failure" | "error") => true,
                _ => false,
            };
            if !allowed {
                return Err(PlanError::integrity(
                    at,
                    &field,
                    format!("'{raw}' is not a valid {key} target"),
                ));
            }
            Ok(Some(t))
        };

        let on_success = target("success")?.unwrap_or(default_next);
        let on_failure = target("failure")?.unwrap_or(Transition::Abort);
        let on_error = target("error")?;

        Ok(Step {
            name,
            kind: self.kind,
            goal,
            tool,
            allowed_tools,
            prompt,
            retries: self.retries.unwrap_or(policy.default_retries),
            timeout: self
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(policy.attempt_timeout),
            inputs: self.inputs,
            args: self.args,
            on_success,
            on_failure,
            on_error,
        })
    }
}

fn clean_name(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
name: build-and-run
description: Build then run
retries: 1
inputs:
  repo: planrun
steps:
  - name: build
    goal: Build the image
    tool: build_docker
    retries: 3
    transitions:
      failure: retry
  - name: run
    description: Run the image
    tools: [shell, echo]
    timeout_secs: 30
    transitions:
      success: success
      failure: notify
  - name: notify
    goal: Tell someone
"#;

    fn defaults() -> RunPolicy {
        RunPolicy::default()
    }

    #[test]
    fn test_parse_yaml_fills_defaults() {
        let plan = parse_plan(YAML, PlanFormat::Yaml, "inline", &defaults()).unwrap();
        assert_eq!(plan.name, "build-and-run");
        assert_eq!(plan.policy.default_retries, 1);
        assert_eq!(plan.policy.max_step_visits, 50);
        assert_eq!(plan.inputs["repo"], "planrun");

        let build = plan.step("build").unwrap();
        assert_eq!(build.retries, 3);
        assert_eq!(build.on_success, Transition::Step("run".into()));
        assert_eq!(build.on_failure, Transition::Retry);
        assert_eq!(build.timeout, Duration::from_secs(300));

        let run = plan.step("run").unwrap();
        assert_eq!(run.goal, "Run the image");
        assert_eq!(run.retries, 1);
        assert_eq!(run.on_success, Transition::End);
        assert_eq!(run.on_failure, Transition::Step("notify".into()));
        assert_eq!(run.allowed_tools, vec!["shell", "echo"]);

        let notify = plan.step("notify").unwrap();
        assert_eq!(notify.on_success, Transition::End);
        assert_eq!(notify.on_failure, Transition::Abort);
    }

    #[test]
    fn test_same_source_loads_equal() {
        let a = parse_plan(YAML, PlanFormat::Yaml, "inline", &defaults()).unwrap();
        let b = parse_plan(YAML, PlanFormat::Yaml, "inline", &defaults()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_toml_and_json() {
        let toml_src = r#"
name = "t"
[[steps]]
name = "only"
goal = "do it"
"#;
        let plan = parse_plan(toml_src, PlanFormat::Toml, "inline", &defaults()).unwrap();
        assert_eq!(plan.steps.len(), 1);

        let json_src = r#"{"name": "j", "steps": [{"name": "a", "goal": "g", "transitions": {"failure": "failed"}}]}"#;
        let plan = parse_plan(json_src, PlanFormat::Json, "inline", &defaults()).unwrap();
        assert_eq!(plan.steps[0].on_failure, Transition::Abort);
    }

    fn integrity_field(src: &str) -> (Option<String>, String) {
        match parse_plan(src, PlanFormat::Yaml, "inline", &defaults()).unwrap_err() {
            PlanError::Integrity { step, field, .. } => (step, field),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_target_rejected() {
        let src = "name: p\nsteps:\n  - name: a\n    goal: g\n    transitions:\n      failure: nowhere\n";
        assert_eq!(
            integrity_field(src),
            (Some("a".into()), "transitions.failure".into())
        );
    }

    #[test]
    fn test_unknown_transition_key_rejected() {
        let src = "name: p\nsteps:\n  - name: a\n    goal: g\n    transitions:\n      timeout: end\n";
        assert_eq!(
            integrity_field(src),
            (Some("a".into()), "transitions.timeout".into())
        );
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(integrity_field("name: p\nsteps: []\n").1, "steps");
        assert_eq!(integrity_field("steps:\n  - name: a\n    goal: g\n").1, "name");
        assert_eq!(
            integrity_field("name: p\nsteps:\n  - name: a\n    goal: g\n  - name: a\n    goal: h\n"),
            (Some("a".into()), "name".into())
        );
        assert_eq!(
            integrity_field("name: p\nsteps:\n  - name: end\n    goal: g\n"),
            (Some("end".into()), "name".into())
        );
        assert_eq!(
            integrity_field("name: p\nsteps:\n  - name: a\n    goal: '  '\n"),
            (Some("a".into()), "goal".into())
        );
        assert_eq!(
            integrity_field("name: p\nsteps:\n  - name: a\n    goal: g\n    timeout_secs: 0\n"),
            (Some("a".into()), "timeout_secs".into())
        );
        assert_eq!(
            integrity_field("name: p\nsteps:\n  - name: a\n    goal: g\n    tool: x\n    tools: [y]\n"),
            (Some("a".into()), "tool".into())
        );
    }

    #[test]
    fn test_tool_step_document() {
        let src = r#"
name: p
steps:
  - name: build
    type: tool
    goal: Build the image
    tool: build_docker
    args:
      tag: "{{ repo }}:latest"
  - name: ship
    goal: Ship it
"#;
        let plan = parse_plan(src, PlanFormat::Yaml, "inline", &defaults()).unwrap();
        assert_eq!(plan.steps[0].kind, StepKind::Tool);
        assert_eq!(plan.steps[0].args["tag"], "{{ repo }}:latest");
        assert_eq!(plan.steps[1].kind, StepKind::Agent);
        assert!(plan.steps[1].args.is_empty());
    }

    #[test]
    fn test_tool_step_rules() {
        assert_eq!(
            integrity_field("name: p\nsteps:\n  - name: a\n    type: tool\n    goal: g\n"),
            (Some("a".into()), "tool".into())
        );
        assert_eq!(
            integrity_field("name: p\nsteps:\n  - name: a\n    type: tool\n    goal: g\n    tool: echo\n    prompt: persona\n"),
            (Some("a".into()), "prompt".into())
        );
        assert_eq!(
            integrity_field("name: p\nsteps:\n  - name: a\n    goal: g\n    args: {text: hi}\n"),
            (Some("a".into()), "args".into())
        );
        assert_eq!(
            integrity_field("name: p\nsteps:\n  - name: a\n    type: script\n    goal: g\n").1,
            "document"
        );
    }

    #[test]
    fn test_success_cannot_retry() {
        let src = "name: p\nsteps:\n  - name: a\n    goal: g\n    transitions:\n      success: retry\n";
        assert_eq!(
            integrity_field(src),
            (Some("a".into()), "transitions.success".into())
        );
    }

    #[test]
    fn test_malformed_document() {
        assert_eq!(integrity_field("name: [unclosed\n").1, "document");
    }

    #[test]
    fn test_load_from_file_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.yml");
        std::fs::write(&path, YAML).unwrap();
        let plan = load_plan(&path, &defaults()).unwrap();
        assert_eq!(plan.source, path.display().to_string());

        let bad = dir.path().join("plan.txt");
        std::fs::write(&bad, YAML).unwrap();
        assert!(matches!(load_plan(&bad, &defaults()), Err(PlanError::Read { .. })));
    }
}
