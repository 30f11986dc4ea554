//! 插件能力：由配置 [[tools.plugins]] / [[tools.prompts]] 注册
//!
//! - PluginTool：运行「程序 + 参数模板」。模板中 {{workspace}} 替换为工作区路径，{{key}} 取自模型传入的 args；
//!   不经过 shell，直接 exec，输出为结果约定 JSON
//! - PromptTemplate：prompt 类能力，以 {{key}} 模板渲染 persona 指令

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::process::Command;

use crate::config::{PluginEntry, PromptEntry};
use crate::tools::registry::CapabilityKind;
use crate::tools::result::process_report;
use crate::tools::schema::string_params_schema;
use crate::tools::Tool;

static PLACEHOLDER_RE: OnceLock<Regex> = OnceLock::new();

fn placeholder_re() -> &'static Regex {
    PLACEHOLDER_RE.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap())
}

/// 模板中出现的占位符（去掉 workspace，按字母序）
fn placeholders<'a>(templates: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut set = BTreeSet::new();
    for t in templates {
        for c in placeholder_re().captures_iter(t) {
            if &c[1] != "workspace" {
                set.insert(c[1].to_string());
            }
        }
    }
    set.into_iter().collect()
}

pub(crate) fn value_text(v: &Value) -> String {
    match v {
        Value::String(x) => x.clone(),
        _ => v.to_string(),
    }
}

/// 从配置项构建的插件工具
pub struct PluginTool {
    name: String,
    description: String,
    program: String,
    args_template: Vec<String>,
    schema: Value,
    workspace: PathBuf,
    timeout_secs: u64,
}

impl PluginTool {
    pub fn new(entry: &PluginEntry, workspace: &Path, timeout_secs: u64) -> Self {
        let schema = entry.schema.clone().unwrap_or_else(|| {
            string_params_schema(&placeholders(entry.args.iter().map(String::as_str)))
        });
        Self {
            name: entry.name.clone(),
            description: entry.description.clone(),
            program: entry.program.clone(),
            args_template: entry.args.clone(),
            schema,
            workspace: workspace.to_path_buf(),
            timeout_secs,
        }
    }

    /// 替换模板中的 {{workspace}} 和 {{key}}；未提供的 key 原样保留
    fn substitute(&self, args: &Value) -> Vec<String> {
        let workspace_str = self.workspace.to_string_lossy();
        let empty = serde_json::Map::new();
        let obj = args.as_object().unwrap_or(&empty);
        self.args_template
            .iter()
            .map(|tpl| {
                placeholder_re()
                    .replace_all(tpl, |c: &regex::Captures<'_>| {
                        let key = &c[1];
                        if key == "workspace" {
                            return workspace_str.to_string();
                        }
                        obj.get(key).map(value_text).unwrap_or_else(|| c[0].to_string())
                    })
                    .into_owned()
            })
            .collect()
    }
}

#[async_trait]
impl Tool for PluginTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let args_vec = self.substitute(&args);
        tracing::info!(tool = %self.name, program = %self.program, "plugin tool invoke");
        let child = Command::new(&self.program)
            .args(&args_vec)
            .current_dir(&self.workspace)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("plugin spawn failed: {}", e))?;
        let timeout = std::time::Duration::from_secs(self.timeout_secs);
        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| format!("plugin timeout after {}s", self.timeout_secs))?
            .map_err(|e| format!("plugin wait failed: {}", e))?;
        Ok(process_report(
            output.status.code(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

/// Persona prompt：渲染后的文本作为步骤指令的前导
pub struct PromptTemplate {
    name: String,
    description: String,
    template: String,
    schema: Value,
}

impl PromptTemplate {
    pub fn new(name: impl Into<String>, description: impl Into<String>, template: impl Into<String>) -> Self {
        let template = template.into();
        let schema = string_params_schema(&placeholders([template.as_str()]));
        Self {
            name: name.into(),
            description: description.into(),
            template,
            schema,
        }
    }

    pub fn from_entry(entry: &PromptEntry) -> Self {
        Self::new(&entry.name, &entry.description, &entry.template)
    }

    /// 渲染模板；缺少必需变量时报错
    pub fn render(&self, args: &Value) -> Result<String, String> {
        let mut missing = Vec::new();
        let rendered = placeholder_re()
            .replace_all(&self.template, |c: &regex::Captures<'_>| {
                match args.get(&c[1]) {
                    Some(v) => value_text(v),
                    None => {
                        missing.push(c[1].to_string());
                        String::new()
                    }
                }
            })
            .into_owned();
        if missing.is_empty() {
            Ok(rendered)
        } else {
            Err(format!("prompt '{}' missing variables: {}", self.name, missing.join(", ")))
        }
    }
}

#[async_trait]
impl Tool for PromptTemplate {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Prompt
    }

    fn parameters_schema(&self) -> Value {
        self.schema.clone()
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        self.render(&args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry() -> PluginEntry {
        PluginEntry {
            name: "build_docker".into(),
            description: "Build an image".into(),
            program: "docker".into(),
            args: vec!["build".into(), "-t".into(), "{{tag}}".into(), "{{workspace}}".into()],
            schema: None,
        }
    }

    #[test]
    fn test_substitute_and_derived_schema() {
        let tool = PluginTool::new(&entry(), Path::new("/ws"), 10);
        assert_eq!(
            tool.substitute(&json!({"tag": "app:1"})),
            vec!["build", "-t", "app:1", "/ws"]
        );
        assert_eq!(tool.parameters_schema()["required"], json!(["tag"]));
    }

    #[test]
    fn test_missing_argument_left_verbatim() {
        let tool = PluginTool::new(&entry(), Path::new("/ws"), 10);
        assert_eq!(tool.substitute(&json!({}))[2], "{{tag}}");
    }

    #[test]
    fn test_prompt_render() {
        let p = PromptTemplate::new("builder", "Build persona", "You build {{ project }} images.");
        assert_eq!(p.kind(), CapabilityKind::Prompt);
        assert_eq!(
            p.render(&json!({"project": "planrun"})).unwrap(),
            "You build planrun images."
        );
        let err = p.render(&json!({})).unwrap_err();
        assert!(err.contains("project"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_plugin_reports_exit_code() {
        let tool = PluginTool::new(
            &PluginEntry {
                name: "say".into(),
                description: String::new(),
                program: "echo".into(),
                args: vec!["{{text}}".into()],
                schema: None,
            },
            &std::env::temp_dir(),
            5,
        );
        let out = tool.execute(json!({"text": "hello"})).await.unwrap();
        let v: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["returncode"], 0);
        assert_eq!(v["stdout"], "hello");
    }
}
