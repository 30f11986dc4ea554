//! Shell 工具：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cargo）；禁止 rm -rf、wget、chmod 777 等子串。
//! 执行通过 sh -c / cmd /C，在工作区目录内运行，输出为结果约定 JSON（returncode / stdout / stderr）。

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::tools::result::process_report;
use crate::tools::Tool;

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

pub struct ShellTool {
    allowed_commands: HashSet<String>,
    timeout_secs: u64,
    workdir: Option<PathBuf>,
    description: String,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>, timeout_secs: u64) -> Self {
        let mut sorted: Vec<String> = allowed_commands.iter().map(|s| s.to_lowercase()).collect();
        sorted.sort();
        let description = format!(
            "Run a whitelisted shell command and report returncode/stdout/stderr as JSON. Allowed commands: {}.",
            sorted.join(", ")
        );
        Self {
            allowed_commands: sorted.into_iter().collect(),
            timeout_secs,
            workdir: None,
            description,
        }
    }

    /// 命令在该目录内执行
    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// 只取第一个 token 作为命令名
    fn command_name<'a>(&self, raw: &'a str) -> &'a str {
        raw.split_whitespace().next().unwrap_or("")
    }

    fn is_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {}", forbidden));
            }
        }
        let name = self.command_name(&raw_lower);
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(format!("Command '{}' not in allowlist", name))
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute (must be in allowlist)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        self.is_allowed(command)?;

        tracing::info!(command = %command, "shell tool execute");

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command]);
            c
        };
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(
            std::time::Duration::from_secs(self.timeout_secs),
            cmd.output(),
        )
        .await
        .map_err(|_| format!("Command timed out after {}s", self.timeout_secs))?
        .map_err(|e| format!("Execution failed: {}", e))?;

        Ok(process_report(
            output.status.code(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}
