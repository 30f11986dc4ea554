//! 能力层：注册表、执行器、结果约定与内置/插件能力来源

pub mod echo;
pub mod executor;
pub mod plugin;
pub mod registry;
pub mod result;
pub mod schema;
pub mod shell;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use echo::EchoTool;
pub use executor::{Invocation, ToolExecutor};
pub use plugin::{PluginTool, PromptTemplate};
pub use registry::{
    CapabilityKind, RegistryError, SharedRegistry, StaticSource, Tool, ToolDescriptor, ToolRegistry,
    ToolSource,
};
pub use result::{classify, ToolOutcome};
pub use schema::tool_call_schema_json;
pub use shell::ShellTool;

use crate::config::ToolsSection;

/// 命名空间 `builtin`：echo 与白名单 shell
pub struct BuiltinSource {
    shell_allowed: Vec<String>,
    shell_timeout_secs: u64,
    workspace: PathBuf,
}

impl BuiltinSource {
    pub fn new(cfg: &ToolsSection, workspace: &Path) -> Self {
        Self {
            shell_allowed: cfg.shell.allowed_commands.clone(),
            shell_timeout_secs: cfg.shell.timeout_secs,
            workspace: workspace.to_path_buf(),
        }
    }
}

impl ToolSource for BuiltinSource {
    fn namespace(&self) -> &str {
        "builtin"
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        vec![
            Arc::new(EchoTool),
            Arc::new(
                ShellTool::new(self.shell_allowed.clone(), self.shell_timeout_secs)
                    .with_workdir(self.workspace.clone()),
            ),
        ]
    }
}

/// 命名空间 `plugins`：配置中的 [[tools.plugins]]
pub struct PluginSource {
    tools: Vec<Arc<dyn Tool>>,
}

impl PluginSource {
    pub fn new(cfg: &ToolsSection, workspace: &Path) -> Self {
        let tools = cfg
            .plugins
            .iter()
            .map(|p| Arc::new(PluginTool::new(p, workspace, cfg.plugin_timeout_secs)) as Arc<dyn Tool>)
            .collect();
        Self { tools }
    }
}

impl ToolSource for PluginSource {
    fn namespace(&self) -> &str {
        "plugins"
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.clone()
    }
}

/// 命名空间 `prompts`：配置中的 [[tools.prompts]]
pub struct PromptSource {
    prompts: Vec<Arc<dyn Tool>>,
}

impl PromptSource {
    pub fn new(cfg: &ToolsSection) -> Self {
        let prompts = cfg
            .prompts
            .iter()
            .map(|p| Arc::new(PromptTemplate::from_entry(p)) as Arc<dyn Tool>)
            .collect();
        Self { prompts }
    }
}

impl ToolSource for PromptSource {
    fn namespace(&self) -> &str {
        "prompts"
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.prompts.clone()
    }
}

/// 按配置组装默认注册表：builtin → plugins → prompts
pub fn build_registry(cfg: &ToolsSection, workspace: &Path) -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();
    registry.register(&BuiltinSource::new(cfg, workspace))?;
    registry.register(&PluginSource::new(cfg, workspace))?;
    registry.register(&PromptSource::new(cfg))?;
    tracing::info!(capabilities = registry.len(), "tool registry ready");
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PluginEntry, PromptEntry};

    #[test]
    fn test_build_registry_from_config() {
        let mut cfg = ToolsSection::default();
        cfg.plugins.push(PluginEntry {
            name: "build_docker".into(),
            description: "Build image".into(),
            program: "docker".into(),
            args: vec!["build".into(), "{{workspace}}".into()],
            schema: None,
        });
        cfg.prompts.push(PromptEntry {
            name: "builder".into(),
            description: "Builder persona".into(),
            template: "You are a release engineer.".into(),
        });
        let reg = build_registry(&cfg, Path::new(".")).unwrap();
        let names: Vec<_> = reg.list(None).into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["echo", "shell", "build_docker", "builder"]);
        assert_eq!(reg.resolve("builder").unwrap().kind, CapabilityKind::Prompt);
        assert_eq!(reg.resolve("build_docker").unwrap().source, "plugins");
    }

    #[test]
    fn test_plugin_shadowing_builtin_conflicts() {
        let mut cfg = ToolsSection::default();
        cfg.plugins.push(PluginEntry {
            name: "echo".into(),
            description: String::new(),
            program: "echo".into(),
            args: vec![],
            schema: None,
        });
        let err = build_registry(&cfg, Path::new(".")).unwrap_err();
        assert!(matches!(err, RegistryError::Conflict { .. }));
    }
}
