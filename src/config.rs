//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再叠加 `--config` 指定的文件，最后用环境变量 `PLANRUN__*` 覆盖
//! （双下划线表示嵌套，如 `PLANRUN__LLM__PROVIDER=openai`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub engine: EngineSection,
    pub store: StoreSection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、工作目录
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 工具执行目录，未设置时用当前目录
    pub workspace_root: Option<PathBuf>,
}

impl AppConfig {
    pub fn workspace(&self) -> PathBuf {
        self.app
            .workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：mock / openai / deepseek
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: Option<String>,
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            base_url: None,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_provider() -> String {
    "mock".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmTimeoutsSection {
    /// 单次模型请求上限（秒）；超时按后端不可用处理，计入重试预算
    #[serde(default = "default_request_timeout")]
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: default_request_timeout(),
        }
    }
}

fn default_request_timeout() -> u64 {
    60
}

/// [engine] 段：引擎选择与计划默认值
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_engine_kind")]
    pub kind: String,
    #[serde(default = "default_retries")]
    pub default_retries: u32,
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    #[serde(default = "default_max_step_visits")]
    pub max_step_visits: u32,
    /// 覆盖内置 system prompt
    pub system_prompt: Option<String>,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            kind: default_engine_kind(),
            default_retries: default_retries(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            max_step_visits: default_max_step_visits(),
            system_prompt: None,
        }
    }
}

fn default_engine_kind() -> String {
    "native".to_string()
}

fn default_retries() -> u32 {
    2
}

fn default_attempt_timeout_secs() -> u64 {
    300
}

fn default_max_step_visits() -> u32 {
    50
}

/// [store] 段：结果存储 URI（file:// / sqlite:// / memory://）
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_store_uri")]
    pub uri: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            uri: default_store_uri(),
        }
    }
}

fn default_store_uri() -> String {
    "file://runs".to_string()
}

/// [tools] 段：Shell 白名单、插件程序、persona prompt
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    #[serde(default)]
    pub shell: ShellSection,
    /// 插件进程超时（秒）
    #[serde(default = "default_plugin_timeout_secs")]
    pub plugin_timeout_secs: u64,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
    #[serde(default)]
    pub prompts: Vec<PromptEntry>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            shell: ShellSection::default(),
            plugin_timeout_secs: default_plugin_timeout_secs(),
            plugins: Vec::new(),
            prompts: Vec::new(),
        }
    }
}

fn default_plugin_timeout_secs() -> u64 {
    600
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
pub struct ShellSection {
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
    #[serde(default = "default_shell_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
            timeout_secs: default_shell_timeout_secs(),
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    vec![
        "ls".into(),
        "grep".into(),
        "cat".into(),
        "head".into(),
        "tail".into(),
        "wc".into(),
        "find".into(),
        "echo".into(),
        "cargo".into(),
        "docker".into(),
        "git".into(),
    ]
}

fn default_shell_timeout_secs() -> u64 {
    120
}

/// [[tools.plugins]]：外部程序 + 参数模板
#[derive(Debug, Clone, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// 参数 JSON Schema；缺省时由模板占位符推导
    pub schema: Option<serde_json::Value>,
}

/// [[tools.prompts]]：persona prompt 模板
#[derive(Debug, Clone, Deserialize)]
pub struct PromptEntry {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub template: String,
}

/// 从 config 目录加载配置，环境变量 PLANRUN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path，则追加该文件（可覆盖前面的键）；显式指定但不存在时报错
/// 3. 最后叠加环境变量 PLANRUN__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        builder = builder.add_source(config::File::from(path.clone()).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("PLANRUN")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let cfg: AppConfig = c.try_deserialize()?;
    cfg.validate()?;
    Ok(cfg)
}

impl AppConfig {
    /// 超时与访问上限必须大于 0（与计划文档的校验一致）
    pub fn validate(&self) -> Result<(), config::ConfigError> {
        let positive = [
            ("engine.attempt_timeout_secs", self.engine.attempt_timeout_secs),
            ("engine.max_step_visits", u64::from(self.engine.max_step_visits)),
            ("llm.timeouts.request", self.llm.timeouts.request),
            ("tools.plugin_timeout_secs", self.tools.plugin_timeout_secs),
            ("tools.shell.timeout_secs", self.tools.shell.timeout_secs),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(config::ConfigError::Message(format!(
                    "{key} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.provider, "mock");
        assert_eq!(cfg.engine.kind, "native");
        assert_eq!(cfg.engine.default_retries, 2);
        assert_eq!(cfg.engine.max_step_visits, 50);
        assert_eq!(cfg.store.uri, "file://runs");
        assert!(cfg.tools.shell.allowed_commands.contains(&"ls".to_string()));
    }

    #[test]
    fn test_load_explicit_file() {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            f,
            r#"
[engine]
default_retries = 5

[store]
uri = "memory://"

[[tools.plugins]]
name = "build_docker"
program = "docker"
args = ["build", "{{{{workspace}}}}"]

[[tools.prompts]]
name = "builder"
template = "You build things."
"#
        )
        .unwrap();
        let cfg = load_config(Some(f.path().to_path_buf())).unwrap();
        assert_eq!(cfg.engine.default_retries, 5);
        assert_eq!(cfg.engine.attempt_timeout_secs, 300);
        assert_eq!(cfg.store.uri, "memory://");
        assert_eq!(cfg.tools.plugins[0].args[1], "{{workspace}}");
        assert_eq!(cfg.tools.prompts[0].name, "builder");
    }

    #[test]
    fn test_zero_limits_rejected() {
        for (section, key) in [
            ("engine", "max_step_visits"),
            ("engine", "attempt_timeout_secs"),
            ("llm.timeouts", "request"),
        ] {
            let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
            writeln!(f, "[{section}]\n{key} = 0").unwrap();
            let err = load_config(Some(f.path().to_path_buf())).unwrap_err();
            assert!(
                err.to_string().contains(&format!("{section}.{key} must be greater than zero")),
                "{err}"
            );
        }
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        assert!(load_config(Some(PathBuf::from("/nonexistent/planrun.toml"))).is_err());
    }
}
