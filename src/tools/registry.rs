//! 工具注册表
//!
//! 所有能力（tool / prompt / resource）实现 Tool trait，由 ToolSource 以显式列表的方式成组提供。
//! ToolRegistry 按名索引 ToolDescriptor，保持注册顺序；同名同来源重复注册是幂等空操作，
//! 不同来源同名则返回 Conflict，除非调用方显式要求替换（替换保留原位置）。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::llm::ToolSpec;

/// 能力种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityKind {
    Tool,
    Prompt,
    Resource,
}

impl CapabilityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Tool => "tool",
            CapabilityKind::Prompt => "prompt",
            CapabilityKind::Resource => "resource",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CapabilityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tool" => Ok(CapabilityKind::Tool),
            "prompt" => Ok(CapabilityKind::Prompt),
            "resource" => Ok(CapabilityKind::Resource),
            other => Err(format!("unknown capability kind '{other}' (expected tool|prompt|resource)")),
        }
    }
}

/// 能力 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 能力名称（用于 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn kind(&self) -> CapabilityKind {
        CapabilityKind::Tool
    }

    /// 参数 JSON Schema（供 LLM 生成正确的参数格式）
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行；Err 为工具层面的失败，交给状态机按失败处理
    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 能力来源：一个命名空间，以显式列表暴露其能力
pub trait ToolSource: Send + Sync {
    fn namespace(&self) -> &str;

    fn tools(&self) -> Vec<Arc<dyn Tool>>;
}

/// 已注册能力的描述；注册后不可变
#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub kind: CapabilityKind,
    pub description: String,
    pub input_schema: Value,
    pub source: String,
    pub callable: Arc<dyn Tool>,
}

impl ToolDescriptor {
    pub fn from_tool(tool: Arc<dyn Tool>, source: impl Into<String>) -> Self {
        Self {
            name: tool.name().to_string(),
            kind: tool.kind(),
            description: tool.description().to_string(),
            input_schema: tool.parameters_schema(),
            source: source.into(),
            callable: tool,
        }
    }

    /// 供模型使用的候选工具描述
    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.input_schema.clone(),
        }
    }
}

impl fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("capability '{0}' is not registered")]
    NotFound(String),

    #[error("capability '{name}' already registered by '{existing}', refusing registration from '{incoming}'")]
    Conflict {
        name: String,
        existing: String,
        incoming: String,
    },
}

/// 进程级共享注册表：读多写少
pub type SharedRegistry = Arc<RwLock<ToolRegistry>>;

/// 工具注册表：按注册顺序存储描述，name -> 下标 索引
#[derive(Default)]
pub struct ToolRegistry {
    entries: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.entries.iter().map(|d| d.name.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_shared(self) -> SharedRegistry {
        Arc::new(RwLock::new(self))
    }

    /// 注册一个来源的全部能力，返回新增数量
    pub fn register(&mut self, source: &dyn ToolSource) -> Result<usize, RegistryError> {
        self.register_with(source, false)
    }

    /// 注册一个来源；`replace` 为 true 时覆盖其它来源的同名能力
    ///
    /// 冲突检查先于任何写入，失败时注册表保持不变。
    pub fn register_with(&mut self, source: &dyn ToolSource, replace: bool) -> Result<usize, RegistryError> {
        let namespace = source.namespace().to_string();
        let descriptors: Vec<ToolDescriptor> = source
            .tools()
            .into_iter()
            .map(|t| ToolDescriptor::from_tool(t, namespace.clone()))
            .collect();

        if !replace {
            for d in &descriptors {
                self.check_conflict(d)?;
            }
        }

        let mut added = 0;
        for d in descriptors {
            if self.insert(d, replace)? {
                added += 1;
            }
        }
        tracing::debug!(source = %namespace, added, total = self.entries.len(), "registered capability source");
        Ok(added)
    }

    /// 显式注册单个能力；返回是否为新增
    pub fn register_one(&mut self, descriptor: ToolDescriptor) -> Result<bool, RegistryError> {
        self.insert(descriptor, false)
    }

    pub fn register_one_replacing(&mut self, descriptor: ToolDescriptor) -> Result<bool, RegistryError> {
        self.insert(descriptor, true)
    }

    fn check_conflict(&self, d: &ToolDescriptor) -> Result<(), RegistryError> {
        match self.index.get(&d.name).map(|&i| &self.entries[i]) {
            Some(existing) if existing.source != d.source => Err(RegistryError::Conflict {
                name: d.name.clone(),
                existing: existing.source.clone(),
                incoming: d.source.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn insert(&mut self, d: ToolDescriptor, replace: bool) -> Result<bool, RegistryError> {
        match self.index.get(&d.name).copied() {
            None => {
                self.index.insert(d.name.clone(), self.entries.len());
                self.entries.push(d);
                Ok(true)
            }
            Some(i) if self.entries[i].source == d.source && !replace => Ok(false),
            Some(i) if replace => {
                tracing::info!(name = %d.name, from = %self.entries[i].source, to = %d.source, "replacing capability");
                self.entries[i] = d;
                Ok(false)
            }
            Some(_) => {
                self.check_conflict(&d)?;
                Ok(false)
            }
        }
    }

    pub fn resolve(&self, name: &str) -> Result<ToolDescriptor, RegistryError> {
        self.index
            .get(name)
            .map(|&i| self.entries[i].clone())
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))
    }

    /// 按注册顺序列出，可按种类过滤
    pub fn list(&self, kind: Option<CapabilityKind>) -> Vec<ToolDescriptor> {
        self.entries
            .iter()
            .filter(|d| kind.map_or(true, |k| d.kind == k))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 以固定列表构成的来源，适合一次性组装或测试
pub struct StaticSource {
    namespace: String,
    tools: Vec<Arc<dyn Tool>>,
}

impl StaticSource {
    pub fn new(namespace: impl Into<String>, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self {
            namespace: namespace.into(),
            tools,
        }
    }
}

impl ToolSource for StaticSource {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn tools(&self) -> Vec<Arc<dyn Tool>> {
        self.tools.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, CapabilityKind);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "test capability"
        }
        fn kind(&self) -> CapabilityKind {
            self.1
        }
        async fn execute(&self, _args: Value) -> Result<String, String> {
            Ok(self.0.to_string())
        }
    }

    fn source(ns: &str, names: &[&'static str]) -> StaticSource {
        StaticSource::new(
            ns,
            names
                .iter()
                .map(|n| Arc::new(Named(n, CapabilityKind::Tool)) as Arc<dyn Tool>)
                .collect(),
        )
    }

    #[test]
    fn test_register_same_source_is_noop() {
        let mut reg = ToolRegistry::new();
        assert_eq!(reg.register(&source("devops", &["build_docker"])).unwrap(), 1);
        assert_eq!(reg.register(&source("devops", &["build_docker"])).unwrap(), 0);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_register_other_source_conflicts() {
        let mut reg = ToolRegistry::new();
        reg.register(&source("devops", &["build_docker"])).unwrap();
        let err = reg.register(&source("ci", &["run_tests", "build_docker"])).unwrap_err();
        assert_eq!(
            err,
            RegistryError::Conflict {
                name: "build_docker".into(),
                existing: "devops".into(),
                incoming: "ci".into()
            }
        );
        // 冲突时整个来源都不写入
        assert!(reg.resolve("run_tests").is_err());
        assert_eq!(reg.resolve("build_docker").unwrap().source, "devops");
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut reg = ToolRegistry::new();
        reg.register(&source("a", &["first", "second"])).unwrap();
        reg.register_with(&source("b", &["first"]), true).unwrap();
        let names: Vec<_> = reg.list(None).into_iter().map(|d| (d.name, d.source)).collect();
        assert_eq!(
            names,
            vec![("first".to_string(), "b".to_string()), ("second".to_string(), "a".to_string())]
        );
    }

    #[test]
    fn test_resolve_not_found() {
        let reg = ToolRegistry::new();
        assert_eq!(
            reg.resolve("missing").unwrap_err(),
            RegistryError::NotFound("missing".into())
        );
    }

    #[test]
    fn test_list_filters_by_kind() {
        let mut reg = ToolRegistry::new();
        reg.register(&source("builtin", &["echo"])).unwrap();
        let persona: Arc<dyn Tool> = Arc::new(Named("builder", CapabilityKind::Prompt));
        assert!(reg
            .register_one(ToolDescriptor::from_tool(persona, "prompts"))
            .unwrap());
        assert_eq!(reg.list(Some(CapabilityKind::Prompt)).len(), 1);
        assert_eq!(reg.list(Some(CapabilityKind::Tool))[0].name, "echo");
        assert_eq!(reg.list(None).len(), 2);
    }

    #[test]
    fn test_register_one_conflict_and_replace() {
        let mut reg = ToolRegistry::new();
        let t: Arc<dyn Tool> = Arc::new(Named("x", CapabilityKind::Tool));
        reg.register_one(ToolDescriptor::from_tool(t.clone(), "a")).unwrap();
        assert!(reg.register_one(ToolDescriptor::from_tool(t.clone(), "b")).is_err());
        assert!(!reg
            .register_one_replacing(ToolDescriptor::from_tool(t, "b"))
            .unwrap());
        assert_eq!(reg.resolve("x").unwrap().source, "b");
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("Prompt".parse::<CapabilityKind>().unwrap(), CapabilityKind::Prompt);
        assert!("other".parse::<CapabilityKind>().is_err());
    }
}
