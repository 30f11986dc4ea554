//! planrun - 声明式多步计划执行引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误分类、恢复策略、步骤阶段、取消信号
//! - **llm**: 模型后端抽象与实现（OpenAI 兼容 / DeepSeek / Mock / Scripted）与工具调用协议
//! - **memory**: 步骤对话与工作记忆
//! - **react**: 步骤状态机、对话构建、运行事件
//! - **store**: 结果存储（SQLite / JSONL / 内存）
//! - **tools**: 能力注册表、内置工具、插件程序、persona prompt 与执行器
//! - **workflow**: 计划模型、加载校验、运行记录、Run Manager

pub mod config;
pub mod core;
pub mod exit_codes;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod store;
pub mod tools;
pub mod workflow;

pub use crate::core::EngineError;
pub use workflow::{load_plan, Plan, PlanEngine, RunManager, RunRecord, RunStatus};
