//! 计划模型与执行：类型、加载校验、构建器、运行记录、共享上下文、Run Manager

pub mod builder;
pub mod context;
pub mod engine;
pub mod graph;
pub mod loader;
pub mod run;
pub mod types;

pub use builder::{PlanBuilder, StepBuilder};
pub use context::RunContext;
pub use engine::{check_capabilities, create_engine, EngineParts, PlanEngine, RunManager, SUPPORTED_ENGINES};
pub use graph::{unreachable_steps, PlanGraph};
pub use loader::{load_plan, parse_plan, PlanDocument, PlanFormat, StepDocument};
pub use run::{
    AttemptStatus, RunFilter, RunRecord, RunStatus, RunSummary, StepAttempt, StepLedger,
    ToolInvocationRecord,
};
pub use types::{Plan, PlanError, RunPolicy, Step, StepId, StepKind, Transition, RESERVED_NAMES};
