//! 核心层：错误分类、恢复策略、步骤阶段、取消信号

pub mod error;
pub mod recovery;
pub mod shutdown;
pub mod state;

pub use error::{AttemptFault, EngineError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use shutdown::{ShutdownManager, ShutdownReason};
pub use state::StepPhase;
