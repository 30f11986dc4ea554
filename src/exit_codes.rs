//! 进程退出码

use crate::core::EngineError;
use crate::workflow::RunStatus;

pub const COMPLETED: i32 = 0;
/// 计划完整性 / 配置 / 注册表错误
pub const INVALID_INPUT: i32 = 1;
pub const ABORTED: i32 = 2;
pub const EXHAUSTED: i32 = 3;
/// 运行 errored 或基础设施故障（含存储）
pub const ERRORED: i32 = 4;

pub fn for_status(status: RunStatus) -> i32 {
    match status {
        RunStatus::Completed => COMPLETED,
        RunStatus::Aborted => ABORTED,
        RunStatus::Exhausted => EXHAUSTED,
        RunStatus::Errored | RunStatus::Running => ERRORED,
    }
}

pub fn for_error(err: &EngineError) -> i32 {
    if err.is_infrastructure() {
        ERRORED
    } else {
        INVALID_INPUT
    }
}
