//! 步骤阶段定义
//!
//! 状态机内部维护 StepPhase，并用 can_transition 约束合法迁移；终态由 Run Manager 消费。

use serde::{Deserialize, Serialize};

/// 单个步骤在状态机中的阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Pending,
    Deciding,
    Invoking,
    Evaluating,
    /// 单次尝试失败；被消费后回到 Deciding
    Failed,
    Succeeded,
    Exhausted,
    Errored,
    /// 取消标记：既不是成功也不是失败
    Cancelled,
}

impl StepPhase {
    /// 对整个步骤而言的终态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepPhase::Succeeded | StepPhase::Exhausted | StepPhase::Errored | StepPhase::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepPhase::Pending => "pending",
            StepPhase::Deciding => "deciding",
            StepPhase::Invoking => "invoking",
            StepPhase::Evaluating => "evaluating",
            StepPhase::Failed => "failed",
            StepPhase::Succeeded => "succeeded",
            StepPhase::Exhausted => "exhausted",
            StepPhase::Errored => "errored",
            StepPhase::Cancelled => "cancelled",
        }
    }

    pub fn can_transition(self, to: StepPhase) -> bool {
        use StepPhase::{
            Cancelled, Deciding, Errored, Evaluating, Exhausted, Failed, Invoking, Pending, Succeeded,
        };
        match (self, to) {
            // tool 步骤不经过 Deciding，直接调用
            (Pending, Deciding | Invoking | Errored | Cancelled) => true,
            // final answer / 越界工具 / 后端不可用 / 超时 均在 Deciding 阶段直接失败
            (Deciding, Invoking | Failed | Errored) => true,
            (Invoking, Evaluating | Failed | Errored) => true,
            (Evaluating, Succeeded | Failed | Errored) => true,
            (Failed, Deciding | Invoking | Exhausted | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for StepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let path = [
            StepPhase::Pending,
            StepPhase::Deciding,
            StepPhase::Invoking,
            StepPhase::Evaluating,
            StepPhase::Succeeded,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_retry_loop_transitions() {
        assert!(StepPhase::Evaluating.can_transition(StepPhase::Failed));
        assert!(StepPhase::Failed.can_transition(StepPhase::Deciding));
        assert!(StepPhase::Failed.can_transition(StepPhase::Exhausted));
    }

    #[test]
    fn test_direct_tool_path_skips_deciding() {
        assert!(StepPhase::Pending.can_transition(StepPhase::Invoking));
        assert!(StepPhase::Failed.can_transition(StepPhase::Invoking));
        assert!(!StepPhase::Deciding.can_transition(StepPhase::Evaluating));
    }

    #[test]
    fn test_terminal_phases_do_not_transition() {
        for phase in [StepPhase::Succeeded, StepPhase::Exhausted, StepPhase::Errored] {
            assert!(phase.is_terminal());
            assert!(!phase.can_transition(StepPhase::Deciding));
        }
        assert!(!StepPhase::Failed.is_terminal());
    }

    #[test]
    fn test_errored_never_goes_through_failed() {
        assert!(!StepPhase::Errored.can_transition(StepPhase::Failed));
        assert!(!StepPhase::Pending.can_transition(StepPhase::Succeeded));
    }
}
