//! 错误恢复引擎
//!
//! 根据 AttemptFault 与重试预算返回 RecoveryAction，供步骤状态机决定是带反馈重试、耗尽还是升级为 Errored。

use crate::core::{AttemptFault, RecoveryAction};

/// 将单次尝试的故障映射为下一步动作；预算 R 意味着最多 R+1 次尝试
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// attempts_used：本次访问已消耗的尝试次数（含刚失败的这一次）
    pub fn handle(&self, fault: &AttemptFault, attempts_used: u32, retry_budget: u32) -> RecoveryAction {
        if !fault.is_retryable() {
            return RecoveryAction::Escalate;
        }
        if attempts_used > retry_budget {
            return RecoveryAction::Exhaust;
        }
        RecoveryAction::RetryWithFeedback(self.feedback(fault, attempts_used, retry_budget))
    }

    /// 给下一次尝试的纠正提示
    fn feedback(&self, fault: &AttemptFault, attempts_used: u32, retry_budget: u32) -> String {
        let remaining = retry_budget + 1 - attempts_used;
        let hint = match fault {
            AttemptFault::ToolFailure(detail) => format!(
                "The tool call failed with this output:\n{detail}\nFix the arguments or approach and call the tool again."
            ),
            AttemptFault::FinalAnswerOnly(_) => {
                "You answered in plain text. This step is only complete once you call a tool. \
                 Respond with a tool call."
                    .to_string()
            }
            AttemptFault::ToolOutsideCandidates { tool, allowed } => format!(
                "Tool '{tool}' cannot be used in this step. Choose one of: {allowed}."
            ),
            AttemptFault::BackendUnavailable(msg) => {
                format!("The previous request could not be completed ({msg}). Try again.")
            }
            AttemptFault::TimedOut(d) => format!(
                "The previous attempt exceeded the {}s time limit. Use a faster approach.",
                d.as_secs()
            ),
            other => other.to_string(),
        };
        format!("Attempt {attempts_used} failed. {hint} ({remaining} attempt(s) left)")
    }
}
