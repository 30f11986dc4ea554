//! 运行过程事件：供 CLI 等前端实时展示步骤进度

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::core::StepPhase;
use crate::workflow::{RunStatus, StepAttempt};

pub type RunEventSender = UnboundedSender<RunEvent>;

/// 运行事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        plan: String,
        steps: usize,
    },
    /// 步骤开始一次新的访问
    StepStarted {
        step: String,
        visit: u32,
        retries: u32,
    },
    /// 阶段切换（Deciding / Invoking / Evaluating ...）
    Phase {
        step: String,
        attempt: u32,
        phase: StepPhase,
    },
    /// 一次尝试已落盘
    AttemptRecorded { attempt: StepAttempt },
    StepFinished {
        step: String,
        visit: u32,
        phase: StepPhase,
        next: String,
    },
    RunFinished {
        run_id: String,
        status: RunStatus,
        failure: Option<String>,
    },
}

/// 无接收方时静默丢弃
pub fn send_event(tx: Option<&RunEventSender>, ev: RunEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
