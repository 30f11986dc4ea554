//! 运行记录
//!
//! RunRecord 由 Run Manager 独占；步骤状态机只通过 StepLedger 追加本步骤的 StepAttempt，
//! 每次追加先写入 ResultStore 再进入内存记录。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::react::events::{send_event, RunEvent, RunEventSender};
use crate::store::{ResultStore, StoreError};
use crate::workflow::types::Plan;

/// 单次尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Succeeded,
    Failed,
    Errored,
    /// 取消标记：运行在两次尝试之间被取消
    Cancelled,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Errored => "errored",
            AttemptStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(AttemptStatus::Succeeded),
            "failed" => Ok(AttemptStatus::Failed),
            "errored" => Ok(AttemptStatus::Errored),
            "cancelled" => Ok(AttemptStatus::Cancelled),
            other => Err(format!("unknown attempt status '{other}'")),
        }
    }
}

/// 工具调用记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub name: String,
    pub arguments: Value,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// 一个步骤的一次执行；记录后不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepAttempt {
    pub step_id: String,
    /// 步骤在本次运行执行序列中的位置（从 1 开始）
    pub visit: u32,
    /// 本次访问内的尝试序号（从 1 开始）
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// 发给模型的请求摘要
    pub request: String,
    /// 模型决定摘要
    pub response: Option<String>,
    pub invocation: Option<ToolInvocationRecord>,
    pub status: AttemptStatus,
    pub detail: String,
}

/// 运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Aborted,
    Exhausted,
    Errored,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
            RunStatus::Exhausted => "exhausted",
            RunStatus::Errored => "errored",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "aborted" => Ok(RunStatus::Aborted),
            "exhausted" => Ok(RunStatus::Exhausted),
            "errored" => Ok(RunStatus::Errored),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// 一次运行的完整记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub plan_name: String,
    pub plan_source: String,
    pub attempts: Vec<StepAttempt>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    /// 最后一次失败的说明
    pub failure: Option<String>,
}

impl RunRecord {
    pub fn new(plan: &Plan) -> Self {
        Self {
            run_id: format!("run_{}", uuid::Uuid::new_v4()),
            plan_name: plan.name.clone(),
            plan_source: plan.source.clone(),
            attempts: Vec::new(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            failure: None,
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            plan_name: self.plan_name.clone(),
            status: self.status,
            started_at: self.started_at,
            ended_at: self.ended_at,
            attempts: self.attempts.len(),
        }
    }

    pub fn last_attempt(&self) -> Option<&StepAttempt> {
        self.attempts.last()
    }

    /// 某次访问的全部尝试
    pub fn visit_attempts(&self, visit: u32) -> Vec<&StepAttempt> {
        self.attempts.iter().filter(|a| a.visit == visit).collect()
    }

    /// 已开始的访问数
    pub fn visits(&self) -> u32 {
        self.attempts.iter().map(|a| a.visit).max().unwrap_or(0)
    }

    /// 每个访问的最终尝试（用于报告每步结果）
    pub fn visit_outcomes(&self) -> Vec<&StepAttempt> {
        let mut out: Vec<&StepAttempt> = Vec::new();
        for a in &self.attempts {
            match out.last_mut() {
                Some(last) if last.visit == a.visit => *last = a,
                _ => out.push(a),
            }
        }
        out
    }
}

/// 运行摘要（list_runs 返回）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub plan_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attempts: usize,
}

/// list_runs 过滤条件
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub status: Option<RunStatus>,
    pub plan: Option<String>,
}

impl RunFilter {
    pub fn matches(&self, s: &RunSummary) -> bool {
        self.status.map_or(true, |st| st == s.status)
            && self.plan.as_deref().map_or(true, |p| p == s.plan_name)
    }
}

/// 按开始时间、run id 排序
pub fn sort_summaries(list: &mut [RunSummary]) {
    list.sort_by(|a, b| {
        a.started_at
            .cmp(&b.started_at)
            .then_with(|| a.run_id.cmp(&b.run_id))
    });
}

/// 步骤账本：只允许追加尝试，追加即持久化
pub struct StepLedger<'a> {
    record: &'a mut RunRecord,
    store: &'a dyn ResultStore,
    events: Option<&'a RunEventSender>,
}

impl<'a> StepLedger<'a> {
    pub fn new(
        record: &'a mut RunRecord,
        store: &'a dyn ResultStore,
        events: Option<&'a RunEventSender>,
    ) -> Self {
        Self {
            record,
            store,
            events,
        }
    }

    /// 先写存储，成功后再进入内存记录
    pub async fn append(&mut self, attempt: StepAttempt) -> Result<(), StoreError> {
        self.store.append(&self.record.run_id, &attempt).await?;
        tracing::debug!(
            run_id = %self.record.run_id,
            step = %attempt.step_id,
            visit = attempt.visit,
            attempt = attempt.attempt,
            status = %attempt.status,
            "attempt recorded"
        );
        send_event(
            self.events,
            RunEvent::AttemptRecorded {
                attempt: attempt.clone(),
            },
        );
        self.record.attempts.push(attempt);
        Ok(())
    }

    /// 本次访问已记录的尝试（续跑时用于恢复预算与反馈）
    pub fn recorded(&self, visit: u32) -> Vec<StepAttempt> {
        self.record
            .visit_attempts(visit)
            .into_iter()
            .cloned()
            .collect()
    }
}
