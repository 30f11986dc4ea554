//! 步骤状态机
//!
//! Pending -> Deciding -> Invoking -> Evaluating -> Succeeded，失败时经 Failed 带反馈回到 Deciding，
//! 预算用尽进入 Exhausted，基础设施/契约故障直接 Errored；取消只在两次尝试之间生效。
//! tool 类步骤跳过 Deciding，以静态参数直接调用固定工具，其余（分类、重试、记录）相同。
//! 每次尝试在状态迁移之前通过 StepLedger 落盘。

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{AttemptFault, RecoveryAction, RecoveryEngine, StepPhase};
use crate::llm::traits::truncate;
use crate::llm::{Decision, LlmClient, ToolSpec};
use crate::memory::{Conversation, WorkingMemory};
use crate::react::events::{send_event, RunEvent, RunEventSender};
use crate::react::planner;
use crate::store::StoreError;
use crate::tools::{
    classify, CapabilityKind, Invocation, SharedRegistry, ToolDescriptor, ToolExecutor, ToolOutcome,
};
use crate::workflow::{
    AttemptStatus, RunContext, Step, StepAttempt, StepKind, StepLedger, ToolInvocationRecord,
};

/// 请求摘要里工具名列表的最大长度
const REQUEST_SUMMARY_CHARS: usize = 300;

/// 一次访问的结果，交给 Run Manager 选择转移
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// 终态：Succeeded / Exhausted / Errored / Cancelled
    pub phase: StepPhase,
    /// 本次访问累计尝试次数（含续跑前已记录的）
    pub attempts: u32,
    /// 成功时的工具输出
    pub output: Option<String>,
    /// 最后一次失败的说明
    pub detail: Option<String>,
}

/// 状态机依赖（一次运行内共享）
pub struct StepStateMachine<'a> {
    pub llm: &'a dyn LlmClient,
    pub registry: &'a SharedRegistry,
    pub executor: &'a ToolExecutor,
    pub recovery: &'a RecoveryEngine,
    pub system_prompt: &'a str,
    /// 单次后端请求超时；超时视为后端不可用
    pub request_timeout: Option<Duration>,
    pub events: Option<&'a RunEventSender>,
}

/// 一次尝试内逐步填充的记录草稿；尝试被超时打断时也能留下已知部分
struct AttemptDraft<'e> {
    step: String,
    attempt: u32,
    phase: StepPhase,
    response: Option<String>,
    invocation: Option<ToolInvocationRecord>,
    events: Option<&'e RunEventSender>,
}

impl AttemptDraft<'_> {
    fn advance(&mut self, next: StepPhase) {
        advance_phase(&mut self.phase, next, &self.step, self.attempt, self.events);
    }
}

fn advance_phase(
    phase: &mut StepPhase,
    next: StepPhase,
    step: &str,
    attempt: u32,
    events: Option<&RunEventSender>,
) {
    debug_assert!(
        phase.can_transition(next),
        "illegal step transition {phase} -> {next}"
    );
    tracing::debug!(step = %step, attempt, from = %phase, to = %next, "step phase");
    *phase = next;
    send_event(
        events,
        RunEvent::Phase {
            step: step.to_string(),
            attempt,
            phase: next,
        },
    );
}

/// 准备阶段的产物
struct Prepared {
    conversation: Conversation,
    candidates: Vec<ToolSpec>,
}

impl StepStateMachine<'_> {
    /// 执行一次步骤访问；只有存储失败会以 Err 返回
    pub async fn execute(
        &self,
        step: &Step,
        visit: u32,
        context: &RunContext,
        ledger: &mut StepLedger<'_>,
        cancel: &CancellationToken,
    ) -> Result<StepReport, StoreError> {
        let prior = ledger.recorded(visit);
        let mut attempts_used = prior.len() as u32;
        let mut phase = StepPhase::Pending;

        let prepared = match self.prepare(step, context).await {
            Ok(p) => p,
            Err(fault) => {
                let detail = fault.to_string();
                tracing::warn!(step = %step.name, visit, error = %detail, "step preparation failed");
                let now = Utc::now();
                ledger
                    .append(StepAttempt {
                        step_id: step.name.clone(),
                        visit,
                        attempt: attempts_used + 1,
                        started_at: now,
                        finished_at: now,
                        request: String::new(),
                        response: None,
                        invocation: None,
                        status: AttemptStatus::Errored,
                        detail: detail.clone(),
                    })
                    .await?;
                advance_phase(&mut phase, StepPhase::Errored, &step.name, attempts_used + 1, self.events);
                return Ok(StepReport {
                    phase,
                    attempts: attempts_used + 1,
                    output: None,
                    detail: Some(detail),
                });
            }
        };

        let Prepared {
            mut conversation,
            candidates,
        } = prepared;
        let constraint = step.tool.as_deref();
        let candidate_names: Vec<&str> = candidates.iter().map(|s| s.name.as_str()).collect();

        let mut memory = WorkingMemory::new();
        memory.set_goal(step.goal.clone());
        let mut last_detail = None;
        if !prior.is_empty() {
            tracing::info!(step = %step.name, visit, recorded = prior.len(), "resuming step visit");
            planner::replay_failures(&mut conversation, &mut memory, &prior);
            last_detail = prior.last().map(|a| a.detail.clone());
            phase = StepPhase::Failed;
            if attempts_used > step.retries {
                advance_phase(&mut phase, StepPhase::Exhausted, &step.name, attempts_used, self.events);
                return Ok(StepReport {
                    phase,
                    attempts: attempts_used,
                    output: None,
                    detail: last_detail,
                });
            }
        }

        loop {
            let attempt_no = attempts_used + 1;

            if cancel.is_cancelled() {
                let now = Utc::now();
                let detail = format!("run cancelled before attempt {attempt_no}");
                ledger
                    .append(StepAttempt {
                        step_id: step.name.clone(),
                        visit,
                        attempt: attempt_no,
                        started_at: now,
                        finished_at: now,
                        request: String::new(),
                        response: None,
                        invocation: None,
                        status: AttemptStatus::Cancelled,
                        detail: detail.clone(),
                    })
                    .await?;
                advance_phase(&mut phase, StepPhase::Cancelled, &step.name, attempt_no, self.events);
                return Ok(StepReport {
                    phase,
                    attempts: attempts_used,
                    output: None,
                    detail: Some(detail),
                });
            }

            let direct = step.kind == StepKind::Tool;
            if !direct {
                advance_phase(&mut phase, StepPhase::Deciding, &step.name, attempt_no, self.events);
            }
            let mut draft = AttemptDraft {
                step: step.name.clone(),
                attempt: attempt_no,
                phase,
                response: None,
                invocation: None,
                events: self.events,
            };
            let request = if direct {
                format!("direct call: {}", candidate_names.join(", "))
            } else {
                format!(
                    "{} message(s); candidates: {}",
                    conversation.len(),
                    truncate(&candidate_names.join(", "), REQUEST_SUMMARY_CHARS)
                )
            };
            let started_at = Utc::now();

            let outcome = match tokio::time::timeout(
                step.timeout,
                self.attempt(step, &conversation, &candidates, constraint, &mut draft),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AttemptFault::TimedOut(step.timeout)),
            };
            attempts_used = attempt_no;
            phase = draft.phase;

            match outcome {
                Ok(output) => {
                    ledger
                        .append(StepAttempt {
                            step_id: step.name.clone(),
                            visit,
                            attempt: attempt_no,
                            started_at,
                            finished_at: Utc::now(),
                            request,
                            response: draft.response,
                            invocation: draft.invocation,
                            status: AttemptStatus::Succeeded,
                            detail: "tool reported success".to_string(),
                        })
                        .await?;
                    advance_phase(&mut phase, StepPhase::Succeeded, &step.name, attempt_no, self.events);
                    tracing::info!(step = %step.name, visit, attempt = attempt_no, "step succeeded");
                    return Ok(StepReport {
                        phase,
                        attempts: attempts_used,
                        output: Some(output),
                        detail: None,
                    });
                }
                Err(fault) => {
                    let detail = fault.to_string();
                    let action = self.recovery.handle(&fault, attempts_used, step.retries);
                    let status = if matches!(action, RecoveryAction::Escalate) {
                        AttemptStatus::Errored
                    } else {
                        AttemptStatus::Failed
                    };
                    tracing::warn!(
                        step = %step.name,
                        visit,
                        attempt = attempt_no,
                        error = %detail,
                        "attempt {}", status
                    );
                    ledger
                        .append(StepAttempt {
                            step_id: step.name.clone(),
                            visit,
                            attempt: attempt_no,
                            started_at,
                            finished_at: Utc::now(),
                            request,
                            response: draft.response.clone(),
                            invocation: draft.invocation,
                            status,
                            detail: detail.clone(),
                        })
                        .await?;
                    last_detail = Some(detail.clone());

                    match action {
                        RecoveryAction::RetryWithFeedback(feedback) => {
                            advance_phase(&mut phase, StepPhase::Failed, &step.name, attempt_no, self.events);
                            memory.add_attempt(
                                draft.response.clone().unwrap_or_else(|| "(no response)".to_string()),
                            );
                            memory.add_failure(detail);
                            planner::push_feedback(
                                &mut conversation,
                                draft.response.as_deref(),
                                &feedback,
                                &memory,
                            );
                        }
                        RecoveryAction::Exhaust => {
                            advance_phase(&mut phase, StepPhase::Failed, &step.name, attempt_no, self.events);
                            advance_phase(&mut phase, StepPhase::Exhausted, &step.name, attempt_no, self.events);
                            return Ok(StepReport {
                                phase,
                                attempts: attempts_used,
                                output: None,
                                detail: last_detail,
                            });
                        }
                        RecoveryAction::Escalate => {
                            advance_phase(&mut phase, StepPhase::Errored, &step.name, attempt_no, self.events);
                            return Ok(StepReport {
                                phase,
                                attempts: attempts_used,
                                output: None,
                                detail: last_detail,
                            });
                        }
                    }
                }
            }
        }
    }

    /// 解析候选工具并渲染 persona，得到初始对话
    async fn prepare(&self, step: &Step, context: &RunContext) -> Result<Prepared, AttemptFault> {
        if step.kind == StepKind::Tool && step.tool.is_none() {
            return Err(AttemptFault::Preparation(format!(
                "tool step '{}' has no fixed tool",
                step.name
            )));
        }
        let (candidates, persona) = {
            let registry = self.registry.read().await;
            let resolve_tool = |name: &str| -> Result<ToolDescriptor, AttemptFault> {
                let d = registry
                    .resolve(name)
                    .map_err(|e| AttemptFault::Unresolvable(e.to_string()))?;
                if d.kind != CapabilityKind::Tool {
                    return Err(AttemptFault::Preparation(format!(
                        "'{}' is a {} capability, not a tool",
                        d.name, d.kind
                    )));
                }
                Ok(d)
            };
            let candidates: Vec<ToolDescriptor> = if let Some(fixed) = &step.tool {
                vec![resolve_tool(fixed)?]
            } else if !step.allowed_tools.is_empty() {
                step.allowed_tools
                    .iter()
                    .map(|n| resolve_tool(n))
                    .collect::<Result<_, _>>()?
            } else {
                registry.list(Some(CapabilityKind::Tool))
            };
            let persona = match &step.prompt {
                Some(name) => {
                    let d = registry
                        .resolve(name)
                        .map_err(|e| AttemptFault::Unresolvable(e.to_string()))?;
                    if d.kind != CapabilityKind::Prompt {
                        return Err(AttemptFault::Preparation(format!(
                            "'{}' is a {} capability, not a prompt",
                            d.name, d.kind
                        )));
                    }
                    Some(d)
                }
                None => None,
            };
            (candidates, persona)
        };

        let persona_text = match persona {
            Some(d) => match self.executor.invoke(&d, context.merged_inputs(step)).await {
                Invocation::Returned(text) => Some(text),
                Invocation::Failed(e) => {
                    return Err(AttemptFault::Preparation(format!(
                        "prompt '{}' failed to render: {e}",
                        d.name
                    )))
                }
                Invocation::Panicked(msg) => {
                    return Err(AttemptFault::Preparation(format!(
                        "prompt '{}' panicked: {msg}",
                        d.name
                    )))
                }
            },
            None => None,
        };

        let conversation =
            planner::initial_conversation(self.system_prompt, persona_text.as_deref(), step, context);
        Ok(Prepared {
            conversation,
            candidates: candidates.iter().map(ToolDescriptor::spec).collect(),
        })
    }

    /// 单次尝试：[Deciding ->] Invoking -> Evaluating；成功返回工具输出
    async fn attempt(
        &self,
        step: &Step,
        conversation: &Conversation,
        candidates: &[ToolSpec],
        constraint: Option<&str>,
        draft: &mut AttemptDraft<'_>,
    ) -> Result<String, AttemptFault> {
        let (tool, arguments) = match step.kind {
            StepKind::Tool => {
                let tool = step.tool.clone().ok_or_else(|| {
                    AttemptFault::Preparation(format!("tool step '{}' has no fixed tool", step.name))
                })?;
                let arguments = Value::Object(step.args.clone().into_iter().collect());
                (tool, arguments)
            }
            StepKind::Agent => {
                let decision = self.decide(conversation, candidates, constraint).await?;
                draft.response = Some(decision.summary());
                match decision {
                    Decision::FinalAnswer(text) => {
                        return Err(AttemptFault::FinalAnswerOnly(truncate(&text, 200)));
                    }
                    Decision::InvokeTool { tool, arguments } => (tool, arguments),
                }
            }
        };
        if !candidates.iter().any(|c| c.name == tool) {
            let allowed = candidates
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(AttemptFault::ToolOutsideCandidates { tool, allowed });
        }

        draft.advance(StepPhase::Invoking);
        draft.invocation = Some(ToolInvocationRecord {
            name: tool.clone(),
            arguments: arguments.clone(),
            result: None,
            error: None,
        });
        let descriptor = self
            .registry
            .read()
            .await
            .resolve(&tool)
            .map_err(|e| AttemptFault::Unresolvable(e.to_string()))?;

        let invocation = self.executor.invoke(&descriptor, arguments).await;
        draft.advance(StepPhase::Evaluating);
        let (result, error, outcome) = match invocation {
            Invocation::Returned(output) => {
                let outcome = match classify(&output) {
                    ToolOutcome::Success(_) => Ok(output.clone()),
                    ToolOutcome::Failure(reason) => Err(AttemptFault::ToolFailure(reason)),
                };
                (Some(output), None, outcome)
            }
            Invocation::Failed(e) => (None, Some(e.clone()), Err(AttemptFault::ToolFailure(e))),
            Invocation::Panicked(message) => (
                None,
                Some(format!("panic: {message}")),
                Err(AttemptFault::ToolPanicked { tool, message }),
            ),
        };
        if let Some(record) = draft.invocation.as_mut() {
            record.result = result;
            record.error = error;
        }
        outcome
    }

    /// 请求模型做出决策；请求超时按后端不可用处理
    async fn decide(
        &self,
        conversation: &Conversation,
        candidates: &[ToolSpec],
        constraint: Option<&str>,
    ) -> Result<Decision, AttemptFault> {
        let request = self
            .llm
            .complete(conversation.messages(), candidates, constraint);
        let decision = match self.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, request).await {
                Ok(r) => r?,
                Err(_) => {
                    return Err(AttemptFault::BackendUnavailable(format!(
                        "request timed out after {}s",
                        limit.as_secs()
                    )))
                }
            },
            None => request.await?,
        };
        Ok(decision)
    }
}
