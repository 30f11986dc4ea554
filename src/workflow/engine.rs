//! 计划执行引擎（Run Manager）
//!
//! 运行前做能力检查，然后逐个步骤驱动状态机，按步骤终态选择转移，直到 end / abort / 终止策略。
//! RunRecord 增量持久化：开始时写运行头，每次尝试追加，结束时写终态。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::core::{EngineError, RecoveryEngine, StepPhase};
use crate::llm::LlmClient;
use crate::react::{send_event, RunEvent, RunEventSender, StepReport, StepStateMachine, DEFAULT_SYSTEM_PROMPT};
use crate::store::ResultStore;
use crate::tools::{CapabilityKind, SharedRegistry, ToolExecutor, ToolRegistry};
use crate::workflow::context::RunContext;
use crate::workflow::run::{AttemptStatus, RunRecord, RunStatus, StepLedger};
use crate::workflow::types::{Plan, PlanError, Step, Transition};

/// 已实现的引擎种类
pub const SUPPORTED_ENGINES: &[&str] = &["native"];

/// 计划执行策略
#[async_trait]
pub trait PlanEngine: Send + Sync {
    fn kind(&self) -> &str;

    async fn execute(&self, plan: &Plan, cancel: CancellationToken) -> Result<RunRecord, EngineError>;

    async fn resume(
        &self,
        plan: &Plan,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Result<RunRecord, EngineError>;
}

/// 构造引擎所需的共享依赖
pub struct EngineParts {
    pub llm: Arc<dyn LlmClient>,
    pub registry: SharedRegistry,
    pub store: Arc<dyn ResultStore>,
    pub system_prompt: Option<String>,
    pub request_timeout: Option<Duration>,
    pub events: Option<RunEventSender>,
}

/// 按 engine.kind 选择引擎
pub fn create_engine(kind: &str, parts: EngineParts) -> Result<Arc<dyn PlanEngine>, EngineError> {
    match kind.trim().to_lowercase().as_str() {
        "native" => {
            let mut manager = RunManager::new(parts.llm, parts.registry, parts.store);
            if let Some(p) = parts.system_prompt {
                manager = manager.with_system_prompt(p);
            }
            if let Some(t) = parts.request_timeout {
                manager = manager.with_request_timeout(t);
            }
            if let Some(tx) = parts.events {
                manager = manager.with_events(tx);
            }
            Ok(Arc::new(manager))
        }
        other => Err(EngineError::UnknownEngine {
            kind: other.to_string(),
            supported: SUPPORTED_ENGINES.join(", "),
        }),
    }
}

/// 计划引用的固定工具、白名单工具与 persona prompt 都必须以正确的种类注册
pub fn check_capabilities(plan: &Plan, registry: &ToolRegistry) -> Result<(), PlanError> {
    for step in &plan.steps {
        let fields = step
            .tool
            .iter()
            .map(|t| ("tool", t.as_str(), CapabilityKind::Tool))
            .chain(step.allowed_tools.iter().map(|t| ("tools", t.as_str(), CapabilityKind::Tool)))
            .chain(step.prompt.iter().map(|p| ("prompt", p.as_str(), CapabilityKind::Prompt)));
        for (field, name, kind) in fields {
            let descriptor = registry.resolve(name).map_err(|_| {
                PlanError::integrity(
                    Some(&step.name),
                    field,
                    format!("capability '{name}' is not registered"),
                )
            })?;
            if descriptor.kind != kind {
                return Err(PlanError::integrity(
                    Some(&step.name),
                    field,
                    format!("capability '{name}' is a {}, expected a {kind}", descriptor.kind),
                ));
            }
        }
    }
    Ok(())
}

/// 驱动循环的游标
enum Cursor {
    /// 开始（或续跑）一次步骤访问；visit 为 Some 时继续已有访问
    Visit { step: String, visit: Option<u32> },
    /// 已知步骤终态，直接选择转移（续跑）
    Route { step: String, report: StepReport },
}

pub struct RunManager {
    llm: Arc<dyn LlmClient>,
    registry: SharedRegistry,
    store: Arc<dyn ResultStore>,
    executor: ToolExecutor,
    recovery: RecoveryEngine,
    system_prompt: String,
    request_timeout: Option<Duration>,
    events: Option<RunEventSender>,
}

impl RunManager {
    pub fn new(llm: Arc<dyn LlmClient>, registry: SharedRegistry, store: Arc<dyn ResultStore>) -> Self {
        Self {
            llm,
            registry,
            store,
            executor: ToolExecutor::new(),
            recovery: RecoveryEngine::new(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            request_timeout: None,
            events: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_events(mut self, tx: RunEventSender) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    pub async fn check_capabilities(&self, plan: &Plan) -> Result<(), PlanError> {
        check_capabilities(plan, &*self.registry.read().await)
    }

    pub async fn run(&self, plan: &Plan) -> Result<RunRecord, EngineError> {
        self.run_with_cancel(plan, CancellationToken::new()).await
    }

    pub async fn run_with_cancel(
        &self,
        plan: &Plan,
        cancel: CancellationToken,
    ) -> Result<RunRecord, EngineError> {
        self.check_capabilities(plan).await?;
        let first = plan
            .first()
            .ok_or_else(|| PlanError::integrity(None, "steps", "plan has no steps"))?;

        let mut record = RunRecord::new(plan);
        self.store.begin(&record).await?;
        tracing::info!(
            run_id = %record.run_id,
            plan = %plan.name,
            steps = plan.steps.len(),
            store = self.store.name(),
            backend = self.llm.name(),
            "run started"
        );
        send_event(
            self.events.as_ref(),
            RunEvent::RunStarted {
                run_id: record.run_id.clone(),
                plan: plan.name.clone(),
                steps: plan.steps.len(),
            },
        );

        let context = RunContext::new(plan);
        let start = Cursor::Visit {
            step: first.name.clone(),
            visit: None,
        };
        self.drive_guarded(plan, &mut record, start, context, &cancel).await?;
        Ok(record)
    }

    /// 续跑未结束的运行；已终结的运行原样返回
    pub async fn resume(
        &self,
        plan: &Plan,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Result<RunRecord, EngineError> {
        let mut record = self.store.load(run_id).await?;
        if record.status.is_terminal() {
            tracing::info!(run_id, status = %record.status, "run already finished");
            return Ok(record);
        }
        if record.plan_name != plan.name {
            return Err(EngineError::Resume {
                run_id: run_id.to_string(),
                reason: format!(
                    "run belongs to plan '{}', not '{}'",
                    record.plan_name, plan.name
                ),
            });
        }
        self.check_capabilities(plan).await?;

        let start = self.resume_cursor(plan, &record)?;
        let context = RunContext::rebuild(plan, &record);
        tracing::info!(
            run_id,
            plan = %plan.name,
            recorded = record.attempts.len(),
            "resuming run"
        );
        send_event(
            self.events.as_ref(),
            RunEvent::RunStarted {
                run_id: record.run_id.clone(),
                plan: plan.name.clone(),
                steps: plan.steps.len(),
            },
        );
        self.drive_guarded(plan, &mut record, start, context, &cancel).await?;
        Ok(record)
    }

    /// 根据最后一条记录决定从哪里继续
    fn resume_cursor(&self, plan: &Plan, record: &RunRecord) -> Result<Cursor, EngineError> {
        let Some(last) = record.last_attempt() else {
            let first = plan
                .first()
                .ok_or_else(|| PlanError::integrity(None, "steps", "plan has no steps"))?;
            return Ok(Cursor::Visit {
                step: first.name.clone(),
                visit: None,
            });
        };
        let step = plan.step(&last.step_id).ok_or_else(|| EngineError::Resume {
            run_id: record.run_id.clone(),
            reason: format!("recorded step '{}' is not in the plan", last.step_id),
        })?;
        let report = |phase: StepPhase, output: Option<String>| StepReport {
            phase,
            attempts: last.attempt,
            output,
            detail: Some(last.detail.clone()),
        };
        let cursor = match last.status {
            AttemptStatus::Succeeded => Cursor::Route {
                step: step.name.clone(),
                report: report(
                    StepPhase::Succeeded,
                    last.invocation.as_ref().and_then(|i| i.result.clone()),
                ),
            },
            AttemptStatus::Failed if last.attempt <= step.retries => Cursor::Visit {
                step: step.name.clone(),
                visit: Some(last.visit),
            },
            AttemptStatus::Failed => Cursor::Route {
                step: step.name.clone(),
                report: report(StepPhase::Exhausted, None),
            },
            AttemptStatus::Errored => Cursor::Route {
                step: step.name.clone(),
                report: report(StepPhase::Errored, None),
            },
            AttemptStatus::Cancelled => Cursor::Visit {
                step: step.name.clone(),
                visit: None,
            },
        };
        Ok(cursor)
    }

    /// drive 出现存储故障时尽力把运行标为 errored，再把错误交给调用方
    async fn drive_guarded(
        &self,
        plan: &Plan,
        record: &mut RunRecord,
        start: Cursor,
        context: RunContext,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        match self.drive(plan, record, start, context, cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(run_id = %record.run_id, error = %e, "run failed");
                if !record.status.is_terminal() {
                    let reason = e.to_string();
                    if let Err(finish_err) = self
                        .store
                        .finish(&record.run_id, RunStatus::Errored, Utc::now(), Some(&reason))
                        .await
                    {
                        tracing::warn!(run_id = %record.run_id, error = %finish_err, "could not mark run errored");
                    }
                    record.status = RunStatus::Errored;
                    record.ended_at = Some(Utc::now());
                    record.failure = Some(reason);
                }
                Err(e)
            }
        }
    }

    async fn drive(
        &self,
        plan: &Plan,
        record: &mut RunRecord,
        start: Cursor,
        mut context: RunContext,
        cancel: &CancellationToken,
    ) -> Result<(), EngineError> {
        let machine = StepStateMachine {
            llm: self.llm.as_ref(),
            registry: &self.registry,
            executor: &self.executor,
            recovery: &self.recovery,
            system_prompt: &self.system_prompt,
            request_timeout: self.request_timeout,
            events: self.events.as_ref(),
        };
        let mut visits = record.visits();
        let mut cursor = start;

        loop {
            let (step, visit, report) = match cursor {
                Cursor::Visit { step, visit } => {
                    let step = self.plan_step(plan, record, &step)?;
                    let visit = match visit {
                        Some(v) => v,
                        None => {
                            if visits >= plan.policy.max_step_visits {
                                let reason = format!(
                                    "termination policy reached: more than {} step visits",
                                    plan.policy.max_step_visits
                                );
                                tracing::warn!(run_id = %record.run_id, step = %step.name, "{reason}");
                                return self.finalize(record, RunStatus::Exhausted, Some(reason)).await;
                            }
                            visits += 1;
                            send_event(
                                self.events.as_ref(),
                                RunEvent::StepStarted {
                                    step: step.name.clone(),
                                    visit: visits,
                                    retries: step.retries,
                                },
                            );
                            visits
                        }
                    };
                    tracing::info!(run_id = %record.run_id, step = %step.name, visit, "step started");
                    let resolved = context.resolve_step(step);
                    let report = {
                        let mut ledger =
                            StepLedger::new(record, self.store.as_ref(), self.events.as_ref());
                        machine.execute(&resolved, visit, &context, &mut ledger, cancel).await?
                    };
                    (step, visit, report)
                }
                Cursor::Route { step, report } => {
                    let step = self.plan_step(plan, record, &step)?;
                    let visit = record.last_attempt().map(|a| a.visit).unwrap_or(visits);
                    (step, visit, report)
                }
            };

            let transition = match report.phase {
                StepPhase::Succeeded => {
                    if let Some(output) = &report.output {
                        context.record_success(&step.name, output);
                    }
                    step.on_success.clone()
                }
                StepPhase::Exhausted => step.on_failure.clone(),
                StepPhase::Errored => step.error_transition().clone(),
                _ => Transition::Abort,
            };
            tracing::info!(
                run_id = %record.run_id,
                step = %step.name,
                visit,
                phase = %report.phase,
                attempts = report.attempts,
                next = %transition,
                "step finished"
            );
            send_event(
                self.events.as_ref(),
                RunEvent::StepFinished {
                    step: step.name.clone(),
                    visit,
                    phase: report.phase,
                    next: transition.to_string(),
                },
            );

            cursor = match transition {
                Transition::End => return self.finalize(record, RunStatus::Completed, None).await,
                Transition::Abort => {
                    let status = match report.phase {
                        StepPhase::Errored => RunStatus::Errored,
                        _ => RunStatus::Aborted,
                    };
                    let failure = report
                        .detail
                        .map(|d| format!("step '{}' {}: {d}", step.name, report.phase));
                    return self.finalize(record, status, failure).await;
                }
                Transition::Retry => Cursor::Visit {
                    step: step.name.clone(),
                    visit: None,
                },
                Transition::Step(next) => Cursor::Visit { step: next, visit: None },
            };
        }
    }

    fn plan_step<'p>(&self, plan: &'p Plan, record: &RunRecord, name: &str) -> Result<&'p Step, EngineError> {
        plan.step(name).ok_or_else(|| EngineError::Resume {
            run_id: record.run_id.clone(),
            reason: format!("step '{name}' is not in the plan"),
        })
    }

    async fn finalize(
        &self,
        record: &mut RunRecord,
        status: RunStatus,
        failure: Option<String>,
    ) -> Result<(), EngineError> {
        let ended_at = Utc::now();
        self.store
            .finish(&record.run_id, status, ended_at, failure.as_deref())
            .await?;
        record.status = status;
        record.ended_at = Some(ended_at);
        record.failure = failure.clone();
        // 后端累计用量（客户端生命周期内）
        let (prompt_tokens, completion_tokens, total_tokens) = self.llm.token_usage();
        match status {
            RunStatus::Completed => tracing::info!(
                run_id = %record.run_id,
                attempts = record.attempts.len(),
                prompt_tokens,
                completion_tokens,
                total_tokens,
                "run completed"
            ),
            _ => tracing::warn!(
                run_id = %record.run_id,
                status = %status,
                failure = failure.as_deref().unwrap_or(""),
                prompt_tokens,
                completion_tokens,
                total_tokens,
                "run finished"
            ),
        }
        send_event(
            self.events.as_ref(),
            RunEvent::RunFinished {
                run_id: record.run_id.clone(),
                status,
                failure,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl PlanEngine for RunManager {
    fn kind(&self) -> &str {
        "native"
    }

    async fn execute(&self, plan: &Plan, cancel: CancellationToken) -> Result<RunRecord, EngineError> {
        self.run_with_cancel(plan, cancel).await
    }

    async fn resume(
        &self,
        plan: &Plan,
        run_id: &str,
        cancel: CancellationToken,
    ) -> Result<RunRecord, EngineError> {
        RunManager::resume(self, plan, run_id, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Decision, ScriptedLlmClient};
    use crate::store::MemoryStore;
    use crate::tools::{EchoTool, StaticSource};
    use crate::workflow::{PlanBuilder, StepBuilder};

    fn manager(llm: ScriptedLlmClient) -> RunManager {
        let mut registry = ToolRegistry::new();
        registry
            .register(&StaticSource::new("builtin", vec![Arc::new(EchoTool)]))
            .unwrap();
        RunManager::new(Arc::new(llm), registry.into_shared(), Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_capability_check() {
        let plan = PlanBuilder::new("p")
            .step(StepBuilder::new("build", "Build").tool("build_docker"))
            .build()
            .unwrap();
        let err = manager(ScriptedLlmClient::new(vec![])).run(&plan).await.unwrap_err();
        match err {
            EngineError::Plan(PlanError::Integrity { step, field, .. }) => {
                assert_eq!(step.as_deref(), Some("build"));
                assert_eq!(field, "tool");
            }
            other => panic!("Expected integrity error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_used_as_prompt_is_rejected() {
        let plan = PlanBuilder::new("p")
            .step(StepBuilder::new("build", "Build").prompt("echo"))
            .build()
            .unwrap();
        let err = manager(ScriptedLlmClient::new(vec![]))
            .check_capabilities(&plan)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected a prompt"));
    }

    #[tokio::test]
    async fn test_retry_transition_starts_new_visit() {
        let plan = PlanBuilder::new("p")
            .step(
                StepBuilder::new("flaky", "Do it")
                    .tool("echo")
                    .retries(0)
                    .on_failure("retry"),
            )
            .build()
            .unwrap();
        let llm = ScriptedLlmClient::new(vec![
            Ok(Decision::FinalAnswer("no".into())),
            ScriptedLlmClient::invoke("echo", serde_json::json!({"text": "ok"})),
        ]);
        let record = manager(llm).run(&plan).await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        let visits: Vec<(u32, u32)> = record.attempts.iter().map(|a| (a.visit, a.attempt)).collect();
        assert_eq!(visits, vec![(1, 1), (2, 1)]);
    }

    #[tokio::test]
    async fn test_unknown_engine_kind() {
        let parts = EngineParts {
            llm: Arc::new(ScriptedLlmClient::new(vec![])),
            registry: ToolRegistry::new().into_shared(),
            store: Arc::new(MemoryStore::new()),
            system_prompt: None,
            request_timeout: None,
            events: None,
        };
        match create_engine("temporal", parts) {
            Err(EngineError::UnknownEngine { kind, supported }) => {
                assert_eq!(kind, "temporal");
                assert_eq!(supported, "native");
            }
            _ => panic!("Expected UnknownEngine"),
        }
    }
}
