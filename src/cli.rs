//! 命令行：run / resume / validate / runs / show / tools

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;

use planrun::config::{load_config, AppConfig};
use planrun::core::{EngineError, ShutdownManager};
use planrun::exit_codes;
use planrun::llm::create_llm_from_config;
use planrun::react::RunEvent;
use planrun::store::open_store;
use planrun::tools::{build_registry, CapabilityKind};
use planrun::workflow::{
    check_capabilities, create_engine, load_plan, EngineParts, Plan, RunFilter, RunPolicy,
    RunRecord, RunStatus,
};

#[derive(Debug, Parser)]
#[command(name = "planrun", version, about = "Run declarative multi-step plans with bounded retries")]
pub struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, conflicts_with = "quiet")]
    debug: bool,
    #[arg(long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Execute a plan
    Run(RunArgs),
    /// Continue an unfinished run
    Resume(ResumeArgs),
    /// Load a plan and check its capabilities without running it
    Validate { plan: PathBuf },
    /// List recorded runs
    Runs(RunsArgs),
    /// Print one recorded run
    Show(ShowArgs),
    /// List registered capabilities
    Tools {
        #[arg(long)]
        kind: Option<CapabilityKind>,
    },
}

#[derive(Debug, Args, Clone)]
struct ExecOptions {
    /// Engine kind (engine.kind)
    #[arg(long)]
    engine: Option<String>,
    /// Model backend (llm.provider)
    #[arg(long)]
    backend: Option<String>,
    #[arg(long)]
    model: Option<String>,
    /// Result store URI (file://, sqlite://, memory://)
    #[arg(long)]
    store: Option<String>,
    /// Default retry budget for steps that declare none
    #[arg(long)]
    retries: Option<u32>,
    /// Print the run record as JSON instead of progress lines
    #[arg(long)]
    json: bool,
}

impl ExecOptions {
    fn apply(&self, cfg: &mut AppConfig) {
        if let Some(kind) = &self.engine {
            cfg.engine.kind = kind.clone();
        }
        if let Some(backend) = &self.backend {
            cfg.llm.provider = backend.clone();
        }
        if let Some(model) = &self.model {
            cfg.llm.model = Some(model.clone());
        }
        if let Some(uri) = &self.store {
            cfg.store.uri = uri.clone();
        }
        if let Some(r) = self.retries {
            cfg.engine.default_retries = r;
        }
    }
}

#[derive(Debug, Args, Clone)]
struct RunArgs {
    plan: PathBuf,
    #[command(flatten)]
    opts: ExecOptions,
}

#[derive(Debug, Args, Clone)]
struct ResumeArgs {
    plan: PathBuf,
    run_id: String,
    #[command(flatten)]
    opts: ExecOptions,
}

#[derive(Debug, Args, Clone)]
struct RunsArgs {
    #[arg(long)]
    store: Option<String>,
    #[arg(long)]
    status: Option<RunStatus>,
    #[arg(long)]
    plan: Option<String>,
}

#[derive(Debug, Args, Clone)]
struct ShowArgs {
    run_id: String,
    #[arg(long)]
    store: Option<String>,
    #[arg(long)]
    json: bool,
}

impl Cli {
    pub fn log_level(&self) -> &'static str {
        if self.debug {
            "debug"
        } else if self.quiet {
            "error"
        } else {
            "info"
        }
    }

    /// 执行子命令并返回退出码
    pub async fn run(self) -> i32 {
        let cfg = match load_config(self.config.clone()) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("error: invalid configuration: {e}");
                return exit_codes::INVALID_INPUT;
            }
        };
        let result = match self.command {
            Command::Run(args) => execute(cfg, &args.plan, None, &args.opts).await,
            Command::Resume(args) => execute(cfg, &args.plan, Some(args.run_id), &args.opts).await,
            Command::Validate { plan } => validate(&cfg, &plan),
            Command::Runs(args) => list_runs(cfg, args).await,
            Command::Show(args) => show(cfg, args).await,
            Command::Tools { kind } => list_tools(&cfg, kind),
        };
        match result {
            Ok(code) => code,
            Err(e) => {
                eprintln!("error: {e}");
                exit_codes::for_error(&e)
            }
        }
    }
}

fn policy(cfg: &AppConfig) -> RunPolicy {
    RunPolicy {
        default_retries: cfg.engine.default_retries,
        attempt_timeout: Duration::from_secs(cfg.engine.attempt_timeout_secs),
        max_step_visits: cfg.engine.max_step_visits,
    }
}

async fn execute(
    mut cfg: AppConfig,
    plan_path: &Path,
    resume_id: Option<String>,
    opts: &ExecOptions,
) -> Result<i32, EngineError> {
    opts.apply(&mut cfg);
    let plan = load_plan(plan_path, &policy(&cfg))?;
    let registry = build_registry(&cfg.tools, &cfg.workspace())?.into_shared();
    let llm = create_llm_from_config(&cfg.llm)?;
    let store = open_store(&cfg.store.uri).await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let printer = if opts.json {
        None
    } else {
        Some(tokio::spawn(print_events(rx)))
    };
    let engine = create_engine(
        &cfg.engine.kind,
        EngineParts {
            llm,
            registry,
            store,
            system_prompt: cfg.engine.system_prompt.clone(),
            request_timeout: Some(Duration::from_secs(cfg.llm.timeouts.request)),
            events: printer.as_ref().map(|_| tx),
        },
    )?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();
    let outcome = match resume_id {
        Some(run_id) => engine.resume(&plan, &run_id, shutdown.token()).await,
        None => engine.execute(&plan, shutdown.token()).await,
    };
    // 引擎持有事件发送端，释放后打印任务才会结束
    drop(engine);
    if let Some(handle) = printer {
        let _ = handle.await;
    }

    let record = outcome?;
    if let Err(e) = report(&record, opts.json) {
        eprintln!("error: {e:#}");
    }
    Ok(exit_codes::for_status(record.status))
}

fn validate(cfg: &AppConfig, plan_path: &Path) -> Result<i32, EngineError> {
    let plan = load_plan(plan_path, &policy(cfg))?;
    let registry = build_registry(&cfg.tools, &cfg.workspace())?;
    check_capabilities(&plan, &registry)?;
    print_plan(&plan);
    Ok(exit_codes::COMPLETED)
}

async fn list_runs(cfg: AppConfig, args: RunsArgs) -> Result<i32, EngineError> {
    let uri = args.store.unwrap_or(cfg.store.uri);
    let store = open_store(&uri).await?;
    let filter = RunFilter {
        status: args.status,
        plan: args.plan,
    };
    let runs = store.list_runs(&filter).await?;
    if runs.is_empty() {
        println!("no runs recorded in {uri}");
        return Ok(exit_codes::COMPLETED);
    }
    println!("{:<42} {:<24} {:<10} {:>8}  STARTED", "RUN", "PLAN", "STATUS", "ATTEMPTS");
    for r in runs {
        println!(
            "{:<42} {:<24} {:<10} {:>8}  {}",
            r.run_id,
            r.plan_name,
            r.status,
            r.attempts,
            r.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(exit_codes::COMPLETED)
}

async fn show(cfg: AppConfig, args: ShowArgs) -> Result<i32, EngineError> {
    let uri = args.store.unwrap_or(cfg.store.uri);
    let store = open_store(&uri).await?;
    let record = store.load(&args.run_id).await?;
    if let Err(e) = report(&record, args.json) {
        eprintln!("error: {e:#}");
    }
    Ok(exit_codes::COMPLETED)
}

fn list_tools(cfg: &AppConfig, kind: Option<CapabilityKind>) -> Result<i32, EngineError> {
    let registry = build_registry(&cfg.tools, &cfg.workspace())?;
    for d in registry.list(kind) {
        println!("{:<20} {:<8} {:<10} {}", d.name, d.kind, d.source, d.description);
    }
    Ok(exit_codes::COMPLETED)
}

fn print_plan(plan: &Plan) {
    println!("plan '{}' ({}): {} step(s)", plan.name, plan.source, plan.steps.len());
    for (i, step) in plan.steps.iter().enumerate() {
        let tools = match (&step.tool, step.allowed_tools.is_empty()) {
            (Some(t), _) => t.clone(),
            (None, false) => step.allowed_tools.join(","),
            (None, true) => "*".to_string(),
        };
        println!(
            "  {}. {:<16} tools={:<20} retries={} timeout={}s  success->{} failure->{} error->{}",
            i + 1,
            step.name,
            tools,
            step.retries,
            step.timeout.as_secs(),
            step.on_success,
            step.on_failure,
            step.error_transition()
        );
    }
}

fn report(record: &RunRecord, json: bool) -> anyhow::Result<()> {
    if json {
        let text = serde_json::to_string_pretty(record).context("failed to serialize run record")?;
        println!("{text}");
        return Ok(());
    }
    println!("run {} ({}) {}", record.run_id, record.plan_name, record.status);
    println!("steps:");
    for a in record.visit_outcomes() {
        println!("  {:<16} visit {:>2}  {:<9} after {} attempt(s)", a.step_id, a.visit, a.status, a.attempt);
    }
    println!("attempts:");
    for a in &record.attempts {
        let tool = a.invocation.as_ref().map(|i| i.name.as_str()).unwrap_or("-");
        println!(
            "  {:<16} visit {:>2} attempt {:>2}  {:<9} {:<14} {}",
            a.step_id,
            a.visit,
            a.attempt,
            a.status,
            tool,
            one_line(&a.detail, 100)
        );
    }
    if let Some(failure) = &record.failure {
        println!("failure: {failure}");
    }
    Ok(())
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<RunEvent>) {
    while let Some(ev) = rx.recv().await {
        match ev {
            RunEvent::RunStarted { run_id, plan, steps } => {
                eprintln!("▶ {run_id}: plan '{plan}' with {steps} step(s)")
            }
            RunEvent::StepStarted { step, visit, retries } => {
                eprintln!("→ {step} (visit {visit}, retry budget {retries})")
            }
            RunEvent::Phase { .. } => {}
            RunEvent::AttemptRecorded { attempt } => eprintln!(
                "    attempt {} {}: {}",
                attempt.attempt,
                attempt.status,
                one_line(&attempt.detail, 120)
            ),
            RunEvent::StepFinished { step, phase, next, .. } => {
                eprintln!("  {step} {phase} -> {next}")
            }
            RunEvent::RunFinished { run_id, status, failure } => match failure {
                Some(f) => eprintln!("■ {run_id}: {status} ({})", one_line(&f, 160)),
                None => eprintln!("■ {run_id}: {status}"),
            },
        }
    }
}

fn one_line(s: &str, max: usize) -> String {
    let flat = s.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() > max {
        format!("{}...", flat.chars().take(max).collect::<String>())
    } else {
        flat
    }
}
