#![forbid(unsafe_code)]

//! `guidance` command surface.
//!
//! Host hooks call [`run_cli`] through the `guidance hook <event>` subcommand:
//! stdin JSON in, one JSON reply on stdout, exit code `1` when the host must
//! not proceed. Logs go to stderr only so the reply stays machine-readable.
//! The remaining subcommands install, verify, inspect and evolve a project's
//! guidance.

pub mod scaffold;

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use guidance_autopilot::{
    run_benchmark, Analyzer, Autopilot, AutopilotConfig, AutopilotPaths, AutopilotState,
    BenchmarkReport, CommandAnalyzer, Decision, HeuristicAnalyzer,
};
use guidance_bundle::load_policy;
use guidance_domain::{
    ComponentSelection, EditOperation, EventKind, EventPayload, GuidanceError, Preset, ProofExport,
    ToolInput,
};
use guidance_proof::{verify_envelopes, ProofChain, SigningKey};
use guidance_runtime::config::{DEFAULT_TIMEOUT_MS, ENV_PROJECT_DIR};
use guidance_runtime::{
    error_reply, format_reply, ignored_reply, translate, Dispatcher, Host, RuntimeConfig,
};
use guidance_store::{
    read_json_optional, write_text_atomic, CommitOutcome, FsGuidanceStore, GuidanceStore,
    AUTOPILOT_STATE_FILE,
};
use guidance_trust::{scaled_rate_limit, TrustLedger};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use scaffold::{InstallOptions, PresetArg, TargetMode, DEFAULT_HOOK_TIMEOUT_MS, STARTER_POLICY};

pub const ENV_LOG: &str = "GUIDANCE_LOG";
pub const ENV_LOG_FORMAT: &str = "GUIDANCE_LOG_FORMAT";

const ANALYSIS_CONTRACT_VERSION: &str = "analysis_report.v1";
const STATUS_CONTRACT_VERSION: &str = "runtime_status.v1";
const DEMO_CONTRACT_VERSION: &str = "demo_report.v1";
const IMPORT_CONTRACT_VERSION: &str = "proof_import.v1";

#[derive(Debug, Parser)]
#[command(name = "guidance")]
#[command(about = "Policy guidance runtime for coding agents")]
pub struct Cli {
    /// Project root; defaults to `GUIDANCE_PROJECT_DIR`, then the current directory.
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Install the runtime and scaffold host hook configuration.
    Init(InstallArgs),
    /// Install the runtime state without touching host configuration.
    Install(InstallArgs),
    /// Check an installed project; exits 2 when a check fails.
    Verify(VerifyArgs),
    Runtime {
        #[command(subcommand)]
        command: Box<RuntimeCommand>,
    },
    Autopilot(AutopilotArgs),
    Benchmark(BenchmarkArgs),
    Analyze(AnalyzeArgs),
    /// Host hook entrypoint: payload on stdin, reply on stdout.
    Hook(HookArgs),
}

#[derive(Debug, Args)]
pub struct InstallArgs {
    #[arg(long)]
    target: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = TargetMode::Both)]
    target_mode: TargetMode,
    #[arg(long, value_enum, default_value_t = PresetArg::Standard)]
    preset: PresetArg,
    #[arg(long, value_delimiter = ',')]
    components: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    exclude: Vec<String>,
    #[arg(long)]
    force: bool,
    #[arg(long)]
    fail_closed: bool,
    /// Host-side hook timeout in milliseconds.
    #[arg(long, default_value_t = DEFAULT_HOOK_TIMEOUT_MS)]
    hook_timeout: u64,
    /// Dispatcher deadline in milliseconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    event_timeout: u64,
    #[arg(long)]
    generate_key: bool,
    #[arg(long)]
    no_autopilot: bool,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
pub struct VerifyArgs {
    #[arg(long)]
    target: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum RuntimeCommand {
    /// Run a scripted event sequence in a scratch project.
    Demo,
    Status,
    Task(TaskArgs),
    Command(CommandArgs),
    Tool(ToolArgs),
    Edit(EditArgs),
    ExportProof(ExportProofArgs),
    ImportProof(ImportProofArgs),
}

#[derive(Debug, Args)]
pub struct IdentityArgs {
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long)]
    agent_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PhaseArg {
    Pre,
    Post,
}

#[derive(Debug, Args)]
pub struct TaskArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long)]
    description: Option<String>,
    #[arg(long, value_enum, default_value_t = PhaseArg::Pre)]
    phase: PhaseArg,
    #[arg(long)]
    status: Option<String>,
    #[command(flatten)]
    identity: IdentityArgs,
}

#[derive(Debug, Args)]
pub struct CommandArgs {
    #[command(flatten)]
    identity: IdentityArgs,
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ToolArgs {
    name: String,
    #[command(flatten)]
    identity: IdentityArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OperationArg {
    Modify,
    Create,
    Delete,
}

impl From<OperationArg> for EditOperation {
    fn from(value: OperationArg) -> Self {
        match value {
            OperationArg::Modify => Self::Modify,
            OperationArg::Create => Self::Create,
            OperationArg::Delete => Self::Delete,
        }
    }
}

#[derive(Debug, Args)]
pub struct EditArgs {
    #[arg(long)]
    file: String,
    #[arg(long, default_value = "")]
    content: String,
    #[arg(long, value_enum, default_value_t = OperationArg::Modify)]
    operation: OperationArg,
    #[arg(long)]
    diff_lines: Option<u64>,
    /// Dispatch `postEdit` instead of `preEdit`.
    #[arg(long)]
    post: bool,
    #[command(flatten)]
    identity: IdentityArgs,
}

#[derive(Debug, Args)]
pub struct ExportProofArgs {
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ImportProofArgs {
    #[arg(long)]
    input: PathBuf,
    /// Re-sign a chain exported under the development key with the configured key.
    #[arg(long)]
    reseal_from_dev: bool,
}

#[derive(Debug, Args)]
pub struct AutopilotArgs {
    #[arg(long, conflicts_with = "daemon")]
    once: bool,
    #[arg(long)]
    daemon: bool,
    #[arg(long)]
    apply: bool,
    #[arg(long)]
    min_delta: Option<f64>,
    #[arg(long)]
    max_promotions: Option<usize>,
    #[arg(long)]
    interval_ms: Option<u64>,
    #[arg(long)]
    ab: bool,
    #[arg(long)]
    min_ab_gain: Option<f64>,
    #[arg(long)]
    source: Option<String>,
    #[command(flatten)]
    analyzer: AnalyzerArgs,
    /// Stop the daemon after this many cycles.
    #[arg(long)]
    max_cycles: Option<u64>,
    #[arg(long)]
    adr_dir: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct AnalyzerArgs {
    /// External analyzer: policy text on stdin, `{"compositeScore": n}` on stdout.
    #[arg(long)]
    analyzer_cmd: Option<String>,
    #[arg(long, default_value_t = 30_000)]
    analyzer_timeout_ms: u64,
}

#[derive(Debug, Args)]
pub struct BenchmarkArgs {
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct AnalyzeArgs {
    #[command(flatten)]
    analyzer: AnalyzerArgs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum HostArg {
    Claude,
    Codex,
    Native,
}

impl From<HostArg> for Host {
    fn from(value: HostArg) -> Self {
        match value {
            HostArg::Claude => Self::Claude,
            HostArg::Codex => Self::Codex,
            HostArg::Native => Self::Native,
        }
    }
}

#[derive(Debug, Args)]
pub struct HookArgs {
    /// Host event name (`PreToolUse`, `exec_command_begin`, `preCommand`, ...).
    event: String,
    #[arg(long, value_enum, default_value_t = HostArg::Native)]
    host: HostArg,
}

/// Install the stderr subscriber: `GUIDANCE_LOG`, then `RUST_LOG`, default `warn`;
/// `GUIDANCE_LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = std::env::var(ENV_LOG)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .map_or_else(
            || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            EnvFilter::new,
        );
    let json = std::env::var(ENV_LOG_FORMAT).is_ok_and(|value| value.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    // A subscriber installed by an embedding host wins.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.with_target(false).try_init()
    };
}

/// Execute a parsed command line and return the process exit code.
///
/// # Errors
/// Returns an error when a diagnostic command fails outright. The `hook`
/// subcommand never errors for payload or configuration problems; it reports
/// them in its reply instead.
pub fn run_cli(cli: Cli) -> Result<u8> {
    let project_dir = cli.project_dir.as_deref();
    match cli.command {
        Command::Init(args) => run_install(project_dir, &args, true),
        Command::Install(args) => run_install(project_dir, &args, false),
        Command::Verify(args) => {
            let target = args.target.as_deref().or(project_dir);
            let report = match runtime_config(target) {
                Ok(config) => scaffold::verify(&config),
                Err(err) => {
                    let dir = target.map_or_else(|| PathBuf::from("."), Path::to_path_buf);
                    scaffold::verify_config_failure(&dir, &err)
                }
            };
            print_json(&report)?;
            Ok(report.exit_code())
        }
        Command::Runtime { command } => run_runtime(project_dir, *command),
        Command::Autopilot(args) => run_autopilot(project_dir, &args),
        Command::Benchmark(args) => run_benchmark_command(project_dir, &args),
        Command::Analyze(args) => run_analyze(project_dir, &args),
        Command::Hook(args) => run_hook(project_dir, &args),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn lookup_config(project_dir: Option<&Path>) -> Result<RuntimeConfig, GuidanceError> {
    let cwd = std::env::current_dir()?;
    let project = project_dir.map(|dir| dir.to_string_lossy().into_owned());
    RuntimeConfig::from_lookup(
        |name| match (&project, name) {
            (Some(dir), ENV_PROJECT_DIR) => Some(dir.clone()),
            _ => std::env::var(name).ok(),
        },
        &cwd,
    )
}

fn runtime_config(project_dir: Option<&Path>) -> Result<RuntimeConfig> {
    lookup_config(project_dir).context("invalid guidance configuration")
}

fn open_store(config: &RuntimeConfig) -> Result<FsGuidanceStore> {
    let store = FsGuidanceStore::new(&config.paths.state_dir);
    store.ensure_layout()?;
    Ok(store)
}

fn run_install(project_dir: Option<&Path>, args: &InstallArgs, scaffold_hosts: bool) -> Result<u8> {
    let target = args
        .target
        .as_deref()
        .or(project_dir)
        .map_or_else(std::env::current_dir, |dir| Ok(dir.to_path_buf()))
        .context("failed to resolve install target")?;
    let config = runtime_config(Some(&target))?;
    let options = InstallOptions {
        target,
        target_mode: args.target_mode,
        preset: args.preset,
        components: args.components.clone(),
        exclude: args.exclude.clone(),
        force: args.force,
        fail_closed: args.fail_closed,
        hook_timeout_ms: args.hook_timeout,
        event_timeout_ms: args.event_timeout,
        generate_key: args.generate_key,
        autopilot: !args.no_autopilot,
        dry_run: args.dry_run,
        scaffold_hosts,
    };
    let report = scaffold::install(&options, &config)?;
    info!(
        target = %report.target,
        actions = report.actions.len(),
        dry_run = report.dry_run,
        "guidance install finished"
    );
    print_json(&report)?;
    Ok(0)
}

fn identity_payload(
    identity: &IdentityArgs,
    task_id: Option<String>,
    tool_input: ToolInput,
) -> EventPayload {
    EventPayload {
        tool_input,
        task_id,
        session_id: identity.session_id.clone(),
        agent_id: identity.agent_id.clone(),
    }
}

fn run_runtime(project_dir: Option<&Path>, command: RuntimeCommand) -> Result<u8> {
    match command {
        RuntimeCommand::Demo => run_demo(project_dir),
        RuntimeCommand::Status => run_status(project_dir),
        RuntimeCommand::Task(args) => {
            let kind = match args.phase {
                PhaseArg::Pre => EventKind::PreTask,
                PhaseArg::Post => EventKind::PostTask,
            };
            let status = match args.phase {
                PhaseArg::Pre => args.status,
                PhaseArg::Post => args.status.or_else(|| Some("completed".to_string())),
            };
            let input = ToolInput {
                description: args.description,
                status,
                ..ToolInput::default()
            };
            let payload = identity_payload(&args.identity, Some(args.task_id), input);
            dispatch_and_print(project_dir, kind, payload)
        }
        RuntimeCommand::Command(args) => {
            let input = ToolInput {
                command: Some(args.command.join(" ")),
                tool_name: Some("Bash".to_string()),
                ..ToolInput::default()
            };
            let payload = identity_payload(&args.identity, None, input);
            dispatch_and_print(project_dir, EventKind::PreCommand, payload)
        }
        RuntimeCommand::Tool(args) => {
            let input = ToolInput {
                tool_name: Some(args.name),
                ..ToolInput::default()
            };
            let payload = identity_payload(&args.identity, None, input);
            dispatch_and_print(project_dir, EventKind::PreToolUse, payload)
        }
        RuntimeCommand::Edit(args) => {
            let diff_lines = args.diff_lines.or_else(|| {
                let lines = args.content.lines().count();
                (lines > 0).then(|| u64::try_from(lines).unwrap_or(u64::MAX))
            });
            let input = ToolInput {
                file_path: Some(args.file),
                content: Some(args.content),
                operation: Some(args.operation.into()),
                diff_lines,
                ..ToolInput::default()
            };
            let kind = if args.post {
                EventKind::PostEdit
            } else {
                EventKind::PreEdit
            };
            let payload = identity_payload(&args.identity, None, input);
            dispatch_and_print(project_dir, kind, payload)
        }
        RuntimeCommand::ExportProof(args) => run_export_proof(project_dir, &args),
        RuntimeCommand::ImportProof(args) => run_import_proof(project_dir, &args),
    }
}

fn dispatch_and_print(
    project_dir: Option<&Path>,
    kind: EventKind,
    payload: EventPayload,
) -> Result<u8> {
    let config = runtime_config(project_dir)?;
    let store = open_store(&config)?;
    let dispatcher = Dispatcher::open(config, store)?;
    let report = dispatcher.dispatch_report(kind, payload);
    print_json(&report.summary())?;
    Ok(u8::from(report.blocked()))
}

fn demo_payload(task_id: Option<&str>, tool_input: ToolInput) -> EventPayload {
    EventPayload {
        tool_input,
        task_id: task_id.map(str::to_string),
        session_id: Some("demo-session".to_string()),
        agent_id: Some("demo-agent".to_string()),
    }
}

fn demo_steps() -> Vec<(&'static str, EventKind, EventPayload)> {
    let command = |text: &str| ToolInput {
        command: Some(text.to_string()),
        tool_name: Some("Bash".to_string()),
        ..ToolInput::default()
    };
    vec![
        (
            "session-start",
            EventKind::SessionStart,
            demo_payload(None, ToolInput::default()),
        ),
        (
            "plan-task",
            EventKind::PreTask,
            demo_payload(
                Some("t-demo"),
                ToolInput {
                    description: Some("Implement auth token refresh".to_string()),
                    ..ToolInput::default()
                },
            ),
        ),
        (
            "safe-command",
            EventKind::PreCommand,
            demo_payload(Some("t-demo"), command("git status")),
        ),
        (
            "force-push",
            EventKind::PreCommand,
            demo_payload(Some("t-demo"), command("git push --force origin main")),
        ),
        (
            "secret-edit",
            EventKind::PreEdit,
            demo_payload(
                Some("t-demo"),
                ToolInput {
                    file_path: Some("src/settings.rs".to_string()),
                    content: Some(
                        "const API_KEY: &str = \"sk-live-0123456789abcdef0123456789\";".to_string(),
                    ),
                    operation: Some(EditOperation::Modify),
                    diff_lines: Some(1),
                    ..ToolInput::default()
                },
            ),
        ),
        (
            "finish-task",
            EventKind::PostTask,
            demo_payload(
                Some("t-demo"),
                ToolInput {
                    status: Some("completed".to_string()),
                    ..ToolInput::default()
                },
            ),
        ),
        (
            "session-end",
            EventKind::SessionEnd,
            demo_payload(None, ToolInput::default()),
        ),
    ]
}

fn run_demo(project_dir: Option<&Path>) -> Result<u8> {
    let base = runtime_config(project_dir)?;
    let policy = fs::read_to_string(&base.paths.root_policy).unwrap_or_else(|err| {
        debug!(error = %err, "project policy unavailable; demo uses the starter policy");
        STARTER_POLICY.to_string()
    });

    let workspace = tempfile::tempdir().context("failed to create demo workspace")?;
    let mut config = RuntimeConfig::for_project(workspace.path());
    config.signing_key = base.signing_key.clone();
    config.timeout = base.timeout;
    config.fail_mode = base.fail_mode;
    config.gate = base.gate.clone();
    write_text_atomic(&config.paths.root_policy, &policy)?;

    let store = open_store(&config)?;
    store.save_components(&ComponentSelection::preset(Preset::Full))?;
    let key = config.signing_key.clone();
    let dispatcher = Dispatcher::open(config, store.clone())?;

    let steps: Vec<Value> = demo_steps()
        .into_iter()
        .map(|(step, kind, payload)| {
            let report = dispatcher.dispatch_report(kind, payload);
            json!({ "step": step, "exitCode": report.exit_code(), "summary": report.summary() })
        })
        .collect();

    let exported = store.load_proof_chain()?;
    let verified = verify_envelopes(&exported.envelopes, &key).is_ok();
    print_json(&json!({
        "contractVersion": DEMO_CONTRACT_VERSION,
        "steps": steps,
        "proof": {
            "length": exported.envelopes.len(),
            "tip": exported.tip(),
            "verified": verified,
        },
    }))?;
    Ok(0)
}

fn run_status(project_dir: Option<&Path>) -> Result<u8> {
    let config = runtime_config(project_dir)?;
    let store = FsGuidanceStore::new(&config.paths.state_dir);
    let components = store.load_components()?;

    let policy = match load_policy(&config.paths.root_policy, &config.paths.local_policy) {
        Ok(texts) => {
            let bundle = texts.compile();
            json!({
                "path": config.paths.root_policy.display().to_string(),
                "ok": true,
                "hash": bundle.hash(),
                "rules": bundle.rules().len(),
                "localOverlay": texts.local.is_some(),
            })
        }
        Err(err) => json!({
            "path": config.paths.root_policy.display().to_string(),
            "ok": false,
            "error": format!("{}: {err}", err.kind()),
        }),
    };

    let exported = store.load_proof_chain()?;
    let verification = verify_envelopes(&exported.envelopes, &config.signing_key);
    let trust: Vec<Value> = TrustLedger::from_records(store.load_trust_records()?)
        .all_snapshots()
        .into_iter()
        .map(|snapshot| {
            json!({
                "agentId": snapshot.agent_id,
                "score": snapshot.score,
                "tier": snapshot.tier.as_str(),
                "rateLimit": scaled_rate_limit(snapshot.tier, config.base_rate_limit),
            })
        })
        .collect();
    let pending: Vec<_> = store.load_pending_runs()?.into_values().collect();
    let autopilot: Option<AutopilotState> =
        read_json_optional(&store.path(AUTOPILOT_STATE_FILE))?;

    print_json(&json!({
        "contractVersion": STATUS_CONTRACT_VERSION,
        "projectDir": config.paths.project_dir.display().to_string(),
        "stateDir": config.paths.state_dir.display().to_string(),
        "config": {
            "wiringEnabled": config.wiring_enabled,
            "timeoutMs": u64::try_from(config.timeout.as_millis()).unwrap_or(u64::MAX),
            "failMode": config.fail_mode.as_str(),
            "production": config.production,
            "devKey": config.uses_dev_key(),
            "keyFingerprint": config.signing_key.fingerprint(),
        },
        "componentsFile": components.is_some(),
        "components": components.unwrap_or_default(),
        "policy": policy,
        "proof": {
            "length": exported.envelopes.len(),
            "tip": exported.tip(),
            "verified": verification.is_ok(),
            "error": verification.err().map(|err| err.to_string()),
        },
        "trust": trust,
        "pendingRuns": pending,
        "autopilot": autopilot,
    }))?;
    Ok(0)
}

fn run_export_proof(project_dir: Option<&Path>, args: &ExportProofArgs) -> Result<u8> {
    let config = runtime_config(project_dir)?;
    let store = FsGuidanceStore::new(&config.paths.state_dir);
    let exported = store.load_proof_chain()?;
    match &args.output {
        Some(path) => {
            let encoded = serde_json::to_string_pretty(&exported)?;
            fs::write(path, encoded)
                .with_context(|| format!("failed to write proof export to {}", path.display()))?;
            print_json(&json!({
                "output": path.display().to_string(),
                "length": exported.envelopes.len(),
                "tip": exported.tip(),
            }))?;
        }
        None => print_json(&exported)?,
    }
    Ok(0)
}

fn run_import_proof(project_dir: Option<&Path>, args: &ImportProofArgs) -> Result<u8> {
    let config = runtime_config(project_dir)?;
    let store = open_store(&config)?;
    let text = fs::read_to_string(&args.input)
        .with_context(|| format!("failed to read {}", args.input.display()))?;
    let mut incoming: ProofExport = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse proof export {}", args.input.display()))?;

    let mut chain = ProofChain::new(config.signing_key.clone());
    if args.reseal_from_dev {
        incoming = chain.reseal(&incoming, &SigningKey::dev())?;
    }
    chain.import(incoming)?;

    let stored = store.load_proof_chain()?;
    match store.commit_proof_chain(stored.tip(), &chain.export())? {
        CommitOutcome::Committed => {}
        CommitOutcome::Conflict { observed_tip } => bail!(
            "proof chain changed during import (tip now {})",
            observed_tip.as_deref().unwrap_or("empty")
        ),
    }
    info!(
        envelopes = chain.chain_length(),
        resealed = args.reseal_from_dev,
        "proof chain imported"
    );
    print_json(&json!({
        "contractVersion": IMPORT_CONTRACT_VERSION,
        "imported": chain.chain_length(),
        "replaced": stored.envelopes.len(),
        "tip": chain.chain_tip(),
        "resealed": args.reseal_from_dev,
    }))?;
    Ok(0)
}

fn build_analyzer(args: &AnalyzerArgs) -> Result<Box<dyn Analyzer>> {
    match args.analyzer_cmd.as_deref() {
        Some(command) => Ok(Box::new(CommandAnalyzer::parse(
            command,
            Duration::from_millis(args.analyzer_timeout_ms),
        )?)),
        None => Ok(Box::new(HeuristicAnalyzer)),
    }
}

fn resolve_under(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// Set `stop` on SIGTERM or SIGINT. The handlers are installed before this
/// returns, so the daemon finishes its current cycle instead of being killed.
fn stop_on_shutdown_signal(stop: Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to start the signal runtime")?;
    let shutdown = {
        let _context = runtime.enter();
        shutdown_signal()?
    };
    thread::Builder::new()
        .name("guidance-signals".to_string())
        .spawn(move || {
            runtime.block_on(shutdown);
            stop.store(true, Ordering::SeqCst);
        })
        .context("failed to start the signal listener")?;
    Ok(())
}

#[cfg(unix)]
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    Ok(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM; stopping after the current cycle"),
            _ = sigint.recv() => info!("received SIGINT; stopping after the current cycle"),
        }
    })
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn shutdown_signal() -> Result<impl std::future::Future<Output = ()>> {
    Ok(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl-C; stopping after the current cycle");
        }
    })
}

fn run_autopilot(project_dir: Option<&Path>, args: &AutopilotArgs) -> Result<u8> {
    let runtime = runtime_config(project_dir)?;
    let mut config = AutopilotConfig::from_env()?;
    config.apply |= args.apply;
    config.ab |= args.ab;
    if let Some(min_delta) = args.min_delta {
        config.min_delta = min_delta;
    }
    if let Some(max_promotions) = args.max_promotions {
        config.max_promotions = max_promotions;
    }
    if let Some(interval_ms) = args.interval_ms {
        config.interval = Duration::from_millis(interval_ms);
    }
    if let Some(min_ab_gain) = args.min_ab_gain {
        config.min_ab_gain = min_ab_gain;
    }
    if let Some(source) = &args.source {
        config.source.clone_from(source);
    }
    config.gate = runtime.gate.clone();
    config.validate()?;

    let project = &runtime.paths.project_dir;
    let mut paths = AutopilotPaths::for_project(project);
    paths.root_policy = runtime.paths.root_policy.clone();
    paths.local_policy = runtime.paths.local_policy.clone();
    paths.state_dir = runtime.paths.state_dir.clone();
    if let Some(dir) = &args.adr_dir {
        paths.adr_dir = resolve_under(project, dir);
    }

    let autopilot = Autopilot::new(config, paths, build_analyzer(&args.analyzer)?);
    // `--once` is the default; the flags conflict at parse time.
    if args.daemon && !args.once {
        let stop = Arc::new(AtomicBool::new(false));
        stop_on_shutdown_signal(Arc::clone(&stop))?;
        let cycles = autopilot.run_daemon(&stop, args.max_cycles)?;
        print_json(&json!({
            "daemon": true,
            "enabled": autopilot.config().enabled,
            "cycles": cycles,
            "state": autopilot.load_state()?,
        }))?;
        return Ok(0);
    }

    let report = autopilot.run_once()?;
    print_json(&report)?;
    Ok(u8::from(report.decision == Decision::Error))
}

fn run_benchmark_command(project_dir: Option<&Path>, args: &BenchmarkArgs) -> Result<u8> {
    let config = runtime_config(project_dir)?;
    let texts = load_policy(&config.paths.root_policy, &config.paths.local_policy)?;
    let report = run_benchmark(&texts.root, texts.local.as_deref(), &config.gate);

    if let Some(path) = &args.output {
        let encoded = serde_json::to_string_pretty(&report)?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write benchmark report to {}", path.display()))?;
    }
    if args.json {
        print_json(&report)?;
    } else {
        print_benchmark_report(&report);
    }
    Ok(0)
}

fn print_benchmark_report(report: &BenchmarkReport) {
    println!(
        "contract={} probes={} generated_at={}",
        report.contract_version, report.probes, report.generated_at
    );
    println!("{:<12} {:>6} {:>10}", "arm", "rules", "pass_rate");
    println!("{}", "-".repeat(30));
    for arm in &report.arms {
        println!("{:<12} {:>6} {:>9.2}%", arm.label, arm.rules, arm.pass_rate);
    }
    println!(
        "root_gain={:.4} local_gain={:.4}",
        report.root_gain, report.local_gain
    );
}

fn run_analyze(project_dir: Option<&Path>, args: &AnalyzeArgs) -> Result<u8> {
    let config = runtime_config(project_dir)?;
    let texts = load_policy(&config.paths.root_policy, &config.paths.local_policy)?;
    let bundle = guidance_bundle::compile(&texts.root, None);
    let analyzer = build_analyzer(&args.analyzer)?;
    let analysis = analyzer.analyze(&texts.root)?;
    print_json(&json!({
        "contractVersion": ANALYSIS_CONTRACT_VERSION,
        "analyzer": analyzer.name(),
        "policyPath": config.paths.root_policy.display().to_string(),
        "policyHash": bundle.hash(),
        "rules": bundle.rules().len(),
        "compositeScore": analysis.composite_score,
        "dimensions": analysis.dimensions,
    }))?;
    Ok(0)
}

/// Parse the hook stdin payload; blank input is an empty payload.
///
/// # Errors
/// Returns [`GuidanceError::Validation`] when the input is not a JSON object.
pub fn parse_hook_payload(input: &str) -> Result<Value, GuidanceError> {
    if input.trim().is_empty() {
        return Ok(json!({}));
    }
    let value: Value = serde_json::from_str(input)
        .map_err(|err| GuidanceError::Validation(format!("hook payload is not valid JSON: {err}")))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err(GuidanceError::Validation(
            "hook payload must be a JSON object".to_string(),
        ))
    }
}

fn emit_reply(reply: &Value) -> Result<()> {
    println!("{}", serde_json::to_string(reply)?);
    Ok(())
}

fn run_hook(project_dir: Option<&Path>, args: &HookArgs) -> Result<u8> {
    let host = Host::from(args.host);
    let event = args.event.as_str();
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .context("failed to read hook payload from stdin")?;

    let config = match lookup_config(project_dir) {
        Ok(config) => config,
        Err(err) => {
            let err = match err {
                GuidanceError::Configuration(_) => err,
                other => GuidanceError::Configuration(other.to_string()),
            };
            emit_reply(&error_reply(host, event, &err, true))?;
            return Ok(1);
        }
    };
    let fail_closed = config.fail_mode.is_closed();

    let bridged = match parse_hook_payload(&input).and_then(|raw| translate(host, event, &raw)) {
        Ok(Some(bridged)) => bridged,
        Ok(None) => {
            debug!(host = host.as_str(), event, "host event carries nothing to guard");
            emit_reply(&ignored_reply(host, event))?;
            return Ok(0);
        }
        Err(err) => {
            emit_reply(&error_reply(host, event, &err, fail_closed))?;
            return Ok(u8::from(fail_closed));
        }
    };

    let dispatcher = match open_store(&config).and_then(|store| Dispatcher::open(config, store)) {
        Ok(dispatcher) => dispatcher,
        Err(err) => {
            let err = GuidanceError::Configuration(format!("{err:#}"));
            emit_reply(&error_reply(host, event, &err, true))?;
            return Ok(1);
        }
    };
    let report = dispatcher.dispatch_report(bridged.kind, bridged.payload);
    emit_reply(&format_reply(host, &bridged.host_event, &report))?;
    Ok(u8::from(report.blocked()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T, clap::Error>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("failed to parse command line: {err}"),
        }
    }

    #[test]
    fn hook_payload_parsing() {
        assert_eq!(parse_hook_payload("  \n").ok(), Some(json!({})));
        assert!(matches!(
            parse_hook_payload("{not json"),
            Err(GuidanceError::Validation(_))
        ));
        assert!(matches!(
            parse_hook_payload("[1, 2]"),
            Err(GuidanceError::Validation(_))
        ));
        let value = parse_hook_payload(r#"{"tool_input":{"command":"ls"}}"#).ok();
        let command = value.and_then(|v| v["tool_input"]["command"].as_str().map(str::to_string));
        assert_eq!(command.as_deref(), Some("ls"));
    }

    #[test]
    fn command_line_shapes_parse() {
        let cli = must(Cli::try_parse_from([
            "guidance",
            "runtime",
            "command",
            "git",
            "push",
            "--force",
            "origin",
            "main",
        ]));
        match cli.command {
            Command::Runtime { command } => match *command {
                RuntimeCommand::Command(args) => {
                    assert_eq!(args.command.join(" "), "git push --force origin main");
                }
                other => panic!("unexpected runtime command: {other:?}"),
            },
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = must(Cli::try_parse_from([
            "guidance",
            "init",
            "--preset",
            "full",
            "--exclude",
            "adversarial,conformance",
            "--target-mode",
            "claude",
        ]));
        match cli.command {
            Command::Init(args) => {
                assert_eq!(args.preset, PresetArg::Full);
                assert_eq!(args.exclude, vec!["adversarial", "conformance"]);
                assert_eq!(args.target_mode, TargetMode::Claude);
                assert_eq!(args.event_timeout, DEFAULT_TIMEOUT_MS);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        assert!(Cli::try_parse_from(["guidance", "autopilot", "--once", "--daemon"]).is_err());
        assert!(Cli::try_parse_from(["guidance", "hook", "PreToolUse", "--host", "vim"]).is_err());
    }
}
