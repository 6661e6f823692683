//! `init`, `install` and `verify`: lay down the state directory, component
//! selection, starter policy and host hook configuration, then check them.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use guidance_bundle::load_policy;
use guidance_domain::{ComponentSelection, EventKind, EventPayload, Preset, ToolInput};
use guidance_proof::ProofChain;
use guidance_runtime::{host_events, Dispatcher, Host, RuntimeConfig, RuntimeSettings};
use guidance_store::{write_json_atomic, write_text_atomic, FsGuidanceStore, GuidanceStore, MemoryStore};
use serde::Serialize;
use serde_json::{json, Map, Value};

pub const INSTALL_CONTRACT_VERSION: &str = "install_report.v1";
pub const VERIFY_CONTRACT_VERSION: &str = "verify_report.v1";

pub const DEFAULT_HOOK_TIMEOUT_MS: u64 = 10_000;

const CLAUDE_SETTINGS: &str = ".claude/settings.json";
const CODEX_HOOKS: &str = ".codex/guidance-hooks.json";
const CLAUDE_HOOK_EVENTS: &[&str] = &[
    "PreToolUse",
    "PostToolUse",
    "UserPromptSubmit",
    "SessionStart",
    "SessionEnd",
    "SubagentStop",
];
const TOOL_EVENTS: &[&str] = &["PreToolUse", "PostToolUse"];
const MANAGED_MARKERS: &[&str] = &["guidance hook", "guidance autopilot"];

/// Root policy written when the project has none.
pub const STARTER_POLICY: &str = "# Project guidance

## Git
- [no-force-push] Never force push to main or release branches (critical) @git priority:100
- [no-hook-bypass] Never skip commit hooks with --no-verify (high) @git priority:80

## Security
- [no-secrets] Never commit secrets, tokens or credentials (critical) @security priority:95
- [no-sudo] Never use sudo in project scripts (high) @security priority:70

## Testing
- [run-tests] Run the test suite before pushing changes (medium) @testing #test priority:50

## Dependencies
- [review-deps] Review lockfile changes when adding dependencies (medium) @dependencies priority:30
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TargetMode {
    Both,
    Claude,
    Codex,
}

impl TargetMode {
    fn includes(self, host: Host) -> bool {
        matches!(
            (self, host),
            (Self::Both, _) | (Self::Claude, Host::Claude) | (Self::Codex, Host::Codex)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PresetArg {
    Minimal,
    Standard,
    Full,
}

impl From<PresetArg> for Preset {
    fn from(value: PresetArg) -> Self {
        match value {
            PresetArg::Minimal => Self::Minimal,
            PresetArg::Standard => Self::Standard,
            PresetArg::Full => Self::Full,
        }
    }
}

/// Resolved `init`/`install` options.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub target: PathBuf,
    pub target_mode: TargetMode,
    pub preset: PresetArg,
    pub components: Vec<String>,
    pub exclude: Vec<String>,
    pub force: bool,
    pub fail_closed: bool,
    pub hook_timeout_ms: u64,
    pub event_timeout_ms: u64,
    pub generate_key: bool,
    pub autopilot: bool,
    pub dry_run: bool,
    /// `init` also writes host hook configuration.
    pub scaffold_hosts: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Created,
    Updated,
    Kept,
    Planned,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaffoldAction {
    pub path: String,
    pub action: ActionKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub contract_version: String,
    pub target: String,
    pub target_mode: String,
    pub dry_run: bool,
    pub components: ComponentSelection,
    pub fail_closed: bool,
    pub hook_timeout_ms: u64,
    pub event_timeout_ms: u64,
    pub autopilot: bool,
    pub actions: Vec<ScaffoldAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generated_key: Option<String>,
    pub notes: Vec<String>,
}

/// Component selection for the install: the preset, narrowed to `--components`
/// when given, minus `--exclude`. `--no-autopilot` also turns off evolution.
///
/// # Errors
/// Returns an error for an unknown component name.
pub fn resolve_components(options: &InstallOptions) -> Result<ComponentSelection> {
    let mut selection = ComponentSelection::preset(options.preset.into());
    if !options.components.is_empty() {
        for name in ComponentSelection::NAMES {
            selection.set(name, false)?;
        }
        for name in options.components.iter().filter(|name| !name.trim().is_empty()) {
            selection.set(name, true)?;
        }
    }
    for name in options.exclude.iter().filter(|name| !name.trim().is_empty()) {
        selection.set(name, false)?;
    }
    if !options.autopilot {
        selection.evolution = false;
    }
    Ok(selection)
}

/// Run `init` or `install` against `config`'s layout.
///
/// # Errors
/// Returns an error for invalid options or when a file cannot be written.
pub fn install(options: &InstallOptions, config: &RuntimeConfig) -> Result<InstallReport> {
    if options.event_timeout_ms == 0 {
        bail!("--event-timeout must be greater than zero");
    }
    if options.hook_timeout_ms < options.event_timeout_ms {
        bail!(
            "--hook-timeout ({} ms) must not be shorter than --event-timeout ({} ms)",
            options.hook_timeout_ms,
            options.event_timeout_ms
        );
    }
    let components = resolve_components(options)?;
    let mut writer = Writer {
        dry_run: options.dry_run,
        force: options.force,
        actions: Vec::new(),
    };

    let store = FsGuidanceStore::new(&config.paths.state_dir);
    if !options.dry_run {
        store.ensure_layout()?;
    }
    writer.json(&store.path(guidance_store::COMPONENTS_FILE), &components)?;
    // Hook processes read these when the host does not export the variables.
    writer.merged_json(
        &store.path(guidance_store::RUNTIME_SETTINGS_FILE),
        &RuntimeSettings {
            fail_closed: options.fail_closed,
            event_timeout_ms: options.event_timeout_ms,
        },
    )?;
    writer.text_if_absent(&config.paths.root_policy, STARTER_POLICY)?;

    if options.scaffold_hosts {
        if options.target_mode.includes(Host::Claude) {
            let path = options.target.join(CLAUDE_SETTINGS);
            let settings = merge_claude_settings(read_settings(&path)?, options);
            writer.merged_json(&path, &settings)?;
        }
        if options.target_mode.includes(Host::Codex) {
            writer.json(&options.target.join(CODEX_HOOKS), &codex_hooks(options))?;
        }
    }

    let generated_key = options
        .generate_key
        .then(|| hex::encode(rand::random::<[u8; 32]>()));
    let mut notes = Vec::new();
    if generated_key.is_some() {
        notes.push(
            "export the generated key as GUIDANCE_PROOF_KEY in the hook environment; it is not stored"
                .to_string(),
        );
    } else if config.uses_dev_key() {
        notes.push(guidance_runtime::MISSING_KEY_WARNING.to_string());
    }

    Ok(InstallReport {
        contract_version: INSTALL_CONTRACT_VERSION.to_string(),
        target: options.target.display().to_string(),
        target_mode: format!("{:?}", options.target_mode).to_ascii_lowercase(),
        dry_run: options.dry_run,
        components,
        fail_closed: options.fail_closed,
        hook_timeout_ms: options.hook_timeout_ms,
        event_timeout_ms: options.event_timeout_ms,
        autopilot: options.autopilot,
        actions: writer.actions,
        generated_key,
        notes,
    })
}

struct Writer {
    dry_run: bool,
    force: bool,
    actions: Vec<ScaffoldAction>,
}

impl Writer {
    fn record(&mut self, path: &Path, action: ActionKind) {
        self.actions.push(ScaffoldAction {
            path: path.display().to_string(),
            action,
        });
    }

    /// Write unless the file exists and `--force` is off.
    fn json<T: Serialize>(&mut self, path: &Path, value: &T) -> Result<()> {
        let exists = path.exists();
        if exists && !self.force {
            self.record(path, ActionKind::Kept);
            return Ok(());
        }
        self.merged_json(path, value)
    }

    /// Always write; used for files that are merged rather than replaced.
    fn merged_json<T: Serialize>(&mut self, path: &Path, value: &T) -> Result<()> {
        if self.dry_run {
            self.record(path, ActionKind::Planned);
            return Ok(());
        }
        let action = if path.exists() {
            ActionKind::Updated
        } else {
            ActionKind::Created
        };
        write_json_atomic(path, value)?;
        self.record(path, action);
        Ok(())
    }

    fn text_if_absent(&mut self, path: &Path, text: &str) -> Result<()> {
        if path.exists() {
            self.record(path, ActionKind::Kept);
        } else if self.dry_run {
            self.record(path, ActionKind::Planned);
        } else {
            write_text_atomic(path, text)?;
            self.record(path, ActionKind::Created);
        }
        Ok(())
    }
}

fn read_settings(path: &Path) -> Result<Value> {
    match fs::read_to_string(path) {
        Ok(text) if text.trim().is_empty() => Ok(json!({})),
        Ok(text) => serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(json!({})),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

fn hook_command(options: &InstallOptions, tail: &str) -> String {
    let mut env = vec![format!(
        "GUIDANCE_EVENT_SYNC_TIMEOUT_MS={}",
        options.event_timeout_ms
    )];
    if options.fail_closed {
        env.push("GUIDANCE_EVENT_FAIL_CLOSED=1".to_string());
    }
    format!("{} {tail}", env.join(" "))
}

fn is_managed(entry: &Value) -> bool {
    entry
        .get("hooks")
        .and_then(Value::as_array)
        .is_some_and(|hooks| {
            hooks.iter().any(|hook| {
                hook.get("command")
                    .and_then(Value::as_str)
                    .is_some_and(|command| MANAGED_MARKERS.iter().any(|mark| command.contains(mark)))
            })
        })
}

/// Merge guidance hook entries into Claude `settings.json`, replacing entries a
/// previous install wrote and leaving every other hook alone.
#[must_use]
pub fn merge_claude_settings(mut settings: Value, options: &InstallOptions) -> Value {
    if !settings.is_object() {
        settings = json!({});
    }
    let timeout_secs = options.hook_timeout_ms.div_ceil(1_000);
    let mut hooks = settings
        .get("hooks")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    for event in CLAUDE_HOOK_EVENTS {
        let mut entries: Vec<Value> = hooks
            .get(*event)
            .and_then(Value::as_array)
            .map(|entries| entries.iter().filter(|entry| !is_managed(entry)).cloned().collect())
            .unwrap_or_default();

        let mut commands = vec![json!({
            "type": "command",
            "command": hook_command(options, &format!("guidance hook {event} --host claude")),
            "timeout": timeout_secs,
        })];
        if *event == "SessionEnd" && options.autopilot {
            commands.push(json!({
                "type": "command",
                "command": "guidance autopilot --once --source session-end",
                "timeout": timeout_secs,
            }));
        }
        let mut entry = Map::new();
        if TOOL_EVENTS.contains(event) {
            entry.insert("matcher".to_string(), json!("*"));
        }
        entry.insert("hooks".to_string(), Value::Array(commands));
        entries.push(Value::Object(entry));
        hooks.insert((*event).to_string(), Value::Array(entries));
    }

    settings["hooks"] = Value::Object(hooks);
    settings
}

fn codex_hooks(options: &InstallOptions) -> Value {
    let events: Map<String, Value> = host_events(Host::Codex)
        .into_iter()
        .map(|event| {
            (
                event.to_string(),
                json!(hook_command(options, &format!("guidance hook {event} --host codex"))),
            )
        })
        .collect();
    json!({
        "host": "codex",
        "timeoutMs": options.hook_timeout_ms,
        "events": events,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCheck {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub contract_version: String,
    pub project_dir: String,
    pub ok: bool,
    pub checks: Vec<VerifyCheck>,
}

impl VerifyReport {
    fn new(project_dir: &Path) -> Self {
        Self {
            contract_version: VERIFY_CONTRACT_VERSION.to_string(),
            project_dir: project_dir.display().to_string(),
            ok: true,
            checks: Vec::new(),
        }
    }

    fn check(&mut self, name: &str, outcome: Result<String>) {
        let (ok, detail) = match outcome {
            Ok(detail) => (true, detail),
            Err(err) => (false, format!("{err:#}")),
        };
        self.ok &= ok;
        self.checks.push(VerifyCheck {
            name: name.to_string(),
            ok,
            detail,
        });
    }

    /// `0` when every check passed, `2` otherwise.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        if self.ok {
            0
        } else {
            2
        }
    }
}

/// Report for a configuration that could not be built at all.
#[must_use]
pub fn verify_config_failure(project_dir: &Path, err: &anyhow::Error) -> VerifyReport {
    let mut report = VerifyReport::new(project_dir);
    report.check("configuration", Err(anyhow::anyhow!("{err:#}")));
    report
}

/// Check an installed project: state dir, components, root policy, proof chain,
/// signing key and a smoke dispatch.
#[must_use]
pub fn verify(config: &RuntimeConfig) -> VerifyReport {
    let paths = &config.paths;
    let mut report = VerifyReport::new(&paths.project_dir);
    report.check("configuration", Ok(format!("state dir {}", paths.state_dir.display())));

    report.check(
        "state-dir",
        if paths.state_dir.is_dir() {
            Ok(paths.state_dir.display().to_string())
        } else {
            Err(anyhow::anyhow!(
                "{} is missing; run `guidance install`",
                paths.state_dir.display()
            ))
        },
    );

    let store = FsGuidanceStore::new(&paths.state_dir);
    report.check(
        "components",
        store.load_components().and_then(|selection| match selection {
            Some(selection) => Ok(enabled_components(&selection)),
            None => bail!("components.json is missing"),
        }),
    );

    let policy = load_policy(&paths.root_policy, &paths.local_policy)
        .map(|texts| texts.compile())
        .map_err(anyhow::Error::from);
    let policy_ok = policy.is_ok();
    report.check(
        "root-policy",
        policy.map(|bundle| format!("{} rules, hash {}", bundle.rules().len(), bundle.hash())),
    );

    report.check(
        "proof-chain",
        store.load_proof_chain().and_then(|exported| {
            let chain = ProofChain::restore(config.signing_key.clone(), exported)?;
            Ok(format!("{} envelopes verified", chain.chain_length()))
        }),
    );

    report.check(
        "signing-key",
        Ok(if config.uses_dev_key() {
            format!("development key ({})", guidance_runtime::MISSING_KEY_WARNING)
        } else {
            format!("fingerprint {}", config.signing_key.fingerprint())
        }),
    );

    if policy_ok {
        report.check("smoke-dispatch", smoke_dispatch(config));
    }
    report
}

fn enabled_components(selection: &ComponentSelection) -> String {
    let flags = [
        ("trust", selection.trust),
        ("proof", selection.proof),
        ("adversarial", selection.adversarial),
        ("conformance", selection.conformance),
        ("evolution", selection.evolution),
    ];
    let enabled: Vec<&str> = flags
        .iter()
        .filter(|(_, on)| *on)
        .map(|(name, _)| *name)
        .collect();
    if enabled.is_empty() {
        "no optional components".to_string()
    } else {
        enabled.join(", ")
    }
}

fn smoke_dispatch(config: &RuntimeConfig) -> Result<String> {
    let mut smoke = config.clone();
    smoke.wiring_enabled = true;
    let dispatcher = Dispatcher::open(smoke, MemoryStore::new())?;
    let payload = EventPayload {
        tool_input: ToolInput {
            command: Some("git status".to_string()),
            ..ToolInput::default()
        },
        ..EventPayload::default()
    };
    let report = dispatcher.dispatch_report(EventKind::PreCommand, payload);
    if report.result.success && !report.blocked() {
        Ok(format!(
            "preCommand 'git status' allowed in {} ms",
            report.elapsed.as_millis()
        ))
    } else {
        bail!(
            "preCommand 'git status' was not allowed: {}",
            report.result.messages.join("; ")
        )
    }
}
