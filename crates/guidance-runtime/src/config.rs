//! Dispatcher configuration read from `GUIDANCE_*` environment variables.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use guidance_domain::{parse_flag, parse_number, GuidanceError};
use guidance_gates::GateConfig;
use guidance_proof::SigningKey;
use guidance_store::{read_json_optional, DEFAULT_STATE_DIR, RUNTIME_SETTINGS_FILE};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_ROOT_POLICY: &str = "CLAUDE.md";
pub const DEFAULT_LOCAL_POLICY: &str = "CLAUDE.local.md";
pub const DEFAULT_BASE_RATE_LIMIT: u64 = 60;

pub const ENV_WIRING_ENABLED: &str = "GUIDANCE_EVENT_WIRING_ENABLED";
pub const ENV_TIMEOUT_MS: &str = "GUIDANCE_EVENT_SYNC_TIMEOUT_MS";
pub const ENV_FAIL_CLOSED: &str = "GUIDANCE_EVENT_FAIL_CLOSED";
pub const ENV_PROOF_KEY: &str = "GUIDANCE_PROOF_KEY";
pub const ENV_ENVIRONMENT: &str = "GUIDANCE_ENVIRONMENT";
pub const ENV_HOME: &str = "GUIDANCE_HOME";
pub const ENV_PROJECT_DIR: &str = "GUIDANCE_PROJECT_DIR";
pub const ENV_ROOT_POLICY: &str = "GUIDANCE_ROOT_POLICY";
pub const ENV_LOCAL_POLICY: &str = "GUIDANCE_LOCAL_POLICY";
pub const ENV_MAX_DIFF_LINES: &str = "GUIDANCE_GATE_MAX_DIFF_LINES";
pub const ENV_ALLOWED_TOOLS: &str = "GUIDANCE_ALLOWED_TOOLS";

pub const MISSING_KEY_WARNING: &str =
    "GUIDANCE_PROOF_KEY is not set; proof envelopes are signed with the development key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    Open,
    Closed,
}

impl FailMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "fail-open",
            Self::Closed => "fail-closed",
        }
    }

    #[must_use]
    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }
}

/// Hook settings recorded by `init`/`install` in the state directory.
/// Environment variables take precedence over them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    pub fail_closed: bool,
    pub event_timeout_ms: u64,
}

impl RuntimeSettings {
    /// `None` when no settings file has been written.
    ///
    /// # Errors
    /// Returns [`GuidanceError::Configuration`] when the file cannot be read
    /// or parsed, or holds a zero timeout.
    pub fn load(state_dir: &Path) -> Result<Option<Self>, GuidanceError> {
        let path = state_dir.join(RUNTIME_SETTINGS_FILE);
        let settings: Option<Self> = read_json_optional(&path)
            .map_err(|err| GuidanceError::Configuration(format!("{err:#}")))?;
        if settings.is_some_and(|settings| settings.event_timeout_ms == 0) {
            return Err(GuidanceError::Configuration(format!(
                "eventTimeoutMs in {} must be greater than zero",
                path.display()
            )));
        }
        Ok(settings)
    }
}

/// Resolved project and state locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePaths {
    pub project_dir: PathBuf,
    pub state_dir: PathBuf,
    pub root_policy: PathBuf,
    pub local_policy: PathBuf,
}

impl RuntimePaths {
    /// Default layout for a project directory.
    #[must_use]
    pub fn for_project(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            state_dir: project_dir.join(DEFAULT_STATE_DIR),
            root_policy: project_dir.join(DEFAULT_ROOT_POLICY),
            local_policy: project_dir.join(DEFAULT_LOCAL_POLICY),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub wiring_enabled: bool,
    pub timeout: Duration,
    pub fail_mode: FailMode,
    pub signing_key: SigningKey,
    pub production: bool,
    pub paths: RuntimePaths,
    pub gate: GateConfig,
    pub base_rate_limit: u64,
}

impl RuntimeConfig {
    /// Defaults for `project_dir`: wiring on, 8 s deadline, fail-open, dev key.
    #[must_use]
    pub fn for_project(project_dir: &Path) -> Self {
        Self {
            wiring_enabled: true,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            fail_mode: FailMode::Open,
            signing_key: SigningKey::dev(),
            production: false,
            paths: RuntimePaths::for_project(project_dir),
            gate: GateConfig::default(),
            base_rate_limit: DEFAULT_BASE_RATE_LIMIT,
        }
    }

    /// Build from the process environment, resolving relative paths against the
    /// current directory.
    ///
    /// # Errors
    /// See [`RuntimeConfig::from_lookup`]; also fails when the current
    /// directory cannot be read.
    pub fn from_env() -> Result<Self, GuidanceError> {
        let cwd = std::env::current_dir()?;
        Self::from_lookup(|name| std::env::var(name).ok(), &cwd)
    }

    /// Build from an arbitrary variable lookup.
    ///
    /// # Errors
    /// Returns [`GuidanceError::Configuration`] for unparseable values, a
    /// malformed proof key, or the development key under
    /// `GUIDANCE_ENVIRONMENT=production`.
    pub fn from_lookup<F>(lookup: F, cwd: &Path) -> Result<Self, GuidanceError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let project_dir = get(ENV_PROJECT_DIR).map_or_else(
            || cwd.to_path_buf(),
            |dir| resolve(cwd, &dir),
        );
        let mut config = Self::for_project(&project_dir);
        if let Some(value) = get(ENV_HOME) {
            config.paths.state_dir = resolve(&project_dir, &value);
        }
        if let Some(settings) = RuntimeSettings::load(&config.paths.state_dir)? {
            debug!(?settings, "stored runtime settings applied");
            config.timeout = Duration::from_millis(settings.event_timeout_ms);
            if settings.fail_closed {
                config.fail_mode = FailMode::Closed;
            }
        }

        if let Some(value) = get(ENV_WIRING_ENABLED) {
            config.wiring_enabled = parse_flag(ENV_WIRING_ENABLED, &value)?;
        }
        if let Some(value) = get(ENV_TIMEOUT_MS) {
            let millis: u64 = parse_number(ENV_TIMEOUT_MS, &value)?;
            if millis == 0 {
                return Err(GuidanceError::Configuration(format!(
                    "{ENV_TIMEOUT_MS} must be greater than zero"
                )));
            }
            config.timeout = Duration::from_millis(millis);
        }
        if let Some(value) = get(ENV_FAIL_CLOSED) {
            config.fail_mode = if parse_flag(ENV_FAIL_CLOSED, &value)? {
                FailMode::Closed
            } else {
                FailMode::Open
            };
        }
        if let Some(value) = get(ENV_ROOT_POLICY) {
            config.paths.root_policy = resolve(&project_dir, &value);
        }
        if let Some(value) = get(ENV_LOCAL_POLICY) {
            config.paths.local_policy = resolve(&project_dir, &value);
        }
        if let Some(value) = get(ENV_MAX_DIFF_LINES) {
            config.gate.large_diff_lines = parse_number(ENV_MAX_DIFF_LINES, &value)?;
        }
        if let Some(value) = get(ENV_ALLOWED_TOOLS) {
            let tools: BTreeSet<String> = value
                .split(',')
                .map(|tool| tool.trim().to_ascii_lowercase())
                .filter(|tool| !tool.is_empty())
                .collect();
            config.gate.allowed_tools = Some(tools);
        }

        config.production = get(ENV_ENVIRONMENT)
            .is_some_and(|value| value.trim().eq_ignore_ascii_case("production"));
        if let Some(value) = get(ENV_PROOF_KEY) {
            config.signing_key = SigningKey::from_hex(&value)?;
        } else if config.production {
            return Err(GuidanceError::Configuration(format!(
                "{ENV_PROOF_KEY} must be set when {ENV_ENVIRONMENT}=production"
            )));
        } else {
            warn!("{MISSING_KEY_WARNING}");
        }
        Ok(config)
    }

    #[must_use]
    pub fn uses_dev_key(&self) -> bool {
        self.signing_key.is_dev()
    }
}

fn resolve(base: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value.trim());
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    fn must<T>(result: Result<T, GuidanceError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }

    #[test]
    fn defaults_apply_without_variables() {
        let config = must(RuntimeConfig::from_lookup(lookup(&[]), Path::new("/repo")));
        assert!(config.wiring_enabled);
        assert_eq!(config.timeout, Duration::from_millis(8_000));
        assert_eq!(config.fail_mode, FailMode::Open);
        assert!(config.uses_dev_key());
        assert_eq!(config.paths.state_dir, PathBuf::from("/repo/.claude-flow/guidance"));
        assert_eq!(config.paths.root_policy, PathBuf::from("/repo/CLAUDE.md"));
        assert_eq!(config.base_rate_limit, 60);
    }

    #[test]
    fn variables_override_defaults() {
        let config = must(RuntimeConfig::from_lookup(
            lookup(&[
                (ENV_WIRING_ENABLED, "0"),
                (ENV_TIMEOUT_MS, "250"),
                (ENV_FAIL_CLOSED, "1"),
                (ENV_PROOF_KEY, "00112233445566778899aabbccddeeff"),
                (ENV_HOME, "state"),
                (ENV_ROOT_POLICY, "/policies/ROOT.md"),
                (ENV_ALLOWED_TOOLS, "Bash, edit"),
            ]),
            Path::new("/repo"),
        ));
        assert!(!config.wiring_enabled);
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert!(config.fail_mode.is_closed());
        assert!(!config.uses_dev_key());
        assert_eq!(config.paths.state_dir, PathBuf::from("/repo/state"));
        assert_eq!(config.paths.root_policy, PathBuf::from("/policies/ROOT.md"));
        let tools = config.gate.allowed_tools.unwrap_or_default();
        assert!(tools.contains("bash") && tools.contains("edit"));
    }

    #[test]
    fn invalid_numbers_are_configuration_errors() {
        let err = RuntimeConfig::from_lookup(lookup(&[(ENV_TIMEOUT_MS, "soon")]), Path::new("/"));
        assert!(matches!(err, Err(GuidanceError::Configuration(_))));

        let zero = RuntimeConfig::from_lookup(lookup(&[(ENV_TIMEOUT_MS, "0")]), Path::new("/"));
        assert!(matches!(zero, Err(GuidanceError::Configuration(_))));
    }

    #[test]
    fn production_rejects_dev_key() {
        let err = RuntimeConfig::from_lookup(
            lookup(&[(ENV_ENVIRONMENT, "production")]),
            Path::new("/repo"),
        );
        assert!(matches!(err, Err(GuidanceError::Configuration(_))));

        let ok = must(RuntimeConfig::from_lookup(
            lookup(&[
                (ENV_ENVIRONMENT, "production"),
                (ENV_PROOF_KEY, "00112233445566778899aabbccddeeff"),
            ]),
            Path::new("/repo"),
        ));
        assert!(ok.production);
    }

    #[test]
    fn stored_settings_apply_under_environment_overrides() {
        let dir = must(tempfile::tempdir().map_err(GuidanceError::from));
        let state = dir.path().join(DEFAULT_STATE_DIR);
        must(std::fs::create_dir_all(&state).map_err(GuidanceError::from));
        must(
            std::fs::write(
                state.join(RUNTIME_SETTINGS_FILE),
                r#"{"failClosed": true, "eventTimeoutMs": 1500}"#,
            )
            .map_err(GuidanceError::from),
        );

        let stored = must(RuntimeConfig::from_lookup(lookup(&[]), dir.path()));
        assert!(stored.fail_mode.is_closed());
        assert_eq!(stored.timeout, Duration::from_millis(1_500));

        let overridden = must(RuntimeConfig::from_lookup(
            lookup(&[(ENV_FAIL_CLOSED, "0"), (ENV_TIMEOUT_MS, "300")]),
            dir.path(),
        ));
        assert_eq!(overridden.fail_mode, FailMode::Open);
        assert_eq!(overridden.timeout, Duration::from_millis(300));
    }

    #[test]
    fn zero_stored_timeout_is_a_configuration_error() {
        let dir = must(tempfile::tempdir().map_err(GuidanceError::from));
        let state = dir.path().join("state");
        must(std::fs::create_dir_all(&state).map_err(GuidanceError::from));
        must(
            std::fs::write(
                state.join(RUNTIME_SETTINGS_FILE),
                r#"{"failClosed": false, "eventTimeoutMs": 0}"#,
            )
            .map_err(GuidanceError::from),
        );
        let err = RuntimeConfig::from_lookup(lookup(&[(ENV_HOME, "state")]), dir.path());
        assert!(matches!(err, Err(GuidanceError::Configuration(_))));
    }

    #[test]
    fn project_dir_variable_moves_every_default_path() {
        let config = must(RuntimeConfig::from_lookup(
            lookup(&[(ENV_PROJECT_DIR, "nested/app")]),
            Path::new("/work"),
        ));
        assert_eq!(config.paths.project_dir, PathBuf::from("/work/nested/app"));
        assert_eq!(
            config.paths.local_policy,
            PathBuf::from("/work/nested/app/CLAUDE.local.md")
        );
    }
}
