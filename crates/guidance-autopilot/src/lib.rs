#![forbid(unsafe_code)]

//! Out-of-band promotion of local guidance rules into the root policy.
//!
//! One cycle compiles the root policy alone and with its local overlay,
//! builds a candidate root text carrying the promotable local rules in a
//! marker block, scores baseline and candidate, and rewrites the root file
//! only when the score delta (and optionally the A/B gain) clears the
//! configured thresholds. A backup and an ADR are written before the root
//! file is replaced, all while the cycle lock is held.

pub mod ab;
pub mod analyzer;
pub mod promote;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use guidance_bundle::{compile, load_policy};
use guidance_domain::{
    compact_timestamp, format_rfc3339, now_utc, parse_flag, parse_number, short_hash, Rule,
};
use guidance_gates::GateConfig;
use guidance_store::{
    append_line, read_json_optional, write_json_atomic, write_text_atomic, AUTOPILOT_LOCK_FILE,
    AUTOPILOT_LOG_FILE, AUTOPILOT_REPORT_FILE, AUTOPILOT_STATE_FILE, BACKUPS_DIR,
    DEFAULT_STATE_DIR, PROPOSALS_DIR,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use ab::{compare, run_benchmark, AbComparison, BenchmarkReport, BENCHMARK_CONTRACT_VERSION};
pub use analyzer::{
    round_score, AnalysisReport, Analyzer, CommandAnalyzer, HeuristicAnalyzer,
    DEFAULT_ANALYZER_TIMEOUT,
};
pub use promote::{
    insert_block, promotable_rules, Promotion, PromotionKind, PromotionSummary, BLOCK_END,
    BLOCK_START,
};

pub const REPORT_CONTRACT_VERSION: &str = "autopilot_report.v1";
pub const DEFAULT_MIN_DELTA: f64 = 0.5;
pub const DEFAULT_MAX_PROMOTIONS: usize = 12;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MIN_AB_GAIN: f64 = 0.05;
pub const DEFAULT_SOURCE: &str = "manual";
pub const DEFAULT_ADR_DIR: &str = "docs/adr";
pub const ADR_TITLE: &str = "Promote local guidance";

pub const ENV_ENABLED: &str = "GUIDANCE_AUTOPILOT_ENABLED";
pub const ENV_MIN_DELTA: &str = "GUIDANCE_AUTOPILOT_MIN_DELTA";
pub const ENV_AB: &str = "GUIDANCE_AUTOPILOT_AB";
pub const ENV_MIN_AB_GAIN: &str = "GUIDANCE_AUTOPILOT_MIN_AB_GAIN";
pub const ENV_MAX_PROMOTIONS: &str = "GUIDANCE_AUTOPILOT_MAX_PROMOTIONS";
pub const ENV_INTERVAL_MS: &str = "GUIDANCE_AUTOPILOT_INTERVAL_MS";

const MIN_INTERVAL: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct AutopilotConfig {
    /// Gates the daemon; a single explicit cycle always runs.
    pub enabled: bool,
    pub apply: bool,
    pub min_delta: f64,
    pub max_promotions: usize,
    pub interval: Duration,
    pub ab: bool,
    pub min_ab_gain: f64,
    pub source: String,
    pub gate: GateConfig,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            apply: false,
            min_delta: DEFAULT_MIN_DELTA,
            max_promotions: DEFAULT_MAX_PROMOTIONS,
            interval: DEFAULT_INTERVAL,
            ab: false,
            min_ab_gain: DEFAULT_MIN_AB_GAIN,
            source: DEFAULT_SOURCE.to_string(),
            gate: GateConfig::default(),
        }
    }
}

impl AutopilotConfig {
    /// Defaults overlaid with `GUIDANCE_AUTOPILOT_*` values from `lookup`.
    ///
    /// # Errors
    /// Returns an error for unparseable values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();
        if let Some(value) = get(ENV_ENABLED) {
            config.enabled = parse_flag(ENV_ENABLED, &value)?;
        }
        if let Some(value) = get(ENV_MIN_DELTA) {
            config.min_delta = parse_number(ENV_MIN_DELTA, &value)?;
        }
        if let Some(value) = get(ENV_AB) {
            config.ab = parse_flag(ENV_AB, &value)?;
        }
        if let Some(value) = get(ENV_MIN_AB_GAIN) {
            config.min_ab_gain = parse_number(ENV_MIN_AB_GAIN, &value)?;
        }
        if let Some(value) = get(ENV_MAX_PROMOTIONS) {
            config.max_promotions = parse_number(ENV_MAX_PROMOTIONS, &value)?;
        }
        if let Some(value) = get(ENV_INTERVAL_MS) {
            config.interval = Duration::from_millis(parse_number(ENV_INTERVAL_MS, &value)?);
        }
        Ok(config)
    }

    /// # Errors
    /// See [`AutopilotConfig::from_lookup`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// # Errors
    /// Returns an error when a threshold is negative or not finite, when
    /// `max_promotions` is zero, or when the interval is under one second.
    pub fn validate(&self) -> Result<()> {
        if !self.min_delta.is_finite() || self.min_delta < 0.0 {
            bail!("min delta must be a non-negative number, got {}", self.min_delta);
        }
        if !self.min_ab_gain.is_finite() {
            bail!("min A/B gain must be finite, got {}", self.min_ab_gain);
        }
        if self.max_promotions == 0 {
            bail!("max promotions must be at least 1");
        }
        if self.interval < MIN_INTERVAL {
            bail!(
                "interval must be at least {} ms, got {} ms",
                MIN_INTERVAL.as_millis(),
                self.interval.as_millis()
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutopilotPaths {
    pub project_dir: PathBuf,
    pub root_policy: PathBuf,
    pub local_policy: PathBuf,
    pub state_dir: PathBuf,
    pub adr_dir: PathBuf,
}

impl AutopilotPaths {
    #[must_use]
    pub fn for_project(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            root_policy: project_dir.join("CLAUDE.md"),
            local_policy: project_dir.join("CLAUDE.local.md"),
            state_dir: project_dir.join(DEFAULT_STATE_DIR),
            adr_dir: project_dir.join(DEFAULT_ADR_DIR),
        }
    }

    #[must_use]
    pub fn state_file(&self, name: &str) -> PathBuf {
        self.state_dir.join(name)
    }

    fn root_name(&self) -> String {
        self.root_policy.file_name().map_or_else(
            || "CLAUDE.md".to_string(),
            |name| name.to_string_lossy().into_owned(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    Applied,
    BelowThreshold,
    UnchangedBelowThreshold,
    NoPromotableLocalRules,
    /// Thresholds met but apply was not requested.
    Proposed,
    Skipped,
    Error,
}

impl Decision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::BelowThreshold => "below-threshold",
            Self::UnchangedBelowThreshold => "unchanged-below-threshold",
            Self::NoPromotableLocalRules => "no-promotable-local-rules",
            Self::Proposed => "proposed",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn is_below_threshold(self) -> bool {
        matches!(self, Self::BelowThreshold | Self::UnchangedBelowThreshold)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutopilotState {
    pub last_run_at: Option<String>,
    pub last_candidate_hash: Option<String>,
    pub last_decision: Option<Decision>,
    pub last_delta: Option<f64>,
    #[serde(default)]
    pub cycles: u64,
    #[serde(default)]
    pub applied: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutopilotReport {
    pub contract_version: String,
    pub generated_at: String,
    pub source: String,
    pub analyzer: String,
    pub decision: Decision,
    pub reason: String,
    pub skipped: bool,
    pub rescored: bool,
    pub apply_requested: bool,
    pub root_hash: Option<String>,
    pub candidate_hash: Option<String>,
    pub promotions: Vec<PromotionSummary>,
    pub baseline_score: Option<f64>,
    pub candidate_score: Option<f64>,
    pub delta: Option<f64>,
    pub min_delta: f64,
    pub ab: Option<AbComparison>,
    pub min_ab_gain: Option<f64>,
    pub backup_path: Option<String>,
    pub adr_path: Option<String>,
    pub proposal_path: Option<String>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl AutopilotReport {
    fn new(config: &AutopilotConfig, analyzer: &str, generated_at: String) -> Self {
        Self {
            contract_version: REPORT_CONTRACT_VERSION.to_string(),
            generated_at,
            source: config.source.clone(),
            analyzer: analyzer.to_string(),
            decision: Decision::Error,
            reason: String::new(),
            skipped: false,
            rescored: false,
            apply_requested: config.apply,
            root_hash: None,
            candidate_hash: None,
            promotions: Vec::new(),
            baseline_score: None,
            candidate_score: None,
            delta: None,
            min_delta: config.min_delta,
            ab: None,
            min_ab_gain: config.ab.then_some(config.min_ab_gain),
            backup_path: None,
            adr_path: None,
            proposal_path: None,
            errors: Vec::new(),
            duration_ms: 0,
        }
    }

    fn log_line(&self) -> String {
        let delta = self
            .delta
            .map_or_else(|| "-".to_string(), |delta| format!("{delta:.2}"));
        format!(
            "{} source={} decision={} delta={} candidate={} reason={}",
            self.generated_at,
            self.source,
            self.decision.as_str(),
            delta,
            self.candidate_hash.as_deref().unwrap_or("-"),
            self.reason
        )
    }
}

/// Advisory exclusive lock on `autopilot.lock`, released on drop.
#[derive(Debug)]
pub struct CycleLock {
    file: File,
}

impl CycleLock {
    /// `None` when another holder has the lock.
    ///
    /// # Errors
    /// Returns an error when the lock file cannot be opened or locking fails
    /// for a reason other than contention.
    pub fn acquire(path: &Path) -> Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(Self { file })),
            Err(err) if is_contended(&err) => Ok(None),
            Err(err) => {
                Err(err).with_context(|| format!("failed to lock {}", path.display()))
            }
        }
    }
}

impl Drop for CycleLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

pub struct Autopilot {
    config: AutopilotConfig,
    paths: AutopilotPaths,
    analyzer: Box<dyn Analyzer>,
}

impl std::fmt::Debug for Autopilot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Autopilot")
            .field("config", &self.config)
            .field("paths", &self.paths)
            .field("analyzer", &self.analyzer.name())
            .finish()
    }
}

impl Autopilot {
    #[must_use]
    pub fn new(config: AutopilotConfig, paths: AutopilotPaths, analyzer: Box<dyn Analyzer>) -> Self {
        Self {
            config,
            paths,
            analyzer,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AutopilotConfig {
        &self.config
    }

    #[must_use]
    pub fn paths(&self) -> &AutopilotPaths {
        &self.paths
    }

    /// Persisted state, or the default when no cycle has run yet.
    ///
    /// # Errors
    /// Returns an error when the state file exists but cannot be parsed.
    pub fn load_state(&self) -> Result<AutopilotState> {
        Ok(read_json_optional(&self.paths.state_file(AUTOPILOT_STATE_FILE))?.unwrap_or_default())
    }

    /// Run one cycle under the lock. A held lock yields a skipped report and
    /// leaves state untouched.
    ///
    /// # Errors
    /// Returns an error only when the lock, state, report or log cannot be
    /// accessed; cycle failures are reported with [`Decision::Error`].
    pub fn run_once(&self) -> Result<AutopilotReport> {
        let lock_path = self.paths.state_file(AUTOPILOT_LOCK_FILE);
        let Some(_lock) = CycleLock::acquire(&lock_path)? else {
            let mut report = AutopilotReport::new(&self.config, self.analyzer.name(), timestamp());
            report.decision = Decision::Skipped;
            report.skipped = true;
            report.reason = "locked".to_string();
            info!(lock = %lock_path.display(), "autopilot cycle skipped; lock held");
            append_line(&self.paths.state_file(AUTOPILOT_LOG_FILE), &report.log_line())?;
            return Ok(report);
        };
        self.run_cycle()
    }

    fn run_cycle(&self) -> Result<AutopilotReport> {
        let started = Instant::now();
        let mut report = AutopilotReport::new(&self.config, self.analyzer.name(), timestamp());
        let mut state = match self.load_state() {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "autopilot state unreadable; starting fresh");
                report.errors.push(format!("{err:#}"));
                AutopilotState::default()
            }
        };

        if let Err(err) = self.evaluate(&state, &mut report) {
            let message = format!("{err:#}");
            warn!(error = %message, "autopilot cycle failed");
            report.decision = Decision::Error;
            report.reason.clone_from(&message);
            report.errors.push(message);
        }
        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        state.last_run_at = Some(report.generated_at.clone());
        state.last_decision = Some(report.decision);
        state.last_candidate_hash.clone_from(&report.candidate_hash);
        if report.delta.is_some() {
            state.last_delta = report.delta;
        }
        state.cycles += 1;
        if report.decision == Decision::Applied {
            state.applied += 1;
        }

        write_json_atomic(&self.paths.state_file(AUTOPILOT_STATE_FILE), &state)?;
        write_json_atomic(&self.paths.state_file(AUTOPILOT_REPORT_FILE), &report)?;
        append_line(&self.paths.state_file(AUTOPILOT_LOG_FILE), &report.log_line())?;
        info!(
            decision = report.decision.as_str(),
            delta = ?report.delta,
            candidate = report.candidate_hash.as_deref().unwrap_or("-"),
            "autopilot cycle complete"
        );
        Ok(report)
    }

    fn evaluate(&self, state: &AutopilotState, report: &mut AutopilotReport) -> Result<()> {
        let texts = load_policy(&self.paths.root_policy, &self.paths.local_policy)?;
        report.root_hash = Some(short_hash(&texts.root));

        let root_bundle = compile(&texts.root, None);
        let merged = texts.compile();
        let promotions = promotable_rules(&root_bundle, &merged, self.config.max_promotions);
        report.promotions = promotions.iter().map(PromotionSummary::from).collect();
        if promotions.is_empty() {
            report.decision = Decision::NoPromotableLocalRules;
            report.reason = "no local rule is missing from or differs from the root policy".to_string();
            return Ok(());
        }

        let promoted: Vec<Rule> = promotions.iter().map(|p| p.rule.clone()).collect();
        let candidate = insert_block(&texts.root, &promoted);
        let candidate_hash = short_hash(&candidate);
        report.candidate_hash = Some(candidate_hash.clone());

        let unchanged = state.last_candidate_hash.as_deref() == Some(candidate_hash.as_str())
            && state.last_decision.is_some_and(Decision::is_below_threshold);
        if unchanged {
            report.decision = Decision::UnchangedBelowThreshold;
            report.reason = "candidate unchanged since the last below-threshold cycle".to_string();
            report.delta = state.last_delta;
            return Ok(());
        }

        report.rescored = true;
        let baseline = self
            .analyzer
            .analyze(&texts.root)
            .context("failed to score the root policy")?;
        let scored = self
            .analyzer
            .analyze(&candidate)
            .context("failed to score the candidate policy")?;
        let delta = round_score(scored.composite_score - baseline.composite_score);
        report.baseline_score = Some(baseline.composite_score);
        report.candidate_score = Some(scored.composite_score);
        report.delta = Some(delta);

        let comparison = self
            .config
            .ab
            .then(|| compare(&texts.root, &candidate, &self.config.gate));
        let ab_passed = match &comparison {
            Some(comparison) => comparison.delta_gain >= self.config.min_ab_gain,
            None => true,
        };
        let delta_passed = delta >= self.config.min_delta;

        if delta_passed && ab_passed && self.config.apply {
            self.apply(&texts.root, &candidate, &candidate_hash, &promotions, comparison.as_ref(), report)?;
            report.ab = comparison;
            report.decision = Decision::Applied;
            report.reason = format!(
                "delta {delta:.2} meets minimum {:.2}; promoted {} rule(s)",
                self.config.min_delta,
                promotions.len()
            );
            return Ok(());
        }

        report.reason = if !delta_passed {
            format!("delta {delta:.2} below minimum {:.2}", self.config.min_delta)
        } else if let (false, Some(comparison)) = (ab_passed, comparison.as_ref()) {
            format!(
                "A/B gain {:.4} below minimum {:.4}",
                comparison.delta_gain, self.config.min_ab_gain
            )
        } else {
            "thresholds met; apply not requested".to_string()
        };
        report.decision = if delta_passed && ab_passed {
            Decision::Proposed
        } else {
            Decision::BelowThreshold
        };
        report.ab = comparison;

        let proposal = self.paths.state_file(PROPOSALS_DIR).join(format!(
            "{}.{candidate_hash}.proposed.md",
            self.paths.root_name()
        ));
        write_text_atomic(&proposal, &candidate)?;
        report.proposal_path = Some(proposal.display().to_string());
        Ok(())
    }

    // Backup, ADR, then the root rewrite, all under the cycle lock.
    fn apply(
        &self,
        root_text: &str,
        candidate: &str,
        candidate_hash: &str,
        promotions: &[Promotion],
        comparison: Option<&AbComparison>,
        report: &mut AutopilotReport,
    ) -> Result<()> {
        let now = now_utc();
        let root_name = self.paths.root_name();
        let backup = self
            .paths
            .state_file(BACKUPS_DIR)
            .join(format!("{root_name}.{}.bak", compact_timestamp(now)));
        write_text_atomic(&backup, root_text)
            .with_context(|| format!("failed to back up {}", self.paths.root_policy.display()))?;
        report.backup_path = Some(backup.display().to_string());

        let number = promote::next_adr_number(&self.paths.adr_dir)?;
        let adr_path = self
            .paths
            .adr_dir
            .join(promote::adr_file_name(number, ADR_TITLE));
        let date = format_rfc3339(now)?;
        let adr = promote::render_adr(&promote::AdrRecord {
            number,
            title: ADR_TITLE,
            date: &date,
            source: &self.config.source,
            root_name: &root_name,
            candidate_hash,
            baseline_score: report.baseline_score.unwrap_or_default(),
            candidate_score: report.candidate_score.unwrap_or_default(),
            delta: report.delta.unwrap_or_default(),
            min_delta: self.config.min_delta,
            ab: comparison,
            promotions,
            backup_path: &backup,
        });
        write_text_atomic(&adr_path, &adr)?;
        report.adr_path = Some(adr_path.display().to_string());

        write_text_atomic(&self.paths.root_policy, candidate)
            .with_context(|| format!("failed to rewrite {}", self.paths.root_policy.display()))?;
        info!(
            root = %self.paths.root_policy.display(),
            adr = %adr_path.display(),
            promotions = promotions.len(),
            "root policy rewritten"
        );
        Ok(())
    }

    /// Run cycles every `interval` until `stop` is set or `max_cycles` have
    /// run. Cycle errors are logged and the loop continues.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid.
    pub fn run_daemon(&self, stop: &AtomicBool, max_cycles: Option<u64>) -> Result<u64> {
        self.config.validate()?;
        if !self.config.enabled {
            info!("autopilot disabled; daemon not started");
            return Ok(0);
        }
        let mut cycles = 0_u64;
        while !stop.load(Ordering::SeqCst) {
            match self.run_once() {
                Ok(report) => info!(decision = report.decision.as_str(), "daemon cycle finished"),
                Err(err) => {
                    let message = format!("{err:#}");
                    warn!(error = %message, "daemon cycle failed");
                    let line = format!("{} decision=error reason={message}", timestamp());
                    if let Err(log_err) = append_line(&self.paths.state_file(AUTOPILOT_LOG_FILE), &line) {
                        warn!(error = %log_err, "failed to append autopilot log");
                    }
                }
            }
            cycles += 1;
            if max_cycles.is_some_and(|max| cycles >= max) {
                break;
            }
            let deadline = Instant::now() + self.config.interval;
            while Instant::now() < deadline && !stop.load(Ordering::SeqCst) {
                thread::sleep(STOP_POLL.min(deadline.saturating_duration_since(Instant::now())));
            }
        }
        Ok(cycles)
    }
}

fn timestamp() -> String {
    guidance_domain::now_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err:#}"),
        }
    }

    fn must_some<T>(value: Option<T>, context: &str) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..): {context}"),
        }
    }

    /// Scores texts with the marker block as `candidate`, everything else as `baseline`.
    struct ScriptedAnalyzer {
        baseline: f64,
        candidate: f64,
        calls: Cell<usize>,
    }

    impl ScriptedAnalyzer {
        fn boxed(baseline: f64, candidate: f64) -> Box<dyn Analyzer> {
            Box::new(Self {
                baseline,
                candidate,
                calls: Cell::new(0),
            })
        }
    }

    impl Analyzer for ScriptedAnalyzer {
        fn analyze(&self, text: &str) -> Result<AnalysisReport> {
            self.calls.set(self.calls.get() + 1);
            let score = if text.contains(BLOCK_START) {
                self.candidate
            } else {
                self.baseline
            };
            Ok(AnalysisReport {
                composite_score: score,
                dimensions: BTreeMap::new(),
            })
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    const ROOT: &str = "# Project policy\n\
\n\
## Git\n\
- [no-force-push] Never force push to protected branches (critical) @git #deploy priority:100\n";

    const LOCAL: &str = "- [require-review] Require a second reviewer for release branches (medium) @git #deploy priority:40\n";

    fn repo() -> (TempDir, AutopilotPaths) {
        let dir = must(tempfile::tempdir().map_err(anyhow::Error::from));
        let paths = AutopilotPaths::for_project(dir.path());
        must(fs::write(&paths.root_policy, ROOT).map_err(anyhow::Error::from));
        must(fs::write(&paths.local_policy, LOCAL).map_err(anyhow::Error::from));
        (dir, paths)
    }

    fn config(apply: bool) -> AutopilotConfig {
        AutopilotConfig {
            apply,
            ..AutopilotConfig::default()
        }
    }

    fn entries(dir: &Path) -> Vec<String> {
        match fs::read_dir(dir) {
            Ok(entries) => {
                let mut names: Vec<String> = entries
                    .filter_map(std::result::Result::ok)
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect();
                names.sort();
                names
            }
            Err(_) => Vec::new(),
        }
    }

    fn read(path: &Path) -> String {
        must(fs::read_to_string(path).map_err(anyhow::Error::from))
    }

    #[test]
    fn below_threshold_writes_a_proposal_and_keeps_root() {
        let (_dir, paths) = repo();
        let autopilot = Autopilot::new(config(true), paths.clone(), ScriptedAnalyzer::boxed(70.0, 70.1));
        let report = must(autopilot.run_once());

        assert_eq!(report.decision, Decision::BelowThreshold);
        assert_eq!(report.delta, Some(0.1));
        assert_eq!(read(&paths.root_policy), ROOT);
        let proposals = entries(&paths.state_file(PROPOSALS_DIR));
        assert_eq!(proposals.len(), 1);
        assert!(proposals[0].starts_with("CLAUDE.md."));
        assert!(proposals[0].ends_with(".proposed.md"));
        assert!(entries(&paths.state_file(BACKUPS_DIR)).is_empty());

        let state = must(autopilot.load_state());
        assert_eq!(state.last_decision, Some(Decision::BelowThreshold));
        assert_eq!(state.last_candidate_hash, report.candidate_hash);
    }

    #[test]
    fn rerun_after_below_threshold_is_a_no_op() {
        let (_dir, paths) = repo();
        let analyzer = ScriptedAnalyzer {
            baseline: 70.0,
            candidate: 70.1,
            calls: Cell::new(0),
        };
        let first = {
            let autopilot = Autopilot::new(config(true), paths.clone(), Box::new(analyzer));
            must(autopilot.run_once())
        };
        let proposals_before = entries(&paths.state_file(PROPOSALS_DIR));

        let analyzer = ScriptedAnalyzer::boxed(0.0, 100.0);
        let autopilot = Autopilot::new(config(true), paths.clone(), analyzer);
        let second = must(autopilot.run_once());

        assert!(second.decision.is_below_threshold());
        assert_eq!(second.decision, Decision::UnchangedBelowThreshold);
        assert!(!second.rescored);
        assert_eq!(second.candidate_hash, first.candidate_hash);
        assert_eq!(second.delta, first.delta);
        assert_eq!(read(&paths.root_policy), ROOT);
        assert_eq!(entries(&paths.state_file(PROPOSALS_DIR)), proposals_before);
        assert!(entries(&paths.state_file(BACKUPS_DIR)).is_empty());
        assert!(entries(&paths.adr_dir).is_empty());

        let state = must(autopilot.load_state());
        assert_eq!(state.cycles, 2);
        assert_eq!(state.last_candidate_hash, first.candidate_hash);
    }

    #[test]
    fn promotion_rewrites_root_with_backup_and_adr() {
        let (_dir, paths) = repo();
        let autopilot = Autopilot::new(config(true), paths.clone(), ScriptedAnalyzer::boxed(70.0, 70.8));
        let report = must(autopilot.run_once());

        assert_eq!(report.decision, Decision::Applied);
        assert_eq!(report.delta, Some(0.8));
        let root = read(&paths.root_policy);
        assert!(root.contains(BLOCK_START));
        assert!(root.contains("[require-review]"));
        assert!(root.starts_with(ROOT.trim_end()));

        let backups = entries(&paths.state_file(BACKUPS_DIR));
        assert_eq!(backups.len(), 1);
        assert!(backups[0].starts_with("CLAUDE.md.") && backups[0].ends_with(".bak"));
        assert_eq!(read(&paths.state_file(BACKUPS_DIR).join(&backups[0])), ROOT);

        let adrs = entries(&paths.adr_dir);
        assert_eq!(adrs, vec!["ADR-001-promote-local-guidance.md".to_string()]);
        let adr = read(&paths.adr_dir.join(&adrs[0]));
        assert!(adr.contains("require-review"));
        assert!(adr.contains("Status: Accepted"));

        let second = must(autopilot.run_once());
        assert_eq!(second.decision, Decision::NoPromotableLocalRules);
        assert_eq!(read(&paths.root_policy), root);
        assert_eq!(entries(&paths.state_file(BACKUPS_DIR)).len(), 1);
        assert_eq!(entries(&paths.adr_dir).len(), 1);

        let state = must(autopilot.load_state());
        assert_eq!(state.applied, 1);
    }

    #[test]
    fn passing_without_apply_only_proposes() {
        let (_dir, paths) = repo();
        let autopilot = Autopilot::new(config(false), paths.clone(), ScriptedAnalyzer::boxed(10.0, 20.0));
        let report = must(autopilot.run_once());
        assert_eq!(report.decision, Decision::Proposed);
        assert!(report.proposal_path.is_some());
        assert_eq!(read(&paths.root_policy), ROOT);
    }

    #[test]
    fn ab_gain_gates_promotion() {
        let (_dir, paths) = repo();
        let config = AutopilotConfig {
            apply: true,
            ab: true,
            min_ab_gain: 5.0,
            ..AutopilotConfig::default()
        };
        let autopilot = Autopilot::new(config, paths.clone(), ScriptedAnalyzer::boxed(10.0, 20.0));
        let report = must(autopilot.run_once());
        assert_eq!(report.decision, Decision::BelowThreshold);
        assert!(report.reason.contains("A/B gain"));
        assert!(report.ab.is_some());
        assert_eq!(read(&paths.root_policy), ROOT);
    }

    #[test]
    fn held_lock_skips_the_cycle() {
        let (_dir, paths) = repo();
        let held = must(CycleLock::acquire(&paths.state_file(AUTOPILOT_LOCK_FILE)));
        let _held = must_some(held, "first lock");

        let autopilot = Autopilot::new(config(true), paths.clone(), ScriptedAnalyzer::boxed(0.0, 100.0));
        let report = must(autopilot.run_once());
        assert!(report.skipped);
        assert_eq!(report.reason, "locked");
        assert_eq!(report.decision, Decision::Skipped);
        assert_eq!(read(&paths.root_policy), ROOT);
        assert!(!paths.state_file(AUTOPILOT_STATE_FILE).exists());
    }

    #[test]
    fn lock_is_released_on_drop() {
        let (_dir, paths) = repo();
        let path = paths.state_file(AUTOPILOT_LOCK_FILE);
        drop(must(CycleLock::acquire(&path)));
        assert!(must(CycleLock::acquire(&path)).is_some());
    }

    #[test]
    fn missing_root_is_reported_not_raised() {
        let (_dir, paths) = repo();
        must(fs::remove_file(&paths.root_policy).map_err(anyhow::Error::from));
        let autopilot = Autopilot::new(config(true), paths.clone(), ScriptedAnalyzer::boxed(0.0, 1.0));
        let report = must(autopilot.run_once());
        assert_eq!(report.decision, Decision::Error);
        assert!(!report.errors.is_empty());

        let persisted: AutopilotReport = must_some(
            must(read_json_optional(&paths.state_file(AUTOPILOT_REPORT_FILE))),
            "report file",
        );
        assert_eq!(persisted.decision, Decision::Error);
        assert!(read(&paths.state_file(AUTOPILOT_LOG_FILE)).contains("decision=error"));
    }

    #[test]
    fn daemon_honours_cycle_limit_and_stop_flag() {
        let (_dir, paths) = repo();
        let autopilot = Autopilot::new(config(false), paths.clone(), ScriptedAnalyzer::boxed(0.0, 0.0));
        let stop = AtomicBool::new(false);
        assert_eq!(must(autopilot.run_daemon(&stop, Some(1))), 1);

        stop.store(true, Ordering::SeqCst);
        assert_eq!(must(autopilot.run_daemon(&stop, Some(5))), 0);

        let disabled = Autopilot::new(
            AutopilotConfig {
                enabled: false,
                ..AutopilotConfig::default()
            },
            paths,
            ScriptedAnalyzer::boxed(0.0, 0.0),
        );
        assert_eq!(must(disabled.run_daemon(&AtomicBool::new(false), Some(1))), 0);
    }

    #[test]
    fn config_reads_environment_and_validates() {
        let vars: BTreeMap<&str, &str> = BTreeMap::from([
            (ENV_MIN_DELTA, "1.5"),
            (ENV_AB, "1"),
            (ENV_MIN_AB_GAIN, "0.2"),
            (ENV_MAX_PROMOTIONS, "3"),
        ]);
        let config = must(AutopilotConfig::from_lookup(|name: &str| {
            vars.get(name).map(|value| (*value).to_string())
        }));
        assert!((config.min_delta - 1.5).abs() < f64::EPSILON);
        assert!(config.ab);
        assert_eq!(config.max_promotions, 3);
        assert!(config.validate().is_ok());

        assert!(AutopilotConfig::from_lookup(|name: &str| {
            (name == ENV_MIN_DELTA).then(|| "lots".to_string())
        })
        .is_err());

        let invalid = AutopilotConfig {
            max_promotions: 0,
            ..AutopilotConfig::default()
        };
        assert!(invalid.validate().is_err());
        let fast = AutopilotConfig {
            interval: Duration::from_millis(10),
            ..AutopilotConfig::default()
        };
        assert!(fast.validate().is_err());
    }
}
