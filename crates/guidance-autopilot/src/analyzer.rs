use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use guidance_bundle::{compile, detect_domains, detect_intents, keywords, known_domains, known_intents};
use guidance_domain::{RiskClass, GENERAL_TAG};
use guidance_gates::{GateConfig, GateEngine};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_ANALYZER_TIMEOUT: Duration = Duration::from_secs(30);

const REAP_TIMEOUT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Composite quality score of one policy text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub composite_score: f64,
    #[serde(default)]
    pub dimensions: BTreeMap<String, f64>,
}

/// Scores policy text. The autopilot only relies on `composite_score`.
pub trait Analyzer {
    #[allow(clippy::missing_errors_doc)]
    fn analyze(&self, text: &str) -> Result<AnalysisReport>;

    fn name(&self) -> &str;
}

// (dimension, weight); weights sum to 1.
const DIMENSIONS: &[(&str, f64)] = &[
    ("coverage", 0.20),
    ("enforceability", 0.20),
    ("specificity", 0.15),
    ("structure", 0.10),
    ("conciseness", 0.10),
    ("safety", 0.25),
];

const SAFETY_TOPICS: &[(&str, &[&str])] = &[
    ("secrets", &["secret", "credential", "password", "token", "key"]),
    ("history", &["force", "rebase", "history"]),
    ("destructive", &["delete", "rm", "drop", "destroy", "truncate"]),
    ("verification", &["test", "verify", "review", "lint"]),
    ("dependencies", &["dependenc", "install", "package", "lockfile"]),
];

const SPECIFIC_KEYWORDS: usize = 6;
const CONCISE_MIN_CHARS: usize = 20;
const CONCISE_MAX_CHARS: usize = 160;

/// Built-in analyzer: six weighted dimensions, each 0-100.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicAnalyzer;

impl Analyzer for HeuristicAnalyzer {
    fn analyze(&self, text: &str) -> Result<AnalysisReport> {
        Ok(heuristic_report(text))
    }

    fn name(&self) -> &str {
        "heuristic"
    }
}

#[allow(clippy::cast_precision_loss)]
fn ratio(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

fn heuristic_report(text: &str) -> AnalysisReport {
    let bundle = compile(text, None);
    let rules = bundle.rules();
    let mut dimensions = BTreeMap::new();
    if rules.is_empty() {
        for (name, _) in DIMENSIONS {
            dimensions.insert((*name).to_string(), 0.0);
        }
        return AnalysisReport {
            composite_score: 0.0,
            dimensions,
        };
    }

    let rule_texts: Vec<&str> = rules.iter().map(|rule| rule.text.as_str()).collect();
    let joined = rule_texts.join(" ");

    let intents = detect_intents(&joined);
    let domains = detect_domains(&joined);
    let known_total = known_intents().count() + known_domains().count();
    let covered = intents.iter().filter(|tag| tag.as_str() != GENERAL_TAG).count()
        + domains.iter().filter(|tag| tag.as_str() != GENERAL_TAG).count();
    dimensions.insert("coverage".to_string(), ratio(covered, known_total));

    let engine = GateEngine::from_bundle(&bundle, GateConfig::default());
    let enforceable = engine.enforceable_rule_ids().len();
    let firm = rules
        .iter()
        .filter(|rule| rule.risk_class >= RiskClass::Medium)
        .count();
    dimensions.insert(
        "enforceability".to_string(),
        ratio(enforceable, rules.len()) * 0.6 + ratio(firm, rules.len()) * 0.4,
    );

    let specificity: usize = rule_texts
        .iter()
        .map(|text| keywords(text).len().min(SPECIFIC_KEYWORDS))
        .sum();
    dimensions.insert(
        "specificity".to_string(),
        ratio(specificity, rules.len() * SPECIFIC_KEYWORDS),
    );

    let explicit = rules.iter().filter(|rule| !rule.id.starts_with("auto-")).count();
    let has_headings = text.lines().any(|line| line.trim_start().starts_with('#'));
    let heading_score = if has_headings { 100.0 } else { 0.0 };
    dimensions.insert(
        "structure".to_string(),
        ratio(explicit, rules.len()) * 0.5 + heading_score * 0.5,
    );

    let concise = rule_texts
        .iter()
        .filter(|text| (CONCISE_MIN_CHARS..=CONCISE_MAX_CHARS).contains(&text.len()))
        .count();
    dimensions.insert("conciseness".to_string(), ratio(concise, rules.len()));

    let words = keywords(&joined);
    let topics = SAFETY_TOPICS
        .iter()
        .filter(|(_, stems)| {
            words
                .iter()
                .any(|word| stems.iter().any(|stem| stem_matches(word, stem)))
        })
        .count();
    dimensions.insert("safety".to_string(), ratio(topics, SAFETY_TOPICS.len()));

    let composite = DIMENSIONS
        .iter()
        .map(|(name, weight)| dimensions.get(*name).copied().unwrap_or_default() * weight)
        .sum::<f64>();
    AnalysisReport {
        composite_score: round_score(composite),
        dimensions: dimensions
            .into_iter()
            .map(|(name, score)| (name, round_score(score)))
            .collect(),
    }
}

fn stem_matches(word: &str, stem: &str) -> bool {
    if stem.len() <= 3 {
        word == stem
    } else {
        word.starts_with(stem)
    }
}

/// Two decimal places, so reports stay stable across runs.
#[must_use]
pub fn round_score(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Runs an external analyzer: policy text on stdin, JSON with
/// `compositeScore` (or `composite_score`) on stdout.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    label: String,
}

impl CommandAnalyzer {
    /// Split `command_line` on whitespace into program and arguments.
    ///
    /// # Errors
    /// Returns an error when `command_line` is blank.
    pub fn parse(command_line: &str, timeout: Duration) -> Result<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("analyzer command must not be empty"))?;
        Ok(Self {
            program: PathBuf::from(program),
            args: parts.map(str::to_string).collect(),
            timeout,
            label: command_line.trim().to_string(),
        })
    }

    fn spawn(&self) -> Result<Child> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn analyzer '{}'", self.label))
    }
}

impl Analyzer for CommandAnalyzer {
    fn analyze(&self, text: &str) -> Result<AnalysisReport> {
        let mut child = self.spawn()?;

        let stdin = child.stdin.take();
        let input = text.to_string();
        let writer = thread::spawn(move || {
            if let Some(mut stdin) = stdin {
                // The child may exit without reading; a broken pipe is not ours to report.
                let _ = stdin.write_all(input.as_bytes());
            }
        });
        let stdout = child.stdout.take();
        let reader = thread::spawn(move || {
            let mut buffer = String::new();
            if let Some(mut stdout) = stdout {
                let _ = stdout.read_to_string(&mut buffer);
            }
            buffer
        });

        let status = wait_with_deadline(&mut child, self.timeout)?;
        let _ = writer.join();
        let output = reader
            .join()
            .map_err(|_| anyhow!("analyzer output reader panicked"))?;

        let Some(status) = status else {
            bail!(
                "analyzer '{}' timed out after {} ms",
                self.label,
                self.timeout.as_millis()
            );
        };
        if !status.success() {
            bail!("analyzer '{}' exited with {status}", self.label);
        }
        parse_analyzer_output(&output)
            .with_context(|| format!("analyzer '{}' returned unusable output", self.label))
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Wait for `child` until `timeout`; on expiry kill it, reap it and return `None`.
fn wait_with_deadline(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("failed to poll analyzer process")? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    let _ = child.kill();
    let reap_deadline = Instant::now() + REAP_TIMEOUT;
    loop {
        match child.try_wait() {
            Ok(None) => {}
            Ok(Some(_)) | Err(_) => return Ok(None),
        }
        if Instant::now() >= reap_deadline {
            bail!("analyzer process did not exit after kill");
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn parse_analyzer_output(output: &str) -> Result<AnalysisReport> {
    let value: Value = serde_json::from_str(output.trim()).context("stdout is not JSON")?;
    let score = value
        .get("compositeScore")
        .or_else(|| value.get("composite_score"))
        .and_then(Value::as_f64)
        .ok_or_else(|| anyhow!("missing numeric compositeScore"))?;
    if !score.is_finite() {
        bail!("compositeScore must be finite");
    }
    let dimensions = value
        .get("dimensions")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .filter_map(|(name, score)| score.as_f64().map(|score| (name.clone(), score)))
                .collect()
        })
        .unwrap_or_default();
    Ok(AnalysisReport {
        composite_score: score,
        dimensions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err:#}"),
        }
    }

    const THIN: &str = "- be careful\n";

    const RICH: &str = "# Policy\n\
\n\
## Git\n\
- [no-force-push] Never force push to protected branches (critical) @git #deploy [bash] priority:100\n\
- [no-hook-bypass] Never skip hooks with --no-verify when committing (high) @git priority:80\n\
\n\
## Security\n\
- [no-secrets] Never commit secrets, tokens or credentials to the repository (critical) @security #security priority:95\n\
- [no-sudo] Never run sudo or escalate privilege in scripts (high) @security priority:70\n\
\n\
## Database\n\
- [no-drop] Never drop table in a migration without a reviewed backup plan (high) @database priority:60\n\
- [tests] Always run the test suite before pushing a release (medium) #test priority:40\n\
- [deps] Pin package dependencies and review lockfile changes (medium) @dependencies priority:30\n";

    #[test]
    fn empty_policy_scores_zero() {
        let report = must(HeuristicAnalyzer.analyze("# Nothing here\n"));
        assert!(report.composite_score.abs() < f64::EPSILON);
        assert_eq!(report.dimensions.len(), DIMENSIONS.len());
    }

    #[test]
    fn richer_policy_scores_higher() {
        let thin = must(HeuristicAnalyzer.analyze(THIN));
        let rich = must(HeuristicAnalyzer.analyze(RICH));
        assert!(rich.composite_score > thin.composite_score);
        assert!(rich.composite_score <= 100.0);
        for score in rich.dimensions.values() {
            assert!((0.0..=100.0).contains(score));
        }
    }

    #[test]
    fn heuristic_scores_are_deterministic() {
        let first = must(HeuristicAnalyzer.analyze(RICH));
        let second = must(HeuristicAnalyzer.analyze(RICH));
        assert_eq!(first, second);
    }

    #[test]
    fn analyzer_output_accepts_both_key_styles() {
        let camel = must(parse_analyzer_output(r#"{"compositeScore": 71.5}"#));
        assert!((camel.composite_score - 71.5).abs() < f64::EPSILON);
        let snake = must(parse_analyzer_output(
            r#"{"composite_score": 12, "dimensions": {"safety": 40}}"#,
        ));
        assert!((snake.composite_score - 12.0).abs() < f64::EPSILON);
        assert_eq!(snake.dimensions.get("safety"), Some(&40.0));
        assert!(parse_analyzer_output(r#"{"score": 1}"#).is_err());
        assert!(parse_analyzer_output("not json").is_err());
    }

    #[test]
    fn blank_command_is_rejected() {
        assert!(CommandAnalyzer::parse("   ", DEFAULT_ANALYZER_TIMEOUT).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_analyzer_reads_stdout() {
        let analyzer = must(CommandAnalyzer::parse(
            "echo {\"compositeScore\":42}",
            Duration::from_secs(5),
        ));
        let report = must(analyzer.analyze(RICH));
        assert!((report.composite_score - 42.0).abs() < f64::EPSILON);
    }

    #[cfg(unix)]
    #[test]
    fn command_analyzer_is_killed_at_deadline() {
        let analyzer = must(CommandAnalyzer::parse("sleep 5", Duration::from_millis(100)));
        let started = Instant::now();
        match analyzer.analyze(RICH) {
            Ok(report) => panic!("expected a timeout, got {report:?}"),
            Err(err) => assert!(format!("{err:#}").contains("timed out")),
        }
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
