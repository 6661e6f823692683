#![forbid(unsafe_code)]

//! Shared vocabulary for the guidance runtime: rules, lifecycle events, hook
//! results, trust records, proof envelopes and the error taxonomy every other
//! crate converts into.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

/// Sentinel tag matching every tool class.
pub const ALL_TAG: &str = "all";

/// Tag every event carries for intents and domains, so untagged rules apply.
pub const GENERAL_TAG: &str = "general";

/// Previous-hash marker for the first envelope of a proof chain.
pub const GENESIS_HASH: &str = "GENESIS";

const SHORT_HASH_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum GuidanceError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("gate error: {0}")]
    Gate(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("integrity error: {0}")]
    Integrity(String),
    #[error("lock contention: {0}")]
    LockContention(String),
    #[error("write conflict: {0}")]
    WriteConflict(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GuidanceError {
    /// Stable machine-readable code for the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Gate(_) => "gate_error",
            Self::Timeout(_) => "timeout_error",
            Self::Integrity(_) => "integrity_error",
            Self::LockContention(_) => "lock_contention",
            Self::WriteConflict(_) => "write_conflict",
            Self::Validation(_) => "validation_error",
            Self::Io(_) => "io_error",
            Self::Serialization(_) => "serialization_error",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskClass {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "medium" | "med" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }

    /// Priority assigned to rules that do not declare one.
    #[must_use]
    pub fn default_priority(self) -> i64 {
        match self {
            Self::Low => 10,
            Self::Medium => 50,
            Self::High => 80,
            Self::Critical => 100,
        }
    }

    /// Whether a violation of this class blocks the intercepted operation.
    #[must_use]
    pub fn is_blocking(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Root,
    Local,
}

impl RuleSource {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Local => "local",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub text: String,
    pub risk_class: RiskClass,
    pub priority: i64,
    pub intents: BTreeSet<String>,
    pub domains: BTreeSet<String>,
    pub tool_classes: BTreeSet<String>,
    pub source: RuleSource,
}

impl Rule {
    /// Compares the fields tracked for promotion; `id` and `source` are ignored.
    #[must_use]
    pub fn differs_from(&self, other: &Self) -> bool {
        self.text != other.text
            || self.risk_class != other.risk_class
            || self.priority != other.priority
            || self.intents != other.intents
            || self.domains != other.domains
            || self.tool_classes != other.tool_classes
    }

    #[must_use]
    pub fn applies_to_all_tools(&self) -> bool {
        self.tool_classes.contains(ALL_TAG)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    PreTask,
    PreCommand,
    PreEdit,
    PreToolUse,
    PostEdit,
    PostTask,
    SessionStart,
    SessionEnd,
}

impl EventKind {
    pub const ALL: [Self; 8] = [
        Self::PreTask,
        Self::PreCommand,
        Self::PreEdit,
        Self::PreToolUse,
        Self::PostEdit,
        Self::PostTask,
        Self::SessionStart,
        Self::SessionEnd,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreTask => "preTask",
            Self::PreCommand => "preCommand",
            Self::PreEdit => "preEdit",
            Self::PreToolUse => "preToolUse",
            Self::PostEdit => "postEdit",
            Self::PostTask => "postTask",
            Self::SessionStart => "sessionStart",
            Self::SessionEnd => "sessionEnd",
        }
    }

    /// Accepts camelCase (`preTask`), kebab-case (`pre-task`) and snake_case.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let folded: String = value
            .chars()
            .filter(|ch| *ch != '-' && *ch != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().to_ascii_lowercase() == folded)
    }

    /// Pre-operation events can abort the intercepted operation.
    #[must_use]
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            Self::PreTask | Self::PreCommand | Self::PreEdit | Self::PreToolUse
        )
    }

    #[must_use]
    pub fn is_session_boundary(self) -> bool {
        matches!(self, Self::SessionStart | Self::SessionEnd)
    }

    /// Tool class an event of this kind exercises.
    #[must_use]
    pub fn tool_class(self) -> &'static str {
        match self {
            Self::PreCommand => "bash",
            Self::PreEdit | Self::PostEdit => "edit",
            Self::PreToolUse => "tool",
            Self::PreTask | Self::PostTask => "task",
            Self::SessionStart | Self::SessionEnd => "session",
        }
    }

    /// Kebab-case slug used in violation codes (`pre-command`).
    #[must_use]
    pub fn slug(self) -> &'static str {
        match self {
            Self::PreTask => "pre-task",
            Self::PreCommand => "pre-command",
            Self::PreEdit => "pre-edit",
            Self::PreToolUse => "pre-tool-use",
            Self::PostEdit => "post-edit",
            Self::PostTask => "post-task",
            Self::SessionStart => "session-start",
            Self::SessionEnd => "session-end",
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum EditOperation {
    Modify,
    Create,
    Delete,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ToolInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<EditOperation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_lines: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

/// Stdin payload handed to the dispatcher by the host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct EventPayload {
    #[serde(default)]
    pub tool_input: ToolInput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl EventPayload {
    /// Free text describing the intercepted operation, used for intent detection.
    #[must_use]
    pub fn query_text(&self) -> String {
        let input = &self.tool_input;
        [
            input.description.as_deref(),
            input.command.as_deref(),
            input.file_path.as_deref(),
            input.tool_name.as_deref(),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub task_id: Option<String>,
    pub session_id: String,
    pub agent_id: String,
    pub payload: EventPayload,
    pub timestamp: String,
}

impl HookEvent {
    #[must_use]
    pub fn new(kind: EventKind, payload: EventPayload) -> Self {
        let session_id = payload
            .session_id
            .clone()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "default-session".to_string());
        let agent_id = payload
            .agent_id
            .clone()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "default-agent".to_string());
        Self {
            event_id: Ulid::new().to_string(),
            kind,
            task_id: payload.task_id.clone(),
            session_id,
            agent_id,
            payload,
            timestamp: now_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allow,
    Warn,
    Deny,
}

impl Outcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Warn => "warn",
            Self::Deny => "deny",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allow" => Some(Self::Allow),
            "warn" => Some(Self::Warn),
            "deny" => Some(Self::Deny),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FinalContext {
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HookResult {
    pub success: bool,
    pub aborted: bool,
    #[serde(default)]
    pub skipped: bool,
    pub messages: Vec<String>,
    pub warnings: Vec<String>,
    pub hooks_executed: u32,
    pub hooks_failed: u32,
    pub final_context: FinalContext,
}

impl Default for HookResult {
    fn default() -> Self {
        Self {
            success: true,
            aborted: false,
            skipped: false,
            messages: Vec::new(),
            warnings: Vec::new(),
            hooks_executed: 0,
            hooks_failed: 0,
            final_context: FinalContext::default(),
        }
    }
}

impl HookResult {
    /// Fatal result: the host must not proceed.
    #[must_use]
    pub fn aborted_with(message: impl Into<String>) -> Self {
        Self {
            success: false,
            aborted: true,
            messages: vec![message.into()],
            ..Self::default()
        }
    }

    /// Single outcome for the trust ledger: failure or abort is a deny,
    /// any warning is a warn, everything else is an allow.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        if !self.success || self.aborted {
            Outcome::Deny
        } else if !self.warnings.is_empty() {
            Outcome::Warn
        } else {
            Outcome::Allow
        }
    }

    pub fn set_metadata(&mut self, key: &str, value: Value) {
        self.final_context.metadata.insert(key.to_string(), value);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrustRecord {
    pub agent_id: String,
    pub outcome: Outcome,
    pub reason: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    Trusted,
    Normal,
    Suspect,
    Quarantined,
}

impl TrustTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trusted => "trusted",
            Self::Normal => "normal",
            Self::Suspect => "suspect",
            Self::Quarantined => "quarantined",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrustSnapshot {
    pub agent_id: String,
    pub score: f64,
    pub tier: TrustTier,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    pub rule_id: String,
    pub code: String,
    pub risk_class: RiskClass,
    pub message: String,
}

/// Audit payload describing one dispatch, hashed into the proof chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub event_id: String,
    pub kind: EventKind,
    pub task_id: Option<String>,
    pub task_description: Option<String>,
    pub session_id: String,
    pub agent_id: String,
    pub outcome: Outcome,
    pub intent: Option<String>,
    pub policy_hash: Option<String>,
    pub violations: Vec<ViolationRecord>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRecord {
    pub tool: String,
    pub input_hash: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemoryOp {
    pub op: String,
    pub key: String,
    pub value_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProofEnvelope {
    pub sequence: u64,
    pub envelope_id: String,
    pub prev_content_hash: String,
    pub content_hash: String,
    pub signature: String,
    pub agent_id: String,
    pub session_id: String,
    pub run_event: RunEvent,
    pub tool_call_records: Vec<ToolCallRecord>,
    pub memory_ops: Vec<MemoryOp>,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProofExport {
    pub envelopes: Vec<ProofEnvelope>,
}

impl ProofExport {
    #[must_use]
    pub fn tip(&self) -> Option<&str> {
        self.envelopes
            .last()
            .map(|envelope| envelope.content_hash.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingRun {
    pub task_id: String,
    pub description: String,
    pub started_at: String,
}

pub type PendingRuns = BTreeMap<String, PendingRun>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Minimal,
    Standard,
    Full,
}

impl Preset {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "minimal" => Some(Self::Minimal),
            "standard" => Some(Self::Standard),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// Optional capabilities enabled for an install (`components.json`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ComponentSelection {
    pub trust: bool,
    pub proof: bool,
    pub adversarial: bool,
    pub conformance: bool,
    pub evolution: bool,
}

impl Default for ComponentSelection {
    fn default() -> Self {
        Self::preset(Preset::Standard)
    }
}

impl ComponentSelection {
    pub const NAMES: [&'static str; 5] = ["trust", "proof", "adversarial", "conformance", "evolution"];

    #[must_use]
    pub fn preset(preset: Preset) -> Self {
        match preset {
            Preset::Minimal => Self {
                trust: false,
                proof: true,
                adversarial: false,
                conformance: false,
                evolution: false,
            },
            Preset::Standard => Self {
                trust: true,
                proof: true,
                adversarial: false,
                conformance: false,
                evolution: true,
            },
            Preset::Full => Self {
                trust: true,
                proof: true,
                adversarial: true,
                conformance: true,
                evolution: true,
            },
        }
    }

    /// Toggles a component by name.
    ///
    /// # Errors
    /// Returns [`GuidanceError::Validation`] for an unknown component name.
    pub fn set(&mut self, name: &str, enabled: bool) -> Result<(), GuidanceError> {
        let slot = match name.trim() {
            "trust" => &mut self.trust,
            "proof" => &mut self.proof,
            "adversarial" => &mut self.adversarial,
            "conformance" => &mut self.conformance,
            "evolution" => &mut self.evolution,
            other => {
                return Err(GuidanceError::Validation(format!(
                    "unknown component '{other}'; expected one of {}",
                    Self::NAMES.join(", ")
                )))
            }
        };
        *slot = enabled;
        Ok(())
    }
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// First twelve hex characters of the SHA-256 of `text`.
#[must_use]
pub fn short_hash(text: &str) -> String {
    let mut full = hash_bytes(text.as_bytes());
    full.truncate(SHORT_HASH_LEN);
    full
}

/// Serializes JSON with object keys sorted at every depth and no whitespace.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// SHA-256 over [`canonical_json`].
#[must_use]
pub fn hash_canonical(value: &Value) -> String {
    hash_bytes(canonical_json(value).as_bytes())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (index, key) in keys.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                if let Some(inner) = map.get(key) {
                    write_canonical(inner, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Collapses every whitespace run to a single space and trims the ends.
#[must_use]
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns [`GuidanceError::Validation`] when the value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<(), GuidanceError> {
    if value.trim().is_empty() {
        return Err(GuidanceError::Validation(format!(
            "{field_name} MUST be non-empty"
        )));
    }
    Ok(())
}

/// Parse a `0`/`1` style flag from an environment value.
///
/// # Errors
/// Returns [`GuidanceError::Configuration`] for anything that is not a recognised boolean.
pub fn parse_flag(name: &str, value: &str) -> Result<bool, GuidanceError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(GuidanceError::Configuration(format!(
            "{name} must be 0 or 1, got '{other}'"
        ))),
    }
}

/// Parse a numeric environment value.
///
/// # Errors
/// Returns [`GuidanceError::Configuration`] when the value does not parse.
pub fn parse_number<T>(name: &str, value: &str) -> Result<T, GuidanceError>
where
    T: std::str::FromStr,
    T::Err: Display,
{
    value.trim().parse::<T>().map_err(|err| {
        GuidanceError::Configuration(format!("{name} has invalid value '{value}': {err}"))
    })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`GuidanceError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, GuidanceError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| GuidanceError::Validation(format!("failed to format timestamp: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`GuidanceError::Validation`] when parsing fails or the offset is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, GuidanceError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| GuidanceError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;
    if parsed.offset() != UtcOffset::UTC {
        return Err(GuidanceError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }
    Ok(parsed)
}

#[must_use]
pub fn now_rfc3339() -> String {
    let now = now_utc();
    format_rfc3339(now).unwrap_or_else(|_| now.unix_timestamp().to_string())
}

/// Filesystem-safe UTC stamp with millisecond precision (`20260207T120000123Z`).
#[must_use]
pub fn compact_timestamp(value: OffsetDateTime) -> String {
    let value = value.to_offset(UtcOffset::UTC);
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}{:03}Z",
        value.year(),
        u8::from(value.month()),
        value.day(),
        value.hour(),
        value.minute(),
        value.second(),
        value.millisecond()
    )
}
