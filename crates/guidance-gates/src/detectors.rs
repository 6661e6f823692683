use guidance_domain::{EventKind, EventPayload, RiskClass};
use regex::Regex;

/// Part of the event payload a detector inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Field {
    Command,
    Content,
    FilePath,
    CommandOrContent,
}

impl Field {
    pub(crate) fn texts(self, payload: &EventPayload) -> Vec<&str> {
        let input = &payload.tool_input;
        let picks = match self {
            Self::Command => [input.command.as_deref(), None],
            Self::Content => [input.content.as_deref(), None],
            Self::FilePath => [input.file_path.as_deref(), None],
            Self::CommandOrContent => [input.command.as_deref(), input.content.as_deref()],
        };
        picks.into_iter().flatten().collect()
    }
}

const COMMAND_KINDS: &[EventKind] = &[EventKind::PreCommand, EventKind::PreToolUse];
const EDIT_KINDS: &[EventKind] = &[EventKind::PreEdit, EventKind::PostEdit];
const CONTENT_KINDS: &[EventKind] = &[
    EventKind::PreCommand,
    EventKind::PreToolUse,
    EventKind::PreEdit,
    EventKind::PostEdit,
];

const FORCE_PUSH: &str = r"\bgit\s+push\b.*\s(?:--force|-f)(?:\s|$)";

const SECRET_LITERALS: &[&str] = &[
    r"AKIA[0-9A-Z]{16}",
    r"-----BEGIN (?:RSA |EC |DSA |OPENSSH )?PRIVATE KEY-----",
    r"\bghp_[A-Za-z0-9]{36}\b",
    r"\bsk-[A-Za-z0-9_-]{20,}",
    r#"(?i)\b(?:api[_-]?key|secret|password|passwd|token)\s*[:=]\s*['"][^'"\s]{8,}['"]"#,
];

/// Bundle rules become checkable when their text mentions one of these
/// keyword phrases; the linked patterns decide whether the rule is violated.
pub(crate) struct DetectorSpec {
    pub(crate) id: &'static str,
    pub(crate) rule_keywords: &'static [&'static str],
    pub(crate) kinds: &'static [EventKind],
    pub(crate) field: Field,
    pub(crate) patterns: &'static [&'static str],
}

pub(crate) const RULE_DETECTORS: &[DetectorSpec] = &[
    DetectorSpec {
        id: "force-push",
        rule_keywords: &["force push", "force-push", "push --force", "--force"],
        kinds: COMMAND_KINDS,
        field: Field::Command,
        patterns: &[FORCE_PUSH],
    },
    DetectorSpec {
        id: "secrets",
        rule_keywords: &["secret", "credential", "password", "api key", "private key", "token"],
        kinds: CONTENT_KINDS,
        field: Field::CommandOrContent,
        patterns: SECRET_LITERALS,
    },
    DetectorSpec {
        id: "sql-drop",
        rule_keywords: &["drop table", "drop database", "drop schema", "truncate", "destructive migration"],
        kinds: CONTENT_KINDS,
        field: Field::CommandOrContent,
        patterns: &[
            r"(?i)\bdrop\s+(?:table|database|schema)\b",
            r"(?i)\btruncate\s+table\b",
        ],
    },
    DetectorSpec {
        id: "hook-bypass",
        rule_keywords: &["no-verify", "bypass hook", "skip hook", "bypass the hook", "skip the hook"],
        kinds: COMMAND_KINDS,
        field: Field::Command,
        patterns: &[r"\s--no-verify\b", r"\bgit\s+commit\b.*\s-n(?:\s|$)"],
    },
    DetectorSpec {
        id: "privilege-escalation",
        rule_keywords: &["sudo", "privilege", "root access", "chmod 777"],
        kinds: COMMAND_KINDS,
        field: Field::Command,
        patterns: &[
            r"(?:^|[;&|]\s*)sudo\s",
            r"\bchmod\s+(?:-R\s+)?777\b",
        ],
    },
    DetectorSpec {
        id: "remote-script",
        rule_keywords: &["curl", "wget", "pipe to shell", "remote script", "piped to sh"],
        kinds: COMMAND_KINDS,
        field: Field::Command,
        patterns: &[r"\b(?:curl|wget)\b[^|]*\|\s*(?:sudo\s+)?(?:ba|z)?sh\b"],
    },
    DetectorSpec {
        id: "env-file",
        rule_keywords: &[".env", "env file", "dotenv"],
        kinds: EDIT_KINDS,
        field: Field::FilePath,
        patterns: &[r"(?:^|/)\.env(?:\.[A-Za-z0-9_-]+)?$"],
    },
];

/// Gates evaluated on every event regardless of bundle contents.
pub(crate) struct BuiltinSpec {
    pub(crate) id: &'static str,
    pub(crate) risk: RiskClass,
    pub(crate) priority: i64,
    pub(crate) kinds: &'static [EventKind],
    pub(crate) field: Field,
    pub(crate) patterns: &'static [&'static str],
    pub(crate) message: &'static str,
}

pub(crate) const BUILTIN_PATTERN_GATES: &[BuiltinSpec] = &[
    BuiltinSpec {
        id: "gate.destructive-ops",
        risk: RiskClass::Critical,
        priority: 1000,
        kinds: COMMAND_KINDS,
        field: Field::Command,
        patterns: &[
            FORCE_PUSH,
            r"\brm\s+(?:-\S*\s+)*-\S*[rR]\S*\s+(?:-\S*\s+)*(?:/|~|\$HOME)\*?(?:\s|;|&|$)",
            r"\bmkfs(?:\.\w+)?\s",
            r"\bdd\s+.*\bof=/dev/(?:sd|nvme|hd|disk)",
            r"\bchmod\s+-R\s+777\s+/(?:\s|$)",
            r"(?i)\bgit\s+reset\s+--hard\s+origin/(?:main|master)\b",
            r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        ],
        message: "destructive command blocked",
    },
    BuiltinSpec {
        id: "gate.secrets",
        risk: RiskClass::High,
        priority: 900,
        kinds: CONTENT_KINDS,
        field: Field::CommandOrContent,
        patterns: SECRET_LITERALS,
        message: "secret literal detected",
    },
];

pub(crate) const LARGE_DIFF_GATE_ID: &str = "gate.large-diff";
pub(crate) const LARGE_DIFF_PRIORITY: i64 = 500;
pub(crate) const TOOL_ALLOWLIST_GATE_ID: &str = "gate.tool-allowlist";
pub(crate) const TOOL_ALLOWLIST_PRIORITY: i64 = 800;

/// A pattern set compiled from a spec table row.
#[derive(Debug, Clone)]
pub(crate) struct CompiledPatterns {
    pub(crate) kinds: Vec<EventKind>,
    pub(crate) field: Field,
    pub(crate) patterns: Vec<Regex>,
}

impl CompiledPatterns {
    pub(crate) fn compile(
        owner: &str,
        kinds: &[EventKind],
        field: Field,
        patterns: &[&str],
        errors: &mut Vec<String>,
    ) -> Self {
        let mut compiled = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            match Regex::new(pattern) {
                Ok(regex) => compiled.push(regex),
                Err(err) => errors.push(format!("{owner}: invalid pattern '{pattern}': {err}")),
            }
        }
        Self {
            kinds: kinds.to_vec(),
            field,
            patterns: compiled,
        }
    }

    /// First matched fragment, if this pattern set fires for the event.
    pub(crate) fn find(&self, kind: EventKind, payload: &EventPayload) -> Option<String> {
        if !self.kinds.contains(&kind) {
            return None;
        }
        for text in self.field.texts(payload) {
            for pattern in &self.patterns {
                if let Some(found) = pattern.find(text) {
                    return Some(found.as_str().trim().to_string());
                }
            }
        }
        None
    }
}
