use guidance_domain::{EventKind, EventPayload, GuidanceError, RiskClass};
use regex::Regex;

use crate::Violation;

/// Commands that abort the operation before any policy is consulted.
pub const DEFAULT_DESTRUCTIVE_PATTERNS: &[(&str, &str)] = &[
    ("fork-bomb", r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
    (
        "rm-rf-root",
        r"\brm\s+(?:-\S*\s+)*-\S*[rR]\S*\s+(?:-\S*\s+)*/\*?(?:\s|;|&|$)",
    ),
    ("format-drive", r"(?i)\bformat(?:\.com)?\s+[a-z]:"),
    ("del-drive", r"(?i)\bdel\s+(?:/[a-z]\s+)*/s\s+(?:/[a-z]\s+)*[a-z]:\\"),
];

#[derive(Debug, Clone)]
pub struct DestructiveShortcut {
    patterns: Vec<(String, Regex)>,
}

impl DestructiveShortcut {
    /// Build a shortcut list from `(label, regex)` pairs.
    ///
    /// # Errors
    /// Returns [`GuidanceError::Configuration`] when a pattern does not compile.
    pub fn new<'a>(
        patterns: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, GuidanceError> {
        let mut compiled = Vec::new();
        for (label, pattern) in patterns {
            let regex = Regex::new(pattern).map_err(|err| {
                GuidanceError::Configuration(format!(
                    "invalid destructive pattern '{label}': {err}"
                ))
            })?;
            compiled.push((label.to_string(), regex));
        }
        Ok(Self { patterns: compiled })
    }

    /// Append an extra pattern to the list.
    ///
    /// # Errors
    /// Returns [`GuidanceError::Configuration`] when the pattern does not compile.
    pub fn with_pattern(mut self, label: &str, pattern: &str) -> Result<Self, GuidanceError> {
        let regex = Regex::new(pattern).map_err(|err| {
            GuidanceError::Configuration(format!("invalid destructive pattern '{label}': {err}"))
        })?;
        self.patterns.push((label.to_string(), regex));
        Ok(self)
    }

    #[must_use]
    pub fn labels(&self) -> Vec<&str> {
        self.patterns.iter().map(|(label, _)| label.as_str()).collect()
    }

    /// Label of the first pattern matching `command`.
    #[must_use]
    pub fn matches(&self, command: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(_, regex)| regex.is_match(command))
            .map(|(label, _)| label.as_str())
    }

    /// Critical violation when the event carries a destructive command.
    #[must_use]
    pub fn check(&self, kind: EventKind, payload: &EventPayload) -> Option<Violation> {
        let command = payload.tool_input.command.as_deref()?;
        let label = self.matches(command)?;
        Some(Violation {
            rule_id: format!("shortcut.{label}"),
            code: format!("{}-blocked", kind.slug()),
            risk_class: RiskClass::Critical,
            priority: i64::MAX,
            message: format!("destructive command refused ({label}): {command}"),
        })
    }
}

impl Default for DestructiveShortcut {
    fn default() -> Self {
        let patterns = DEFAULT_DESTRUCTIVE_PATTERNS
            .iter()
            .filter_map(|(label, pattern)| {
                Regex::new(pattern)
                    .ok()
                    .map(|regex| ((*label).to_string(), regex))
            })
            .collect();
        Self { patterns }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_patterns_all_compile() {
        let shortcut = DestructiveShortcut::default();
        assert_eq!(shortcut.labels().len(), DEFAULT_DESTRUCTIVE_PATTERNS.len());
    }

    #[test]
    fn catches_the_minimum_safety_net() {
        let shortcut = DestructiveShortcut::default();
        assert_eq!(shortcut.matches("rm -rf /"), Some("rm-rf-root"));
        assert_eq!(shortcut.matches("sudo rm -rf /*"), Some("rm-rf-root"));
        assert_eq!(shortcut.matches("rm -fr / --no-preserve-root"), Some("rm-rf-root"));
        assert_eq!(shortcut.matches(":(){ :|:& };:"), Some("fork-bomb"));
        assert_eq!(shortcut.matches("format c:"), Some("format-drive"));
        assert_eq!(shortcut.matches(r"del /s /q c:\"), Some("del-drive"));
    }

    #[test]
    fn leaves_ordinary_commands_alone() {
        let shortcut = DestructiveShortcut::default();
        for command in [
            "git status",
            "rm -rf /tmp/build",
            "rm -rf ./target",
            "cargo fmt",
            "del notes.txt",
        ] {
            assert_eq!(shortcut.matches(command), None, "{command}");
        }
    }

    #[test]
    fn extra_patterns_extend_the_list() {
        let shortcut = match DestructiveShortcut::default().with_pattern("shred", r"\bshred\b") {
            Ok(value) => value,
            Err(err) => panic!("pattern should compile: {err}"),
        };
        assert_eq!(shortcut.matches("shred -u secrets.txt"), Some("shred"));
        assert!(DestructiveShortcut::default()
            .with_pattern("broken", "(")
            .is_err());
    }
}
