use std::collections::BTreeSet;

use guidance_domain::GENERAL_TAG;

type KeywordTable = &'static [(&'static str, &'static [&'static str])];

// Earlier rows win ties in `detect_intent`.
const INTENT_KEYWORDS: KeywordTable = &[
    (
        "security",
        &[
            "security", "secure", "secret", "credential", "password", "passwd", "token", "auth",
            "vulnerab", "inject", "permission", "sudo", "encrypt", "privilege", "apikey", "xss",
            "csrf",
        ],
    ),
    (
        "test",
        &["test", "coverage", "assert", "fixture", "mock", "regression"],
    ),
    (
        "refactor",
        &["refactor", "rename", "cleanup", "restructur", "simplif", "extract", "dedup"],
    ),
    (
        "performance",
        &["perf", "latenc", "optimi", "cache", "throughput", "benchmark", "slow", "fast"],
    ),
    (
        "deploy",
        &["deploy", "release", "publish", "push", "rollout", "rollback"],
    ),
    (
        "docs",
        &["docs", "documentation", "readme", "changelog", "docstring"],
    ),
];

const DOMAIN_KEYWORDS: KeywordTable = &[
    (
        "security",
        &["secret", "credential", "password", "passwd", "token", "auth", "encrypt", "sudo", "privilege"],
    ),
    (
        "git",
        &["git", "commit", "branch", "push", "merge", "rebase", "checkout", "hook"],
    ),
    (
        "database",
        &["sql", "database", "db", "migration", "schema", "postgres", "mysql", "sqlite", "table"],
    ),
    (
        "filesystem",
        &["rm", "file", "director", "path", "chmod", "chown", "delete", "disk"],
    ),
    (
        "network",
        &["curl", "wget", "http", "api", "endpoint", "request", "download"],
    ),
    (
        "config",
        &["config", "env", "settings", "yaml", "toml", "dotenv"],
    ),
    (
        "dependencies",
        &["npm", "cargo", "pip", "dependenc", "package", "install", "lockfile"],
    ),
];

// Keywords this short must match a whole token; longer ones match as stems.
const EXACT_MATCH_MAX_LEN: usize = 3;

const STOP_WORDS: &[&str] = &[
    "the", "an", "to", "of", "and", "or", "in", "on", "for", "with", "is", "be", "are", "it",
    "must", "never", "always", "should", "not", "do", "don", "use", "any", "all", "from", "by",
    "as", "at", "this", "that", "when", "before", "after", "into",
];

/// Lowercased alphanumeric tokens of at least two characters.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|token| token.len() >= 2)
        .map(str::to_ascii_lowercase)
        .collect()
}

/// Tokens with stop words removed, deduplicated and ordered.
#[must_use]
pub fn keywords(text: &str) -> BTreeSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|token| !STOP_WORDS.contains(&token.as_str()))
        .collect()
}

fn keyword_matches(token: &str, keyword: &str) -> bool {
    if keyword.len() <= EXACT_MATCH_MAX_LEN {
        token == keyword
    } else {
        token.starts_with(keyword)
    }
}

fn table_hits(table: KeywordTable, tokens: &[String]) -> Vec<(&'static str, usize)> {
    table
        .iter()
        .map(|(label, words)| {
            let hits = tokens
                .iter()
                .filter(|token| words.iter().any(|word| keyword_matches(token, word)))
                .count();
            (*label, hits)
        })
        .filter(|(_, hits)| *hits > 0)
        .collect()
}

/// Every intent label whose keywords occur in `text`; never empty.
#[must_use]
pub fn detect_intents(text: &str) -> BTreeSet<String> {
    labels_or_general(table_hits(INTENT_KEYWORDS, &tokenize(text)))
}

/// Every domain label whose keywords occur in `text`; never empty.
#[must_use]
pub fn detect_domains(text: &str) -> BTreeSet<String> {
    labels_or_general(table_hits(DOMAIN_KEYWORDS, &tokenize(text)))
}

/// Coarse single intent label: the intent with the most keyword hits.
#[must_use]
pub fn detect_intent(text: &str) -> String {
    let mut best: Option<(&str, usize)> = None;
    for (label, hits) in table_hits(INTENT_KEYWORDS, &tokenize(text)) {
        match best {
            Some((_, current)) if hits <= current => {}
            _ => best = Some((label, hits)),
        }
    }
    best.map_or_else(|| GENERAL_TAG.to_string(), |(label, _)| label.to_string())
}

fn labels_or_general(hits: Vec<(&'static str, usize)>) -> BTreeSet<String> {
    let mut labels: BTreeSet<String> = hits
        .into_iter()
        .map(|(label, _)| label.to_string())
        .collect();
    if labels.is_empty() {
        labels.insert(GENERAL_TAG.to_string());
    }
    labels
}

/// Whether `label` names a domain that event tagging can produce.
#[must_use]
pub fn is_known_domain(label: &str) -> bool {
    DOMAIN_KEYWORDS.iter().any(|(known, _)| *known == label)
}

/// Intent labels the keyword table can detect, in table order.
pub fn known_intents() -> impl Iterator<Item = &'static str> {
    INTENT_KEYWORDS.iter().map(|(label, _)| *label)
}

/// Domain labels the keyword table can detect, in table order.
pub fn known_domains() -> impl Iterator<Item = &'static str> {
    DOMAIN_KEYWORDS.iter().map(|(label, _)| *label)
}

/// Lowercase kebab slug (`Git Workflow` -> `git-workflow`).
#[must_use]
pub fn slugify(text: &str) -> String {
    tokenize_keep_short(text).join("-")
}

fn tokenize_keep_short(text: &str) -> Vec<String> {
    text.split(|ch: char| !ch.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}
