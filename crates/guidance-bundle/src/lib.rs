#![forbid(unsafe_code)]

//! Policy bundle compiler and retriever.
//!
//! Policy files are Markdown. Every bullet outside a code fence is a rule,
//! either explicit (`- [id] text (risk) @domain #intent [tool] priority:N`) or
//! implicit (`- text`), in which case id, risk and tags are inferred; the
//! nearest heading adds a domain tag when it names a known domain. The
//! compiled [`Bundle`] carries a constitution hash that depends only on the
//! normalised rule set, never on input ordering or whitespace.

mod retrieve;
pub mod tags;

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use guidance_domain::{
    hash_canonical, normalize_whitespace, now_rfc3339, short_hash, GuidanceError, RiskClass, Rule,
    RuleSource, ALL_TAG, GENERAL_TAG,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

pub use retrieve::{RetrievedShard, TaskRetrieval, DEFAULT_MAX_SHARDS};
pub use tags::{
    detect_domains, detect_intent, detect_intents, is_known_domain, keywords, known_domains,
    known_intents, slugify, tokenize,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Constitution {
    pub hash: String,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Shard {
    pub rule: Rule,
    pub embedding_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub total_rules: usize,
    pub root_rules: usize,
    pub local_rules: usize,
    pub compiled_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    pub constitution: Constitution,
    pub shards: Vec<Shard>,
    pub manifest: Manifest,
}

impl Bundle {
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.constitution.hash
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.constitution.rules
    }

    #[must_use]
    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.constitution.rules.iter().find(|rule| rule.id == id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.constitution.rules.is_empty()
    }
}

/// Raw policy text read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTexts {
    pub root: String,
    pub local: Option<String>,
}

impl PolicyTexts {
    #[must_use]
    pub fn compile(&self) -> Bundle {
        compile(&self.root, self.local.as_deref())
    }
}

/// Read the root policy (mandatory) and the local overlay (optional).
///
/// # Errors
/// Returns [`GuidanceError::Configuration`] when the root file is missing or
/// unreadable, and [`GuidanceError::Io`] when an existing local file cannot be read.
pub fn load_policy(root_path: &Path, local_path: &Path) -> Result<PolicyTexts, GuidanceError> {
    let root = std::fs::read_to_string(root_path).map_err(|err| {
        GuidanceError::Configuration(format!(
            "root policy {} is missing or unreadable: {err}",
            root_path.display()
        ))
    })?;
    let local = match std::fs::read_to_string(local_path) {
        Ok(text) => Some(text),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(GuidanceError::Io(err)),
    };
    Ok(PolicyTexts { root, local })
}

/// Compile root text plus an optional local overlay into a [`Bundle`].
///
/// A local rule whose id matches a root rule replaces it. Rules are sorted by id
/// before hashing.
#[must_use]
pub fn compile(root_text: &str, local_text: Option<&str>) -> Bundle {
    let mut merged: BTreeMap<String, Rule> = BTreeMap::new();
    let root_rules = parse_rules(root_text, RuleSource::Root);
    let root_count = root_rules.len();
    for rule in root_rules {
        merged.insert(rule.id.clone(), rule);
    }

    let mut local_count = 0_usize;
    let mut overrides = 0_usize;
    if let Some(local_text) = local_text {
        for rule in parse_rules(local_text, RuleSource::Local) {
            local_count += 1;
            if merged.insert(rule.id.clone(), rule).is_some() {
                overrides += 1;
            }
        }
    }

    let rules: Vec<Rule> = merged.into_values().collect();
    let hash = constitution_hash(&rules);
    let shards = rules
        .iter()
        .map(|rule| Shard {
            rule: rule.clone(),
            embedding_key: embedding_key(rule),
        })
        .collect();

    debug!(
        total = rules.len(),
        root = root_count,
        local = local_count,
        overrides,
        hash = %hash,
        "compiled policy bundle"
    );

    Bundle {
        manifest: Manifest {
            total_rules: rules.len(),
            root_rules: root_count,
            local_rules: local_count,
            compiled_at: now_rfc3339(),
        },
        constitution: Constitution { hash, rules },
        shards,
    }
}

/// Digest over the normalised rule sequence; callers pass rules sorted by id.
#[must_use]
pub fn constitution_hash(rules: &[Rule]) -> String {
    let material: Vec<Value> = rules
        .iter()
        .map(|rule| {
            json!({
                "id": rule.id,
                "text": rule.text,
                "riskClass": rule.risk_class.as_str(),
                "priority": rule.priority,
                "intents": rule.intents,
                "domains": rule.domains,
                "toolClasses": rule.tool_classes,
                "source": rule.source.as_str(),
            })
        })
        .collect();
    hash_canonical(&Value::Array(material))
}

fn embedding_key(rule: &Rule) -> String {
    let mut words = keywords(&rule.text);
    words.extend(
        rule.intents
            .iter()
            .chain(rule.domains.iter())
            .filter(|tag| tag.as_str() != GENERAL_TAG)
            .cloned(),
    );
    words.into_iter().collect::<Vec<_>>().join(" ")
}

/// Parse every rule bullet in `text`.
#[must_use]
pub fn parse_rules(text: &str, source: RuleSource) -> Vec<Rule> {
    let mut rules = Vec::new();
    let mut heading: Option<String> = None;
    let mut in_fence = false;

    for raw in text.lines() {
        let line = raw.trim();
        if line.starts_with("```") || line.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if let Some(title) = heading_text(line) {
            heading = Some(slugify(title)).filter(|slug| !slug.is_empty());
            continue;
        }
        let Some(body) = bullet_body(line) else {
            continue;
        };
        if let Some(rule) = parse_rule_line(body, source, heading.as_deref()) {
            rules.push(rule);
        }
    }
    rules
}

fn heading_text(line: &str) -> Option<&str> {
    let level = line.chars().take_while(|ch| *ch == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    line[level..]
        .strip_prefix(' ')
        .map(str::trim)
        .filter(|title| !title.is_empty())
}

fn bullet_body(line: &str) -> Option<&str> {
    ["- ", "* ", "+ "]
        .iter()
        .find_map(|marker| line.strip_prefix(marker))
        .map(str::trim)
        .filter(|body| !body.is_empty())
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | ':'))
}

fn is_tag(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
}

fn split_explicit_id(body: &str) -> (Option<&str>, &str) {
    if let Some(after_open) = body.strip_prefix('[') {
        if let Some(close) = after_open.find(']') {
            let candidate = &after_open[..close];
            if is_identifier(candidate) {
                return (Some(candidate), after_open[close + 1..].trim_start());
            }
        }
    }
    (None, body)
}

#[derive(Default)]
struct TrailingMeta {
    risk: Option<RiskClass>,
    priority: Option<i64>,
    intents: BTreeSet<String>,
    domains: BTreeSet<String>,
    tool_classes: BTreeSet<String>,
}

impl TrailingMeta {
    // Returns false when `token` is plain text, which ends the metadata tail.
    fn absorb(&mut self, token: &str) -> bool {
        if let Some(value) = token.strip_prefix("priority:") {
            return match value.parse::<i64>() {
                Ok(parsed) => {
                    self.priority.get_or_insert(parsed);
                    true
                }
                Err(_) => false,
            };
        }
        if let Some(tag) = token.strip_prefix('@').filter(|tag| is_tag(tag)) {
            self.domains.insert(tag.to_ascii_lowercase());
            return true;
        }
        if let Some(tag) = token.strip_prefix('#').filter(|tag| is_tag(tag)) {
            self.intents.insert(tag.to_ascii_lowercase());
            return true;
        }
        if let Some(tag) = token
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .filter(|tag| is_tag(tag))
        {
            self.tool_classes.insert(tag.to_ascii_lowercase());
            return true;
        }
        if let Some(risk) = token
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .and_then(RiskClass::parse)
        {
            self.risk.get_or_insert(risk);
            return true;
        }
        false
    }
}

fn parse_rule_line(body: &str, source: RuleSource, heading: Option<&str>) -> Option<Rule> {
    let (explicit_id, rest) = split_explicit_id(body);
    let mut tokens: Vec<&str> = rest.split_whitespace().collect();
    let mut meta = TrailingMeta::default();
    while let Some(last) = tokens.last().copied() {
        if !meta.absorb(last) {
            break;
        }
        tokens.pop();
    }

    let text = normalize_whitespace(&tokens.join(" "));
    if text.is_empty() {
        return None;
    }

    let id = explicit_id.map_or_else(|| format!("auto-{}", short_hash(&text)), str::to_string);
    let risk_class = meta.risk.unwrap_or_else(|| infer_risk(&text));
    let priority = meta
        .priority
        .unwrap_or_else(|| risk_class.default_priority());

    let intents = if meta.intents.is_empty() {
        detect_intents(&text)
    } else {
        meta.intents
    };
    let domains = if meta.domains.is_empty() {
        inferred_domains(&text, heading)
    } else {
        meta.domains
    };
    let tool_classes = if meta.tool_classes.is_empty() {
        BTreeSet::from([ALL_TAG.to_string()])
    } else {
        meta.tool_classes
    };

    Some(Rule {
        id,
        text,
        risk_class,
        priority,
        intents,
        domains,
        tool_classes,
        source,
    })
}

fn inferred_domains(text: &str, heading: Option<&str>) -> BTreeSet<String> {
    let mut domains = detect_domains(text);
    if let Some(heading) = heading.filter(|heading| is_known_domain(heading)) {
        domains.remove(GENERAL_TAG);
        domains.insert(heading.to_string());
    }
    domains
}

fn infer_risk(text: &str) -> RiskClass {
    let words = tokenize(text);
    let has = |word: &str| words.iter().any(|token| token == word);
    let must_not = words
        .windows(2)
        .any(|pair| pair[0] == "must" && pair[1] == "not");
    if has("never") || must_not {
        RiskClass::High
    } else if has("must") || has("always") {
        RiskClass::Medium
    } else {
        RiskClass::Low
    }
}

/// Render a rule in the explicit bullet grammar accepted by [`parse_rules`].
#[must_use]
pub fn render_rule(rule: &Rule) -> String {
    let mut line = format!("- [{}] {} ({})", rule.id, rule.text, rule.risk_class.as_str());
    for domain in &rule.domains {
        line.push_str(" @");
        line.push_str(domain);
    }
    for intent in &rule.intents {
        line.push_str(" #");
        line.push_str(intent);
    }
    for tool in &rule.tool_classes {
        line.push_str(" [");
        line.push_str(tool);
        line.push(']');
    }
    line.push_str(&format!(" priority:{}", rule.priority));
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn must_some<T>(value: Option<T>, context: &str) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..): {context}"),
        }
    }

    const ROOT: &str = "# Project policy\n\
\n\
## Git\n\
- [no-force-push] Never force push to protected branches (critical) @git #deploy [bash] priority:100\n\
- Always run the test suite before committing\n\
\n\
```bash\n\
- this bullet lives in a fence and is ignored\n\
```\n\
\n\
## Security\n\
- Never commit secrets or credentials\n";

    #[test]
    fn explicit_rule_fields_are_parsed() {
        let rules = parse_rules(ROOT, RuleSource::Root);
        let rule = must_some(
            rules.iter().find(|rule| rule.id == "no-force-push"),
            "explicit rule",
        );
        assert_eq!(rule.text, "Never force push to protected branches");
        assert_eq!(rule.risk_class, RiskClass::Critical);
        assert_eq!(rule.priority, 100);
        assert_eq!(rule.domains, BTreeSet::from(["git".to_string()]));
        assert_eq!(rule.intents, BTreeSet::from(["deploy".to_string()]));
        assert_eq!(rule.tool_classes, BTreeSet::from(["bash".to_string()]));
    }

    #[test]
    fn implicit_rules_infer_id_risk_and_heading_domain() {
        let rules = parse_rules(ROOT, RuleSource::Root);
        assert_eq!(rules.len(), 3);

        let secrets = must_some(
            rules.iter().find(|rule| rule.text.contains("secrets")),
            "implicit secrets rule",
        );
        assert!(secrets.id.starts_with("auto-"));
        assert_eq!(secrets.risk_class, RiskClass::High);
        assert_eq!(secrets.priority, RiskClass::High.default_priority());
        assert!(secrets.domains.contains("security"));
        assert!(secrets.intents.contains("security"));
        assert!(secrets.applies_to_all_tools());

        let tests = must_some(
            rules.iter().find(|rule| rule.text.contains("test suite")),
            "implicit test rule",
        );
        assert_eq!(tests.risk_class, RiskClass::Medium);
        assert!(tests.domains.contains("git"));
    }

    #[test]
    fn local_rule_supersedes_root_with_same_id() {
        let local = "- [no-force-push] Never force push anywhere (critical) @git [bash] priority:120\n\
                     - [local-only] Prefer small commits (low) @git #general [all] priority:5\n";
        let bundle = compile(ROOT, Some(local));
        let rule = must_some(bundle.rule("no-force-push"), "overridden rule");
        assert_eq!(rule.source, RuleSource::Local);
        assert_eq!(rule.priority, 120);
        assert_eq!(bundle.manifest.total_rules, 4);
        assert_eq!(bundle.manifest.local_rules, 2);
        assert_eq!(bundle.shards.len(), 4);
    }

    #[test]
    fn rules_are_sorted_by_id() {
        let bundle = compile("- [b] second rule\n- [a] first rule\n", None);
        let ids: Vec<&str> = bundle.rules().iter().map(|rule| rule.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn hash_ignores_line_order_and_whitespace() {
        let first = compile("- [a] keep   it small\n- [b] write tests\n", None);
        let second = compile("\n\n-   [b]   write tests  \n- [a] keep it small\n", None);
        assert_eq!(first.hash(), second.hash());
    }

    #[test]
    fn hash_changes_with_tracked_fields() {
        let low = compile("- [a] keep it small (low)\n", None);
        let high = compile("- [a] keep it small (high)\n", None);
        assert_ne!(low.hash(), high.hash());
    }

    #[test]
    fn rendered_rules_reparse_identically() {
        for rule in parse_rules(ROOT, RuleSource::Local) {
            let reparsed = parse_rules(&render_rule(&rule), RuleSource::Root);
            assert_eq!(reparsed.len(), 1);
            assert!(!rule.differs_from(&reparsed[0]), "{}", render_rule(&rule));
            assert_eq!(rule.id, reparsed[0].id);
        }
    }

    #[test]
    fn checkbox_bullets_are_not_explicit_ids() {
        let rules = parse_rules("- [ ] migrate the database\n", RuleSource::Root);
        assert_eq!(rules.len(), 1);
        assert!(rules[0].id.starts_with("auto-"));
    }

    #[test]
    fn missing_root_policy_is_configuration_error() {
        let dir = std::env::temp_dir().join(format!("guidance-bundle-{}", short_hash(&now_rfc3339())));
        let result = load_policy(&dir.join("CLAUDE.md"), &dir.join("CLAUDE.local.md"));
        match result {
            Err(GuidanceError::Configuration(message)) => assert!(message.contains("CLAUDE.md")),
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    fn rule_line() -> impl Strategy<Value = (String, usize)> {
        ("[a-z]{2,8}( [a-z]{2,8}){0,5}", 0_usize..4)
    }

    proptest! {
        #[test]
        fn constitution_hash_is_deterministic(
            lines in prop::collection::btree_map("[a-z]{1,6}", rule_line(), 0..12)
        ) {
            let risks = ["low", "medium", "high", "critical"];
            let render = |spacing: &str, reverse: bool| {
                let mut out: Vec<String> = lines
                    .iter()
                    .map(|(id, (text, risk))| {
                        format!("-{spacing}[{id}]{spacing}{}{spacing}({})", text.replace(' ', spacing), risks[*risk])
                    })
                    .collect();
                if reverse {
                    out.reverse();
                }
                out.join("\n")
            };
            let plain = render(" ", false);
            let spaced = render("   ", true);
            let first = compile(&plain, None);
            let second = compile(&plain, None);
            let third = compile(&spaced, None);
            prop_assert_eq!(first.hash(), second.hash());
            prop_assert_eq!(first.hash(), third.hash());
        }
    }
}
