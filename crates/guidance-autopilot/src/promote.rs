//! Promotion candidates, the marker block in the root policy, and ADR files.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use guidance_bundle::{parse_rules, render_rule, slugify, Bundle};
use guidance_domain::{Rule, RuleSource};
use serde::{Deserialize, Serialize};

use crate::ab::AbComparison;

pub const BLOCK_START: &str = "<!-- guidance-autopilot:start -->";
pub const BLOCK_END: &str = "<!-- guidance-autopilot:end -->";
const BLOCK_HEADING: &str = "## Auto-promoted guidance";

const ADR_PREFIX: &str = "ADR-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionKind {
    /// The id does not exist in the root policy.
    New,
    /// The root policy has the id with different tracked fields.
    Changed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Promotion {
    pub rule: Rule,
    pub kind: PromotionKind,
}

/// Report view of one promotion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PromotionSummary {
    pub id: String,
    pub kind: PromotionKind,
    pub priority: i64,
    pub line: String,
}

impl From<&Promotion> for PromotionSummary {
    fn from(promotion: &Promotion) -> Self {
        Self {
            id: promotion.rule.id.clone(),
            kind: promotion.kind,
            priority: promotion.rule.priority,
            line: render_rule(&promotion.rule),
        }
    }
}

fn by_priority(left: &Rule, right: &Rule) -> std::cmp::Ordering {
    right
        .priority
        .cmp(&left.priority)
        .then_with(|| left.id.cmp(&right.id))
}

/// Local rules of `merged` that are missing from `root` or differ from it,
/// highest priority first, at most `max`.
#[must_use]
pub fn promotable_rules(root: &Bundle, merged: &Bundle, max: usize) -> Vec<Promotion> {
    let mut promotions: Vec<Promotion> = merged
        .rules()
        .iter()
        .filter(|rule| rule.source == RuleSource::Local)
        .filter_map(|rule| {
            let kind = match root.rule(&rule.id) {
                None => PromotionKind::New,
                Some(existing) if existing.differs_from(rule) => PromotionKind::Changed,
                Some(_) => return None,
            };
            Some(Promotion {
                rule: rule.clone(),
                kind,
            })
        })
        .collect();
    promotions.sort_by(|left, right| by_priority(&left.rule, &right.rule));
    promotions.truncate(max);
    promotions
}

fn block_span(text: &str) -> Option<(usize, usize)> {
    let start = text.find(BLOCK_START)?;
    let end = text[start..].find(BLOCK_END)? + start + BLOCK_END.len();
    Some((start, end))
}

/// Rules currently inside the marker block of `text`.
#[must_use]
pub fn block_rules(text: &str) -> Vec<Rule> {
    block_span(text).map_or_else(Vec::new, |(start, end)| {
        parse_rules(&text[start..end], RuleSource::Root)
    })
}

#[must_use]
pub fn render_block(rules: &[Rule]) -> String {
    let mut sorted: Vec<&Rule> = rules.iter().collect();
    sorted.sort_by(|left, right| by_priority(left, right));
    let mut out = format!("{BLOCK_START}\n{BLOCK_HEADING}\n\n");
    for rule in sorted {
        out.push_str(&render_rule(rule));
        out.push('\n');
    }
    out.push_str(BLOCK_END);
    out
}

/// Root text with `promoted` merged into the marker block.
///
/// An existing block is replaced in place and keeps the rules it already
/// held unless a promoted rule reuses their id; otherwise the block is
/// appended. Block rules come last in the file, so they supersede earlier root
/// rules with the same id when compiled.
#[must_use]
pub fn insert_block(root_text: &str, promoted: &[Rule]) -> String {
    if let Some((start, end)) = block_span(root_text) {
        let mut merged: BTreeMap<String, Rule> = block_rules(root_text)
            .into_iter()
            .map(|rule| (rule.id.clone(), rule))
            .collect();
        for rule in promoted {
            merged.insert(rule.id.clone(), rule.clone());
        }
        let rules: Vec<Rule> = merged.into_values().collect();
        return format!(
            "{}{}{}",
            &root_text[..start],
            render_block(&rules),
            &root_text[end..]
        );
    }

    let mut out = root_text.trim_end().to_string();
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(&render_block(promoted));
    out.push('\n');
    out
}

/// Next free ADR number in `dir` (1 when the directory is empty or missing).
///
/// # Errors
/// Returns an error when an existing directory cannot be listed.
pub fn next_adr_number(dir: &Path) -> Result<u32> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(1),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to list {}", dir.display()));
        }
    };
    let mut highest = 0_u32;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", dir.display()))?;
        let name = entry.file_name();
        let Some(number) = name.to_str().and_then(adr_number) else {
            continue;
        };
        highest = highest.max(number);
    }
    Ok(highest + 1)
}

fn adr_number(file_name: &str) -> Option<u32> {
    let rest = file_name.strip_prefix(ADR_PREFIX)?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

#[must_use]
pub fn adr_file_name(number: u32, title: &str) -> String {
    format!("{ADR_PREFIX}{number:03}-{}.md", slugify(title))
}

/// Inputs recorded in a promotion ADR.
#[derive(Debug)]
pub struct AdrRecord<'a> {
    pub number: u32,
    pub title: &'a str,
    pub date: &'a str,
    pub source: &'a str,
    pub root_name: &'a str,
    pub candidate_hash: &'a str,
    pub baseline_score: f64,
    pub candidate_score: f64,
    pub delta: f64,
    pub min_delta: f64,
    pub ab: Option<&'a AbComparison>,
    pub promotions: &'a [Promotion],
    pub backup_path: &'a Path,
}

#[must_use]
pub fn render_adr(record: &AdrRecord<'_>) -> String {
    let mut out = format!(
        "# {ADR_PREFIX}{:03}: {}\n\n- Status: Accepted\n- Date: {}\n- Source: {}\n- Candidate: {}\n\n",
        record.number, record.title, record.date, record.source, record.candidate_hash
    );
    out.push_str("## Context\n\n");
    out.push_str(&format!(
        "The local overlay carries {} rule(s) that are missing from or differ from {}. \
The analyzer scored the root policy at {:.2} and the candidate at {:.2} \
(delta {:.2}, minimum {:.2}).\n",
        record.promotions.len(),
        record.root_name,
        record.baseline_score,
        record.candidate_score,
        record.delta,
        record.min_delta
    ));
    if let Some(ab) = record.ab {
        out.push_str(&format!(
            "A/B replay: baseline delta {:.4}, candidate delta {:.4}, gain {:.4}.\n",
            ab.baseline_delta, ab.candidate_delta, ab.delta_gain
        ));
    }
    out.push_str(&format!(
        "\n## Decision\n\nPromote the following rules into {}:\n\n",
        record.root_name
    ));
    for promotion in record.promotions {
        let kind = match promotion.kind {
            PromotionKind::New => "new",
            PromotionKind::Changed => "changed",
        };
        out.push_str(&format!("{} ({kind})\n", render_rule(&promotion.rule)));
    }
    out.push_str(&format!(
        "\n## Consequences\n\nThe previous root policy is preserved at `{}`. \
Restore it to roll back.\n",
        record.backup_path.display()
    ));
    out
}
