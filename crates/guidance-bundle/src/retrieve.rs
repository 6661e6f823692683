use std::cmp::Ordering;
use std::collections::BTreeSet;

use guidance_domain::GENERAL_TAG;
use serde::{Deserialize, Serialize};

use crate::tags::{detect_intent, keywords};
use crate::{render_rule, Bundle, Shard};

pub const DEFAULT_MAX_SHARDS: usize = 5;

const INTENT_BOOST: f64 = 0.25;
const MIN_STEP: f64 = 1e-6;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetrievedShard {
    pub shard: Shard,
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRetrieval {
    pub intent: String,
    pub shards: Vec<RetrievedShard>,
    pub policy_text: String,
}

impl Bundle {
    /// Rank shards by keyword overlap with `query`.
    ///
    /// Scores are strictly decreasing down the list; ties are broken by
    /// priority (descending) then id. An empty query yields nothing.
    #[must_use]
    pub fn retrieve(&self, query: &str, max_shards: usize) -> Vec<RetrievedShard> {
        let query_words = keywords(query);
        if query_words.is_empty() || max_shards == 0 {
            return Vec::new();
        }
        let intent = detect_intent(query);

        let mut scored: Vec<(f64, &Shard)> = self
            .shards
            .iter()
            .map(|shard| (similarity(&query_words, &intent, shard), shard))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        scored.sort_by(|left, right| {
            right
                .0
                .partial_cmp(&left.0)
                .unwrap_or(Ordering::Equal)
                .then_with(|| right.1.rule.priority.cmp(&left.1.rule.priority))
                .then_with(|| left.1.rule.id.cmp(&right.1.rule.id))
        });

        let mut out: Vec<RetrievedShard> = Vec::with_capacity(max_shards.min(scored.len()));
        for (score, shard) in scored {
            if out.len() == max_shards {
                break;
            }
            let score = match out.last() {
                Some(previous) if score >= previous.similarity => previous.similarity - MIN_STEP,
                _ => score,
            };
            if score <= 0.0 {
                break;
            }
            out.push(RetrievedShard {
                shard: shard.clone(),
                similarity: score,
            });
        }
        out
    }

    /// Retrieve shards for a task and render them as policy text.
    ///
    /// When nothing matches, the highest-priority rules stand in so a non-empty
    /// bundle always produces policy text.
    #[must_use]
    pub fn retrieve_for_task(&self, task_description: &str, max_shards: usize) -> TaskRetrieval {
        let intent = detect_intent(task_description);
        let shards = self.retrieve(task_description, max_shards);

        let lines: Vec<String> = if shards.is_empty() {
            let mut fallback: Vec<&Shard> = self.shards.iter().collect();
            fallback.sort_by(|left, right| {
                right
                    .rule
                    .priority
                    .cmp(&left.rule.priority)
                    .then_with(|| left.rule.id.cmp(&right.rule.id))
            });
            fallback
                .into_iter()
                .take(max_shards.max(1))
                .map(|shard| render_rule(&shard.rule))
                .collect()
        } else {
            shards
                .iter()
                .map(|retrieved| render_rule(&retrieved.shard.rule))
                .collect()
        };

        let policy_text = if lines.is_empty() {
            String::new()
        } else {
            format!("Relevant guidance (intent: {intent}):\n{}", lines.join("\n"))
        };

        TaskRetrieval {
            intent,
            shards,
            policy_text,
        }
    }
}

fn similarity(query_words: &BTreeSet<String>, intent: &str, shard: &Shard) -> f64 {
    let shard_words: BTreeSet<&str> = shard.embedding_key.split_whitespace().collect();
    let shared = query_words
        .iter()
        .filter(|word| shard_words.contains(word.as_str()))
        .count();
    let union = query_words.len() + shard_words.len() - shared;
    let mut score = if union == 0 {
        0.0
    } else {
        ratio(shared, union)
    };
    if intent != GENERAL_TAG && shard.rule.intents.contains(intent) {
        score += INTENT_BOOST;
    }
    score.min(1.0)
}

#[allow(clippy::cast_precision_loss)]
fn ratio(numerator: usize, denominator: usize) -> f64 {
    numerator as f64 / denominator as f64
}

#[cfg(test)]
mod tests {
    use crate::compile;

    const POLICY: &str = "\
- [auth-tokens] Never log auth tokens or passwords (high) @security #security [all] priority:90\n\
- [auth-review] Auth changes need a second reviewer (medium) @security #security [all] priority:60\n\
- [small-diffs] Keep diffs small and focused (low) @git #refactor [edit] priority:20\n\
- [bench] Run the benchmark before merging performance work (low) @git #performance [bash] priority:10\n";

    #[test]
    fn empty_query_returns_nothing() {
        let bundle = compile(POLICY, None);
        assert!(bundle.retrieve("", 5).is_empty());
        assert!(bundle.retrieve("   the and ", 5).is_empty());
    }

    #[test]
    fn scores_are_strictly_decreasing_and_bounded() {
        let bundle = compile(POLICY, None);
        let results = bundle.retrieve("implement auth token handling", 5);
        assert!(results.len() >= 2);
        assert_eq!(results[0].shard.rule.id, "auth-tokens");
        for pair in results.windows(2) {
            assert!(pair[0].similarity > pair[1].similarity);
        }
        for result in &results {
            assert!(result.similarity > 0.0 && result.similarity <= 1.0);
        }
    }

    #[test]
    fn retrieval_is_deterministic_and_capped() {
        let bundle = compile(POLICY, None);
        let first = bundle.retrieve("auth security review", 1);
        let second = bundle.retrieve("auth security review", 1);
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn task_retrieval_reports_intent_and_policy_text() {
        let bundle = compile(POLICY, None);
        let retrieval = bundle.retrieve_for_task("Implement auth", 5);
        assert_eq!(retrieval.intent, "security");
        assert!(retrieval.policy_text.contains("[auth-tokens]"));
    }

    #[test]
    fn unmatched_task_falls_back_to_top_priority_rules() {
        let bundle = compile(POLICY, None);
        let retrieval = bundle.retrieve_for_task("xyzzy plugh", 2);
        assert!(retrieval.shards.is_empty());
        assert!(retrieval.policy_text.contains("[auth-tokens]"));
        assert!(retrieval.policy_text.contains("[auth-review]"));
        assert!(!retrieval.policy_text.contains("[bench]"));
    }

    #[test]
    fn empty_bundle_has_no_policy_text() {
        let bundle = compile("# nothing here\n", None);
        assert!(bundle.retrieve_for_task("Implement auth", 5).policy_text.is_empty());
    }
}
