#![forbid(unsafe_code)]

//! Per-agent trust ledger.
//!
//! The append-only record list is the source of truth. Scores are an
//! accumulator replayed from the records: every agent starts at
//! [`INITIAL_SCORE`] and each outcome adds its delta, clamped to `[0, 1]`.

use std::collections::BTreeMap;

use guidance_domain::{now_rfc3339, Outcome, TrustRecord, TrustSnapshot, TrustTier};
use tracing::debug;

pub const INITIAL_SCORE: f64 = 0.5;
pub const ALLOW_DELTA: f64 = 0.02;
pub const WARN_DELTA: f64 = -0.05;
pub const DENY_DELTA: f64 = -0.15;

pub const TRUSTED_THRESHOLD: f64 = 0.8;
pub const NORMAL_THRESHOLD: f64 = 0.5;
pub const SUSPECT_THRESHOLD: f64 = 0.2;

// Absorbs accumulated float error at the tier boundaries.
const THRESHOLD_EPSILON: f64 = 1e-9;

#[must_use]
pub fn outcome_delta(outcome: Outcome) -> f64 {
    match outcome {
        Outcome::Allow => ALLOW_DELTA,
        Outcome::Warn => WARN_DELTA,
        Outcome::Deny => DENY_DELTA,
    }
}

#[must_use]
pub fn tier_for(score: f64) -> TrustTier {
    let score = score + THRESHOLD_EPSILON;
    if score >= TRUSTED_THRESHOLD {
        TrustTier::Trusted
    } else if score >= NORMAL_THRESHOLD {
        TrustTier::Normal
    } else if score >= SUSPECT_THRESHOLD {
        TrustTier::Suspect
    } else {
        TrustTier::Quarantined
    }
}

/// Rate-limit multiplier as an exact fraction `(numerator, denominator)`.
#[must_use]
pub fn rate_multiplier(tier: TrustTier) -> (u64, u64) {
    match tier {
        TrustTier::Trusted => (2, 1),
        TrustTier::Normal => (1, 1),
        TrustTier::Suspect => (1, 2),
        TrustTier::Quarantined => (1, 10),
    }
}

/// `base_limit` scaled by the tier multiplier, rounded down.
#[must_use]
pub fn scaled_rate_limit(tier: TrustTier, base_limit: u64) -> u64 {
    let (numerator, denominator) = rate_multiplier(tier);
    base_limit.saturating_mul(numerator) / denominator
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrustLedger {
    records: Vec<TrustRecord>,
    scores: BTreeMap<String, f64>,
}

impl TrustLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from persisted records.
    #[must_use]
    pub fn from_records(records: Vec<TrustRecord>) -> Self {
        let mut ledger = Self::new();
        ledger.import_records(records);
        ledger
    }

    /// Append an outcome for `agent_id` and return the updated snapshot.
    pub fn record_outcome(
        &mut self,
        agent_id: &str,
        outcome: Outcome,
        reason: &str,
    ) -> TrustSnapshot {
        let record = TrustRecord {
            agent_id: agent_id.to_string(),
            outcome,
            reason: reason.to_string(),
            timestamp: now_rfc3339(),
        };
        self.apply(&record);
        self.records.push(record);
        let snapshot = self.snapshot(agent_id);
        debug!(
            agent = agent_id,
            outcome = outcome.as_str(),
            score = snapshot.score,
            tier = snapshot.tier.as_str(),
            "trust outcome recorded"
        );
        snapshot
    }

    /// Snapshot for `agent_id`; unknown agents sit at the initial score.
    #[must_use]
    pub fn snapshot(&self, agent_id: &str) -> TrustSnapshot {
        let score = self.scores.get(agent_id).copied().unwrap_or(INITIAL_SCORE);
        TrustSnapshot {
            agent_id: agent_id.to_string(),
            score,
            tier: tier_for(score),
        }
    }

    /// Snapshots for every agent with at least one record, ordered by agent id.
    #[must_use]
    pub fn all_snapshots(&self) -> Vec<TrustSnapshot> {
        self.scores
            .keys()
            .map(|agent_id| self.snapshot(agent_id))
            .collect()
    }

    #[must_use]
    pub fn rate_limit(&self, agent_id: &str, base_limit: u64) -> u64 {
        scaled_rate_limit(self.snapshot(agent_id).tier, base_limit)
    }

    /// Append records (for example from another ledger) and replay them.
    pub fn import_records(&mut self, records: Vec<TrustRecord>) {
        for record in records {
            self.apply(&record);
            self.records.push(record);
        }
    }

    #[must_use]
    pub fn export_records(&self) -> Vec<TrustRecord> {
        self.records.clone()
    }

    #[must_use]
    pub fn records(&self) -> &[TrustRecord] {
        &self.records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn apply(&mut self, record: &TrustRecord) {
        let score = self
            .scores
            .entry(record.agent_id.clone())
            .or_insert(INITIAL_SCORE);
        *score = (*score + outcome_delta(record.outcome)).clamp(0.0, 1.0);
    }
}
