//! Optional capabilities selected by `components.json`.
//!
//! Each capability is a trait with a live implementation backed by the store
//! and a no-op used when the component is disabled, so the dispatcher runs the
//! same code path for minimal and full installs.

use std::fmt::{Debug, Formatter};

use guidance_domain::{
    now_rfc3339, ComponentSelection, GuidanceError, MemoryOp, Outcome, ProofEnvelope,
    RunEvent, ToolCallRecord, TrustRecord, TrustSnapshot,
};
use guidance_gates::{InjectionSignals, NoThreatSignals, ThreatSignalSource};
use guidance_proof::{verify_envelopes, AppendMetadata, ProofChain, SigningKey};
use guidance_store::{CommitOutcome, GuidanceStore};
use guidance_trust::{scaled_rate_limit, TrustLedger};
use serde::Serialize;
use tracing::{debug, warn};

/// Proof appends retry this many times when another writer moves the tip.
pub const MAX_APPEND_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustView {
    pub snapshot: TrustSnapshot,
    pub rate_limit: u64,
}

pub trait TrustSink: Send + Sync {
    /// Append an outcome and return the agent's refreshed standing, or `None`
    /// when trust tracking is off.
    #[allow(clippy::missing_errors_doc)]
    fn record(
        &self,
        agent_id: &str,
        outcome: Outcome,
        reason: &str,
    ) -> anyhow::Result<Option<TrustView>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoTrust;

impl TrustSink for NoTrust {
    fn record(&self, _: &str, _: Outcome, _: &str) -> anyhow::Result<Option<TrustView>> {
        Ok(None)
    }
}

/// Trust backed by the persisted record list; scores are replayed per call.
#[derive(Debug, Clone)]
pub struct LedgerTrust<S> {
    store: S,
    base_rate_limit: u64,
}

impl<S> LedgerTrust<S> {
    #[must_use]
    pub fn new(store: S, base_rate_limit: u64) -> Self {
        Self {
            store,
            base_rate_limit,
        }
    }
}

impl<S: GuidanceStore + Send + Sync> TrustSink for LedgerTrust<S> {
    fn record(
        &self,
        agent_id: &str,
        outcome: Outcome,
        reason: &str,
    ) -> anyhow::Result<Option<TrustView>> {
        let record = TrustRecord {
            agent_id: agent_id.to_string(),
            outcome,
            reason: reason.to_string(),
            timestamp: now_rfc3339(),
        };
        let records = self
            .store
            .append_trust_records(std::slice::from_ref(&record))?;
        let snapshot = TrustLedger::from_records(records).snapshot(agent_id);
        debug!(
            agent = agent_id,
            outcome = outcome.as_str(),
            score = snapshot.score,
            tier = snapshot.tier.as_str(),
            "trust record persisted"
        );
        Ok(Some(TrustView {
            rate_limit: scaled_rate_limit(snapshot.tier, self.base_rate_limit),
            snapshot,
        }))
    }
}

/// One proof append request.
#[derive(Debug, Clone)]
pub struct ProofEntry {
    pub run_event: RunEvent,
    pub tool_call_records: Vec<ToolCallRecord>,
    pub memory_ops: Vec<MemoryOp>,
    pub metadata: AppendMetadata,
}

pub trait ProofSink: Send + Sync {
    /// Append and persist an envelope, or `None` when proofs are off.
    ///
    /// Errors are [`GuidanceError::Integrity`] when the persisted chain no
    /// longer verifies and [`GuidanceError::WriteConflict`] when every retry
    /// lost a race with a concurrent writer.
    #[allow(clippy::missing_errors_doc)]
    fn append(&self, entry: ProofEntry) -> Result<Option<ProofEnvelope>, GuidanceError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProof;

impl ProofSink for NoProof {
    fn append(&self, _: ProofEntry) -> Result<Option<ProofEnvelope>, GuidanceError> {
        Ok(None)
    }
}

/// Proof chain persisted through compare-on-tip commits.
#[derive(Debug, Clone)]
pub struct ChainProof<S> {
    store: S,
    key: SigningKey,
    max_attempts: usize,
}

impl<S> ChainProof<S> {
    #[must_use]
    pub fn new(store: S, key: SigningKey) -> Self {
        Self {
            store,
            key,
            max_attempts: MAX_APPEND_ATTEMPTS,
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }
}

impl<S: GuidanceStore + Send + Sync> ProofSink for ChainProof<S> {
    fn append(&self, entry: ProofEntry) -> Result<Option<ProofEnvelope>, GuidanceError> {
        for attempt in 1..=self.max_attempts {
            let stored = self.store.load_proof_chain().map_err(store_error)?;
            let expected_tip = stored.tip().map(str::to_string);
            let mut chain = ProofChain::restore(self.key.clone(), stored)?;
            let envelope = chain.append(
                entry.run_event.clone(),
                entry.tool_call_records.clone(),
                entry.memory_ops.clone(),
                &entry.metadata,
            )?;
            match self
                .store
                .commit_proof_chain(expected_tip.as_deref(), &chain.export())
                .map_err(store_error)?
            {
                CommitOutcome::Committed => {
                    debug!(
                        attempt,
                        envelope_id = %envelope.envelope_id,
                        length = chain.chain_length(),
                        "proof chain committed"
                    );
                    return Ok(Some(envelope));
                }
                CommitOutcome::Conflict { observed_tip } => {
                    debug!(attempt, ?observed_tip, "proof chain moved; retrying append");
                }
            }
        }
        warn!(attempts = self.max_attempts, "proof append retries exhausted");
        Err(GuidanceError::WriteConflict(format!(
            "proof chain changed under {} consecutive append attempts",
            self.max_attempts
        )))
    }
}

fn store_error(err: anyhow::Error) -> GuidanceError {
    GuidanceError::Io(std::io::Error::other(format!("{err:#}")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConformanceReport {
    pub chain_length: usize,
    pub chain_tip: Option<String>,
    pub verified: bool,
    pub detail: Option<String>,
}

pub trait ConformanceCheck: Send + Sync {
    /// Audit the persisted proof chain, or `None` when conformance is off.
    #[allow(clippy::missing_errors_doc)]
    fn check(&self) -> anyhow::Result<Option<ConformanceReport>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoConformance;

impl ConformanceCheck for NoConformance {
    fn check(&self) -> anyhow::Result<Option<ConformanceReport>> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub struct ChainConformance<S> {
    store: S,
    key: SigningKey,
}

impl<S> ChainConformance<S> {
    #[must_use]
    pub fn new(store: S, key: SigningKey) -> Self {
        Self { store, key }
    }
}

impl<S: GuidanceStore + Send + Sync> ConformanceCheck for ChainConformance<S> {
    fn check(&self) -> anyhow::Result<Option<ConformanceReport>> {
        let stored = self.store.load_proof_chain()?;
        let detail = verify_envelopes(&stored.envelopes, &self.key)
            .err()
            .map(|err| err.to_string());
        Ok(Some(ConformanceReport {
            chain_length: stored.envelopes.len(),
            chain_tip: stored.tip().map(str::to_string),
            verified: detail.is_none(),
            detail,
        }))
    }
}

/// The capability set a dispatcher runs with.
pub struct Capabilities {
    selection: ComponentSelection,
    pub trust: Box<dyn TrustSink>,
    pub proof: Box<dyn ProofSink>,
    pub threats: Box<dyn ThreatSignalSource + Send + Sync>,
    pub conformance: Box<dyn ConformanceCheck>,
}

impl Debug for Capabilities {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("selection", &self.selection)
            .finish_non_exhaustive()
    }
}

impl Capabilities {
    /// Wire live implementations for enabled components and no-ops for the rest.
    #[must_use]
    pub fn from_selection<S>(
        selection: ComponentSelection,
        store: &S,
        key: &SigningKey,
        base_rate_limit: u64,
    ) -> Self
    where
        S: GuidanceStore + Clone + Send + Sync + 'static,
    {
        let trust: Box<dyn TrustSink> = if selection.trust {
            Box::new(LedgerTrust::new(store.clone(), base_rate_limit))
        } else {
            Box::new(NoTrust)
        };
        let proof: Box<dyn ProofSink> = if selection.proof {
            Box::new(ChainProof::new(store.clone(), key.clone()))
        } else {
            Box::new(NoProof)
        };
        let threats: Box<dyn ThreatSignalSource + Send + Sync> = if selection.adversarial {
            Box::new(InjectionSignals::default())
        } else {
            Box::new(NoThreatSignals)
        };
        let conformance: Box<dyn ConformanceCheck> = if selection.conformance {
            Box::new(ChainConformance::new(store.clone(), key.clone()))
        } else {
            Box::new(NoConformance)
        };
        Self {
            selection,
            trust,
            proof,
            threats,
            conformance,
        }
    }

    /// Every capability replaced by its no-op.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            selection: ComponentSelection {
                trust: false,
                proof: false,
                adversarial: false,
                conformance: false,
                evolution: false,
            },
            trust: Box::new(NoTrust),
            proof: Box::new(NoProof),
            threats: Box::new(NoThreatSignals),
            conformance: Box::new(NoConformance),
        }
    }

    /// Swap the trust capability, keeping the rest of the wiring.
    #[must_use]
    pub fn with_trust(mut self, trust: Box<dyn TrustSink>) -> Self {
        self.trust = trust;
        self
    }

    #[must_use]
    pub fn selection(&self) -> ComponentSelection {
        self.selection
    }
}
