#![forbid(unsafe_code)]

//! Hook dispatcher: the single `dispatch(kind, payload) -> HookResult` surface.
//!
//! One dispatch runs, in order: the destructive-command shortcut, policy
//! loading (cached until a session boundary or [`Dispatcher::reload`]),
//! retrieval for `preTask`, the gate, the trust record and the proof append.
//! The pipeline runs on a worker thread so the caller can enforce the
//! configured deadline. Once the deadline passes the worker is cancelled and
//! performs no further state writes, so a synthesised result is never
//! contradicted by a trust record or proof envelope landing later. Errors
//! never escape; they become [`HookResult`] fields.

pub mod bridge;
pub mod components;
pub mod config;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use guidance_bundle::{load_policy, Bundle, DEFAULT_MAX_SHARDS};
use guidance_domain::{
    hash_canonical, short_hash, EventKind, EventPayload, GuidanceError, HookEvent, HookResult,
    MemoryOp, Outcome, PendingRun, ProofEnvelope, RunEvent, ToolCallRecord, ViolationRecord,
};
use guidance_gates::{DestructiveShortcut, GateEngine, Violation};
use guidance_proof::AppendMetadata;
use guidance_store::GuidanceStore;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

pub use bridge::{
    error_reply, format_reply, host_events, ignored_reply, normalize_payload, translate,
    BridgedEvent, Host,
};
pub use components::{
    Capabilities, ChainConformance, ChainProof, ConformanceCheck, ConformanceReport, LedgerTrust,
    NoConformance, NoProof, NoTrust, ProofEntry, ProofSink, TrustSink, TrustView,
    MAX_APPEND_ATTEMPTS,
};
pub use config::{FailMode, RuntimeConfig, RuntimePaths, RuntimeSettings, MISSING_KEY_WARNING};

/// Everything one dispatch produced, including what the host reply summarises.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub event: HookEvent,
    pub result: HookResult,
    pub violations: Vec<ViolationRecord>,
    pub trust: Option<TrustView>,
    pub envelope: Option<ProofEnvelope>,
    pub policy_text: Option<String>,
    pub intent: Option<String>,
    pub elapsed: Duration,
}

impl DispatchReport {
    fn bare(event: HookEvent, result: HookResult, violations: Vec<ViolationRecord>) -> Self {
        Self {
            event,
            result,
            violations,
            trust: None,
            envelope: None,
            policy_text: None,
            intent: None,
            elapsed: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn blocked(&self) -> bool {
        self.result.aborted
    }

    /// `1` when the host must not proceed, `0` otherwise (warnings included).
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(self.result.aborted)
    }

    /// Stdout summary for the native host.
    #[must_use]
    pub fn summary(&self) -> Value {
        let trust = self.trust.as_ref().map(|view| {
            json!({
                "score": view.snapshot.score,
                "tier": view.snapshot.tier.as_str(),
                "rateLimit": view.rate_limit,
            })
        });
        let envelope = self.envelope.as_ref().map(|envelope| {
            json!({
                "envelopeId": envelope.envelope_id,
                "contentHash": envelope.content_hash,
                "sequence": envelope.sequence,
            })
        });
        let mut summary = json!({
            "event": self.event.kind.as_str(),
            "eventId": self.event.event_id,
            "success": self.result.success,
            "blocked": self.result.aborted,
            "skipped": self.result.skipped,
            "messages": self.result.messages,
            "warnings": self.result.warnings,
            "trust": trust,
            "proofEnvelope": envelope,
            "taskId": self.event.task_id,
            "intent": self.intent,
            "violations": self.violations,
            "hooksExecuted": self.result.hooks_executed,
            "hooksFailed": self.result.hooks_failed,
            "durationMs": u64::try_from(self.elapsed.as_millis()).unwrap_or(u64::MAX),
        });
        if let Some(policy_text) = &self.policy_text {
            summary["policyText"] = json!(policy_text);
        }
        summary
    }
}

#[derive(Debug)]
struct CompiledPolicy {
    bundle: Bundle,
    gate: GateEngine,
}

struct Pipeline<S> {
    config: RuntimeConfig,
    store: S,
    capabilities: Capabilities,
    shortcut: DestructiveShortcut,
    cache: Mutex<Option<Arc<CompiledPolicy>>>,
}

pub struct Dispatcher<S> {
    inner: Arc<Pipeline<S>>,
}

impl<S> Dispatcher<S>
where
    S: GuidanceStore + Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(config: RuntimeConfig, store: S, capabilities: Capabilities) -> Self {
        Self {
            inner: Arc::new(Pipeline {
                config,
                store,
                capabilities,
                shortcut: DestructiveShortcut::default(),
                cache: Mutex::new(None),
            }),
        }
    }

    /// Wire capabilities from the stored component selection (standard preset
    /// when `components.json` is absent).
    ///
    /// # Errors
    /// Returns an error when `components.json` exists but cannot be read.
    pub fn open(config: RuntimeConfig, store: S) -> anyhow::Result<Self> {
        let selection = store.load_components()?.unwrap_or_default();
        let capabilities = Capabilities::from_selection(
            selection,
            &store,
            &config.signing_key,
            config.base_rate_limit,
        );
        debug!(?selection, "dispatcher capabilities wired");
        Ok(Self::new(config, store, capabilities))
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Drop the cached bundle; the next dispatch recompiles the policy files.
    pub fn reload(&self) {
        self.inner.invalidate();
    }

    pub fn dispatch(&self, kind: EventKind, payload: EventPayload) -> HookResult {
        self.dispatch_report(kind, payload).result
    }

    pub fn dispatch_report(&self, kind: EventKind, payload: EventPayload) -> DispatchReport {
        let started = Instant::now();
        let event = HookEvent::new(kind, payload);
        let shortcut = self.inner.shortcut.check(kind, &event.payload);
        if let Some(violation) = &shortcut {
            warn!(rule = %violation.rule_id, "destructive command blocked before gate evaluation");
        }

        if !self.inner.config.wiring_enabled {
            let mut result = HookResult {
                skipped: true,
                messages: vec!["event wiring disabled".to_string()],
                ..HookResult::default()
            };
            let violations = shortcut_records(&mut result, shortcut.as_ref());
            let mut report = DispatchReport::bare(event, result, violations);
            report.elapsed = started.elapsed();
            return report;
        }

        let (sender, receiver) = mpsc::channel();
        let pipeline = Arc::clone(&self.inner);
        let worker_event = event.clone();
        let worker_shortcut = shortcut.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let worker_cancelled = Arc::clone(&cancelled);
        let spawned = thread::Builder::new()
            .name("guidance-dispatch".to_string())
            .spawn(move || {
                let report = pipeline.run(
                    worker_event,
                    worker_shortcut.as_ref(),
                    started,
                    &worker_cancelled,
                );
                // The caller may have given up on the deadline already.
                let _ = sender.send(report);
            });

        let deadline = self.inner.config.timeout;
        let received = match spawned {
            Ok(_) => receiver
                .recv_timeout(deadline.saturating_sub(started.elapsed()))
                .map_err(|err| match err {
                    mpsc::RecvTimeoutError::Timeout => GuidanceError::Timeout(format!(
                        "dispatch exceeded {} ms",
                        deadline.as_millis()
                    )),
                    mpsc::RecvTimeoutError::Disconnected => GuidanceError::Gate(
                        "dispatch pipeline stopped before producing a result".to_string(),
                    ),
                }),
            Err(err) => Err(GuidanceError::Gate(format!(
                "failed to start dispatch worker: {err}"
            ))),
        };
        match received {
            Ok(report) => report,
            Err(err) => {
                cancelled.store(true, Ordering::SeqCst);
                self.synthesized(event, shortcut.as_ref(), &err, started)
            }
        }
    }

    fn synthesized(
        &self,
        event: HookEvent,
        shortcut: Option<&Violation>,
        err: &GuidanceError,
        started: Instant,
    ) -> DispatchReport {
        let mode = self.inner.config.fail_mode;
        warn!(
            event = event.kind.as_str(),
            error = %err,
            mode = mode.as_str(),
            "dispatch did not complete; synthesising result"
        );
        let note = format!("{}: {err}", err.kind());
        let mut result = if mode.is_closed() {
            HookResult::aborted_with(format!("{note}; blocking ({})", mode.as_str()))
        } else {
            HookResult {
                skipped: true,
                messages: vec![format!("{note}; continuing ({})", mode.as_str())],
                ..HookResult::default()
            }
        };
        result.hooks_failed = 1;
        let violations = shortcut_records(&mut result, shortcut);
        let mut report = DispatchReport::bare(event, result, violations);
        report.elapsed = started.elapsed();
        report
    }
}

fn block_with_shortcut(result: &mut HookResult, violation: &Violation) {
    result.success = false;
    result.aborted = true;
    result.messages.push(violation.message.clone());
}

fn shortcut_records(result: &mut HookResult, shortcut: Option<&Violation>) -> Vec<ViolationRecord> {
    shortcut
        .map(|violation| {
            block_with_shortcut(result, violation);
            result.hooks_executed += 1;
            vec![violation.record()]
        })
        .unwrap_or_default()
}

impl<S: GuidanceStore> Pipeline<S> {
    fn invalidate(&self) {
        if let Ok(mut cached) = self.cache.lock() {
            *cached = None;
        }
    }

    fn policy(&self) -> Result<Arc<CompiledPolicy>, GuidanceError> {
        if let Ok(cached) = self.cache.lock() {
            if let Some(policy) = cached.as_ref() {
                return Ok(Arc::clone(policy));
            }
        }
        let paths = &self.config.paths;
        let bundle = load_policy(&paths.root_policy, &paths.local_policy)?.compile();
        let gate = GateEngine::from_bundle(&bundle, self.config.gate.clone());
        let compiled = Arc::new(CompiledPolicy { bundle, gate });
        if let Ok(mut cached) = self.cache.lock() {
            *cached = Some(Arc::clone(&compiled));
        }
        Ok(compiled)
    }

    #[allow(clippy::too_many_lines)]
    fn run(
        &self,
        event: HookEvent,
        shortcut: Option<&Violation>,
        started: Instant,
        cancelled: &AtomicBool,
    ) -> DispatchReport {
        let kind = event.kind;
        let mut result = HookResult::default();
        let mut violations = shortcut_records(&mut result, shortcut);

        if kind.is_session_boundary() {
            self.invalidate();
        }
        let policy = match self.policy() {
            Ok(policy) => policy,
            Err(err) => {
                warn!(error = %err, "guidance policy unavailable");
                result.success = false;
                result.aborted = true;
                result.hooks_failed += 1;
                result.messages.push(format!("{}: {err}", err.kind()));
                let mut report = DispatchReport::bare(event, result, violations);
                report.elapsed = started.elapsed();
                return report;
            }
        };
        result.set_metadata("policyHash", json!(policy.bundle.hash()));

        let mut payload = event.payload.clone();
        let mut memory_ops = Vec::new();
        let mut policy_text = None;
        let mut intent = None;
        let mut restored = false;
        match kind {
            EventKind::PreTask => {
                let description = payload.tool_input.description.clone().unwrap_or_default();
                let retrieval = policy
                    .bundle
                    .retrieve_for_task(&description, DEFAULT_MAX_SHARDS);
                result.hooks_executed += 1;
                let shard_ids: Vec<&str> = retrieval
                    .shards
                    .iter()
                    .map(|retrieved| retrieved.shard.rule.id.as_str())
                    .collect();
                result.set_metadata("policyText", json!(retrieval.policy_text));
                result.set_metadata("shards", json!(shard_ids));
                intent = Some(retrieval.intent.clone());
                policy_text = Some(retrieval.policy_text);
                if let Some(task_id) = &event.task_id {
                    if !past_deadline(cancelled, "pending run") {
                        self.remember_task(
                            task_id,
                            &description,
                            &event,
                            &mut result,
                            &mut memory_ops,
                        );
                    }
                }
            }
            EventKind::PostTask => {
                if let Some(task_id) = &event.task_id {
                    restored =
                        self.restore_task(task_id, &mut payload, &mut result, &mut memory_ops);
                }
            }
            _ => {}
        }

        let signals = self.capabilities.threats.signals(kind, &payload);
        let decision = policy.gate.evaluate(kind, &payload, &signals);
        result.hooks_executed += 1;
        decision.apply_to(kind, &mut result);
        violations.extend(decision.records());
        let intent = intent.unwrap_or_else(|| decision.tags.intent.clone());
        result.set_metadata("intent", json!(intent));

        let outcome = result.outcome();
        if past_deadline(cancelled, "trust record") {
            return abandoned(event, result, violations, started);
        }
        let trust = self.record_trust(&event, outcome, &violations, &mut result);

        let run_event = RunEvent {
            event_id: event.event_id.clone(),
            kind,
            task_id: event.task_id.clone(),
            task_description: payload.tool_input.description.clone(),
            session_id: event.session_id.clone(),
            agent_id: event.agent_id.clone(),
            outcome,
            intent: Some(intent.clone()),
            policy_hash: Some(policy.bundle.hash().to_string()),
            violations: violations.clone(),
            timestamp: event.timestamp.clone(),
        };
        let entry = ProofEntry {
            run_event,
            tool_call_records: tool_calls(kind, &payload, outcome),
            memory_ops,
            metadata: AppendMetadata {
                agent_id: event.agent_id.clone(),
                session_id: event.session_id.clone(),
            },
        };
        if past_deadline(cancelled, "proof append") {
            return abandoned(event, result, violations, started);
        }
        let envelope = match self.capabilities.proof.append(entry) {
            Ok(envelope) => {
                if let Some(envelope) = &envelope {
                    result.hooks_executed += 1;
                    result.set_metadata("envelopeId", json!(envelope.envelope_id));
                }
                if restored {
                    if let Some(task_id) = &event.task_id {
                        self.release_task(task_id, &mut result);
                    }
                }
                envelope
            }
            Err(err) => {
                result.hooks_failed += 1;
                self.proof_failure(&mut result, &err);
                None
            }
        };

        if kind == EventKind::SessionEnd {
            self.audit_chain(&mut result);
        }
        if self.config.uses_dev_key() && self.capabilities.selection().proof {
            result.warnings.push(MISSING_KEY_WARNING.to_string());
        }

        let elapsed = started.elapsed();
        info!(
            event = kind.as_str(),
            outcome = outcome.as_str(),
            aborted = result.aborted,
            violations = violations.len(),
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "dispatch complete"
        );
        DispatchReport {
            event,
            result,
            violations,
            trust,
            envelope,
            policy_text,
            intent: Some(intent),
            elapsed,
        }
    }

    fn remember_task(
        &self,
        task_id: &str,
        description: &str,
        event: &HookEvent,
        result: &mut HookResult,
        memory_ops: &mut Vec<MemoryOp>,
    ) {
        let run = PendingRun {
            task_id: task_id.to_string(),
            description: description.to_string(),
            started_at: event.timestamp.clone(),
        };
        match self.store.put_pending_run(&run) {
            Ok(()) => memory_ops.push(MemoryOp {
                op: "put".to_string(),
                key: format!("pending-runs/{task_id}"),
                value_hash: Some(short_hash(description)),
            }),
            Err(err) => {
                result.hooks_failed += 1;
                result
                    .warnings
                    .push(format!("pending run for task {task_id} not recorded: {err:#}"));
            }
        }
    }

    /// Copy the pending run into the payload. The run stays stored until the
    /// proof append succeeds, so a failed `postTask` can be retried.
    fn restore_task(
        &self,
        task_id: &str,
        payload: &mut EventPayload,
        result: &mut HookResult,
        memory_ops: &mut Vec<MemoryOp>,
    ) -> bool {
        let pending = self
            .store
            .load_pending_runs()
            .map(|mut runs| runs.remove(task_id));
        match pending {
            Ok(Some(run)) => {
                debug!(task_id, "pending run restored");
                memory_ops.push(MemoryOp {
                    op: "take".to_string(),
                    key: format!("pending-runs/{task_id}"),
                    value_hash: Some(short_hash(&run.description)),
                });
                result.set_metadata("taskDescription", json!(run.description));
                payload.tool_input.description = Some(run.description);
                true
            }
            Ok(None) => {
                debug!(task_id, "no pending run for task");
                false
            }
            Err(err) => {
                result.hooks_failed += 1;
                result
                    .warnings
                    .push(format!("pending run for task {task_id} not restored: {err:#}"));
                false
            }
        }
    }

    fn release_task(&self, task_id: &str, result: &mut HookResult) {
        if let Err(err) = self.store.take_pending_run(task_id) {
            result.hooks_failed += 1;
            result
                .warnings
                .push(format!("pending run for task {task_id} not cleared: {err:#}"));
        }
    }

    fn record_trust(
        &self,
        event: &HookEvent,
        outcome: Outcome,
        violations: &[ViolationRecord],
        result: &mut HookResult,
    ) -> Option<TrustView> {
        let reason = violations.first().map_or_else(
            || format!("{} {}", event.kind.as_str(), outcome.as_str()),
            |violation| violation.rule_id.clone(),
        );
        match self
            .capabilities
            .trust
            .record(&event.agent_id, outcome, &reason)
        {
            Ok(Some(view)) => {
                result.hooks_executed += 1;
                result.set_metadata(
                    "trust",
                    json!({
                        "score": view.snapshot.score,
                        "tier": view.snapshot.tier.as_str(),
                        "rateLimit": view.rate_limit,
                    }),
                );
                Some(view)
            }
            Ok(None) => None,
            Err(err) => {
                result.hooks_failed += 1;
                result
                    .warnings
                    .push(format!("trust ledger not updated: {err:#}"));
                None
            }
        }
    }

    fn proof_failure(&self, result: &mut HookResult, err: &GuidanceError) {
        let mode = self.config.fail_mode;
        warn!(error = %err, mode = mode.as_str(), "proof append failed");
        let note = format!("{}: {err}", err.kind());
        if matches!(err, GuidanceError::WriteConflict(_)) {
            result.success = false;
        }
        if mode.is_closed() {
            result.success = false;
            result.aborted = true;
            result.messages.push(note);
        } else {
            result.warnings.push(note);
        }
    }

    fn audit_chain(&self, result: &mut HookResult) {
        match self.capabilities.conformance.check() {
            Ok(Some(report)) => {
                if !report.verified {
                    result.warnings.push(format!(
                        "proof chain failed verification: {}",
                        report.detail.as_deref().unwrap_or("unknown cause")
                    ));
                }
                result.set_metadata("conformance", json!(report));
            }
            Ok(None) => {}
            Err(err) => result
                .warnings
                .push(format!("conformance check failed: {err:#}")),
        }
    }
}

fn past_deadline(cancelled: &AtomicBool, step: &str) -> bool {
    let passed = cancelled.load(Ordering::SeqCst);
    if passed {
        debug!(step, "dispatch deadline passed; skipping state write");
    }
    passed
}

/// The caller has already synthesised a result; this report is discarded.
fn abandoned(
    event: HookEvent,
    result: HookResult,
    violations: Vec<ViolationRecord>,
    started: Instant,
) -> DispatchReport {
    let mut report = DispatchReport::bare(event, result, violations);
    report.elapsed = started.elapsed();
    report
}

fn tool_calls(kind: EventKind, payload: &EventPayload, outcome: Outcome) -> Vec<ToolCallRecord> {
    match kind {
        EventKind::PreCommand | EventKind::PreEdit | EventKind::PostEdit | EventKind::PreToolUse => {
            let input = serde_json::to_value(&payload.tool_input).unwrap_or(Value::Null);
            vec![ToolCallRecord {
                tool: payload
                    .tool_input
                    .tool_name
                    .clone()
                    .unwrap_or_else(|| kind.tool_class().to_string()),
                input_hash: hash_canonical(&input),
                outcome,
            }]
        }
        _ => Vec::new(),
    }
}
