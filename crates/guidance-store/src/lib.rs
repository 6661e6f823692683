#![forbid(unsafe_code)]

//! On-disk state under the guidance home directory.
//!
//! Every file is pretty-printed JSON written through a sibling temp file and
//! an atomic rename, so a crash mid-dispatch leaves either the old or the new
//! contents. Read-modify-write updates (trust records, pending runs and the
//! compare-on-tip proof commit) hold an exclusive lock on `state.lock` for
//! the whole load/check/rename, so concurrent hook processes never drop each
//! other's writes. Plain loads do not lock.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use fs2::FileExt;
use guidance_domain::{
    ComponentSelection, PendingRun, PendingRuns, ProofExport, TrustRecord,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;

pub const DEFAULT_STATE_DIR: &str = ".claude-flow/guidance";
pub const TRUST_RECORDS_FILE: &str = "trust-records.json";
pub const PROOF_CHAIN_FILE: &str = "proof-chain.json";
pub const PENDING_RUNS_FILE: &str = "pending-runs.json";
pub const AUTOPILOT_STATE_FILE: &str = "autopilot-state.json";
pub const AUTOPILOT_REPORT_FILE: &str = "autopilot-report.json";
pub const AUTOPILOT_LOG_FILE: &str = "autopilot.log";
pub const AUTOPILOT_LOCK_FILE: &str = "autopilot.lock";
pub const COMPONENTS_FILE: &str = "components.json";
pub const RUNTIME_SETTINGS_FILE: &str = "runtime.json";
pub const STATE_LOCK_FILE: &str = "state.lock";
pub const BACKUPS_DIR: &str = "backups";
pub const PROPOSALS_DIR: &str = "proposals";

/// Result of a compare-on-tip proof chain commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    Conflict { observed_tip: Option<String> },
}

pub trait GuidanceStore {
    #[allow(clippy::missing_errors_doc)]
    fn load_trust_records(&self) -> Result<Vec<TrustRecord>>;

    /// Re-read the record list, append `records`, write it back and return it.
    #[allow(clippy::missing_errors_doc)]
    fn append_trust_records(&self, records: &[TrustRecord]) -> Result<Vec<TrustRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn load_proof_chain(&self) -> Result<ProofExport>;

    /// Persist `chain` only if the stored tip still equals `expected_tip`.
    #[allow(clippy::missing_errors_doc)]
    fn commit_proof_chain(
        &self,
        expected_tip: Option<&str>,
        chain: &ProofExport,
    ) -> Result<CommitOutcome>;

    #[allow(clippy::missing_errors_doc)]
    fn load_pending_runs(&self) -> Result<PendingRuns>;

    #[allow(clippy::missing_errors_doc)]
    fn put_pending_run(&self, run: &PendingRun) -> Result<()>;

    /// Remove and return the pending run for `task_id`.
    #[allow(clippy::missing_errors_doc)]
    fn take_pending_run(&self, task_id: &str) -> Result<Option<PendingRun>>;

    #[allow(clippy::missing_errors_doc)]
    fn load_components(&self) -> Result<Option<ComponentSelection>>;

    #[allow(clippy::missing_errors_doc)]
    fn save_components(&self, selection: &ComponentSelection) -> Result<()>;
}

/// Write `value` as pretty JSON via temp file + rename.
///
/// # Errors
/// Returns an error when the parent directory cannot be created, or when
/// serialization, the write or the rename fails.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut text = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize {}", path.display()))?;
    text.push('\n');
    write_text_atomic(path, &text)
}

/// Write `text` via temp file + rename.
///
/// # Errors
/// Returns an error when the parent directory cannot be created or the write
/// or rename fails.
pub fn write_text_atomic(path: &Path, text: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;
    let mut temp = NamedTempFile::new_in(&parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    temp.write_all(text.as_bytes())
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    temp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temp file for {}", path.display()))?;
    temp.persist(path)
        .map_err(|err| anyhow!("failed to rename temp file into {}: {}", path.display(), err.error))?;
    Ok(())
}

/// Read JSON from `path`; `None` when the file does not exist.
///
/// # Errors
/// Returns an error when the file exists but cannot be read or parsed.
pub fn read_json_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let value = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(value))
}

/// Append one line to a log file, creating it if needed.
///
/// # Errors
/// Returns an error when the file cannot be opened or written.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))?;
    Ok(())
}

/// Exclusive advisory lock over the state directory, released on drop.
struct StateLock {
    file: File,
}

impl StateLock {
    fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
        let path = dir.join(STATE_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("failed to lock {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Filesystem-backed store rooted at the guidance home directory.
#[derive(Debug, Clone)]
pub struct FsGuidanceStore {
    dir: PathBuf,
}

impl FsGuidanceStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Create the state directory (and its `backups/`, `proposals/`) if missing.
    ///
    /// # Errors
    /// Returns an error when a directory cannot be created.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.dir.clone(),
            self.dir.join(BACKUPS_DIR),
            self.dir.join(PROPOSALS_DIR),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    fn stored_tip(&self) -> Result<Option<String>> {
        Ok(self.load_proof_chain()?.tip().map(str::to_string))
    }

    fn locked<T>(&self, update: impl FnOnce() -> Result<T>) -> Result<T> {
        let _lock = StateLock::acquire(&self.dir)?;
        update()
    }
}

impl GuidanceStore for FsGuidanceStore {
    fn load_trust_records(&self) -> Result<Vec<TrustRecord>> {
        Ok(read_json_optional(&self.path(TRUST_RECORDS_FILE))?.unwrap_or_default())
    }

    fn append_trust_records(&self, records: &[TrustRecord]) -> Result<Vec<TrustRecord>> {
        self.locked(|| {
            let mut all = self.load_trust_records()?;
            all.extend_from_slice(records);
            write_json_atomic(&self.path(TRUST_RECORDS_FILE), &all)?;
            Ok(all)
        })
    }

    fn load_proof_chain(&self) -> Result<ProofExport> {
        Ok(read_json_optional(&self.path(PROOF_CHAIN_FILE))?.unwrap_or_default())
    }

    fn commit_proof_chain(
        &self,
        expected_tip: Option<&str>,
        chain: &ProofExport,
    ) -> Result<CommitOutcome> {
        self.locked(|| {
            let observed = self.stored_tip()?;
            if observed.as_deref() != expected_tip {
                debug!(?observed, ?expected_tip, "proof chain moved before commit");
                return Ok(CommitOutcome::Conflict {
                    observed_tip: observed,
                });
            }
            write_json_atomic(&self.path(PROOF_CHAIN_FILE), chain)?;
            Ok(CommitOutcome::Committed)
        })
    }

    fn load_pending_runs(&self) -> Result<PendingRuns> {
        Ok(read_json_optional(&self.path(PENDING_RUNS_FILE))?.unwrap_or_default())
    }

    fn put_pending_run(&self, run: &PendingRun) -> Result<()> {
        self.locked(|| {
            let mut runs = self.load_pending_runs()?;
            runs.insert(run.task_id.clone(), run.clone());
            write_json_atomic(&self.path(PENDING_RUNS_FILE), &runs)
        })
    }

    fn take_pending_run(&self, task_id: &str) -> Result<Option<PendingRun>> {
        self.locked(|| {
            let mut runs = self.load_pending_runs()?;
            let taken = runs.remove(task_id);
            if taken.is_some() {
                write_json_atomic(&self.path(PENDING_RUNS_FILE), &runs)?;
            }
            Ok(taken)
        })
    }

    fn load_components(&self) -> Result<Option<ComponentSelection>> {
        read_json_optional(&self.path(COMPONENTS_FILE))
    }

    fn save_components(&self, selection: &ComponentSelection) -> Result<()> {
        write_json_atomic(&self.path(COMPONENTS_FILE), selection)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    trust: Vec<TrustRecord>,
    chain: ProofExport,
    pending: BTreeMap<String, PendingRun>,
    components: Option<ComponentSelection>,
    forced_conflicts: usize,
    commits: usize,
}

/// Shared in-process store, used by tests and embedders without a disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` proof commits report a conflict.
    ///
    /// # Errors
    /// Returns an error if the state lock is poisoned.
    pub fn force_conflicts(&self, count: usize) -> Result<()> {
        self.with_state(|state| {
            state.forced_conflicts = count;
            Ok(())
        })
    }

    /// Number of proof commits that succeeded.
    ///
    /// # Errors
    /// Returns an error if the state lock is poisoned.
    pub fn commit_count(&self) -> Result<usize> {
        self.with_state(|state| Ok(state.commits))
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> Result<T>) -> Result<T> {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        f(&mut guard)
    }
}

impl GuidanceStore for MemoryStore {
    fn load_trust_records(&self) -> Result<Vec<TrustRecord>> {
        self.with_state(|state| Ok(state.trust.clone()))
    }

    fn append_trust_records(&self, records: &[TrustRecord]) -> Result<Vec<TrustRecord>> {
        self.with_state(|state| {
            state.trust.extend_from_slice(records);
            Ok(state.trust.clone())
        })
    }

    fn load_proof_chain(&self) -> Result<ProofExport> {
        self.with_state(|state| Ok(state.chain.clone()))
    }

    fn commit_proof_chain(
        &self,
        expected_tip: Option<&str>,
        chain: &ProofExport,
    ) -> Result<CommitOutcome> {
        self.with_state(|state| {
            if state.forced_conflicts > 0 {
                state.forced_conflicts -= 1;
                return Ok(CommitOutcome::Conflict {
                    observed_tip: state.chain.tip().map(str::to_string),
                });
            }
            if state.chain.tip() != expected_tip {
                return Ok(CommitOutcome::Conflict {
                    observed_tip: state.chain.tip().map(str::to_string),
                });
            }
            state.chain = chain.clone();
            state.commits += 1;
            Ok(CommitOutcome::Committed)
        })
    }

    fn load_pending_runs(&self) -> Result<PendingRuns> {
        self.with_state(|state| Ok(state.pending.clone()))
    }

    fn put_pending_run(&self, run: &PendingRun) -> Result<()> {
        self.with_state(|state| {
            state.pending.insert(run.task_id.clone(), run.clone());
            Ok(())
        })
    }

    fn take_pending_run(&self, task_id: &str) -> Result<Option<PendingRun>> {
        self.with_state(|state| Ok(state.pending.remove(task_id)))
    }

    fn load_components(&self) -> Result<Option<ComponentSelection>> {
        self.with_state(|state| Ok(state.components))
    }

    fn save_components(&self, selection: &ComponentSelection) -> Result<()> {
        self.with_state(|state| {
            state.components = Some(*selection);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guidance_domain::{
        EventKind, Outcome, Preset, ProofEnvelope, RunEvent, GENESIS_HASH,
    };
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err:#}"),
        }
    }

    fn temp_store() -> (tempfile::TempDir, FsGuidanceStore) {
        let dir = must(tempfile::tempdir().map_err(anyhow::Error::from));
        let store = FsGuidanceStore::new(dir.path().join(DEFAULT_STATE_DIR));
        must(store.ensure_layout());
        (dir, store)
    }

    fn envelope(sequence: u64, prev: &str, hash: &str) -> ProofEnvelope {
        ProofEnvelope {
            sequence,
            envelope_id: Ulid::new().to_string(),
            prev_content_hash: prev.to_string(),
            content_hash: hash.to_string(),
            signature: "sig".to_string(),
            agent_id: "agent".to_string(),
            session_id: "session".to_string(),
            run_event: RunEvent {
                event_id: Ulid::new().to_string(),
                kind: EventKind::PreCommand,
                task_id: None,
                task_description: None,
                session_id: "session".to_string(),
                agent_id: "agent".to_string(),
                outcome: Outcome::Allow,
                intent: None,
                policy_hash: None,
                violations: Vec::new(),
                timestamp: "2026-02-07T12:00:00Z".to_string(),
            },
            tool_call_records: Vec::new(),
            memory_ops: Vec::new(),
            timestamp: "2026-02-07T12:00:00Z".to_string(),
        }
    }

    fn record(agent: &str, outcome: Outcome) -> TrustRecord {
        TrustRecord {
            agent_id: agent.to_string(),
            outcome,
            reason: "test".to_string(),
            timestamp: "2026-02-07T12:00:00Z".to_string(),
        }
    }

    #[test]
    fn missing_files_load_as_empty_state() {
        let (_dir, store) = temp_store();
        assert!(must(store.load_trust_records()).is_empty());
        assert!(must(store.load_proof_chain()).envelopes.is_empty());
        assert!(must(store.load_pending_runs()).is_empty());
        assert!(must(store.load_components()).is_none());
    }

    #[test]
    fn trust_records_append_and_persist_pretty_json() {
        let (_dir, store) = temp_store();
        must(store.append_trust_records(&[record("a", Outcome::Allow)]));
        let all = must(store.append_trust_records(&[record("b", Outcome::Deny)]));
        assert_eq!(all.len(), 2);

        let text = must(
            fs::read_to_string(store.path(TRUST_RECORDS_FILE)).map_err(anyhow::Error::from),
        );
        assert!(text.contains("\n  {"));
        assert!(text.contains("\"agentId\": \"b\""));
    }

    #[test]
    fn proof_commit_detects_moved_tip() {
        let (_dir, store) = temp_store();
        let first = ProofExport {
            envelopes: vec![envelope(0, GENESIS_HASH, "h0")],
        };
        assert_eq!(
            must(store.commit_proof_chain(None, &first)),
            CommitOutcome::Committed
        );

        let stale = ProofExport {
            envelopes: vec![envelope(0, GENESIS_HASH, "other")],
        };
        assert_eq!(
            must(store.commit_proof_chain(None, &stale)),
            CommitOutcome::Conflict {
                observed_tip: Some("h0".to_string())
            }
        );

        let mut second = first.clone();
        second.envelopes.push(envelope(1, "h0", "h1"));
        assert_eq!(
            must(store.commit_proof_chain(Some("h0"), &second)),
            CommitOutcome::Committed
        );
        assert_eq!(must(store.load_proof_chain()).tip(), Some("h1"));
    }

    #[test]
    fn pending_runs_put_and_take() {
        let (_dir, store) = temp_store();
        must(store.put_pending_run(&PendingRun {
            task_id: "t1".to_string(),
            description: "Implement auth".to_string(),
            started_at: "2026-02-07T12:00:00Z".to_string(),
        }));
        let taken = must(store.take_pending_run("t1"));
        assert_eq!(
            taken.map(|run| run.description),
            Some("Implement auth".to_string())
        );
        assert!(must(store.take_pending_run("t1")).is_none());
        assert!(must(store.load_pending_runs()).is_empty());
    }

    #[test]
    fn components_round_trip() {
        let (_dir, store) = temp_store();
        let selection = ComponentSelection::preset(Preset::Full);
        must(store.save_components(&selection));
        assert_eq!(must(store.load_components()), Some(selection));
    }

    #[test]
    fn corrupt_state_is_an_error_with_path_context() {
        let (_dir, store) = temp_store();
        must(fs::write(store.path(PROOF_CHAIN_FILE), "{not json").map_err(anyhow::Error::from));
        let err = match store.load_proof_chain() {
            Ok(_) => panic!("corrupt chain should not load"),
            Err(err) => err,
        };
        assert!(format!("{err:#}").contains(PROOF_CHAIN_FILE));
    }

    #[test]
    fn append_line_accumulates() {
        let (_dir, store) = temp_store();
        let path = store.path(AUTOPILOT_LOG_FILE);
        must(append_line(&path, "one"));
        must(append_line(&path, "two"));
        let text = must(fs::read_to_string(&path).map_err(anyhow::Error::from));
        assert_eq!(text, "one\ntwo\n");
    }

    #[test]
    fn concurrent_writers_keep_every_update() {
        let (_dir, store) = temp_store();
        let state_dir = store.dir().to_path_buf();
        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let writer = FsGuidanceStore::new(state_dir.clone());
                std::thread::spawn(move || {
                    for index in 0..25 {
                        must(writer.put_pending_run(&PendingRun {
                            task_id: format!("w{worker}-t{index}"),
                            description: "parallel".to_string(),
                            started_at: "2026-02-07T12:00:00Z".to_string(),
                        }));
                        must(writer.append_trust_records(&[record(
                            &format!("w{worker}"),
                            Outcome::Allow,
                        )]));
                    }
                })
            })
            .collect();
        for worker in workers {
            if worker.join().is_err() {
                panic!("writer thread panicked");
            }
        }

        assert_eq!(must(store.load_pending_runs()).len(), 100);
        assert_eq!(must(store.load_trust_records()).len(), 100);
    }

    #[test]
    fn concurrent_commits_never_report_a_lost_write() {
        let (_dir, store) = temp_store();
        let state_dir = store.dir().to_path_buf();
        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let writer = FsGuidanceStore::new(state_dir.clone());
                std::thread::spawn(move || {
                    let mut committed = 0_usize;
                    for index in 0..25 {
                        let mut chain = must(writer.load_proof_chain());
                        let tip = chain.tip().map(str::to_string);
                        let sequence = chain.envelopes.len() as u64;
                        let prev = tip.clone().unwrap_or_else(|| GENESIS_HASH.to_string());
                        chain
                            .envelopes
                            .push(envelope(sequence, &prev, &format!("w{worker}-h{index}")));
                        if must(writer.commit_proof_chain(tip.as_deref(), &chain))
                            == CommitOutcome::Committed
                        {
                            committed += 1;
                        }
                    }
                    committed
                })
            })
            .collect();
        let mut committed = 0;
        for worker in workers {
            match worker.join() {
                Ok(count) => committed += count,
                Err(_) => panic!("writer thread panicked"),
            }
        }

        let chain = must(store.load_proof_chain());
        assert!(committed > 0);
        assert_eq!(chain.envelopes.len(), committed);
        for (index, pair) in chain.envelopes.windows(2).enumerate() {
            assert_eq!(pair[1].prev_content_hash, pair[0].content_hash, "link {index}");
        }
    }

    #[test]
    fn memory_store_forced_conflicts() {
        let store = MemoryStore::new();
        must(store.force_conflicts(1));
        let chain = ProofExport {
            envelopes: vec![envelope(0, GENESIS_HASH, "h0")],
        };
        assert!(matches!(
            must(store.commit_proof_chain(None, &chain)),
            CommitOutcome::Conflict { .. }
        ));
        assert_eq!(
            must(store.commit_proof_chain(None, &chain)),
            CommitOutcome::Committed
        );
        assert_eq!(must(store.commit_count()), 1);
    }
}
