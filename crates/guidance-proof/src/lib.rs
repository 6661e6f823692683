#![forbid(unsafe_code)]

//! Append-only, HMAC-signed proof chain of run events.
//!
//! `contentHash = SHA-256(prevContentHash || canonical({runEvent, toolCallRecords, memoryOps}))`
//! and `signature = HMAC-SHA256(key, contentHash)`. The first envelope links to
//! [`GENESIS_HASH`].

use std::fmt::{Debug, Formatter};

use guidance_domain::{
    canonical_json, now_rfc3339, short_hash, GuidanceError, MemoryOp, ProofEnvelope, ProofExport,
    RunEvent, ToolCallRecord, GENESIS_HASH,
};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use ulid::Ulid;

type HmacSha256 = Hmac<Sha256>;

/// Named fallback used when no key is configured. Never acceptable in production.
pub const DEV_SIGNING_KEY: &str = "guidance-dev-signing-key-not-for-production";

const MIN_KEY_BYTES: usize = 16;

#[derive(Clone, PartialEq, Eq)]
pub struct SigningKey {
    bytes: Vec<u8>,
    dev: bool,
}

impl Debug for SigningKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("fingerprint", &self.fingerprint())
            .field("dev", &self.dev)
            .finish()
    }
}

impl SigningKey {
    /// Parse a hex-encoded key of at least 16 bytes.
    ///
    /// # Errors
    /// Returns [`GuidanceError::Configuration`] for invalid hex or a short key.
    pub fn from_hex(value: &str) -> Result<Self, GuidanceError> {
        let bytes = hex::decode(value.trim()).map_err(|err| {
            GuidanceError::Configuration(format!("GUIDANCE_PROOF_KEY is not valid hex: {err}"))
        })?;
        if bytes.len() < MIN_KEY_BYTES {
            return Err(GuidanceError::Configuration(format!(
                "GUIDANCE_PROOF_KEY must decode to at least {MIN_KEY_BYTES} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(Self { bytes, dev: false })
    }

    #[must_use]
    pub fn dev() -> Self {
        Self {
            bytes: DEV_SIGNING_KEY.as_bytes().to_vec(),
            dev: true,
        }
    }

    #[must_use]
    pub fn is_dev(&self) -> bool {
        self.dev
    }

    /// Short non-secret identifier for logs and status output.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        short_hash(&hex::encode(Sha256::digest(&self.bytes)))
    }

    fn mac(&self) -> Result<HmacSha256, GuidanceError> {
        HmacSha256::new_from_slice(&self.bytes)
            .map_err(|err| GuidanceError::Configuration(format!("invalid signing key: {err}")))
    }

    /// # Errors
    /// Returns [`GuidanceError::Configuration`] if the key cannot seed an HMAC.
    pub fn sign(&self, content_hash: &str) -> Result<String, GuidanceError> {
        let mut mac = self.mac()?;
        mac.update(content_hash.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Constant-time signature check.
    #[must_use]
    pub fn verify(&self, content_hash: &str, signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(content_hash.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

/// Identity of the dispatch that produced an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendMetadata {
    pub agent_id: String,
    pub session_id: String,
}

/// Hash binding an envelope to its predecessor and payload.
///
/// # Errors
/// Returns [`GuidanceError::Serialization`] if the payload cannot be encoded.
pub fn content_hash(
    prev_content_hash: &str,
    run_event: &RunEvent,
    tool_call_records: &[ToolCallRecord],
    memory_ops: &[MemoryOp],
) -> Result<String, GuidanceError> {
    let body = json!({
        "runEvent": serde_json::to_value(run_event)?,
        "toolCallRecords": serde_json::to_value(tool_call_records)?,
        "memoryOps": serde_json::to_value(memory_ops)?,
    });
    let mut hasher = Sha256::new();
    hasher.update(prev_content_hash.as_bytes());
    hasher.update(canonical_json(&body).as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Check chain linkage, content hashes, signatures and id ordering.
///
/// # Errors
/// Returns [`GuidanceError::Integrity`] naming the first broken envelope.
pub fn verify_envelopes(envelopes: &[ProofEnvelope], key: &SigningKey) -> Result<(), GuidanceError> {
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut last_id: Option<Ulid> = None;

    for (index, envelope) in envelopes.iter().enumerate() {
        let broken = |reason: &str| {
            GuidanceError::Integrity(format!(
                "envelope {index} ({}) {reason}",
                envelope.envelope_id
            ))
        };

        if envelope.sequence != index as u64 {
            return Err(broken("is out of sequence"));
        }
        if envelope.prev_content_hash != expected_prev {
            return Err(broken("does not link to its predecessor"));
        }
        let recomputed = content_hash(
            &envelope.prev_content_hash,
            &envelope.run_event,
            &envelope.tool_call_records,
            &envelope.memory_ops,
        )?;
        if recomputed != envelope.content_hash {
            return Err(broken("has a content hash that does not match its payload"));
        }
        if !key.verify(&envelope.content_hash, &envelope.signature) {
            return Err(broken("has a signature that does not verify"));
        }
        let id = Ulid::from_string(&envelope.envelope_id)
            .map_err(|_| broken("has a malformed envelope id"))?;
        if last_id.is_some_and(|previous| id <= previous) {
            return Err(broken("has a non-monotonic envelope id"));
        }

        last_id = Some(id);
        expected_prev.clone_from(&envelope.content_hash);
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ProofChain {
    key: SigningKey,
    envelopes: Vec<ProofEnvelope>,
}

impl ProofChain {
    #[must_use]
    pub fn new(key: SigningKey) -> Self {
        Self {
            key,
            envelopes: Vec::new(),
        }
    }

    /// Load a previously persisted chain, verifying it against the current key.
    ///
    /// Unlike [`ProofChain::import`], this accepts the development key so a
    /// local install keeps working without configuration.
    ///
    /// # Errors
    /// Returns [`GuidanceError::Integrity`] when the persisted chain does not verify.
    pub fn restore(key: SigningKey, exported: ProofExport) -> Result<Self, GuidanceError> {
        verify_envelopes(&exported.envelopes, &key)?;
        Ok(Self {
            key,
            envelopes: exported.envelopes,
        })
    }

    #[must_use]
    pub fn key(&self) -> &SigningKey {
        &self.key
    }

    /// Append and sign a new envelope.
    ///
    /// # Errors
    /// Returns an error if hashing or signing fails.
    pub fn append(
        &mut self,
        run_event: RunEvent,
        tool_call_records: Vec<ToolCallRecord>,
        memory_ops: Vec<MemoryOp>,
        metadata: &AppendMetadata,
    ) -> Result<ProofEnvelope, GuidanceError> {
        let prev_content_hash = self
            .chain_tip()
            .unwrap_or(GENESIS_HASH)
            .to_string();
        let content_hash = content_hash(
            &prev_content_hash,
            &run_event,
            &tool_call_records,
            &memory_ops,
        )?;
        let signature = self.key.sign(&content_hash)?;

        let envelope = ProofEnvelope {
            sequence: self.envelopes.len() as u64,
            envelope_id: self.next_envelope_id(),
            prev_content_hash,
            content_hash,
            signature,
            agent_id: metadata.agent_id.clone(),
            session_id: metadata.session_id.clone(),
            run_event,
            tool_call_records,
            memory_ops,
            timestamp: now_rfc3339(),
        };
        debug!(
            envelope_id = %envelope.envelope_id,
            sequence = envelope.sequence,
            content_hash = %envelope.content_hash,
            "proof envelope appended"
        );
        self.envelopes.push(envelope.clone());
        Ok(envelope)
    }

    // ULIDs minted in the same millisecond are not ordered, so bump past the tip.
    fn next_envelope_id(&self) -> String {
        let fresh = Ulid::new();
        let last = self
            .envelopes
            .last()
            .and_then(|envelope| Ulid::from_string(&envelope.envelope_id).ok());
        match last {
            Some(previous) if fresh <= previous => previous
                .increment()
                .unwrap_or(fresh)
                .to_string(),
            _ => fresh.to_string(),
        }
    }

    #[must_use]
    pub fn verify_chain(&self) -> bool {
        match verify_envelopes(&self.envelopes, &self.key) {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "proof chain verification failed");
                false
            }
        }
    }

    #[must_use]
    pub fn chain_tip(&self) -> Option<&str> {
        self.envelopes
            .last()
            .map(|envelope| envelope.content_hash.as_str())
    }

    #[must_use]
    pub fn chain_length(&self) -> usize {
        self.envelopes.len()
    }

    #[must_use]
    pub fn envelopes(&self) -> &[ProofEnvelope] {
        &self.envelopes
    }

    #[must_use]
    pub fn export(&self) -> ProofExport {
        ProofExport {
            envelopes: self.envelopes.clone(),
        }
    }

    /// Replace the chain with an exported batch after verifying every envelope.
    ///
    /// The batch is all-or-nothing: on failure the current chain is untouched.
    ///
    /// # Errors
    /// Returns [`GuidanceError::Configuration`] when running on the development
    /// key and [`GuidanceError::Integrity`] when any envelope fails verification.
    pub fn import(&mut self, exported: ProofExport) -> Result<(), GuidanceError> {
        if self.key.is_dev() {
            return Err(GuidanceError::Configuration(
                "refusing to import a proof chain under the development signing key; set GUIDANCE_PROOF_KEY".to_string(),
            ));
        }
        verify_envelopes(&exported.envelopes, &self.key)?;
        self.envelopes = exported.envelopes;
        Ok(())
    }

    /// Re-sign an exported chain produced under `previous` with this chain's key.
    ///
    /// Content hashes are unchanged; only signatures are replaced. The batch must
    /// verify under `previous` first.
    ///
    /// # Errors
    /// Returns [`GuidanceError::Integrity`] when the batch does not verify under
    /// `previous`, or a signing error.
    pub fn reseal(&self, exported: &ProofExport, previous: &SigningKey) -> Result<ProofExport, GuidanceError> {
        verify_envelopes(&exported.envelopes, previous)?;
        let mut envelopes = exported.envelopes.clone();
        for envelope in &mut envelopes {
            envelope.signature = self.key.sign(&envelope.content_hash)?;
        }
        Ok(ProofExport { envelopes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guidance_domain::{EventKind, Outcome};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn prod_key() -> SigningKey {
        must_ok(SigningKey::from_hex("00112233445566778899aabbccddeeff0011223344556677"))
    }

    fn run_event(description: &str) -> RunEvent {
        RunEvent {
            event_id: Ulid::new().to_string(),
            kind: EventKind::PreCommand,
            task_id: Some("t1".to_string()),
            task_description: Some(description.to_string()),
            session_id: "s1".to_string(),
            agent_id: "a1".to_string(),
            outcome: Outcome::Allow,
            intent: None,
            policy_hash: None,
            violations: Vec::new(),
            timestamp: "2026-02-07T12:00:00Z".to_string(),
        }
    }

    fn metadata() -> AppendMetadata {
        AppendMetadata {
            agent_id: "a1".to_string(),
            session_id: "s1".to_string(),
        }
    }

    fn chain_of(length: usize, key: SigningKey) -> ProofChain {
        let mut chain = ProofChain::new(key);
        for index in 0..length {
            must_ok(chain.append(
                run_event(&format!("step {index}")),
                vec![ToolCallRecord {
                    tool: "bash".to_string(),
                    input_hash: short_hash("ls"),
                    outcome: Outcome::Allow,
                }],
                Vec::new(),
                &metadata(),
            ));
        }
        chain
    }

    #[test]
    fn chain_links_and_signs_every_envelope() {
        let chain = chain_of(3, prod_key());
        let envelopes = chain.envelopes();
        assert_eq!(envelopes[0].prev_content_hash, GENESIS_HASH);
        for pair in envelopes.windows(2) {
            assert_eq!(pair[1].prev_content_hash, pair[0].content_hash);
            assert!(pair[1].envelope_id > pair[0].envelope_id);
        }
        assert!(chain.verify_chain());
        assert_eq!(chain.chain_length(), 3);
        assert_eq!(chain.chain_tip(), Some(envelopes[2].content_hash.as_str()));
    }

    #[test]
    fn export_import_round_trip_is_identity() {
        let source = chain_of(3, prod_key());
        let mut target = ProofChain::new(prod_key());
        must_ok(target.import(source.export()));
        assert_eq!(target.export(), source.export());
    }

    #[test]
    fn tampered_content_hash_is_rejected_and_chain_kept() {
        let source = chain_of(3, prod_key());
        let mut target = chain_of(1, prod_key());
        let before = target.export();

        let mut exported = source.export();
        let mut bytes = exported.envelopes[1].content_hash.clone().into_bytes();
        bytes[0] = if bytes[0] == b'a' { b'b' } else { b'a' };
        exported.envelopes[1].content_hash = must_ok(String::from_utf8(bytes));

        match target.import(exported) {
            Err(GuidanceError::Integrity(message)) => assert!(message.contains("envelope 1")),
            other => panic!("expected integrity error, got {other:?}"),
        }
        assert_eq!(target.export(), before);
    }

    #[test]
    fn mutated_payload_is_rejected() {
        let mut exported = chain_of(2, prod_key()).export();
        exported.envelopes[0].run_event.task_description = Some("forged".to_string());
        let mut target = ProofChain::new(prod_key());
        assert!(matches!(
            target.import(exported),
            Err(GuidanceError::Integrity(_))
        ));
        assert_eq!(target.chain_length(), 0);
    }

    #[test]
    fn foreign_key_signatures_are_rejected() {
        let other = must_ok(SigningKey::from_hex("ffeeddccbbaa99887766554433221100"));
        let exported = chain_of(2, other).export();
        let mut target = ProofChain::new(prod_key());
        assert!(matches!(
            target.import(exported),
            Err(GuidanceError::Integrity(_))
        ));
    }

    #[test]
    fn dev_key_import_fails_closed() {
        let exported = chain_of(1, SigningKey::dev()).export();
        let mut target = ProofChain::new(SigningKey::dev());
        match target.import(exported) {
            Err(GuidanceError::Configuration(message)) => {
                assert!(message.contains("GUIDANCE_PROOF_KEY"));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }

    #[test]
    fn restore_accepts_dev_key_but_rejects_tampering() {
        let exported = chain_of(2, SigningKey::dev()).export();
        let restored = must_ok(ProofChain::restore(SigningKey::dev(), exported.clone()));
        assert_eq!(restored.chain_length(), 2);

        let mut tampered = exported;
        tampered.envelopes[1].signature = "00".repeat(32);
        assert!(ProofChain::restore(SigningKey::dev(), tampered).is_err());
    }

    #[test]
    fn reseal_moves_a_chain_to_a_new_key() {
        let exported = chain_of(2, SigningKey::dev()).export();
        let target_chain = ProofChain::new(prod_key());
        let resealed = must_ok(target_chain.reseal(&exported, &SigningKey::dev()));
        let mut target = ProofChain::new(prod_key());
        must_ok(target.import(resealed));
        assert_eq!(target.chain_length(), 2);
    }

    #[test]
    fn short_or_invalid_keys_are_configuration_errors() {
        assert!(matches!(
            SigningKey::from_hex("abcd"),
            Err(GuidanceError::Configuration(_))
        ));
        assert!(matches!(
            SigningKey::from_hex("not-hex"),
            Err(GuidanceError::Configuration(_))
        ));
    }

    #[test]
    fn debug_output_hides_key_material() {
        let rendered = format!("{:?}", prod_key());
        assert!(!rendered.contains("00112233"));
        assert!(rendered.contains("fingerprint"));
    }
}
