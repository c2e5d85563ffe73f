//! Mesh trust: revocation issuance/verification and local peer-admission
//! bookkeeping (§4.5, §4.1).
//!
//! A mesh has a single founder key; only a revocation signed by that key
//! can mark an origin untrusted. Rate limiting and reputation tracking are
//! otherwise per-peer bookkeeping independent of that trust decision.

use crate::error::{GossipError, Result};
use atmosphere_core::canonical::canonical_bytes;
use atmosphere_core::crypto::verify_signature;
use atmosphere_core::{GossipEnvelope, NodeId, RecordKind};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;

/// The record_bytes payload of a `RecordKind::Revoke` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevocationRecord {
    pub revoked_node_id: NodeId,
    pub reason: Option<String>,
    pub revoked_at: u64,
}

/// Build and sign a revocation envelope. Only the mesh founder's key should
/// ever be passed here; the caller is responsible for guarding access to it.
pub fn issue_revocation(
    revoked_node_id: NodeId,
    reason: Option<String>,
    revoked_at: u64,
    version: u64,
    mesh_keypair: &atmosphere_core::crypto::KeyPair,
) -> Result<GossipEnvelope> {
    let record = RevocationRecord {
        revoked_node_id,
        reason,
        revoked_at,
    };
    let record_bytes = canonical_bytes(&record)?;
    let signature = mesh_keypair.sign(&record_bytes);
    Ok(GossipEnvelope {
        record_kind: RecordKind::Revoke,
        record_bytes,
        origin_node_id: revoked_node_id,
        origin_version: version,
        ttl_hops: 8,
        origin_signature: signature,
        witness_signatures: vec![],
    })
}

/// Verify a revocation envelope was signed by the mesh's own key (not the
/// revoked node's key — a node cannot revoke itself), and decode its body.
pub fn verify_revocation(
    envelope: &GossipEnvelope,
    mesh_public_key: &[u8; 32],
) -> Result<RevocationRecord> {
    if envelope.record_kind != RecordKind::Revoke {
        return Err(GossipError::RevocationNotFounderSigned);
    }
    verify_signature(mesh_public_key, &envelope.record_bytes, &envelope.origin_signature)
        .map_err(|_| GossipError::RevocationNotFounderSigned)?;
    let record: RevocationRecord = atmosphere_core::canonical::from_canonical_bytes(&envelope.record_bytes)?;
    if record.revoked_node_id != envelope.origin_node_id {
        return Err(GossipError::RevocationNotFounderSigned);
    }
    Ok(record)
}

#[derive(Debug, Clone)]
struct RateLimitState {
    count: u32,
    window_start: Instant,
}

/// Local per-peer trust bookkeeping: who we've admitted into this process's
/// working set and a simple request-rate ceiling per peer, independent of
/// mesh-wide revocation (which lives in the gossip store).
pub struct TrustState {
    admitted: RwLock<HashMap<NodeId, Instant>>,
    rate_limits: RwLock<HashMap<NodeId, RateLimitState>>,
    rate_limit_rpm: u32,
}

impl TrustState {
    pub fn new(rate_limit_rpm: u32) -> Self {
        Self {
            admitted: RwLock::new(HashMap::new()),
            rate_limits: RwLock::new(HashMap::new()),
            rate_limit_rpm,
        }
    }

    pub fn admit(&self, node_id: NodeId) {
        self.admitted.write().insert(node_id, Instant::now());
    }

    pub fn is_admitted(&self, node_id: NodeId) -> bool {
        self.admitted.read().contains_key(&node_id)
    }

    pub fn revoke_local(&self, node_id: NodeId) {
        self.admitted.write().remove(&node_id);
        self.rate_limits.write().remove(&node_id);
    }

    /// Sliding 60-second window request counter.
    pub fn check_rate_limit(&self, node_id: NodeId) -> bool {
        let mut limits = self.rate_limits.write();
        let now = Instant::now();
        let state = limits.entry(node_id).or_insert(RateLimitState {
            count: 0,
            window_start: now,
        });

        if now.duration_since(state.window_start).as_secs() >= 60 {
            state.count = 0;
            state.window_start = now;
        }

        if state.count >= self.rate_limit_rpm {
            return false;
        }
        state.count += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_core::crypto::KeyPair;

    #[test]
    fn revocation_roundtrip() {
        let mesh_kp = KeyPair::generate();
        let target = NodeId([9; 16]);
        let envelope = issue_revocation(target, Some("compromised".into()), 1_000, 1, &mesh_kp).unwrap();
        let record = verify_revocation(&envelope, &mesh_kp.public_key()).unwrap();
        assert_eq!(record.revoked_node_id, target);
    }

    #[test]
    fn revocation_rejects_wrong_mesh_key() {
        let mesh_kp = KeyPair::generate();
        let other_kp = KeyPair::generate();
        let target = NodeId([9; 16]);
        let envelope = issue_revocation(target, None, 1_000, 1, &mesh_kp).unwrap();
        assert!(verify_revocation(&envelope, &other_kp.public_key()).is_err());
    }

    #[test]
    fn admission_and_local_revoke() {
        let trust = TrustState::new(60);
        let node = NodeId([1; 16]);
        assert!(!trust.is_admitted(node));
        trust.admit(node);
        assert!(trust.is_admitted(node));
        trust.revoke_local(node);
        assert!(!trust.is_admitted(node));
    }

    #[test]
    fn rate_limit_blocks_after_threshold() {
        let trust = TrustState::new(2);
        let node = NodeId([2; 16]);
        assert!(trust.check_rate_limit(node));
        assert!(trust.check_rate_limit(node));
        assert!(!trust.check_rate_limit(node));
    }
}
