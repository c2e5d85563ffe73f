//! Epidemic gossip: dedup, merge, anti-entropy, and tombstone/revocation
//! bookkeeping (§4.5).
//!
//! This module owns the data plane only. Picking *which* peers to push to,
//! and actually writing frames to a socket, is `atmosphere-supervisor`'s and
//! the runtime's job; this engine answers "have I seen this", "who wins",
//! and "what does my peer still need".

use crate::error::{GossipError, Result};
use crate::store::{RecordKey, Store};
use atmosphere_core::{canonical, CapabilityRecord, GossipEnvelope, NodeId, RecordKind, RouteEntry};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use parking_lot::Mutex;

/// Fanout: push to this many random Connected peers.
pub const FANOUT: usize = 3;
/// Further peers to forward to if ttl_hops remains, on receipt.
pub const FORWARD_FANOUT: usize = FANOUT - 1;
/// Anti-entropy interval.
pub const ANTI_ENTROPY_INTERVAL_SECS: u64 = 60;
/// How long a tombstone is retained before being purged.
pub const TOMBSTONE_RETENTION_SECS: u64 = 24 * 60 * 60;
/// How long an envelope from an unknown origin is buffered waiting for an
/// identity record, before being discarded.
pub const UNKNOWN_ORIGIN_BUFFER_SECS: u64 = 30;
/// Bound on the in-memory dedup set (per §5).
const DEDUP_CACHE_CAPACITY: usize = 100_000;

type DedupKey = (RecordKind, NodeId, String, u64);

/// Bounded FIFO dedup set: cheap "have I seen this exact envelope" check
/// that avoids touching sled for the overwhelming majority of re-gossiped
/// duplicates.
struct DedupCache {
    order: VecDeque<DedupKey>,
    seen: HashSet<DedupKey>,
}

impl DedupCache {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    /// Returns true if this is the first time we've seen `key`.
    fn insert(&mut self, key: DedupKey) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        if self.order.len() >= DEDUP_CACHE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.order.push_back(key.clone());
        self.seen.insert(key);
        true
    }
}

struct PendingEnvelope {
    envelope: GossipEnvelope,
    buffered_at: u64,
}

/// Outcome of ingesting a single envelope.
#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// New or higher-version record, stored and eligible for re-forwarding.
    Applied,
    /// Already seen, or superseded by what we already have.
    Stale,
    /// Origin not yet known locally; buffered pending an identity record.
    BufferedUnknownOrigin,
}

pub struct GossipEngine {
    store: Arc<Store>,
    dedup: Mutex<DedupCache>,
    pending: Mutex<HashMap<NodeId, Vec<PendingEnvelope>>>,
}

impl GossipEngine {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            dedup: Mutex::new(DedupCache::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Initial ttl_hops for a freshly-originated record: ceil(log2(known
    /// peers)) + 2, floored at 4.
    pub fn initial_ttl_hops(known_peer_count: usize) -> u32 {
        let peers = known_peer_count.max(1) as f64;
        let log2 = peers.log2().ceil() as u32;
        (log2 + 2).max(4)
    }

    /// The ttl_hops to stamp on a re-forwarded envelope, or `None` if it
    /// should not be forwarded further.
    pub fn decrement_ttl(ttl_hops: u32) -> Option<u32> {
        if ttl_hops == 0 {
            None
        } else {
            Some(ttl_hops - 1)
        }
    }

    /// Record the identifying part of a gossiped payload, used both for the
    /// dedup key and as the sled key suffix. Origin-scoped singleton kinds
    /// (cost, revoke, liveness) have no sub-identity.
    fn record_id(envelope: &GossipEnvelope) -> Result<String> {
        match envelope.record_kind {
            RecordKind::Capability => {
                let record: CapabilityRecord = canonical::from_canonical_bytes(&envelope.record_bytes)?;
                Ok(record.capability_id)
            }
            RecordKind::Route => {
                let record: RouteEntry = canonical::from_canonical_bytes(&envelope.record_bytes)?;
                Ok(record.capability_id)
            }
            RecordKind::Cost | RecordKind::Revoke | RecordKind::Liveness => Ok(String::new()),
        }
    }

    /// Ingest a single envelope received from a peer (or generated locally).
    ///
    /// `origin_public_key` is `None` when we haven't yet received an
    /// identity record for this origin; the envelope is buffered rather than
    /// verified/discarded outright, per §4.5's unknown-origin handling.
    pub fn ingest(
        &self,
        envelope: GossipEnvelope,
        origin_public_key: Option<&[u8; 32]>,
        now: u64,
    ) -> Result<IngestOutcome> {
        if self.store.is_revoked(envelope.origin_node_id)? && envelope.record_kind != RecordKind::Revoke {
            return Err(GossipError::OriginRevoked(envelope.origin_node_id));
        }

        let Some(public_key) = origin_public_key else {
            self.pending
                .lock()
                .entry(envelope.origin_node_id)
                .or_default()
                .push(PendingEnvelope {
                    envelope,
                    buffered_at: now,
                });
            return Ok(IngestOutcome::BufferedUnknownOrigin);
        };

        self.ingest_verified(envelope, public_key)
    }

    fn ingest_verified(&self, envelope: GossipEnvelope, public_key: &[u8; 32]) -> Result<IngestOutcome> {
        atmosphere_core::crypto::verify_signature(public_key, &envelope.record_bytes, &envelope.origin_signature)
            .map_err(|_| GossipError::InvalidSignature {
                record_kind: envelope.record_kind,
                origin: envelope.origin_node_id,
            })?;

        let record_id = Self::record_id(&envelope)?;
        let dedup_key = envelope.dedup_key(&record_id);
        if !self.dedup.lock().insert(dedup_key) {
            return Ok(IngestOutcome::Stale);
        }

        let key = RecordKey::new(envelope.record_kind, envelope.origin_node_id, record_id);
        match self.store.get_record(&key)? {
            Some(existing) if !Self::supersedes(&envelope, &existing) => Ok(IngestOutcome::Stale),
            _ => {
                self.store.put_record(&key, &envelope)?;
                Ok(IngestOutcome::Applied)
            }
        }
    }

    /// Merge rule (§4.5): higher origin_version wins; ties broken by
    /// byte-lexicographic comparison of the origin signature. Commutative,
    /// associative, and idempotent by construction (a pure function of the
    /// two envelopes' version and signature bytes).
    fn supersedes(candidate: &GossipEnvelope, existing: &GossipEnvelope) -> bool {
        match candidate.origin_version.cmp(&existing.origin_version) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => candidate.origin_signature > existing.origin_signature,
        }
    }

    /// Flush any envelopes buffered for `origin` now that we know its key,
    /// re-running them through verification and merge.
    pub fn resolve_origin(&self, origin: NodeId, public_key: &[u8; 32]) -> Result<Vec<IngestOutcome>> {
        let buffered = self.pending.lock().remove(&origin).unwrap_or_default();
        buffered
            .into_iter()
            .map(|p| self.ingest_verified(p.envelope, public_key))
            .collect()
    }

    /// Drop buffered envelopes older than [`UNKNOWN_ORIGIN_BUFFER_SECS`].
    pub fn expire_pending(&self, now: u64) {
        let mut pending = self.pending.lock();
        pending.retain(|_, envelopes| {
            envelopes.retain(|p| now.saturating_sub(p.buffered_at) < UNKNOWN_ORIGIN_BUFFER_SECS);
            !envelopes.is_empty()
        });
    }

    /// Local anti-entropy digest: highest known origin_version per
    /// (record_kind, origin), the basis of `AntiEntropyReq`/`Resp` (§6).
    pub fn digest(&self) -> Result<Vec<(RecordKind, NodeId, u64)>> {
        let mut digest = self.store.all_versions()?;
        digest.sort_by(|a, b| (a.0 as u8, a.1).cmp(&(b.0 as u8, b.1)));
        Ok(digest)
    }

    /// Given a peer's digest, return the full envelopes for every
    /// (record_kind, origin) where we're strictly ahead.
    pub fn missing_for_peer(&self, peer_digest: &[(RecordKind, NodeId, u64)]) -> Result<Vec<GossipEnvelope>> {
        let peer_versions: HashMap<(RecordKind, NodeId), u64> = peer_digest
            .iter()
            .map(|(kind, origin, version)| ((*kind, *origin), *version))
            .collect();

        let mut out = Vec::new();
        for entry in self.store.all_records() {
            let (key, envelope) = entry?;
            let peer_has = peer_versions
                .get(&(key.record_kind, key.origin_node_id))
                .copied()
                .unwrap_or(0);
            if envelope.origin_version > peer_has {
                out.push(envelope);
            }
        }
        Ok(out)
    }

    /// Purge capability tombstones older than the retention window.
    pub fn sweep_tombstones(&self, now: u64) -> Result<usize> {
        let mut purged = 0;
        for entry in self.store.all_records() {
            let (key, envelope) = entry?;
            if key.record_kind != RecordKind::Capability {
                continue;
            }
            let record: CapabilityRecord = canonical::from_canonical_bytes(&envelope.record_bytes)?;
            if record.is_tombstone() && now.saturating_sub(record.updated_at) >= TOMBSTONE_RETENTION_SECS {
                self.store.delete_record(&key)?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_core::{canonical::canonical_bytes, crypto::KeyPair, CapabilityType};
    use std::collections::BTreeMap;

    fn engine() -> (GossipEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        (GossipEngine::new(store), dir)
    }

    fn signed_capability_envelope(
        kp: &KeyPair,
        capability_id: &str,
        version: u64,
    ) -> GossipEnvelope {
        let record = CapabilityRecord {
            capability_id: capability_id.into(),
            owner_node_id: kp.node_id(),
            type_tag: CapabilityType::Tool,
            description: "echoes input".into(),
            embedding: vec![0.0; atmosphere_core::EMBEDDING_DIM],
            tools: vec!["echo".into()],
            constraints: BTreeMap::new(),
            version,
            updated_at: 0,
            signature: vec![],
        };
        let record_bytes = canonical_bytes(&record).unwrap();
        let signature = kp.sign(&record_bytes);
        GossipEnvelope {
            record_kind: RecordKind::Capability,
            record_bytes,
            origin_node_id: kp.node_id(),
            origin_version: version,
            ttl_hops: 4,
            origin_signature: signature,
            witness_signatures: vec![],
        }
    }

    #[test]
    fn ingest_new_record_applies() {
        let (engine, _dir) = engine();
        let kp = KeyPair::generate();
        let envelope = signed_capability_envelope(&kp, "cap-1", 1);
        let outcome = engine.ingest(envelope, Some(&kp.public_key()), 0).unwrap();
        assert_eq!(outcome, IngestOutcome::Applied);
    }

    #[test]
    fn ingest_duplicate_is_stale() {
        let (engine, _dir) = engine();
        let kp = KeyPair::generate();
        let envelope = signed_capability_envelope(&kp, "cap-1", 1);
        engine.ingest(envelope.clone(), Some(&kp.public_key()), 0).unwrap();
        let outcome = engine.ingest(envelope, Some(&kp.public_key()), 0).unwrap();
        assert_eq!(outcome, IngestOutcome::Stale);
    }

    #[test]
    fn higher_version_supersedes() {
        let (engine, _dir) = engine();
        let kp = KeyPair::generate();
        engine
            .ingest(signed_capability_envelope(&kp, "cap-1", 1), Some(&kp.public_key()), 0)
            .unwrap();
        let outcome = engine
            .ingest(signed_capability_envelope(&kp, "cap-1", 2), Some(&kp.public_key()), 0)
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Applied);
        assert_eq!(
            engine.store().highest_version(RecordKind::Capability, kp.node_id()).unwrap(),
            2
        );
    }

    #[test]
    fn unknown_origin_is_buffered_then_resolved() {
        let (engine, _dir) = engine();
        let kp = KeyPair::generate();
        let envelope = signed_capability_envelope(&kp, "cap-1", 1);
        let outcome = engine.ingest(envelope, None, 0).unwrap();
        assert_eq!(outcome, IngestOutcome::BufferedUnknownOrigin);

        let results = engine.resolve_origin(kp.node_id(), &kp.public_key()).unwrap();
        assert_eq!(results, vec![IngestOutcome::Applied]);
    }

    #[test]
    fn unknown_origin_expires() {
        let (engine, _dir) = engine();
        let kp = KeyPair::generate();
        let envelope = signed_capability_envelope(&kp, "cap-1", 1);
        engine.ingest(envelope, None, 0).unwrap();
        engine.expire_pending(UNKNOWN_ORIGIN_BUFFER_SECS + 1);
        let results = engine.resolve_origin(kp.node_id(), &kp.public_key()).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn digest_and_missing_for_peer() {
        let (engine, _dir) = engine();
        let kp = KeyPair::generate();
        engine
            .ingest(signed_capability_envelope(&kp, "cap-1", 1), Some(&kp.public_key()), 0)
            .unwrap();

        let digest = engine.digest().unwrap();
        assert_eq!(digest, vec![(RecordKind::Capability, kp.node_id(), 1)]);

        let missing = engine.missing_for_peer(&[]).unwrap();
        assert_eq!(missing.len(), 1);

        let missing_when_current = engine.missing_for_peer(&digest).unwrap();
        assert!(missing_when_current.is_empty());
    }

    #[test]
    fn initial_ttl_hops_floors_at_four() {
        assert_eq!(GossipEngine::initial_ttl_hops(1), 4);
        assert_eq!(GossipEngine::initial_ttl_hops(4), 4);
        assert_eq!(GossipEngine::initial_ttl_hops(16), 6);
    }
}
