//! Persistent storage for gossiped records, backed by `sled`.
//!
//! Four trees: `records` (the latest envelope per dedup key), `versions`
//! (the highest known origin_version per (record_kind, origin), the input to
//! the anti-entropy digest), `revoked` (origins a founder-signed revocation
//! has marked untrusted), and `metadata` (misc scalar state, e.g. this
//! node's own replica bookkeeping).

use crate::error::Result;
use atmosphere_core::{GossipEnvelope, NodeId, RecordKind};
use std::path::Path;

/// Identifies a single gossiped record independent of its version: which
/// kind, whose origin, and (for kinds with more than one record per origin,
/// e.g. capabilities) which record. Origin-scoped singleton kinds (Cost,
/// Revoke, Liveness) pass an empty `record_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub record_kind: RecordKind,
    pub origin_node_id: NodeId,
    pub record_id: String,
}

impl RecordKey {
    pub fn new(record_kind: RecordKind, origin_node_id: NodeId, record_id: impl Into<String>) -> Self {
        Self {
            record_kind,
            origin_node_id,
            record_id: record_id.into(),
        }
    }

    fn to_sled_key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(17 + self.record_id.len());
        key.push(record_kind_tag(self.record_kind));
        key.extend_from_slice(&self.origin_node_id.0);
        key.extend_from_slice(self.record_id.as_bytes());
        key
    }

    fn version_sled_key(&self) -> [u8; 17] {
        let mut key = [0u8; 17];
        key[0] = record_kind_tag(self.record_kind);
        key[1..].copy_from_slice(&self.origin_node_id.0);
        key
    }
}

fn record_kind_tag(kind: RecordKind) -> u8 {
    match kind {
        RecordKind::Capability => 1,
        RecordKind::Cost => 2,
        RecordKind::Route => 3,
        RecordKind::Revoke => 4,
        RecordKind::Liveness => 5,
    }
}

pub struct Store {
    db: sled::Db,
    records: sled::Tree,
    versions: sled::Tree,
    revoked: sled::Tree,
    metadata: sled::Tree,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        let records = db.open_tree("records")?;
        let versions = db.open_tree("versions")?;
        let revoked = db.open_tree("revoked")?;
        let metadata = db.open_tree("metadata")?;
        Ok(Self {
            db,
            records,
            versions,
            revoked,
            metadata,
        })
    }

    /// Store the envelope for `key`, overwriting whatever was there. Callers
    /// (the engine) are responsible for having already applied the merge
    /// rule before calling this.
    pub fn put_record(&self, key: &RecordKey, envelope: &GossipEnvelope) -> Result<()> {
        let value = postcard::to_allocvec(envelope)?;
        self.records.insert(key.to_sled_key(), value)?;
        self.bump_version(key, envelope.origin_version)?;
        Ok(())
    }

    pub fn get_record(&self, key: &RecordKey) -> Result<Option<GossipEnvelope>> {
        match self.records.get(key.to_sled_key())? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_record(&self, key: &RecordKey) -> Result<()> {
        self.records.remove(key.to_sled_key())?;
        Ok(())
    }

    pub fn all_records(&self) -> impl Iterator<Item = Result<(RecordKey, GossipEnvelope)>> + '_ {
        self.records.iter().map(|entry| {
            let (raw_key, bytes) = entry?;
            let envelope: GossipEnvelope = postcard::from_bytes(&bytes)?;
            let record_kind = envelope.record_kind;
            let mut origin = [0u8; 16];
            origin.copy_from_slice(&raw_key[1..17]);
            let record_id = String::from_utf8_lossy(&raw_key[17..]).into_owned();
            Ok((
                RecordKey::new(record_kind, NodeId(origin), record_id),
                envelope,
            ))
        })
    }

    /// Highest origin_version known for this (record_kind, origin), or 0.
    pub fn highest_version(&self, record_kind: RecordKind, origin: NodeId) -> Result<u64> {
        let probe = RecordKey::new(record_kind, origin, "");
        match self.versions.get(probe.version_sled_key())? {
            Some(bytes) => Ok(u64::from_be_bytes(bytes.as_ref().try_into().unwrap_or([0; 8]))),
            None => Ok(0),
        }
    }

    fn bump_version(&self, key: &RecordKey, version: u64) -> Result<()> {
        let current = self.highest_version(key.record_kind, key.origin_node_id)?;
        if version > current {
            self.versions
                .insert(key.version_sled_key(), &version.to_be_bytes())?;
        }
        Ok(())
    }

    /// Per-(record_kind, origin) highest versions, the raw input to the
    /// anti-entropy digest (engine.rs hashes this deterministically).
    pub fn all_versions(&self) -> Result<Vec<(RecordKind, NodeId, u64)>> {
        let mut out = Vec::new();
        for entry in self.versions.iter() {
            let (raw_key, bytes) = entry?;
            let record_kind = tag_to_record_kind(raw_key[0]);
            let mut origin = [0u8; 16];
            origin.copy_from_slice(&raw_key[1..17]);
            let version = u64::from_be_bytes(bytes.as_ref().try_into().unwrap_or([0; 8]));
            out.push((record_kind, NodeId(origin), version));
        }
        Ok(out)
    }

    pub fn mark_revoked(&self, origin: NodeId) -> Result<()> {
        self.revoked.insert(origin.0, &[])?;
        Ok(())
    }

    pub fn is_revoked(&self, origin: NodeId) -> Result<bool> {
        Ok(self.revoked.contains_key(origin.0)?)
    }

    pub fn put_metadata(&self, key: &str, value: &[u8]) -> Result<()> {
        self.metadata.insert(key, value)?;
        Ok(())
    }

    pub fn get_metadata(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.metadata.get(key)?.map(|v| v.to_vec()))
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn tag_to_record_kind(tag: u8) -> RecordKind {
    match tag {
        1 => RecordKind::Capability,
        2 => RecordKind::Cost,
        3 => RecordKind::Route,
        4 => RecordKind::Revoke,
        _ => RecordKind::Liveness,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope(origin: NodeId, version: u64) -> GossipEnvelope {
        GossipEnvelope {
            record_kind: RecordKind::Capability,
            record_bytes: vec![1, 2, 3],
            origin_node_id: origin,
            origin_version: version,
            ttl_hops: 4,
            origin_signature: vec![],
            witness_signatures: vec![],
        }
    }

    #[test]
    fn put_get_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let origin = NodeId([1; 16]);
        let key = RecordKey::new(RecordKind::Capability, origin, "cap-1");
        let env = sample_envelope(origin, 3);

        store.put_record(&key, &env).unwrap();
        let fetched = store.get_record(&key).unwrap().unwrap();
        assert_eq!(fetched.origin_version, 3);
        assert_eq!(store.highest_version(RecordKind::Capability, origin).unwrap(), 3);
    }

    #[test]
    fn version_tracks_max_across_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let origin = NodeId([2; 16]);

        let key_a = RecordKey::new(RecordKind::Capability, origin, "cap-a");
        let key_b = RecordKey::new(RecordKind::Capability, origin, "cap-b");
        store.put_record(&key_a, &sample_envelope(origin, 5)).unwrap();
        store.put_record(&key_b, &sample_envelope(origin, 2)).unwrap();

        assert_eq!(store.highest_version(RecordKind::Capability, origin).unwrap(), 5);
    }

    #[test]
    fn revocation_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let origin = NodeId([3; 16]);
        assert!(!store.is_revoked(origin).unwrap());
        store.mark_revoked(origin).unwrap();
        assert!(store.is_revoked(origin).unwrap());
    }
}
