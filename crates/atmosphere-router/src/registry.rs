//! Capability and cost registry (§4.6).
//!
//! Readers take a consistent snapshot pointer for the duration of a routing
//! decision (§5's copy-on-write discipline): each write path builds a new
//! `Arc<HashMap<..>>` and swaps it in, rather than locking per-read.

use atmosphere_core::crypto::KeyPair;
use atmosphere_core::{CapabilityRecord, CapabilityType, CostSample, NodeId, EMBEDDING_DIM};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// The embedding model is an external collaborator (assumed: a fixed
/// deterministic text→vector function) — never implemented here, only
/// depended on.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Deterministic placeholder embedder for wiring and tests. Hashes the text
/// into a BLAKE3 stream and expands it to `EMBEDDING_DIM` floats in [-1, 1].
/// Not a semantic embedding; the real model is injected by the runtime.
pub struct HashEmbedder;

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut out = Vec::with_capacity(EMBEDDING_DIM);
        let mut counter: u64 = 0;
        while out.len() < EMBEDDING_DIM {
            let mut hasher = blake3::Hasher::new();
            hasher.update(text.as_bytes());
            hasher.update(&counter.to_le_bytes());
            let digest = hasher.finalize();
            for chunk in digest.as_bytes().chunks_exact(4) {
                if out.len() >= EMBEDDING_DIM {
                    break;
                }
                let v = u32::from_le_bytes(chunk.try_into().unwrap());
                out.push((v as f32 / u32::MAX as f32) * 2.0 - 1.0);
            }
            counter += 1;
        }
        out
    }
}

/// Derive the cost multiplier from a raw sample (§4.6). Pure and
/// deterministic: every node computing it over the same sample agrees.
pub fn cost_multiplier(sample: &CostSample) -> f64 {
    let power_factor = if sample.plugged_in {
        1.0
    } else if sample.battery_percent > 50 {
        2.0
    } else {
        3.0
    };
    let cpu_factor = if sample.cpu_load > 0.75 {
        2.0
    } else if sample.cpu_load > 0.5 {
        1.6
    } else {
        1.0
    };
    let memory_factor = if sample.memory_percent > 90 {
        2.5
    } else if sample.memory_percent > 80 {
        1.5
    } else {
        1.0
    };
    let network_factor = if sample.network_metered { 1.5 } else { 1.0 };

    let cost = power_factor as f64 * cpu_factor.max(memory_factor) as f64 * network_factor as f64;
    cost.clamp(1.0, 5.0)
}

#[derive(Debug, Clone)]
pub struct CapabilityEntry {
    pub record: CapabilityRecord,
}

pub struct CapabilityRegistry {
    capabilities: RwLock<Arc<HashMap<String, CapabilityEntry>>>,
    costs: RwLock<Arc<HashMap<NodeId, CostSample>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            capabilities: RwLock::new(Arc::new(HashMap::new())),
            costs: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// A stable, cheaply-clonable view for the duration of a routing decision.
    pub fn snapshot_capabilities(&self) -> Arc<HashMap<String, CapabilityEntry>> {
        self.capabilities.read().clone()
    }

    pub fn snapshot_costs(&self) -> Arc<HashMap<NodeId, CostSample>> {
        self.costs.read().clone()
    }

    /// Insert or replace a capability record (local registration, or merge
    /// of a gossiped one that won). No-op if `record.version` does not
    /// exceed what's already stored for that id.
    pub fn upsert_capability(&self, record: CapabilityRecord) {
        let mut guard = self.capabilities.write();
        if let Some(existing) = guard.get(&record.capability_id) {
            if record.version <= existing.record.version {
                return;
            }
        }
        let mut next = (**guard).clone();
        next.insert(record.capability_id.clone(), CapabilityEntry { record });
        *guard = Arc::new(next);
    }

    pub fn remove_capability(&self, capability_id: &str) {
        let mut guard = self.capabilities.write();
        if guard.contains_key(capability_id) {
            let mut next = (**guard).clone();
            next.remove(capability_id);
            *guard = Arc::new(next);
        }
    }

    pub fn upsert_cost(&self, sample: CostSample) {
        let mut guard = self.costs.write();
        if let Some(existing) = guard.get(&sample.node_id) {
            if sample.sampled_at <= existing.sampled_at {
                return;
            }
        }
        let mut next = (**guard).clone();
        next.insert(sample.node_id, sample);
        *guard = Arc::new(next);
    }

    /// Current cost multiplier for a node, or the neutral 1.0 if we have no
    /// sample yet (new peers aren't penalized before their first report).
    pub fn cost_multiplier_for(&self, node_id: NodeId) -> f64 {
        self.costs
            .read()
            .get(&node_id)
            .map(cost_multiplier)
            .unwrap_or(1.0)
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Local publishing side of §4.6: assigns capability ids, computes
/// embeddings, bumps per-id version counters, and signs. The signed record
/// still needs to be handed to the gossip engine for push — that crosses a
/// crate boundary the runtime owns, not this one.
pub struct LocalCapabilityManager {
    node_id: NodeId,
    keypair: Arc<KeyPair>,
    embedder: Arc<dyn Embedder>,
    versions: RwLock<HashMap<String, u64>>,
}

impl LocalCapabilityManager {
    pub fn new(node_id: NodeId, keypair: Arc<KeyPair>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            node_id,
            keypair,
            embedder,
            versions: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_capability(
        &self,
        capability_id: String,
        type_tag: CapabilityType,
        description: String,
        tools: Vec<String>,
        constraints: BTreeMap<String, String>,
        now: u64,
    ) -> CapabilityRecord {
        let embedding = self.embedder.embed(&description);
        let version = self.bump_version(&capability_id);
        self.sign(capability_id, type_tag, description, embedding, tools, constraints, version, now)
    }

    /// Publishes a tombstone: same identity, bumped version, empty content.
    pub fn unregister_capability(&self, capability_id: String, type_tag: CapabilityType, now: u64) -> CapabilityRecord {
        let version = self.bump_version(&capability_id);
        self.sign(capability_id, type_tag, String::new(), Vec::new(), Vec::new(), BTreeMap::new(), version, now)
    }

    fn bump_version(&self, capability_id: &str) -> u64 {
        let mut versions = self.versions.write();
        let counter = versions.entry(capability_id.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    #[allow(clippy::too_many_arguments)]
    fn sign(
        &self,
        capability_id: String,
        type_tag: CapabilityType,
        description: String,
        embedding: Vec<f32>,
        tools: Vec<String>,
        constraints: BTreeMap<String, String>,
        version: u64,
        now: u64,
    ) -> CapabilityRecord {
        let record = CapabilityRecord {
            capability_id,
            owner_node_id: self.node_id,
            type_tag,
            description,
            embedding,
            tools,
            constraints,
            version,
            updated_at: now,
            signature: Vec::new(),
        };
        atmosphere_core::crypto::sign_capability_record(record, &self.keypair)
            .expect("canonical CBOR encoding of a well-formed record cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_multiplier_plugged_in_idle() {
        let sample = CostSample {
            node_id: NodeId([0; 16]),
            plugged_in: true,
            battery_percent: 100,
            cpu_load: 0.1,
            gpu_load: 0.0,
            memory_percent: 10,
            network_metered: false,
            sampled_at: 0,
        };
        assert_eq!(cost_multiplier(&sample), 1.0);
    }

    #[test]
    fn cost_multiplier_battery_low_cpu_hot_metered() {
        let sample = CostSample {
            node_id: NodeId([0; 16]),
            plugged_in: false,
            battery_percent: 20,
            cpu_load: 0.9,
            gpu_load: 0.0,
            memory_percent: 50,
            network_metered: true,
            sampled_at: 0,
        };
        // power=3.0, cpu=2.0, memory=1.0 -> max=2.0, network=1.5 -> 3*2*1.5=9 clamped to 5
        assert_eq!(cost_multiplier(&sample), 5.0);
    }

    #[test]
    fn registry_upsert_respects_version_monotonicity() {
        let reg = CapabilityRegistry::new();
        let rec_v1 = CapabilityRecord {
            capability_id: "c1".into(),
            owner_node_id: NodeId([1; 16]),
            type_tag: CapabilityType::Tool,
            description: "d".into(),
            embedding: vec![0.0; EMBEDDING_DIM],
            tools: vec!["t".into()],
            constraints: BTreeMap::new(),
            version: 2,
            updated_at: 0,
            signature: vec![],
        };
        reg.upsert_capability(rec_v1.clone());
        let mut stale = rec_v1.clone();
        stale.version = 1;
        stale.description = "stale".into();
        reg.upsert_capability(stale);

        let snapshot = reg.snapshot_capabilities();
        assert_eq!(snapshot.get("c1").unwrap().record.description, "d");
    }

    #[test]
    fn local_capability_manager_signs_and_verifies() {
        let kp = Arc::new(KeyPair::generate());
        let node_id = kp.node_id();
        let manager = LocalCapabilityManager::new(node_id, kp.clone(), Arc::new(HashEmbedder));
        let record = manager.register_capability(
            "c1".into(),
            CapabilityType::Tool,
            "echoes input".into(),
            vec!["echo".into()],
            BTreeMap::new(),
            0,
        );
        assert_eq!(record.version, 1);
        assert!(atmosphere_core::crypto::verify_capability_record(&record, &kp.public_key()).is_ok());
    }
}
