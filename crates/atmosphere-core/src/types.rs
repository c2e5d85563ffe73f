//! Atmosphere data model (see §3).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 16-byte random identifier, stable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub [u8; 16]);

impl NodeId {
    /// NodeId = first 16 bytes of SHA-256(public key).
    pub fn from_public_key(public_key: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(public_key);
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        NodeId(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        if bytes.len() != 16 {
            return None;
        }
        let mut out = [0u8; 16];
        out.copy_from_slice(&bytes);
        Some(NodeId(out))
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// 8-byte random identifier generated by the mesh founder; stable for the mesh lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeshId(pub [u8; 8]);

impl MeshId {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        MeshId(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for MeshId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// An address, not a connection. See [`TransportKind`] for the matching tag
/// used on the wire and in RouteEntry/PeerState bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Endpoint {
    Lan { host: String, port: u16 },
    Public { host: String, port: u16 },
    Relay { url: String, session_id: String },
    Ble { mac: String },
}

impl Endpoint {
    pub fn transport_kind(&self) -> TransportKind {
        match self {
            Endpoint::Lan { .. } => TransportKind::Lan,
            Endpoint::Public { .. } => TransportKind::Udp,
            Endpoint::Relay { .. } => TransportKind::Relay,
            Endpoint::Ble { .. } => TransportKind::Ble,
        }
    }
}

/// The four uniform transports (C3). Priority order for probing is the
/// declaration order here: LAN, UDP (hole-punched), Relay, BLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TransportKind {
    Lan,
    Udp,
    Relay,
    Ble,
}

impl TransportKind {
    pub const PRIORITY_ORDER: [TransportKind; 4] = [
        TransportKind::Lan,
        TransportKind::Udp,
        TransportKind::Relay,
        TransportKind::Ble,
    ];

    /// Heartbeat interval per transport (§4.4).
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        use std::time::Duration;
        match self {
            TransportKind::Lan => Duration::from_secs(15),
            TransportKind::Relay => Duration::from_secs(60),
            TransportKind::Udp => Duration::from_secs(30),
            TransportKind::Ble => Duration::from_secs(30),
        }
    }

    /// Max frame payload size for this transport (§4.3).
    pub fn max_frame_size(&self) -> usize {
        match self {
            TransportKind::Lan | TransportKind::Relay => 1024 * 1024,
            TransportKind::Udp => 4 * 1024,
            TransportKind::Ble => 220,
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TransportKind::Lan => "lan",
            TransportKind::Udp => "udp",
            TransportKind::Relay => "relay",
            TransportKind::Ble => "ble",
        };
        write!(f, "{s}")
    }
}

/// A signed, self-contained join token (§4.1).
///
/// The nonce is deliberately *not* part of the signed body; replay
/// protection for live connections is handled separately by
/// [`SessionAuth`] (see §9 open questions).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InviteToken {
    pub mesh_id: MeshId,
    pub mesh_public_key: [u8; 32],
    pub issuer_node_id: NodeId,
    pub capabilities_granted: Vec<String>,
    pub endpoints: Vec<Endpoint>,
    pub created_at: u64,
    pub expires_at: u64,
    pub signature: Vec<u8>,
}

impl InviteToken {
    /// Fields in signed-body order, fixed, excluding the signature itself.
    /// Used both to produce the signature and to re-derive it for verification.
    pub(crate) fn signed_body(&self) -> InviteTokenBody<'_> {
        InviteTokenBody {
            mesh_id: self.mesh_id,
            mesh_public_key: self.mesh_public_key,
            issuer_node_id: self.issuer_node_id,
            capabilities_granted: &self.capabilities_granted,
            endpoints: &self.endpoints,
            created_at: self.created_at,
            expires_at: self.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct InviteTokenBody<'a> {
    pub mesh_id: MeshId,
    pub mesh_public_key: [u8; 32],
    pub issuer_node_id: NodeId,
    pub capabilities_granted: &'a [String],
    pub endpoints: &'a [Endpoint],
    pub created_at: u64,
    pub expires_at: u64,
}

/// Per-connection auth envelope (§3). Replay protection is (nonce, node_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionAuth {
    pub node_id: NodeId,
    pub nonce: [u8; 16],
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

impl SessionAuth {
    pub(crate) fn signed_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.extend_from_slice(&self.nonce);
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf
    }
}

/// Kind of capability a node advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityType {
    Llm,
    Embeddings,
    Vision,
    Sensor,
    Tool,
    Rag,
    Custom,
}

pub const EMBEDDING_DIM: usize = 384;

/// A self-describing, versioned, signed declaration that a node can perform
/// work matching an embedded description (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub capability_id: String,
    pub owner_node_id: NodeId,
    pub type_tag: CapabilityType,
    pub description: String,
    pub embedding: Vec<f32>,
    pub tools: Vec<String>,
    pub constraints: BTreeMap<String, String>,
    pub version: u64,
    pub updated_at: u64,
    pub signature: Vec<u8>,
}

impl CapabilityRecord {
    /// A tombstone: same identity, bumped version, no tools/description content.
    pub fn is_tombstone(&self) -> bool {
        self.tools.is_empty() && self.description.is_empty()
    }

    pub(crate) fn signed_body(&self) -> CapabilityRecordBody<'_> {
        CapabilityRecordBody {
            capability_id: &self.capability_id,
            owner_node_id: self.owner_node_id,
            type_tag: self.type_tag,
            description: &self.description,
            embedding: &self.embedding,
            tools: &self.tools,
            constraints: &self.constraints,
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct CapabilityRecordBody<'a> {
    pub capability_id: &'a str,
    pub owner_node_id: NodeId,
    pub type_tag: CapabilityType,
    pub description: &'a str,
    pub embedding: &'a [f32],
    pub tools: &'a [String],
    pub constraints: &'a BTreeMap<String, String>,
    pub version: u64,
    pub updated_at: u64,
}

/// A node's self-reported resource snapshot (§3). The derived cost
/// multiplier (§4.6) is computed by `atmosphere-router`, not stored here, so
/// every reader recomputes it from the same raw sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostSample {
    pub node_id: NodeId,
    pub plugged_in: bool,
    pub battery_percent: u8,
    pub cpu_load: f32,
    pub gpu_load: f32,
    pub memory_percent: u8,
    pub network_metered: bool,
    pub sampled_at: u64,
}

impl CostSample {
    /// Hysteresis check against a previous sample (§4.6): only gossip a new
    /// sample if something material changed or 5 minutes have elapsed.
    pub fn materially_changed_from(&self, prev: &CostSample, now: u64) -> bool {
        const STALE_SECS: u64 = 300;
        if now.saturating_sub(prev.sampled_at) >= STALE_SECS {
            return true;
        }
        self.plugged_in != prev.plugged_in
            || self.network_metered != prev.network_metered
            || (self.battery_percent as i16 - prev.battery_percent as i16).abs() >= 5
            || (self.cpu_load - prev.cpu_load).abs() >= 0.1
            || (self.memory_percent as i16 - prev.memory_percent as i16).abs() >= 5
    }
}

/// A signed CostSample as it travels on the wire / through gossip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedCostSample {
    pub sample: CostSample,
    pub signature: Vec<u8>,
}

/// A ranked next-hop for a capability (§3, §4.7).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub capability_id: String,
    pub next_hop_node_id: NodeId,
    pub via_transport: TransportKind,
    pub hop_count: u32,
    pub measured_latency_ms: f64,
    pub cost_multiplier: f64,
    pub reliability: f64,
    pub last_updated: u64,
    pub score: f64,
}

pub const ROUTE_ENTRIES_PER_CAPABILITY: usize = 8;

/// Kind of gossiped record (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Capability,
    Cost,
    Route,
    Revoke,
    Liveness,
}

/// The envelope epidemic gossip actually exchanges (§3, §4.5).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GossipEnvelope {
    pub record_kind: RecordKind,
    pub record_bytes: Vec<u8>,
    pub origin_node_id: NodeId,
    pub origin_version: u64,
    pub ttl_hops: u32,
    pub origin_signature: Vec<u8>,
    pub witness_signatures: Vec<Vec<u8>>,
}

impl GossipEnvelope {
    /// Dedup key: (record_kind, origin_node_id, record_id, origin_version).
    /// `record_id` disambiguates multiple records of the same kind from the
    /// same origin (e.g. two capabilities); callers pass the capability_id
    /// or an empty string for origin-scoped singleton record kinds.
    pub fn dedup_key(&self, record_id: &str) -> (RecordKind, NodeId, String, u64) {
        (
            self.record_kind,
            self.origin_node_id,
            record_id.to_string(),
            self.origin_version,
        )
    }
}

/// Liveness state machine for a peer (§3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LivenessState {
    Unknown,
    Probing,
    Connected,
    Suspect,
    Dead,
}

/// Everything known locally about a remote peer (§3). The mutable,
/// concurrently-updated version of this (sharded, lock-guarded) lives in
/// `atmosphere-supervisor`; this is the plain-data snapshot shape shared
/// across crate boundaries (e.g. for `peers`/`status` CLI output).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerState {
    pub node_id: NodeId,
    pub public_key: [u8; 32],
    pub known_endpoints: BTreeMap<TransportKind, Endpoint>,
    pub active_transport: Option<TransportKind>,
    pub rtt_ewma_ms: BTreeMap<TransportKind, f64>,
    pub missed_heartbeats: BTreeMap<TransportKind, u32>,
    pub liveness: LivenessState,
}

impl PeerState {
    pub fn new(node_id: NodeId, public_key: [u8; 32]) -> Self {
        Self {
            node_id,
            public_key,
            known_endpoints: BTreeMap::new(),
            active_transport: None,
            rtt_ewma_ms: BTreeMap::new(),
            missed_heartbeats: BTreeMap::new(),
            liveness: LivenessState::Unknown,
        }
    }
}

/// A joined mesh, persisted across restarts (§3, §4.9).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedMesh {
    pub mesh_id: MeshId,
    pub mesh_name: String,
    pub mesh_public_key: [u8; 32],
    pub founder_node_id: NodeId,
    pub relay_token: Option<String>,
    pub endpoints: Vec<Endpoint>,
    pub joined_at: u64,
    pub last_connected: Option<u64>,
    pub auto_reconnect: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_from_public_key_is_deterministic() {
        let pk = [7u8; 32];
        let a = NodeId::from_public_key(&pk);
        let b = NodeId::from_public_key(&pk);
        assert_eq!(a, b);
    }

    #[test]
    fn node_id_hex_roundtrip() {
        let id = NodeId([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16]);
        let hex = id.to_hex();
        assert_eq!(NodeId::from_hex(&hex), Some(id));
    }

    #[test]
    fn cost_sample_hysteresis() {
        let base = CostSample {
            node_id: NodeId([0; 16]),
            plugged_in: true,
            battery_percent: 80,
            cpu_load: 0.2,
            gpu_load: 0.0,
            memory_percent: 40,
            network_metered: false,
            sampled_at: 1_000,
        };
        let mut next = base;
        next.sampled_at = 1_010;
        assert!(!next.materially_changed_from(&base, 1_010));

        next.cpu_load = 0.35;
        assert!(next.materially_changed_from(&base, 1_010));

        let mut stale = base;
        stale.sampled_at = 1_000 + 301;
        assert!(stale.materially_changed_from(&base, 1_000 + 301));
    }

    #[test]
    fn capability_tombstone() {
        let mut rec = CapabilityRecord {
            capability_id: "c1".into(),
            owner_node_id: NodeId([0; 16]),
            type_tag: CapabilityType::Tool,
            description: "does things".into(),
            embedding: vec![0.0; EMBEDDING_DIM],
            tools: vec!["echo".into()],
            constraints: BTreeMap::new(),
            version: 1,
            updated_at: 0,
            signature: vec![],
        };
        assert!(!rec.is_tombstone());
        rec.version += 1;
        rec.tools.clear();
        rec.description.clear();
        assert!(rec.is_tombstone());
    }
}
