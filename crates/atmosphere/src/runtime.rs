//! Wires the per-concern crates into one running node (§9: a single
//! `Runtime` instead of several independently-run daemons).
//!
//! Components are built in dependency order: identity first, then the
//! gossip/router/supervisor pieces that need it, then the maintenance
//! loop that ties them together.

use crate::config::Config;
use crate::store::MeshStore;
use anyhow::{bail, Context, Result};
use atmosphere_core::crypto::KeyPair;
use atmosphere_core::{
    CapabilityType, Endpoint, GossipEnvelope, InviteToken, MeshId, NodeId, RecordKind, SavedMesh, TransportKind,
};
use atmosphere_gossip::{GossipEngine, Store as GossipStore, TrustState};
use atmosphere_net::{Frame, FrameKind, LanAdapter, PeerAddressBook, RelayAdapter, TransportAdapter, UdpAdapter};
use atmosphere_router::{CapabilityRegistry, HashEmbedder, LocalCapabilityManager, Router, RouteTable};
use atmosphere_supervisor::{ConnectionSupervisor, SupervisorEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

mod dispatch;
mod load;

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Everything one running Atmosphere node owns. Built once by [`bootstrap`]
/// and shared (via `Arc`) between the CLI handlers and the maintenance
/// tasks spawned by `serve`.
pub struct Runtime {
    pub config: Config,
    pub keypair: Arc<KeyPair>,
    pub node_id: NodeId,
    pub meshes: Mutex<MeshStore>,
    pub gossip: Arc<GossipEngine>,
    pub trust: Arc<TrustState>,
    pub supervisor: Arc<ConnectionSupervisor>,
    pub router: Arc<Router>,
    pub capabilities: Arc<LocalCapabilityManager>,
    waiters: Arc<dispatch::IntentWaiters>,
    events_rx: Mutex<Option<mpsc::Receiver<SupervisorEvent>>>,
}

impl Runtime {
    /// Loads identity and saved-mesh state, opens the gossip store, and
    /// wires up the transports named in `config`. Does not start any
    /// background task or bind a listener — that's `serve`'s job, so `join`
    /// /`invite`/`peers`/`status` can reuse this without opening sockets.
    pub async fn bootstrap(config: Config) -> Result<Arc<Runtime>> {
        config.validate()?;
        std::fs::create_dir_all(config.home_dir())
            .with_context(|| format!("creating {}", config.home_dir().display()))?;

        let keypair = Arc::new(crate::config::load_or_create_identity(&config.identity_key_path())?);
        let node_id = keypair.node_id();
        info!(node_id = %node_id, "identity loaded");

        let meshes = MeshStore::open(config.meshes_path()).context("opening saved-mesh store")?;

        let gossip_store = GossipStore::open(config.gossip_db_path()).context("opening gossip store")?;
        let gossip = Arc::new(GossipEngine::new(Arc::new(gossip_store)));
        let trust = Arc::new(TrustState::new(config.rate_limit_rpm));

        let transports = build_transports(config.port).await?;
        let (supervisor, events_rx) = ConnectionSupervisor::new(node_id, keypair.clone(), transports);
        let supervisor = Arc::new(supervisor);

        let registry = Arc::new(CapabilityRegistry::new());
        load_persisted_capabilities(&registry, &config.capabilities_path());
        let table = RouteTable::new();
        let embedder: Arc<dyn atmosphere_router::Embedder> = Arc::new(HashEmbedder);
        let capabilities = Arc::new(LocalCapabilityManager::new(node_id, keypair.clone(), embedder.clone()));

        let dispatcher = Arc::new(dispatch::SupervisorDispatcher::new(supervisor.clone()));
        let waiters = dispatcher.waiters();
        let loads = Arc::new(load::SupervisorLoadSource::new(supervisor.clone(), node_id, registry.clone()));
        let router = Arc::new(Router::new(node_id, registry, table, embedder, dispatcher, loads));

        Ok(Arc::new(Runtime {
            config,
            keypair,
            node_id,
            meshes: Mutex::new(meshes),
            gossip,
            trust,
            supervisor,
            router,
            capabilities,
            waiters,
            events_rx: Mutex::new(Some(events_rx)),
        }))
    }

    /// Hands the supervisor's decoded-event receiver to `serve`'s event
    /// loop. Returns `None` on a second call — there's only ever one
    /// consumer task.
    pub fn take_event_receiver(&self) -> Option<mpsc::Receiver<SupervisorEvent>> {
        self.events_rx.lock().take()
    }

    /// Completes the matching in-flight `dispatch` call once an
    /// `IntentResponse` frame arrives (§4.8 step 7).
    pub fn complete_intent_response(&self, response: atmosphere_core::IntentResponse) {
        self.waiters.complete(response);
    }

    /// §4.9: kick off a join attempt for every auto-reconnecting saved mesh
    /// that isn't already active, most-recently-connected first.
    pub fn reconnect_saved_meshes(&self) {
        let candidates: Vec<SavedMesh> = self.meshes.lock().auto_reconnect_candidates().into_iter().cloned().collect();
        for mesh in candidates {
            info!(mesh_id = %mesh.mesh_id, mesh_name = %mesh.mesh_name, "reconnecting saved mesh");
            for endpoint in &mesh.endpoints {
                self.supervisor.register_peer(peer_book_for_founder(&mesh, endpoint.clone()));
            }
        }
    }

    /// Processes an invite token: verifies it, then persists the mesh as
    /// joined (§4.1, §4.9). Returns the mesh id on success.
    pub fn join(&self, token: &InviteToken) -> Result<MeshId> {
        let now = now_unix();
        atmosphere_core::crypto::verify_invite(token, now).context("invite token rejected")?;

        let mesh = SavedMesh {
            mesh_id: token.mesh_id,
            mesh_name: format!("mesh-{}", token.mesh_id.to_hex()),
            mesh_public_key: token.mesh_public_key,
            founder_node_id: token.issuer_node_id,
            relay_token: None,
            endpoints: token.endpoints.clone(),
            joined_at: now,
            last_connected: Some(now),
            auto_reconnect: true,
        };

        for endpoint in &mesh.endpoints {
            self.supervisor.register_peer(peer_book_for_founder(&mesh, endpoint.clone()));
        }

        self.meshes.lock().upsert(mesh.clone())?;
        self.meshes.lock().activate(mesh.mesh_id)?;
        Ok(mesh.mesh_id)
    }

    /// Issues an invite token for the active mesh. Only the mesh founder's
    /// key can sign one (§3) — in Atmosphere's single-key model that's
    /// whichever node created the mesh, so this only succeeds when the
    /// active mesh's `founder_node_id` is this node's own id.
    pub fn invite(&self, ttl_hours: u64) -> Result<InviteToken> {
        let meshes = self.meshes.lock();
        let active = match meshes.active() {
            Some(mesh) => mesh.clone(),
            None => bail!("no active mesh; run `serve` once to create one, or `join` an existing mesh first"),
        };
        drop(meshes);

        if active.founder_node_id != self.node_id {
            bail!("only the mesh founder can issue invites for mesh {}", active.mesh_id);
        }

        let now = now_unix();
        let unsigned = InviteToken {
            mesh_id: active.mesh_id,
            mesh_public_key: active.mesh_public_key,
            issuer_node_id: self.node_id,
            capabilities_granted: vec![],
            endpoints: active.endpoints.clone(),
            created_at: now,
            expires_at: now + ttl_hours.saturating_mul(3600),
            signature: Vec::new(),
        };
        let token = atmosphere_core::crypto::create_invite(unsigned, &self.keypair)?;
        Ok(token)
    }

    /// If this node has no active mesh yet, create one with itself as
    /// founder (§9's resolved open question: the mesh key *is* the node's
    /// own identity key — no separate mesh keypair file to manage).
    pub fn ensure_mesh(&self) -> Result<MeshId> {
        let mut meshes = self.meshes.lock();
        if let Some(active) = meshes.active() {
            return Ok(active.mesh_id);
        }
        let mesh_id = MeshId::generate();
        let now = now_unix();
        let mesh = SavedMesh {
            mesh_id,
            mesh_name: format!("mesh-{}", mesh_id.to_hex()),
            mesh_public_key: self.keypair.public_key(),
            founder_node_id: self.node_id,
            relay_token: None,
            endpoints: vec![Endpoint::Lan { host: "0.0.0.0".into(), port: self.config.port }],
            joined_at: now,
            last_connected: Some(now),
            auto_reconnect: true,
        };
        meshes.upsert(mesh.clone())?;
        meshes.activate(mesh_id)?;
        info!(mesh_id = %mesh_id, "founded new mesh");
        Ok(mesh_id)
    }

    pub fn peer_snapshot(&self) -> Vec<atmosphere_core::PeerState> {
        self.supervisor.peers().all_snapshots()
    }

    pub fn capability_snapshot(&self) -> Arc<HashMap<String, atmosphere_router::CapabilityEntry>> {
        self.router.registry().snapshot_capabilities()
    }

    /// Persists the local capability set to `capabilities.cbor` (§6), so a
    /// restart doesn't have to wait on gossip to relearn what this node
    /// itself advertises.
    pub fn persist_capabilities(&self) -> Result<()> {
        let snapshot = self.capability_snapshot();
        let records: Vec<_> = snapshot.values().map(|e| e.record.clone()).collect();
        let mut buf = Vec::new();
        ciborium::into_writer(&records, &mut buf).context("encoding capabilities.cbor")?;
        let path = self.config.capabilities_path();
        let tmp = path.with_extension("cbor.tmp");
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Publishes a local capability: signs it, registers it locally, and
    /// hands it to the gossip engine to propagate (§4.6).
    pub fn register_capability(
        &self,
        capability_id: String,
        type_tag: CapabilityType,
        description: String,
        tools: Vec<String>,
    ) -> Result<()> {
        let record = self.capabilities.register_capability(
            capability_id.clone(),
            type_tag,
            description,
            tools,
            Default::default(),
            now_unix(),
        );
        self.router.registry().upsert_capability(record.clone());
        // Seed the local node as its own next hop (§4.8 step 6's "executes
        // locally" branch needs an entry in the table, not just the
        // registry, for `ranked_candidates` to ever surface it).
        self.router.table().observe(
            &capability_id,
            self.node_id,
            TransportKind::Lan,
            0,
            0.0,
            0.0,
            1.0,
            now_unix(),
        );
        if let Err(err) = self.gossip_capability(&record) {
            warn!(%err, "failed to hand local capability to gossip engine");
        }
        Ok(())
    }

    /// Wraps a freshly-registered capability in a signed `GossipEnvelope`,
    /// applies it to this node's own gossip store, and pushes it directly to
    /// a fanout of currently-connected peers (§4.5, §4.6) so it doesn't have
    /// to wait on the next anti-entropy round to start spreading.
    fn gossip_capability(&self, record: &atmosphere_core::CapabilityRecord) -> Result<()> {
        let record_bytes = atmosphere_core::canonical::canonical_bytes(record)?;
        let origin_signature = self.keypair.sign(&record_bytes);
        let known_peers = self.peer_snapshot().len();
        let envelope = GossipEnvelope {
            record_kind: RecordKind::Capability,
            record_bytes,
            origin_node_id: self.node_id,
            origin_version: record.version,
            ttl_hops: GossipEngine::initial_ttl_hops(known_peers),
            origin_signature,
            witness_signatures: Vec::new(),
        };
        self.gossip
            .ingest(envelope.clone(), Some(&self.keypair.public_key()), now_unix())
            .context("ingesting locally-originated capability envelope")?;
        self.push_gossip_envelope(envelope);
        Ok(())
    }

    /// Best-effort push of an envelope to up to `FANOUT` connected peers;
    /// the periodic anti-entropy round in `main.rs` is what makes delivery
    /// eventually-consistent even if every push here is dropped.
    fn push_gossip_envelope(&self, envelope: GossipEnvelope) {
        let frame = match Frame::encode(FrameKind::GossipEnvelope, &envelope) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "failed to encode gossip envelope for push");
                return;
            }
        };

        let targets: Vec<NodeId> = self
            .peer_snapshot()
            .into_iter()
            .filter(|peer| peer.active_transport.is_some())
            .map(|peer| peer.node_id)
            .take(atmosphere_gossip::engine::FANOUT)
            .collect();

        for node_id in targets {
            let frame = frame.clone();
            let supervisor = self.supervisor.clone();
            tokio::spawn(async move {
                if let Err(err) = supervisor
                    .send(node_id, atmosphere_core::RequestId::generate(), frame)
                    .await
                {
                    debug!(%err, peer = %node_id, "gossip push failed");
                }
            });
        }
    }
}

/// Repopulates the registry from the last-known local capability set
/// (§6's `capabilities.cbor`), so `atmosphere network` reflects what this
/// node advertised before restart without waiting on gossip. Missing or
/// unreadable cache is not fatal — a fresh `ATMOSPHERE_HOME` just starts empty.
fn load_persisted_capabilities(registry: &CapabilityRegistry, path: &std::path::Path) {
    let Ok(bytes) = std::fs::read(path) else { return };
    match ciborium::from_reader::<Vec<atmosphere_core::CapabilityRecord>, _>(bytes.as_slice()) {
        Ok(records) => {
            for record in records {
                registry.upsert_capability(record);
            }
        }
        Err(err) => warn!(%err, ?path, "failed to decode capabilities.cbor, starting empty"),
    }
}

fn peer_book_for_founder(mesh: &SavedMesh, endpoint: Endpoint) -> PeerAddressBook {
    let mut book = PeerAddressBook::new(mesh.founder_node_id, mesh.mesh_public_key);
    book.add_endpoint(endpoint);
    book
}

async fn build_transports(port: u16) -> Result<HashMap<TransportKind, Arc<dyn TransportAdapter>>> {
    let mut transports: HashMap<TransportKind, Arc<dyn TransportAdapter>> = HashMap::new();
    transports.insert(TransportKind::Lan, Arc::new(LanAdapter));
    transports.insert(TransportKind::Relay, Arc::new(RelayAdapter));

    let socket = UdpSocket::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding UDP socket on port {port}"))?;
    transports.insert(TransportKind::Udp, Arc::new(UdpAdapter::new(Arc::new(socket))));

    Ok(transports)
}
