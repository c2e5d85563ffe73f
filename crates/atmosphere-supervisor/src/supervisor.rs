//! Connection supervision (§4.4): per-peer transport selection, the probe
//! loop, heartbeat bookkeeping, and session continuity across transport
//! switches.
//!
//! A `Scheduler` drives a bounded-concurrency probe loop over
//! `atmosphere-net::transport::TransportAdapter` for the actual I/O. The
//! per-peer state map is sharded 16 ways by `NodeId` hash (§5) since every
//! heartbeat and probe result touches it.

use crate::error::{Result, SupervisorError};
use crate::liveness::PeerEntry;
use crate::scheduler::Scheduler;
use atmosphere_core::crypto::{self, KeyPair};
use atmosphere_core::{
    AntiEntropyReq, AntiEntropyResp, GossipEnvelope, Heartbeat, IntentRequest, IntentResponse, NodeId, PeerState,
    RequestId, TransportKind, TransportSwitch,
};
use atmosphere_net::{Connection, Frame, FrameKind, PeerAddressBook, TransportAdapter, TransportEvent};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Bound on the queue of decoded events handed up to the runtime layer.
const SUPERVISOR_EVENT_QUEUE_DEPTH: usize = 256;

/// Frames decoded off an open connection that belong to the gossip and
/// intent-dispatch layers above this crate, routed onward rather than
/// handled here. Heartbeats never appear in this enum — they're consumed
/// directly by the per-connection demux task to update `PeerTable`.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Gossip { from: NodeId, via_transport: TransportKind, envelope: GossipEnvelope },
    AntiEntropyReq { from: NodeId, req: AntiEntropyReq },
    AntiEntropyResp { from: NodeId, resp: AntiEntropyResp },
    IntentRequest { from: NodeId, request: IntentRequest },
    IntentResponse { from: NodeId, response: IntentResponse },
}

/// Shared-state shard count (§5).
pub const SHARD_COUNT: usize = 16;
/// Per-transport probe deadline (§5).
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// A transport's probe result is trusted for this long when selecting the
/// active transport (§4.4).
pub const PROBE_FRESHNESS_WINDOW: Duration = Duration::from_secs(30);

fn shard_of(node_id: &NodeId) -> usize {
    let mut hasher = DefaultHasher::new();
    node_id.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

/// Sharded map of live peer bookkeeping. Each shard is an independent
/// `RwLock`, so concurrent heartbeats for distinct peers never contend.
pub struct PeerTable {
    shards: Vec<RwLock<HashMap<NodeId, PeerEntry>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    pub fn insert(&self, node_id: NodeId, public_key: [u8; 32]) {
        let shard = &self.shards[shard_of(&node_id)];
        shard
            .write()
            .entry(node_id)
            .or_insert_with(|| PeerEntry::new(PeerState::new(node_id, public_key)));
    }

    pub fn remove(&self, node_id: &NodeId) {
        self.shards[shard_of(node_id)].write().remove(node_id);
    }

    pub fn with_mut<R>(&self, node_id: &NodeId, f: impl FnOnce(&mut PeerEntry) -> R) -> Option<R> {
        self.shards[shard_of(node_id)].write().get_mut(node_id).map(f)
    }

    pub fn with<R>(&self, node_id: &NodeId, f: impl FnOnce(&PeerEntry) -> R) -> Option<R> {
        self.shards[shard_of(node_id)].read().get(node_id).map(f)
    }

    pub fn snapshot(&self, node_id: &NodeId) -> Option<PeerState> {
        self.with(node_id, |e| e.state.clone())
    }

    pub fn all_snapshots(&self) -> Vec<PeerState> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().values().map(|e| e.state.clone()).collect::<Vec<_>>())
            .collect()
    }

    /// Record an inbound heartbeat on `transport`, clearing missed-heartbeat
    /// state and reviving the peer out of Suspect if it was the active
    /// transport (§4.10). A no-op for peers we've never registered.
    pub fn record_heartbeat(&self, from: &NodeId, transport: TransportKind) {
        self.with_mut(from, |e| e.record_heartbeat_recv(transport, Instant::now()));
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Supervises every known peer's connections: probes reachable transports,
/// picks the best one, switches without tearing down the others, and
/// replays in-flight requests across a switch.
pub struct ConnectionSupervisor {
    local_node_id: NodeId,
    keypair: Arc<KeyPair>,
    transports: HashMap<TransportKind, Arc<dyn TransportAdapter>>,
    books: RwLock<HashMap<NodeId, PeerAddressBook>>,
    peers: Arc<PeerTable>,
    scheduler: Scheduler,
    connections: RwLock<HashMap<(NodeId, TransportKind), Arc<Connection>>>,
    pending: RwLock<HashMap<(NodeId, RequestId), Frame>>,
    heartbeat_sequence: AtomicU64,
    events_tx: mpsc::Sender<SupervisorEvent>,
}

impl ConnectionSupervisor {
    /// Builds the supervisor along with the receiving half of its
    /// gossip/intent event channel. The receiver is meant to be drained by
    /// exactly one long-lived consumer task in the runtime layer.
    pub fn new(
        local_node_id: NodeId,
        keypair: Arc<KeyPair>,
        transports: HashMap<TransportKind, Arc<dyn TransportAdapter>>,
    ) -> (Self, mpsc::Receiver<SupervisorEvent>) {
        let (events_tx, events_rx) = mpsc::channel(SUPERVISOR_EVENT_QUEUE_DEPTH);
        let supervisor = Self {
            local_node_id,
            keypair,
            transports,
            books: RwLock::new(HashMap::new()),
            peers: Arc::new(PeerTable::new()),
            scheduler: Scheduler::new(1000),
            connections: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            heartbeat_sequence: AtomicU64::new(0),
            events_tx,
        };
        (supervisor, events_rx)
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    /// Learn a peer's dialing information and start tracking it.
    pub fn register_peer(&self, book: PeerAddressBook) {
        self.peers.insert(book.node_id, book.public_key);
        self.scheduler.register_peer(book.node_id);
        self.books.write().insert(book.node_id, book);
    }

    pub fn forget_peer(&self, node_id: &NodeId) {
        self.peers.remove(node_id);
        self.scheduler.remove_peer(node_id);
        self.books.write().remove(node_id);
        self.connections.write().retain(|(peer, _), _| peer != node_id);
    }

    /// Probe every transport we have an endpoint for, recording success
    /// timestamps used by transport selection. Each probe is bounded by
    /// `PROBE_TIMEOUT` (§5).
    pub async fn probe_peer(&self, node_id: NodeId) -> Result<()> {
        let book = self
            .books
            .read()
            .get(&node_id)
            .cloned()
            .ok_or(SupervisorError::UnknownPeer(node_id))?;

        let mut any_ok = false;
        for endpoint in book.dial_order() {
            let Some(adapter) = self.transports.get(&endpoint.transport_kind()) else {
                continue;
            };
            let outcome = tokio::time::timeout(PROBE_TIMEOUT, adapter.probe(endpoint)).await;
            match outcome {
                Ok(Ok(_rtt)) => {
                    any_ok = true;
                    let now = Instant::now();
                    self.peers.with_mut(&node_id, |e| e.record_probe_success(endpoint.transport_kind(), now));
                }
                Ok(Err(e)) => debug!(peer = %node_id, transport = %endpoint.transport_kind(), error = %e, "probe failed"),
                Err(_) => debug!(peer = %node_id, transport = %endpoint.transport_kind(), "probe timed out"),
            }
        }

        self.scheduler.report_result(&node_id, any_ok);
        self.ensure_best_transport(node_id).await?;
        Ok(())
    }

    /// Pick the highest-priority transport with a fresh successful probe and
    /// switch to it if it differs from the currently active one (§4.4).
    /// Other open connections are left standing.
    async fn ensure_best_transport(&self, node_id: NodeId) -> Result<()> {
        let now = Instant::now();
        let best = self
            .peers
            .with(&node_id, |e| e.freshest_transport(now, PROBE_FRESHNESS_WINDOW))
            .flatten();

        let Some(best) = best else {
            self.peers.with_mut(&node_id, |e| e.note_reconnect_failure(now));
            self.scheduler.set_connected(&node_id, false);
            return Err(SupervisorError::AllTransportsFailed(node_id));
        };

        let current = self.peers.with(&node_id, |e| e.state.active_transport).flatten();
        if current == Some(best) {
            return Ok(());
        }

        self.open_connection(node_id, best).await?;

        let switch = crypto::sign_transport_switch(
            TransportSwitch {
                old_transport: current,
                new_transport: best,
                signature: Vec::new(),
            },
            &self.keypair,
        )?;

        self.peers.with_mut(&node_id, |e| {
            e.state.active_transport = Some(best);
            e.reset_backoff();
        });
        self.scheduler.set_connected(&node_id, true);

        info!(peer = %node_id, old = ?switch.old_transport, new = %switch.new_transport, "switched active transport");
        self.replay_pending(node_id, best).await?;
        Ok(())
    }

    /// Sink for connections accepted out-of-band (the LAN accept loop),
    /// demuxed through the same path as connections this supervisor opens
    /// itself.
    pub fn inbound_event_sink(&self) -> mpsc::Sender<TransportEvent> {
        let (tx, rx) = mpsc::channel(64);
        self.spawn_event_demux(rx);
        tx
    }

    async fn open_connection(&self, node_id: NodeId, transport: TransportKind) -> Result<()> {
        if self.connections.read().contains_key(&(node_id, transport)) {
            return Ok(());
        }
        let book = self
            .books
            .read()
            .get(&node_id)
            .cloned()
            .ok_or(SupervisorError::UnknownPeer(node_id))?;
        let adapter = self
            .transports
            .get(&transport)
            .ok_or(SupervisorError::AllTransportsFailed(node_id))?;

        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(64);
        let connection = adapter.open(&book, event_tx).await?;
        self.connections.write().insert((node_id, transport), connection);
        self.spawn_event_demux(event_rx);
        Ok(())
    }

    /// Drains one connection's `TransportEvent`s for as long as it lives:
    /// heartbeats update `PeerTable` directly, everything else is decoded
    /// by `FrameKind` and forwarded on `events_tx` for the runtime layer to
    /// route into the gossip engine and `IntentWaiters`.
    fn spawn_event_demux(&self, mut event_rx: mpsc::Receiver<TransportEvent>) {
        let peers = self.peers.clone();
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    TransportEvent::PeerConnected { .. } | TransportEvent::PeerDisconnected { .. } => {}
                    TransportEvent::FrameReceived { from, transport, frame } => match frame.kind {
                        FrameKind::Heartbeat => {
                            peers.record_heartbeat(&from, transport);
                        }
                        FrameKind::GossipEnvelope | FrameKind::Revocation => {
                            match frame.decode::<GossipEnvelope>() {
                                Ok(envelope) => {
                                    let _ = events_tx.try_send(SupervisorEvent::Gossip {
                                        from,
                                        via_transport: transport,
                                        envelope,
                                    });
                                }
                                Err(e) => debug!(peer = %from, error = %e, "dropped malformed gossip envelope"),
                            }
                        }
                        FrameKind::AntiEntropyReq => match frame.decode::<AntiEntropyReq>() {
                            Ok(req) => {
                                let _ = events_tx.try_send(SupervisorEvent::AntiEntropyReq { from, req });
                            }
                            Err(e) => debug!(peer = %from, error = %e, "dropped malformed anti-entropy request"),
                        },
                        FrameKind::AntiEntropyResp => match frame.decode::<AntiEntropyResp>() {
                            Ok(resp) => {
                                let _ = events_tx.try_send(SupervisorEvent::AntiEntropyResp { from, resp });
                            }
                            Err(e) => debug!(peer = %from, error = %e, "dropped malformed anti-entropy response"),
                        },
                        FrameKind::IntentRequest => match frame.decode::<IntentRequest>() {
                            Ok(request) => {
                                let _ = events_tx.try_send(SupervisorEvent::IntentRequest { from, request });
                            }
                            Err(e) => debug!(peer = %from, error = %e, "dropped malformed intent request"),
                        },
                        FrameKind::IntentResponse => match frame.decode::<IntentResponse>() {
                            Ok(response) => {
                                let _ = events_tx.try_send(SupervisorEvent::IntentResponse { from, response });
                            }
                            Err(e) => debug!(peer = %from, error = %e, "dropped malformed intent response"),
                        },
                        FrameKind::Handshake | FrameKind::HandshakeAck | FrameKind::TransportSwitch => {}
                    },
                }
            }
        });
    }

    /// Send a frame to a peer over its currently active transport, queuing
    /// it for replay (keyed by request id, deduped) so a later transport
    /// switch can resend anything still in flight.
    pub async fn send(&self, node_id: NodeId, request_id: RequestId, frame: Frame) -> Result<()> {
        let active = self.peers.with(&node_id, |e| e.state.active_transport).flatten();
        let Some(active) = active else {
            return Err(SupervisorError::AllTransportsFailed(node_id));
        };
        self.pending.write().insert((node_id, request_id), frame.clone());

        let connections = self.connections.read();
        let conn = connections
            .get(&(node_id, active))
            .ok_or(SupervisorError::AllTransportsFailed(node_id))?;
        conn.send(frame).await?;
        Ok(())
    }

    /// Drop a request from the replay set once its response arrives.
    pub fn complete(&self, node_id: NodeId, request_id: RequestId) {
        self.pending.write().remove(&(node_id, request_id));
    }

    async fn replay_pending(&self, node_id: NodeId, transport: TransportKind) -> Result<()> {
        let frames: Vec<Frame> = self
            .pending
            .read()
            .iter()
            .filter(|((peer, _), _)| *peer == node_id)
            .map(|(_, frame)| frame.clone())
            .collect();

        if frames.is_empty() {
            return Ok(());
        }
        let connections = self.connections.read();
        let Some(conn) = connections.get(&(node_id, transport)) else {
            return Ok(());
        };
        for frame in frames {
            let _ = conn.send(frame).await;
        }
        Ok(())
    }

    /// Build and send a signed heartbeat on the peer's active transport.
    pub async fn send_heartbeat(&self, node_id: NodeId, cost_multiplier: f64, peer_count: u32) -> Result<()> {
        let active = self.peers.with(&node_id, |e| e.state.active_transport).flatten();
        let Some(active) = active else {
            return Err(SupervisorError::AllTransportsFailed(node_id));
        };

        let sequence = self.heartbeat_sequence.fetch_add(1, Ordering::Relaxed);
        let heartbeat = crypto::sign_heartbeat(
            Heartbeat {
                node_id: self.local_node_id,
                transport: active,
                sequence,
                cost_multiplier,
                peer_count,
                signature: Vec::new(),
            },
            &self.keypair,
        )?;

        let frame = Frame::encode(FrameKind::Heartbeat, &heartbeat)
            .map_err(atmosphere_net::TransportError::Frame)?;

        self.peers.with_mut(&node_id, |e| e.record_heartbeat_sent(active, Instant::now()));

        let connections = self.connections.read();
        let conn = connections
            .get(&(node_id, active))
            .ok_or(SupervisorError::AllTransportsFailed(node_id))?;
        conn.send(frame).await?;
        Ok(())
    }

    /// Sweep every known peer's active transport for missed heartbeats,
    /// advancing Suspect/Dead transitions (§4.4, §4.10). Call on a timer
    /// alongside the probe loop.
    pub fn check_liveness(&self) {
        let now = Instant::now();
        for node_id in self.books.read().keys().copied().collect::<Vec<_>>() {
            let active = self.peers.with(&node_id, |e| e.state.active_transport).flatten();
            if let Some(transport) = active {
                let dead = self
                    .peers
                    .with_mut(&node_id, |e| {
                        e.check_timeout(transport, now);
                        e.state.liveness == atmosphere_core::LivenessState::Dead
                    })
                    .unwrap_or(false);
                if dead {
                    warn!(peer = %node_id, "peer declared dead, evicting routes");
                    self.connections.write().retain(|(peer, _), _| *peer != node_id);
                }
            }
        }
    }

    /// One tick of the supervised probe loop: schedule anything due, then
    /// drain and execute the scheduler's ready queue.
    pub async fn tick(&self, max_concurrent: usize) {
        self.scheduler.schedule_due_probes(max_concurrent);
        for _ in 0..max_concurrent {
            let Some(probe) = self.scheduler.next_probe() else { break };
            if let Err(e) = self.probe_peer(probe.peer).await {
                debug!(peer = %probe.peer, error = %e, "probe cycle failed");
            }
        }
        self.check_liveness();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use atmosphere_core::Endpoint;
    use atmosphere_net::{TransportError, TransportEvent};
    use std::sync::atomic::AtomicBool;

    struct MockAdapter {
        kind: TransportKind,
        healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TransportAdapter for MockAdapter {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        async fn probe(&self, _endpoint: &Endpoint) -> std::result::Result<Duration, TransportError> {
            if self.healthy.load(Ordering::Relaxed) {
                Ok(Duration::from_millis(5))
            } else {
                Err(TransportError::ConnectionClosed)
            }
        }

        async fn open(
            &self,
            peer: &PeerAddressBook,
            _event_tx: mpsc::Sender<TransportEvent>,
        ) -> std::result::Result<Arc<Connection>, TransportError> {
            let (tx, _rx) = mpsc::channel(8);
            Ok(Connection::for_testing(peer.node_id, self.kind, tx))
        }
    }

    fn supervisor_with(kind: TransportKind, healthy: bool) -> (ConnectionSupervisor, NodeId) {
        let keypair = Arc::new(KeyPair::generate());
        let mut transports: HashMap<TransportKind, Arc<dyn TransportAdapter>> = HashMap::new();
        transports.insert(
            kind,
            Arc::new(MockAdapter {
                kind,
                healthy: Arc::new(AtomicBool::new(healthy)),
            }),
        );
        let (supervisor, _events) = ConnectionSupervisor::new(NodeId([0; 16]), keypair, transports);

        let peer_id = NodeId([9; 16]);
        let mut book = PeerAddressBook::new(peer_id, [1; 32]);
        book.add_endpoint(match kind {
            TransportKind::Lan => Endpoint::Lan { host: "10.0.0.1".into(), port: 1 },
            TransportKind::Relay => Endpoint::Relay { url: "wss://r".into(), session_id: "s".into() },
            TransportKind::Ble => Endpoint::Ble { mac: "aa:bb".into() },
            TransportKind::Udp => Endpoint::Public { host: "1.2.3.4".into(), port: 1 },
        });
        supervisor.register_peer(book);
        (supervisor, peer_id)
    }

    #[tokio::test]
    async fn successful_probe_selects_active_transport() {
        let (supervisor, peer_id) = supervisor_with(TransportKind::Lan, true);
        supervisor.probe_peer(peer_id).await.unwrap();
        let state = supervisor.peers().snapshot(&peer_id).unwrap();
        assert_eq!(state.active_transport, Some(TransportKind::Lan));
    }

    #[tokio::test]
    async fn failed_probe_yields_all_transports_failed() {
        let (supervisor, peer_id) = supervisor_with(TransportKind::Lan, false);
        let err = supervisor.probe_peer(peer_id).await.unwrap_err();
        assert!(matches!(err, SupervisorError::AllTransportsFailed(_)));
    }

    #[test]
    fn peer_table_shards_are_independent() {
        let table = PeerTable::new();
        table.insert(NodeId([1; 16]), [1; 32]);
        table.insert(NodeId([2; 16]), [2; 32]);
        assert_eq!(table.all_snapshots().len(), 2);
        table.remove(&NodeId([1; 16]));
        assert_eq!(table.all_snapshots().len(), 1);
    }
}
