//! Intent router: the full candidate-selection-and-dispatch pipeline (§4.8).
//!
//! Registry + route table + scorer wired together behind `route()`/
//! `report_*`, running the 8-step candidate-selection pipeline and
//! dispatching over a real intent-request/response wire message.

use crate::registry::CapabilityRegistry;
use crate::scoring::{self, Candidate, CandidateLoad, Constraints, SIMILARITY_THRESHOLD};
use crate::table::RouteTable;
use crate::{Result, RouterError};
use async_trait::async_trait;
use atmosphere_core::{IntentRequest, IntentResponse, IntentStatus, NodeId, RequestId, RouteConstraints};
use std::collections::BTreeMap;
use std::time::Duration;

/// How the router reaches a chosen peer: send a heartbeat to confirm the
/// transport is alive, then dispatch the signed intent and await the
/// matching response. Implemented one layer up (`atmosphere-supervisor`,
/// wired by the `atmosphere` runtime) against the live connection pool;
/// this crate only depends on the shape.
#[async_trait]
pub trait IntentDispatcher: Send + Sync {
    /// Confirm the transport to `node_id` is healthy within `timeout`
    /// (§4.8: "a heartbeat is sent synchronously before dispatch").
    async fn heartbeat_check(&self, node_id: NodeId, timeout: Duration) -> Result<()>;

    /// Send a signed intent request to `node_id` and await its response,
    /// bounded by the time remaining until `deadline` (unix millis).
    async fn dispatch(&self, node_id: NodeId, request: IntentRequest, deadline: u64) -> Result<IntentResponse>;
}

/// Per-candidate load context the router needs at query time but doesn't
/// own the source of truth for (queue depth, cpu load, liveness, gpu).
/// Supplied by the caller, typically sourced from `atmosphere-supervisor`'s
/// PeerState map.
pub trait LoadSource: Send + Sync {
    fn load_for(&self, node_id: NodeId) -> CandidateLoad;
}

const MAX_DISTINCT_RETRIES: usize = 3;
const HEARTBEAT_CHECK_TIMEOUT_MS: u64 = 500;

/// One attempted node in a dispatch chain, kept for the caller-visible
/// failure report (§7: "the chain of attempted nodes with per-attempt errors").
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub node_id: NodeId,
    pub error: String,
}

/// Successful dispatch result.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub node_id: NodeId,
    pub response: IntentResponse,
    pub attempts: Vec<AttemptOutcome>,
}

/// One intent's outcome within a `route_all` batch: independent of the
/// other intents in the batch (§7: "per-intent outcomes on partial success").
pub enum BatchOutcome {
    Dispatched(RouteOutcome),
    Failed { intent: String, error: RouterError },
}

pub struct Router {
    local_node_id: NodeId,
    registry: std::sync::Arc<CapabilityRegistry>,
    table: RouteTable,
    embedder: std::sync::Arc<dyn crate::registry::Embedder>,
    dispatcher: std::sync::Arc<dyn IntentDispatcher>,
    loads: std::sync::Arc<dyn LoadSource>,
}

impl Router {
    pub fn new(
        local_node_id: NodeId,
        registry: std::sync::Arc<CapabilityRegistry>,
        table: RouteTable,
        embedder: std::sync::Arc<dyn crate::registry::Embedder>,
        dispatcher: std::sync::Arc<dyn IntentDispatcher>,
        loads: std::sync::Arc<dyn LoadSource>,
    ) -> Self {
        Self {
            local_node_id,
            registry,
            table,
            embedder,
            dispatcher,
            loads,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Serves an `IntentRequest` that arrived over the wire because some
    /// other node's `route()` picked this one: matches it against only the
    /// capabilities this node itself owns, rather than the full routing
    /// table, since there's no next hop left to forward to.
    pub fn handle_inbound_intent(&self, request: &IntentRequest) -> IntentResponse {
        let embedding = self.embedder.embed(&request.intent);
        let capabilities = self.registry.snapshot_capabilities();
        let best = capabilities
            .values()
            .filter(|entry| !entry.record.is_tombstone())
            .map(|entry| (entry, scoring::cosine_similarity(&embedding, &entry.record.embedding)))
            .filter(|(_, similarity)| *similarity >= SIMILARITY_THRESHOLD)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((entry, _)) => self.dispatch_local(&entry.record.capability_id, request.request_id),
            None => IntentResponse {
                request_id: request.request_id,
                status: IntentStatus::UnknownCapability,
                result: None,
                error: Some("no locally registered capability matches this intent".into()),
                signature: Vec::new(),
            },
        }
    }

    /// Steps 1-5: embed the intent, gather every RouteEntry across every
    /// known capability, filter by similarity/liveness/constraints, score,
    /// and sort descending. Delegates the filter/constrain/score pipeline
    /// to `scoring::rank` rather than reimplementing it, since `RouteEntry`
    /// already carries its own `capability_id`.
    fn ranked_candidates(&self, intent_text: &str, constraints: &Constraints) -> Vec<(Candidate, f64)> {
        let embedding = self.embedder.embed(intent_text);
        let capabilities = self.registry.snapshot_capabilities();

        let mut candidates = Vec::new();
        for (capability_id, entry) in capabilities.iter() {
            let similarity = scoring::cosine_similarity(&embedding, &entry.record.embedding);
            if similarity < SIMILARITY_THRESHOLD {
                continue;
            }
            for route_entry in self.table.entries_for(capability_id) {
                let load = self.loads.load_for(route_entry.next_hop_node_id);
                candidates.push(Candidate {
                    entry: route_entry,
                    similarity,
                    load,
                });
            }
        }

        scoring::rank(candidates, constraints, self.local_node_id)
    }

    /// §4.8 step 6's "or executes locally": the winning candidate is this
    /// node itself, so the capability is served straight out of the
    /// registry rather than round-tripping an `IntentRequest` over the wire.
    fn dispatch_local(&self, capability_id: &str, request_id: RequestId) -> IntentResponse {
        let capabilities = self.registry.snapshot_capabilities();
        match capabilities.get(capability_id) {
            Some(entry) if !entry.record.is_tombstone() => IntentResponse {
                request_id,
                status: IntentStatus::Ok,
                result: None,
                error: None,
                signature: Vec::new(),
            },
            _ => IntentResponse {
                request_id,
                status: IntentStatus::UnknownCapability,
                result: None,
                error: Some(format!("capability {capability_id} not locally registered")),
                signature: Vec::new(),
            },
        }
    }

    /// §4.8, all eight steps, for a single intent.
    pub async fn route(
        &self,
        intent: String,
        context: BTreeMap<String, String>,
        constraints: Constraints,
        deadline: u64,
        now_ms: u64,
    ) -> Result<RouteOutcome> {
        let wire_constraints = RouteConstraints {
            local_only: constraints.local_only,
            require_gpu: constraints.require_gpu,
            max_latency_ms: constraints.max_latency_ms,
            exclude_nodes: constraints.exclude_nodes.clone(),
            max_hops: constraints.max_hops,
        };

        let ranked = self.ranked_candidates(&intent, &constraints);
        if ranked.is_empty() {
            return Err(RouterError::NoCapableNode);
        }

        let mut attempts = Vec::new();
        let mut tried_nodes = std::collections::HashSet::new();

        for (candidate, _score) in ranked {
            let capability_id = candidate.entry.capability_id.clone();
            if attempts.len() >= MAX_DISTINCT_RETRIES {
                break;
            }
            let node_id = candidate.entry.next_hop_node_id;
            if !tried_nodes.insert(node_id) {
                continue;
            }
            if now_ms >= deadline {
                break;
            }

            if node_id == self.local_node_id {
                let response = self.dispatch_local(&capability_id, RequestId::generate());
                let success = matches!(response.status, IntentStatus::Ok);
                self.table.record_dispatch_outcome(&capability_id, node_id, success, now_ms / 1000);
                match response.status {
                    IntentStatus::Ok => {
                        return Ok(RouteOutcome {
                            node_id,
                            response,
                            attempts,
                        });
                    }
                    IntentStatus::UnknownCapability => {
                        self.table.evict_capability_owner(&capability_id, node_id);
                        attempts.push(AttemptOutcome {
                            node_id,
                            error: "unknown capability".into(),
                        });
                        continue;
                    }
                    IntentStatus::Busy | IntentStatus::Error => {
                        attempts.push(AttemptOutcome {
                            node_id,
                            error: response.error.clone().unwrap_or_default(),
                        });
                        continue;
                    }
                }
            }

            if self
                .dispatcher
                .heartbeat_check(node_id, Duration::from_millis(HEARTBEAT_CHECK_TIMEOUT_MS))
                .await
                .is_err()
            {
                self.table.evict_capability_owner(&capability_id, node_id);
                attempts.push(AttemptOutcome {
                    node_id,
                    error: "heartbeat check failed".into(),
                });
                continue;
            }

            let request = IntentRequest {
                request_id: RequestId::generate(),
                intent: intent.clone(),
                context: context.clone(),
                constraints: wire_constraints.clone(),
                deadline,
                signature: Vec::new(),
            };

            match self.dispatcher.dispatch(node_id, request, deadline).await {
                Ok(response) => {
                    let success = matches!(response.status, IntentStatus::Ok);
                    self.table.record_dispatch_outcome(&capability_id, node_id, success, now_ms / 1000);
                    match response.status {
                        IntentStatus::Ok => {
                            return Ok(RouteOutcome {
                                node_id,
                                response,
                                attempts,
                            });
                        }
                        IntentStatus::Busy => {
                            attempts.push(AttemptOutcome {
                                node_id,
                                error: "peer busy".into(),
                            });
                            continue;
                        }
                        IntentStatus::UnknownCapability => {
                            self.table.evict_capability_owner(&capability_id, node_id);
                            attempts.push(AttemptOutcome {
                                node_id,
                                error: "unknown capability".into(),
                            });
                            continue;
                        }
                        IntentStatus::Error => {
                            attempts.push(AttemptOutcome {
                                node_id,
                                error: response.error.clone().unwrap_or_default(),
                            });
                            continue;
                        }
                    }
                }
                Err(e) => {
                    self.table.record_dispatch_outcome(&capability_id, node_id, false, now_ms / 1000);
                    attempts.push(AttemptOutcome {
                        node_id,
                        error: e.to_string(),
                    });
                    continue;
                }
            }
        }

        Err(RouterError::AllRetriesFailed {
            attempted: attempts.len(),
            chain: attempts.iter().map(|a| a.node_id).collect(),
        })
    }

    /// Dispatches each intent independently with its own deadline and
    /// backup-node fallback; one intent's exhaustion never fails the batch
    /// (§4.8 `route_all` variant).
    pub async fn route_all(
        &self,
        intents: Vec<(String, BTreeMap<String, String>, Constraints, u64)>,
        now_ms: u64,
    ) -> Vec<BatchOutcome> {
        let mut out = Vec::with_capacity(intents.len());
        for (intent, context, constraints, deadline) in intents {
            let intent_clone = intent.clone();
            match self.route(intent, context, constraints, deadline, now_ms).await {
                Ok(outcome) => out.push(BatchOutcome::Dispatched(outcome)),
                Err(error) => out.push(BatchOutcome::Failed {
                    intent: intent_clone,
                    error,
                }),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Embedder, HashEmbedder};
    use atmosphere_core::{CapabilityRecord, CapabilityType, TransportKind, EMBEDDING_DIM};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct AlwaysOkDispatcher {
        calls: AtomicU64,
    }

    #[async_trait]
    impl IntentDispatcher for AlwaysOkDispatcher {
        async fn heartbeat_check(&self, _node_id: NodeId, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        async fn dispatch(&self, _node_id: NodeId, request: IntentRequest, _deadline: u64) -> Result<IntentResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(IntentResponse {
                request_id: request.request_id,
                status: IntentStatus::Ok,
                result: Some(b"hi".to_vec()),
                error: None,
                signature: Vec::new(),
            })
        }
    }

    struct FixedLoad;
    impl LoadSource for FixedLoad {
        fn load_for(&self, _node_id: NodeId) -> CandidateLoad {
            CandidateLoad {
                queue_depth: 0,
                cpu_load: 0.1,
                is_connected_or_local: true,
                has_gpu: false,
            }
        }
    }

    fn sample_capability(owner: NodeId) -> CapabilityRecord {
        CapabilityRecord {
            capability_id: "cap_echo".into(),
            owner_node_id: owner,
            type_tag: CapabilityType::Tool,
            description: "echoes input".into(),
            embedding: HashEmbedder.embed("echoes input"),
            tools: vec!["echo".into()],
            constraints: Default::default(),
            version: 1,
            updated_at: 0,
            signature: vec![],
        }
    }

    #[tokio::test]
    async fn routes_to_best_candidate() {
        let local = NodeId([0; 16]);
        let peer = NodeId([1; 16]);
        let registry = Arc::new(CapabilityRegistry::new());
        registry.upsert_capability(sample_capability(peer));

        let table = RouteTable::new();
        table.observe("cap_echo", peer, TransportKind::Lan, 0, 5.0, 0.0, 1.0, 0);

        let dispatcher = Arc::new(AlwaysOkDispatcher { calls: AtomicU64::new(0) });
        let router = Router::new(
            local,
            registry,
            table,
            Arc::new(HashEmbedder),
            dispatcher.clone(),
            Arc::new(FixedLoad),
        );

        let outcome = router
            .route("echoes input".into(), Default::default(), Constraints::default(), 30_000, 0)
            .await
            .unwrap();
        assert_eq!(outcome.node_id, peer);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn executes_locally_without_touching_dispatcher() {
        let local = NodeId([0; 16]);
        let registry = Arc::new(CapabilityRegistry::new());
        registry.upsert_capability(sample_capability(local));

        let table = RouteTable::new();
        table.observe("cap_echo", local, TransportKind::Lan, 0, 0.0, 0.0, 1.0, 0);

        let dispatcher = Arc::new(AlwaysOkDispatcher { calls: AtomicU64::new(0) });
        let router = Router::new(
            local,
            registry,
            table,
            Arc::new(HashEmbedder),
            dispatcher.clone(),
            Arc::new(FixedLoad),
        );

        let outcome = router
            .route("echoes input".into(), Default::default(), Constraints::default(), 30_000, 0)
            .await
            .unwrap();
        assert_eq!(outcome.node_id, local);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_candidates_yields_no_capable_node() {
        let local = NodeId([0; 16]);
        let registry = Arc::new(CapabilityRegistry::new());
        let table = RouteTable::new();
        let dispatcher = Arc::new(AlwaysOkDispatcher { calls: AtomicU64::new(0) });
        let router = Router::new(
            local,
            registry,
            table,
            Arc::new(HashEmbedder),
            dispatcher,
            Arc::new(FixedLoad),
        );

        let err = router
            .route("anything".into(), Default::default(), Constraints::default(), 30_000, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::NoCapableNode));
    }

    #[test]
    fn embedding_dim_matches_core() {
        assert_eq!(HashEmbedder.embed("x").len(), EMBEDDING_DIM);
    }
}
