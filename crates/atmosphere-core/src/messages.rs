//! Wire message bodies for the frame kinds that aren't a bare gossip record
//! (§6). `GossipEnvelope` (0x04) and `Revocation` (0x0A, a
//! `RecordKind::Revoke`-tagged `GossipEnvelope`) already have their bodies
//! in [`crate::types`]; this module covers the rest of the discriminator
//! table that `atmosphere-net::framing::FrameKind` names.

use crate::types::{GossipEnvelope, MeshId, NodeId, RecordKind, SessionAuth, TransportKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 0x01 — first message on a new connection: identity plus a summary
/// digest of locally-known capabilities, so the peer can decide whether to
/// immediately pull via anti-entropy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub node_id: NodeId,
    pub public_key: [u8; 32],
    pub mesh_id: MeshId,
    pub session_auth: SessionAuth,
    pub caps_summary_digest: [u8; 32],
}

/// 0x02 — handshake reply, same shape minus the digest (the acker doesn't
/// need to offer one back; the initiator's anti-entropy request follows).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub node_id: NodeId,
    pub public_key: [u8; 32],
    pub session_auth: SessionAuth,
}

/// 0x03 — periodic liveness probe (§4.4, §4.10). Sending interval depends
/// on the transport it travels over ([`TransportKind::heartbeat_interval`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: NodeId,
    pub transport: TransportKind,
    pub sequence: u64,
    pub cost_multiplier: f64,
    pub peer_count: u32,
    pub signature: Vec<u8>,
}

impl Heartbeat {
    pub(crate) fn signed_body(&self) -> HeartbeatBody {
        HeartbeatBody {
            node_id: self.node_id,
            transport: self.transport,
            sequence: self.sequence,
            cost_multiplier: self.cost_multiplier,
            peer_count: self.peer_count,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct HeartbeatBody {
    pub node_id: NodeId,
    pub transport: TransportKind,
    pub sequence: u64,
    pub cost_multiplier: f64,
    pub peer_count: u32,
}

/// 0x05 — anti-entropy pull request: the sender's per-origin version
/// digest, as produced by the gossip store's `(record_kind, origin, highest
/// version)` summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiEntropyReq {
    pub digest: Vec<(RecordKind, NodeId, u64)>,
}

/// 0x06 — anti-entropy pull response: full records the requester is behind
/// on or missing entirely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntiEntropyResp {
    pub missing_records: Vec<GossipEnvelope>,
}

/// Identifier for one dispatched intent, minted by the router that issues
/// it (§4.8 step 6) and echoed back in the matching [`IntentResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub [u8; 16]);

impl RequestId {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        RequestId(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hard constraints a dispatch must honor (§4.8 step 3). Carried on the
/// wire, not just held locally, so a node that re-routes after a retry
/// re-applies the same constraints the caller asked for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConstraints {
    pub local_only: bool,
    pub require_gpu: bool,
    pub max_latency_ms: Option<f64>,
    pub exclude_nodes: Vec<NodeId>,
    pub max_hops: Option<u32>,
}

/// 0x07 — a capability dispatch request (§4.8 step 6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRequest {
    pub request_id: RequestId,
    pub intent: String,
    pub context: BTreeMap<String, String>,
    pub constraints: RouteConstraints,
    pub deadline: u64,
    pub signature: Vec<u8>,
}

impl IntentRequest {
    pub(crate) fn signed_body(&self) -> IntentRequestBody<'_> {
        IntentRequestBody {
            request_id: self.request_id,
            intent: &self.intent,
            context: &self.context,
            constraints: &self.constraints,
            deadline: self.deadline,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct IntentRequestBody<'a> {
    pub request_id: RequestId,
    pub intent: &'a str,
    pub context: &'a BTreeMap<String, String>,
    pub constraints: &'a RouteConstraints,
    pub deadline: u64,
}

/// Outcome tag for an [`IntentResponse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    Ok,
    Busy,
    UnknownCapability,
    Error,
}

/// 0x08 — reply to an [`IntentRequest`]. Exactly one of `result`/`error` is
/// populated, matching `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentResponse {
    pub request_id: RequestId,
    pub status: IntentStatus,
    pub result: Option<Vec<u8>>,
    pub error: Option<String>,
    pub signature: Vec<u8>,
}

impl IntentResponse {
    pub(crate) fn signed_body(&self) -> IntentResponseBody<'_> {
        IntentResponseBody {
            request_id: self.request_id,
            status: self.status.clone(),
            result: self.result.as_deref(),
            error: self.error.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct IntentResponseBody<'a> {
    pub request_id: RequestId,
    pub status: IntentStatus,
    pub result: Option<&'a [u8]>,
    pub error: Option<&'a str>,
}

/// 0x09 — announces a supervisor-initiated active-transport failover
/// (§4.4), signed so the receiving peer can distinguish it from a spoofed
/// downgrade attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportSwitch {
    pub old_transport: Option<TransportKind>,
    pub new_transport: TransportKind,
    pub signature: Vec<u8>,
}

impl TransportSwitch {
    pub(crate) fn signed_body(&self) -> TransportSwitchBody {
        TransportSwitchBody {
            old_transport: self.old_transport,
            new_transport: self.new_transport,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct TransportSwitchBody {
    pub old_transport: Option<TransportKind>,
    pub new_transport: TransportKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_hex_roundtrip() {
        let id = RequestId::generate();
        assert_eq!(id.to_hex().len(), 32);
    }

    #[test]
    fn route_constraints_default_is_permissive() {
        let c = RouteConstraints::default();
        assert!(!c.local_only);
        assert!(!c.require_gpu);
        assert!(c.max_latency_ms.is_none());
        assert!(c.exclude_nodes.is_empty());
        assert!(c.max_hops.is_none());
    }
}
