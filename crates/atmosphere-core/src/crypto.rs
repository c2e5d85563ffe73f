//! Identity, signing, and invite/session-auth verification for Atmosphere
//! (§3, §4.1).
//!
//! Ed25519 backs every signature in the system: invite tokens, capability
//! records, cost samples, and per-connection session auth. NodeId derivation
//! uses SHA-256, the normative hash for wire identifiers. BLAKE3 is kept for
//! internal, non-normative content hashing (e.g. gossip dedup keys) using
//! domain-separated contexts, without pretending it's part of the wire
//! contract.

use crate::canonical::canonical_bytes;
use crate::error::{CoreError, Result};
use crate::messages::{Heartbeat, IntentRequest, IntentResponse, TransportSwitch};
use crate::types::{CapabilityRecord, CostSample, InviteToken, NodeId, SessionAuth, SignedCostSample};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

/// An Ed25519 identity keypair, one per node (and one per mesh, held by its founder).
pub struct KeyPair {
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        KeyPair { signing_key }
    }

    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| CoreError::InvalidSeedLength(seed.len()))?;
        Ok(KeyPair {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The raw 32-byte seed this keypair was generated or loaded from,
    /// for persisting as `identity.key` (§6).
    pub fn seed(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_public_key(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// A convenience closure form, for callers building a signed record in
    /// one expression (invite issuance, capability publishing).
    pub fn sign_fn(&self) -> impl Fn(&[u8]) -> Vec<u8> + '_ {
        move |msg| self.sign(msg)
    }
}

/// Verify a raw Ed25519 signature against a public key.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &[u8]) -> Result<()> {
    let verifying_key = VerifyingKey::from_bytes(public_key)
        .map_err(|e| CoreError::InvalidPublicKey(e.to_string()))?;
    let signature: [u8; 64] = signature
        .try_into()
        .map_err(|_| CoreError::InvalidSignature)?;
    let signature = Signature::from_bytes(&signature);
    verifying_key
        .verify(message, &signature)
        .map_err(|_| CoreError::InvalidSignature)
}

/// Sign the canonical body of an invite token with the mesh's key, producing
/// a complete, self-contained [`InviteToken`].
pub fn create_invite(
    mut token: InviteToken,
    mesh_keypair: &KeyPair,
) -> Result<InviteToken> {
    let body_bytes = canonical_bytes(&token.signed_body())?;
    token.signature = mesh_keypair.sign(&body_bytes);
    Ok(token)
}

/// Verify an invite token's signature, mesh identity, and expiry.
pub fn verify_invite(token: &InviteToken, now: u64) -> Result<()> {
    if now >= token.expires_at {
        return Err(CoreError::InviteExpired {
            expires_at: token.expires_at,
            now,
        });
    }
    let body_bytes = canonical_bytes(&token.signed_body())?;
    verify_signature(&token.mesh_public_key, &body_bytes, &token.signature)
}

/// Verify an invite token was issued for the mesh the verifier expects to join.
pub fn verify_invite_mesh(token: &InviteToken, expected_mesh_public_key: &[u8; 32]) -> Result<()> {
    if &token.mesh_public_key != expected_mesh_public_key {
        return Err(CoreError::InviteWrongMesh);
    }
    Ok(())
}

/// Build and sign a [`SessionAuth`] envelope for a new connection.
pub fn create_session_auth(node_id: NodeId, timestamp: u64, keypair: &KeyPair) -> SessionAuth {
    use rand::RngCore;
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut auth = SessionAuth {
        node_id,
        nonce,
        timestamp,
        signature: Vec::new(),
    };
    auth.signature = keypair.sign(&auth.signed_body());
    auth
}

/// Verify a [`SessionAuth`] envelope's signature against the claimed node's public key.
/// Replay protection (nonce, node_id) is the caller's responsibility (it needs
/// a store to check against, which this crate intentionally doesn't own).
pub fn verify_session_auth(auth: &SessionAuth, public_key: &[u8; 32]) -> Result<()> {
    verify_signature(public_key, &auth.signed_body(), &auth.signature)
}

/// Sign the canonical body of a capability record, producing a
/// self-contained, verifiable [`CapabilityRecord`].
pub fn sign_capability_record(mut record: CapabilityRecord, keypair: &KeyPair) -> Result<CapabilityRecord> {
    let body_bytes = canonical_bytes(&record.signed_body())?;
    record.signature = keypair.sign(&body_bytes);
    Ok(record)
}

/// Verify a capability record's signature against its claimed owner's public key.
pub fn verify_capability_record(record: &CapabilityRecord, owner_public_key: &[u8; 32]) -> Result<()> {
    let body_bytes = canonical_bytes(&record.signed_body())?;
    verify_signature(owner_public_key, &body_bytes, &record.signature)
}

/// Sign a cost sample, producing the wire envelope (§3).
pub fn sign_cost_sample(sample: CostSample, keypair: &KeyPair) -> Result<SignedCostSample> {
    let body_bytes = canonical_bytes(&sample)?;
    let signature = keypair.sign(&body_bytes);
    Ok(SignedCostSample { sample, signature })
}

/// Verify a signed cost sample against its claimed owner's public key.
pub fn verify_cost_sample(signed: &SignedCostSample, owner_public_key: &[u8; 32]) -> Result<()> {
    let body_bytes = canonical_bytes(&signed.sample)?;
    verify_signature(owner_public_key, &body_bytes, &signed.signature)
}

/// Sign a heartbeat (§4.10), producing the wire envelope.
pub fn sign_heartbeat(mut heartbeat: Heartbeat, keypair: &KeyPair) -> Result<Heartbeat> {
    let body_bytes = canonical_bytes(&heartbeat.signed_body())?;
    heartbeat.signature = keypair.sign(&body_bytes);
    Ok(heartbeat)
}

/// Verify a heartbeat's signature against its claimed sender's public key.
pub fn verify_heartbeat(heartbeat: &Heartbeat, public_key: &[u8; 32]) -> Result<()> {
    let body_bytes = canonical_bytes(&heartbeat.signed_body())?;
    verify_signature(public_key, &body_bytes, &heartbeat.signature)
}

/// Sign an intent dispatch request (§4.8 step 6).
pub fn sign_intent_request(mut request: IntentRequest, keypair: &KeyPair) -> Result<IntentRequest> {
    let body_bytes = canonical_bytes(&request.signed_body())?;
    request.signature = keypair.sign(&body_bytes);
    Ok(request)
}

/// Verify an intent dispatch request's signature against its caller's public key.
pub fn verify_intent_request(request: &IntentRequest, caller_public_key: &[u8; 32]) -> Result<()> {
    let body_bytes = canonical_bytes(&request.signed_body())?;
    verify_signature(caller_public_key, &body_bytes, &request.signature)
}

/// Sign an intent dispatch response.
pub fn sign_intent_response(mut response: IntentResponse, keypair: &KeyPair) -> Result<IntentResponse> {
    let body_bytes = canonical_bytes(&response.signed_body())?;
    response.signature = keypair.sign(&body_bytes);
    Ok(response)
}

/// Verify an intent dispatch response's signature against the responding node's public key.
pub fn verify_intent_response(response: &IntentResponse, responder_public_key: &[u8; 32]) -> Result<()> {
    let body_bytes = canonical_bytes(&response.signed_body())?;
    verify_signature(responder_public_key, &body_bytes, &response.signature)
}

/// Sign a transport-switch announcement (§4.4).
pub fn sign_transport_switch(mut switch: TransportSwitch, keypair: &KeyPair) -> Result<TransportSwitch> {
    let body_bytes = canonical_bytes(&switch.signed_body())?;
    switch.signature = keypair.sign(&body_bytes);
    Ok(switch)
}

/// Verify a transport-switch announcement's signature.
pub fn verify_transport_switch(switch: &TransportSwitch, public_key: &[u8; 32]) -> Result<()> {
    let body_bytes = canonical_bytes(&switch.signed_body())?;
    verify_signature(public_key, &body_bytes, &switch.signature)
}

/// Domain-separated BLAKE3 content hash, used for internal dedup/cache keys
/// that never cross the wire as normative identifiers.
pub fn content_hash(domain: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain);
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Endpoint, MeshId};

    fn sample_invite(mesh_keypair: &KeyPair, issuer: NodeId, expires_at: u64) -> InviteToken {
        InviteToken {
            mesh_id: MeshId::generate(),
            mesh_public_key: mesh_keypair.public_key(),
            issuer_node_id: issuer,
            capabilities_granted: vec!["llm".into()],
            endpoints: vec![Endpoint::Lan {
                host: "192.168.1.1".into(),
                port: 7420,
            }],
            created_at: 0,
            expires_at,
            signature: Vec::new(),
        }
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let kp = KeyPair::generate();
        let msg = b"hello atmosphere";
        let sig = kp.sign(msg);
        assert!(verify_signature(&kp.public_key(), msg, &sig).is_ok());
    }

    #[test]
    fn tampered_signature_rejected() {
        let kp = KeyPair::generate();
        let msg = b"hello atmosphere";
        let mut sig = kp.sign(msg);
        sig[0] ^= 0xFF;
        assert!(verify_signature(&kp.public_key(), msg, &sig).is_err());
    }

    #[test]
    fn invite_create_and_verify() {
        let mesh_kp = KeyPair::generate();
        let issuer = KeyPair::generate();
        let token = sample_invite(&mesh_kp, issuer.node_id(), 1_000);
        let token = create_invite(token, &mesh_kp).unwrap();

        assert!(verify_invite(&token, 500).is_ok());
        assert!(verify_invite_mesh(&token, &mesh_kp.public_key()).is_ok());
    }

    #[test]
    fn invite_expired_rejected() {
        let mesh_kp = KeyPair::generate();
        let issuer = KeyPair::generate();
        let token = sample_invite(&mesh_kp, issuer.node_id(), 1_000);
        let token = create_invite(token, &mesh_kp).unwrap();

        assert!(verify_invite(&token, 1_000).is_err());
        assert!(verify_invite(&token, 2_000).is_err());
    }

    #[test]
    fn invite_wrong_mesh_rejected() {
        let mesh_kp = KeyPair::generate();
        let other_mesh_kp = KeyPair::generate();
        let issuer = KeyPair::generate();
        let token = sample_invite(&mesh_kp, issuer.node_id(), 1_000);
        let token = create_invite(token, &mesh_kp).unwrap();

        assert!(verify_invite_mesh(&token, &other_mesh_kp.public_key()).is_err());
    }

    #[test]
    fn session_auth_roundtrip() {
        let kp = KeyPair::generate();
        let auth = create_session_auth(kp.node_id(), 42, &kp);
        assert!(verify_session_auth(&auth, &kp.public_key()).is_ok());
    }

    fn sample_capability(owner: NodeId) -> CapabilityRecord {
        use std::collections::BTreeMap;
        CapabilityRecord {
            capability_id: "c1".into(),
            owner_node_id: owner,
            type_tag: crate::types::CapabilityType::Tool,
            description: "echoes input".into(),
            embedding: vec![0.0; crate::types::EMBEDDING_DIM],
            tools: vec!["echo".into()],
            constraints: BTreeMap::new(),
            version: 1,
            updated_at: 0,
            signature: Vec::new(),
        }
    }

    #[test]
    fn capability_record_sign_and_verify() {
        let kp = KeyPair::generate();
        let record = sign_capability_record(sample_capability(kp.node_id()), &kp).unwrap();
        assert!(verify_capability_record(&record, &kp.public_key()).is_ok());
    }

    #[test]
    fn capability_record_tampered_rejected() {
        let kp = KeyPair::generate();
        let mut record = sign_capability_record(sample_capability(kp.node_id()), &kp).unwrap();
        record.version += 1;
        assert!(verify_capability_record(&record, &kp.public_key()).is_err());
    }

    #[test]
    fn cost_sample_sign_and_verify() {
        let kp = KeyPair::generate();
        let sample = CostSample {
            node_id: kp.node_id(),
            plugged_in: true,
            battery_percent: 80,
            cpu_load: 0.2,
            gpu_load: 0.0,
            memory_percent: 40,
            network_metered: false,
            sampled_at: 0,
        };
        let signed = sign_cost_sample(sample, &kp).unwrap();
        assert!(verify_cost_sample(&signed, &kp.public_key()).is_ok());
    }

    #[test]
    fn heartbeat_sign_and_verify() {
        let kp = KeyPair::generate();
        let heartbeat = Heartbeat {
            node_id: kp.node_id(),
            transport: crate::types::TransportKind::Lan,
            sequence: 1,
            cost_multiplier: 1.0,
            peer_count: 3,
            signature: Vec::new(),
        };
        let signed = sign_heartbeat(heartbeat, &kp).unwrap();
        assert!(verify_heartbeat(&signed, &kp.public_key()).is_ok());
    }

    #[test]
    fn intent_request_sign_and_verify() {
        use crate::messages::{RequestId, RouteConstraints};
        let kp = KeyPair::generate();
        let request = IntentRequest {
            request_id: RequestId::generate(),
            intent: "echo this".into(),
            context: Default::default(),
            constraints: RouteConstraints::default(),
            deadline: 30_000,
            signature: Vec::new(),
        };
        let signed = sign_intent_request(request, &kp).unwrap();
        assert!(verify_intent_request(&signed, &kp.public_key()).is_ok());
    }

    #[test]
    fn intent_response_sign_and_verify() {
        use crate::messages::{IntentStatus, RequestId};
        let kp = KeyPair::generate();
        let response = IntentResponse {
            request_id: RequestId::generate(),
            status: IntentStatus::Ok,
            result: Some(b"hi".to_vec()),
            error: None,
            signature: Vec::new(),
        };
        let signed = sign_intent_response(response, &kp).unwrap();
        assert!(verify_intent_response(&signed, &kp.public_key()).is_ok());
    }

    #[test]
    fn transport_switch_sign_and_verify() {
        let kp = KeyPair::generate();
        let switch = TransportSwitch {
            old_transport: Some(crate::types::TransportKind::Lan),
            new_transport: crate::types::TransportKind::Relay,
            signature: Vec::new(),
        };
        let signed = sign_transport_switch(switch, &kp).unwrap();
        assert!(verify_transport_switch(&signed, &kp.public_key()).is_ok());
    }
}
