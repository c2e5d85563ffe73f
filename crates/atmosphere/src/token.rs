//! Invite token wire encoding (§6): a base64url-encoded canonical-CBOR
//! `InviteToken`, paired with a short, human-typeable code derived from its
//! hash for out-of-band sharing (read over a phone call, etc).

use anyhow::{Context, Result};
use atmosphere_core::canonical::{canonical_bytes, from_canonical_bytes};
use atmosphere_core::InviteToken;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Encode a token for sharing: the base64url string a user pastes into
/// `atmosphere join`.
pub fn encode(token: &InviteToken) -> Result<String> {
    let bytes = canonical_bytes(token).context("encoding invite token")?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

pub fn decode(encoded: &str) -> Result<InviteToken> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded.trim()).context("invite token is not valid base64url")?;
    from_canonical_bytes(&bytes).context("invite token is not a valid CBOR InviteToken")
}

/// A short code derived from the token's hash, grouped for readability
/// (`XXXX-XXXX-XXXX-XXXX`). Not reversible to the token itself — resolving
/// one back to a full token requires a lookup server that isn't part of
/// this node's own responsibilities.
pub fn short_code(token: &InviteToken) -> Result<String> {
    let bytes = canonical_bytes(token).context("encoding invite token")?;
    let digest = Sha256::digest(&bytes);
    let hex = hex::encode_upper(&digest[..8]);
    Ok(hex
        .as_bytes()
        .chunks(4)
        .map(|chunk| std::str::from_utf8(chunk).unwrap())
        .collect::<Vec<_>>()
        .join("-"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_core::crypto::{create_invite, KeyPair};
    use atmosphere_core::MeshId;

    fn sample_token() -> InviteToken {
        let mesh_kp = KeyPair::generate();
        let unsigned = InviteToken {
            mesh_id: MeshId::generate(),
            mesh_public_key: mesh_kp.public_key(),
            issuer_node_id: mesh_kp.node_id(),
            capabilities_granted: vec![],
            endpoints: vec![],
            created_at: 0,
            expires_at: 1_000_000,
            signature: Vec::new(),
        };
        create_invite(unsigned, &mesh_kp).unwrap()
    }

    #[test]
    fn round_trips_through_base64url() {
        let token = sample_token();
        let encoded = encode(&token).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, token);
    }

    #[test]
    fn short_code_is_grouped_into_four_blocks() {
        let token = sample_token();
        let code = short_code(&token).unwrap();
        let groups: Vec<_> = code.split('-').collect();
        assert_eq!(groups.len(), 4);
        assert!(groups.iter().all(|g| g.len() == 4));
    }
}
