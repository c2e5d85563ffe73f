//! Shared error taxonomy for Atmosphere.
//!
//! Each crate defines its own error enum for the failures it can produce;
//! this module only carries the types common to all of them (encoding,
//! identity) plus the coarse `ErrorKind` taxonomy from the error handling
//! design that every per-crate error maps into at the caller boundary.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Coarse error classification used for propagation/retry decisions.
///
/// Every per-crate error type implements `kind()` returning one of these so
/// callers can make retry/surface decisions without matching on concrete
/// error variants across crate boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport blip, timeout, peer busy — retried.
    Transient,
    /// All transports failed for a peer — peer marked Suspect.
    PeerUnreachable,
    /// Signature/expiry/revocation failure — record discarded, never surfaced raw.
    Security,
    /// Routing found no candidate.
    NoCapableNode,
    /// Malformed frame or invalid parameters — connection closed for that peer.
    BadRequest,
    /// Unrecoverable — process exits nonzero.
    Fatal,
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("CBOR encoding error: {0}")]
    CborEncode(String),

    #[error("CBOR decoding error: {0}")]
    CborDecode(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid seed length: expected 32 bytes, got {0}")]
    InvalidSeedLength(usize),

    #[error("float normalization error: {0}")]
    FloatNormalization(String),

    #[error("invite expired at {expires_at}, now {now}")]
    InviteExpired { expires_at: u64, now: u64 },

    #[error("invite signed for wrong mesh")]
    InviteWrongMesh,

    #[error("missing required field: {0}")]
    MissingField(String),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidSignature
            | CoreError::InvalidPublicKey(_)
            | CoreError::InviteExpired { .. }
            | CoreError::InviteWrongMesh => ErrorKind::Security,
            CoreError::CborEncode(_)
            | CoreError::CborDecode(_)
            | CoreError::InvalidSeedLength(_)
            | CoreError::FloatNormalization(_)
            | CoreError::MissingField(_) => ErrorKind::BadRequest,
        }
    }
}
