//! Error taxonomy for the gossip engine.

use atmosphere_core::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GossipError>;

#[derive(Debug, Error)]
pub enum GossipError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Postcard(#[from] postcard::Error),

    #[error("core error: {0}")]
    Core(#[from] atmosphere_core::CoreError),

    #[error("invalid signature on {record_kind:?} from {origin}")]
    InvalidSignature {
        record_kind: atmosphere_core::RecordKind,
        origin: atmosphere_core::NodeId,
    },

    #[error("record from untrusted origin {0}")]
    UntrustedOrigin(atmosphere_core::NodeId),

    #[error("origin {0} is revoked")]
    OriginRevoked(atmosphere_core::NodeId),

    #[error("revocation not signed by mesh key")]
    RevocationNotFounderSigned,
}

impl GossipError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GossipError::InvalidSignature { .. }
            | GossipError::UntrustedOrigin(_)
            | GossipError::OriginRevoked(_)
            | GossipError::RevocationNotFounderSigned => ErrorKind::Security,
            GossipError::Sled(_) | GossipError::Postcard(_) => ErrorKind::Transient,
            GossipError::Core(e) => e.kind(),
        }
    }
}
