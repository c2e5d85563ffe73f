//! Error taxonomy for intent routing.

use atmosphere_core::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no candidate found for capability matching this intent")]
    NoCapableNode,

    #[error("all {attempted} retry candidates failed: {chain:?}")]
    AllRetriesFailed {
        attempted: usize,
        chain: Vec<atmosphere_core::NodeId>,
    },

    #[error("peer busy: send queue full")]
    PeerBusy,

    #[error("capability {0} disappeared between lookup and dispatch")]
    UnknownCapability(String),

    #[error("core error: {0}")]
    Core(#[from] atmosphere_core::CoreError),

    #[error("dispatch transport error: {0}")]
    Dispatch(String),
}

impl RouterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RouterError::NoCapableNode | RouterError::UnknownCapability(_) => ErrorKind::NoCapableNode,
            RouterError::AllRetriesFailed { .. } | RouterError::PeerBusy | RouterError::Dispatch(_) => {
                ErrorKind::Transient
            }
            RouterError::Core(e) => e.kind(),
        }
    }
}
