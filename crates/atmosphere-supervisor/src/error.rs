//! Error taxonomy for connection supervision and liveness (§4.4, §4.10).

use atmosphere_core::ErrorKind;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no transport reachable for peer {0}")]
    AllTransportsFailed(atmosphere_core::NodeId),

    #[error("peer {0} is unknown")]
    UnknownPeer(atmosphere_core::NodeId),

    #[error("send queue full for peer {0}")]
    QueueFull(atmosphere_core::NodeId),

    #[error("transport error: {0}")]
    Transport(#[from] atmosphere_net::TransportError),

    #[error("core error: {0}")]
    Core(#[from] atmosphere_core::CoreError),
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SupervisorError::AllTransportsFailed(_) => ErrorKind::PeerUnreachable,
            SupervisorError::UnknownPeer(_) => ErrorKind::BadRequest,
            SupervisorError::QueueFull(_) => ErrorKind::Transient,
            SupervisorError::Transport(_) => ErrorKind::Transient,
            SupervisorError::Core(e) => e.kind(),
        }
    }
}
