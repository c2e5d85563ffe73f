//! Epidemic gossip engine for the Atmosphere mesh runtime (§4.5).
//!
//! Provides durable record storage, push/pull anti-entropy, merge
//! resolution, tombstone retention, and mesh-founder-signed revocation. Peer
//! selection and transport I/O live one layer up, in `atmosphere-supervisor`
//! and the `atmosphere` runtime.

pub mod engine;
pub mod error;
pub mod store;
pub mod trust;

pub use engine::{GossipEngine, IngestOutcome};
pub use error::{GossipError, Result};
pub use store::{RecordKey, Store};
pub use trust::{issue_revocation, verify_revocation, RevocationRecord, TrustState};
