//! Intent router for the Atmosphere mesh runtime (§4.6-§4.8).
//!
//! Owns capability/cost registration, the ranked routing table, candidate
//! scoring, and the dispatch pipeline. Transport I/O and peer liveness are
//! injected (`IntentDispatcher`, `LoadSource`) rather than owned here, so
//! this crate stays testable without a live mesh.

pub mod error;
pub mod registry;
pub mod router;
pub mod scoring;
pub mod table;

pub use error::{Result, RouterError};
pub use registry::{CapabilityEntry, CapabilityRegistry, Embedder, HashEmbedder, LocalCapabilityManager};
pub use router::{AttemptOutcome, BatchOutcome, IntentDispatcher, LoadSource, Router, RouteOutcome};
pub use scoring::Constraints;
pub use table::RouteTable;
