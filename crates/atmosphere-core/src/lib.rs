//! Atmosphere Core Library
//!
//! Core data model, canonical CBOR encoding, and identity primitives shared
//! by every other crate in the Atmosphere mesh runtime.
//!
//! # Modules
//!
//! - [`types`]: data model (NodeId, CapabilityRecord, RouteEntry, ...)
//! - [`canonical`]: deterministic CBOR encoding for signing
//! - [`crypto`]: identity keypair, signing, invite tokens
//! - [`error`]: shared error taxonomy
//! - [`messages`]: wire message bodies for non-gossip frame kinds (§6)

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod messages;
pub mod types;

pub use error::{CoreError, ErrorKind, Result};
pub use messages::*;
pub use types::*;
