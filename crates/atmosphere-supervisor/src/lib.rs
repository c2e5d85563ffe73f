//! Connection supervision and liveness for the Atmosphere mesh runtime
//! (§4.4, §4.10).
//!
//! Owns the sharded per-peer state map, the probe loop, transport
//! selection/switching, and session continuity across a switch. Actual
//! transport I/O comes from `atmosphere-net`; the gossip and router crates
//! are wired on top of this at the `atmosphere` binary crate.

pub mod error;
pub mod liveness;
pub mod scheduler;
pub mod supervisor;

pub use error::{Result, SupervisorError};
pub use liveness::PeerEntry;
pub use scheduler::{ProbeHistory, ProbePriority, ScheduledProbe, Scheduler, SchedulerError, SchedulerStats};
pub use supervisor::{ConnectionSupervisor, PeerTable};
