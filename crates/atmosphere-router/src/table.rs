//! Routing table: up to K=8 RouteEntries per capability, ranked by score (§4.7).
//!
//! Entries are ranked purely by the named scoring formula rather than any
//! decaying/reinforced terrain value, stored as a plain
//! `RwLock<HashMap<capability_id, Vec<RouteEntry>>>`.

use atmosphere_core::{NodeId, RouteEntry, TransportKind};
use parking_lot::RwLock;
use std::collections::HashMap;

pub const MAX_ENTRIES_PER_CAPABILITY: usize = atmosphere_core::ROUTE_ENTRIES_PER_CAPABILITY;
const DECAY_START_SECS: u64 = 5 * 60;
const EVICTION_SCORE: f64 = 0.05;

/// cost_inv × reliability × locality, with similarity pinned to 1.0 — the
/// component of the score that's stable at storage time. Real similarity is
/// recomputed against the live intent at query time (§4.7); this is only
/// used for top-K retention ordering between queries.
fn storage_time_score(cost_multiplier: f64, reliability: f64, hop_count: u32) -> f64 {
    let locality = 0.95f64.powi(hop_count as i32);
    let cost_inv = 1.0 / cost_multiplier.max(f64::EPSILON);
    locality * cost_inv * reliability
}

pub struct RouteTable {
    entries: RwLock<HashMap<String, Vec<RouteEntry>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Synthesize or refresh an entry learned from a gossiped CapabilityRecord
    /// or CostSample, advertised by peer `next_hop` at `advertised_hop_count`
    /// with `advertised_latency_ms` (§4.7).
    #[allow(clippy::too_many_arguments)]
    pub fn observe(
        &self,
        capability_id: &str,
        next_hop_node_id: NodeId,
        via_transport: TransportKind,
        advertised_hop_count: u32,
        measured_rtt_ms: f64,
        advertised_latency_ms: f64,
        cost_multiplier: f64,
        now: u64,
    ) {
        let hop_count = advertised_hop_count + 1;
        let measured_latency_ms = measured_rtt_ms + advertised_latency_ms;

        let mut table = self.entries.write();
        let entries = table.entry(capability_id.to_string()).or_default();

        let reliability = entries
            .iter()
            .find(|e| e.next_hop_node_id == next_hop_node_id)
            .map(|e| e.reliability)
            .unwrap_or(0.5);

        let score = storage_time_score(cost_multiplier, reliability, hop_count);
        let new_entry = RouteEntry {
            capability_id: capability_id.to_string(),
            next_hop_node_id,
            via_transport,
            hop_count,
            measured_latency_ms,
            cost_multiplier,
            reliability,
            last_updated: now,
            score,
        };

        entries.retain(|e| e.next_hop_node_id != next_hop_node_id);
        entries.push(new_entry);
        entries.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        entries.truncate(MAX_ENTRIES_PER_CAPABILITY);
    }

    /// Update an entry's reliability EWMA (α=0.2) after a dispatch outcome.
    pub fn record_dispatch_outcome(&self, capability_id: &str, next_hop_node_id: NodeId, success: bool, now: u64) {
        const ALPHA: f64 = 0.2;
        let mut table = self.entries.write();
        if let Some(entries) = table.get_mut(capability_id) {
            if let Some(entry) = entries.iter_mut().find(|e| e.next_hop_node_id == next_hop_node_id) {
                let outcome = if success { 1.0 } else { 0.0 };
                entry.reliability = ALPHA * outcome + (1.0 - ALPHA) * entry.reliability;
                entry.last_updated = now;
                entry.score = storage_time_score(entry.cost_multiplier, entry.reliability, entry.hop_count);
            }
            entries.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        }
    }

    pub fn entries_for(&self, capability_id: &str) -> Vec<RouteEntry> {
        self.entries.read().get(capability_id).cloned().unwrap_or_default()
    }

    pub fn all_capability_ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn evict_capability_owner(&self, capability_id: &str, next_hop_node_id: NodeId) {
        let mut table = self.entries.write();
        if let Some(entries) = table.get_mut(capability_id) {
            entries.retain(|e| e.next_hop_node_id != next_hop_node_id);
        }
    }

    /// Decay stale entries and evict anything that falls below threshold
    /// (§4.7): past 5 minutes idle, score is halved per additional minute.
    pub fn decay(&self, now: u64) {
        let mut table = self.entries.write();
        for entries in table.values_mut() {
            for entry in entries.iter_mut() {
                let age = now.saturating_sub(entry.last_updated);
                if age > DECAY_START_SECS {
                    let extra_minutes = (age - DECAY_START_SECS) / 60 + 1;
                    entry.score *= 0.5f64.powi(extra_minutes as i32);
                }
            }
            entries.retain(|e| e.score >= EVICTION_SCORE);
        }
        table.retain(|_, entries| !entries.is_empty());
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_caps_at_k_entries() {
        let table = RouteTable::new();
        for i in 0..12u8 {
            table.observe(
                "cap-1",
                NodeId([i; 16]),
                TransportKind::Lan,
                0,
                10.0,
                0.0,
                1.0,
                0,
            );
        }
        assert_eq!(table.entries_for("cap-1").len(), MAX_ENTRIES_PER_CAPABILITY);
    }

    #[test]
    fn dispatch_outcome_updates_reliability() {
        let table = RouteTable::new();
        let peer = NodeId([1; 16]);
        table.observe("cap-1", peer, TransportKind::Lan, 0, 10.0, 0.0, 1.0, 0);
        table.record_dispatch_outcome("cap-1", peer, true, 10);
        let entries = table.entries_for("cap-1");
        assert!(entries[0].reliability > 0.5);
    }

    #[test]
    fn decay_evicts_below_threshold() {
        let table = RouteTable::new();
        let peer = NodeId([1; 16]);
        table.observe("cap-1", peer, TransportKind::Lan, 0, 10.0, 0.0, 5.0, 0);
        // Score starts low (cost_inv = 0.2, reliability = 0.5 -> 0.1); after
        // enough decay minutes it drops under the eviction threshold.
        table.decay(5 * 60 + 10 * 60);
        assert!(table.entries_for("cap-1").is_empty());
    }
}
