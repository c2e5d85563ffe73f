//! Candidate filtering, scoring, and constraint application (§4.8 steps 2-4).
//!
//! Fixed scoring formula rather than a tunable weighted blend:
//! `score = similarity × locality × cost_inv × reliability`, with fixed
//! busy/overloaded penalties rather than learned weights.

use atmosphere_core::{NodeId, RouteEntry};

/// Similarity threshold below which a candidate is dropped (§4.8 step 2).
pub const SIMILARITY_THRESHOLD: f32 = 0.35;

#[derive(Debug, Clone, Default)]
pub struct Constraints {
    pub local_only: bool,
    pub require_gpu: bool,
    pub max_latency_ms: Option<f64>,
    pub exclude_nodes: Vec<NodeId>,
    pub max_hops: Option<u32>,
}

/// Per-candidate liveness/load context the router needs but doesn't own
/// (queue depth and cpu load come from the supervisor/registry).
#[derive(Debug, Clone, Copy)]
pub struct CandidateLoad {
    pub queue_depth: u32,
    pub cpu_load: f32,
    pub is_connected_or_local: bool,
    pub has_gpu: bool,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub entry: RouteEntry,
    pub similarity: f32,
    pub load: CandidateLoad,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Step 2: similarity threshold + liveness filter.
pub fn filter_by_similarity(candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| c.similarity >= SIMILARITY_THRESHOLD && c.load.is_connected_or_local)
        .collect()
}

/// Step 3: hard constraints. Entries violating any are removed.
pub fn apply_constraints(candidates: Vec<Candidate>, constraints: &Constraints, local_node_id: NodeId) -> Vec<Candidate> {
    candidates
        .into_iter()
        .filter(|c| {
            if constraints.local_only && c.entry.next_hop_node_id != local_node_id {
                return false;
            }
            if constraints.require_gpu && !c.load.has_gpu {
                return false;
            }
            if let Some(max_latency) = constraints.max_latency_ms {
                if c.entry.measured_latency_ms > max_latency {
                    return false;
                }
            }
            if constraints.exclude_nodes.contains(&c.entry.next_hop_node_id) {
                return false;
            }
            if let Some(max_hops) = constraints.max_hops {
                if c.entry.hop_count > max_hops {
                    return false;
                }
            }
            true
        })
        .collect()
}

/// Step 4: live score with busy/overloaded penalties. Recomputes similarity
/// into the formula instead of trusting the stored, stale `entry.score`.
pub fn live_score(candidate: &Candidate) -> f64 {
    let locality = 0.95f64.powi(candidate.entry.hop_count as i32);
    let cost_inv = 1.0 / candidate.entry.cost_multiplier.max(f64::EPSILON);
    let mut score = candidate.similarity as f64 * locality * cost_inv * candidate.entry.reliability;

    if candidate.load.queue_depth > 10 {
        score *= 0.7;
    }
    if candidate.load.cpu_load > 0.9 {
        score *= 0.5;
    }
    score
}

/// Steps 2-4-5 combined: filter, constrain, score, sort descending.
pub fn rank(candidates: Vec<Candidate>, constraints: &Constraints, local_node_id: NodeId) -> Vec<(Candidate, f64)> {
    let candidates = filter_by_similarity(candidates);
    let candidates = apply_constraints(candidates, constraints, local_node_id);

    let mut scored: Vec<(Candidate, f64)> = candidates
        .into_iter()
        .map(|c| {
            let score = live_score(&c);
            (c, score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_core::TransportKind;

    fn entry(next_hop: NodeId, hop_count: u32, cost: f64, reliability: f64) -> RouteEntry {
        RouteEntry {
            capability_id: "cap-1".into(),
            next_hop_node_id: next_hop,
            via_transport: TransportKind::Lan,
            hop_count,
            measured_latency_ms: 10.0,
            cost_multiplier: cost,
            reliability,
            last_updated: 0,
            score: 0.0,
        }
    }

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn below_threshold_is_filtered() {
        let candidates = vec![Candidate {
            entry: entry(NodeId([1; 16]), 1, 1.0, 1.0),
            similarity: 0.1,
            load: CandidateLoad {
                queue_depth: 0,
                cpu_load: 0.1,
                is_connected_or_local: true,
                has_gpu: false,
            },
        }];
        assert!(filter_by_similarity(candidates).is_empty());
    }

    #[test]
    fn busy_and_overloaded_penalties_apply() {
        let base = Candidate {
            entry: entry(NodeId([1; 16]), 1, 1.0, 1.0),
            similarity: 1.0,
            load: CandidateLoad {
                queue_depth: 0,
                cpu_load: 0.1,
                is_connected_or_local: true,
                has_gpu: false,
            },
        };
        let baseline = live_score(&base);

        let mut busy = base.clone();
        busy.load.queue_depth = 11;
        assert!((live_score(&busy) - baseline * 0.7).abs() < 1e-9);

        let mut overloaded = base.clone();
        overloaded.load.cpu_load = 0.95;
        assert!((live_score(&overloaded) - baseline * 0.5).abs() < 1e-9);
    }

    #[test]
    fn exclude_nodes_constraint() {
        let target = NodeId([1; 16]);
        let candidates = vec![Candidate {
            entry: entry(target, 1, 1.0, 1.0),
            similarity: 1.0,
            load: CandidateLoad {
                queue_depth: 0,
                cpu_load: 0.1,
                is_connected_or_local: true,
                has_gpu: false,
            },
        }];
        let constraints = Constraints {
            exclude_nodes: vec![target],
            ..Default::default()
        };
        let filtered = apply_constraints(candidates, &constraints, NodeId([0; 16]));
        assert!(filtered.is_empty());
    }
}
