//! Probe scheduling (§4.4).
//!
//! A three-tier priority queue with per-target history, generalized to mesh
//! liveness probing (one peer, probed on every known transport). Priority
//! ordering is defined around the connected/disconnected behavior of §4.4
//! rather than a success-rate tier.

use atmosphere_core::NodeId;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Base probe interval while disconnected (§4.4).
pub const T_PROBE: Duration = Duration::from_secs(10);
/// Probe interval multiplier once a transport has a live connection.
pub const CONNECTED_INTERVAL_MULTIPLIER: u32 = 6;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no peers available")]
    NoProviders,
    #[error("peer already scheduled: {0}")]
    AlreadyScheduled(NodeId),
    #[error("queue full")]
    QueueFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbePriority {
    /// Newly seen or currently disconnected peers.
    High,
    /// Regular probing of a connected peer.
    Normal,
    /// A peer with a long, unbroken success streak.
    Low,
}

#[derive(Debug, Clone)]
pub struct ScheduledProbe {
    pub peer: NodeId,
    pub priority: ProbePriority,
    pub scheduled_at: Instant,
    pub attempts: u32,
}

/// Per-peer probe history driving interval and priority decisions.
#[derive(Debug, Clone, Default)]
pub struct ProbeHistory {
    pub last_probe: Option<Instant>,
    pub total_probes: u64,
    pub successful: u64,
    pub failed: u64,
    pub consecutive_failures: u32,
    pub connected: bool,
}

impl ProbeHistory {
    /// §4.4: base interval is `T_PROBE`; once connected, back off to
    /// `T_PROBE * 6` since a live heartbeat already covers liveness.
    pub fn suggested_interval(&self) -> Duration {
        if self.connected {
            T_PROBE * CONNECTED_INTERVAL_MULTIPLIER
        } else {
            T_PROBE
        }
    }

    pub fn priority(&self) -> ProbePriority {
        if !self.connected {
            ProbePriority::High
        } else if self.consecutive_failures > 0 {
            ProbePriority::Normal
        } else if self.total_probes >= 5 && self.success_rate() > 0.95 {
            ProbePriority::Low
        } else {
            ProbePriority::Normal
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_probes == 0 {
            0.0
        } else {
            self.successful as f64 / self.total_probes as f64
        }
    }

    pub fn record(&mut self, passed: bool) {
        self.last_probe = Some(Instant::now());
        self.total_probes += 1;
        if passed {
            self.successful += 1;
            self.consecutive_failures = 0;
        } else {
            self.failed += 1;
            self.consecutive_failures += 1;
        }
    }

    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }
}

/// Probe scheduler: tracks known peers, their probe history, and a
/// priority-ordered queue of due probes.
pub struct Scheduler {
    peers: RwLock<HashSet<NodeId>>,
    history: RwLock<HashMap<NodeId, ProbeHistory>>,
    high_priority: RwLock<VecDeque<ScheduledProbe>>,
    normal_priority: RwLock<VecDeque<ScheduledProbe>>,
    low_priority: RwLock<VecDeque<ScheduledProbe>>,
    in_flight: RwLock<HashSet<NodeId>>,
    max_queue_size: usize,
}

impl Scheduler {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            peers: RwLock::new(HashSet::new()),
            history: RwLock::new(HashMap::new()),
            high_priority: RwLock::new(VecDeque::new()),
            normal_priority: RwLock::new(VecDeque::new()),
            low_priority: RwLock::new(VecDeque::new()),
            in_flight: RwLock::new(HashSet::new()),
            max_queue_size,
        }
    }

    pub fn register_peer(&self, peer: NodeId) {
        self.peers.write().insert(peer);
        self.history.write().entry(peer).or_default();
    }

    pub fn remove_peer(&self, peer: &NodeId) {
        self.peers.write().remove(peer);
        self.history.write().remove(peer);
    }

    pub fn set_connected(&self, peer: &NodeId, connected: bool) {
        if let Some(h) = self.history.write().get_mut(peer) {
            h.set_connected(connected);
        }
    }

    pub fn schedule_probe(&self, peer: NodeId) -> Result<(), SchedulerError> {
        if self.in_flight.read().contains(&peer) {
            return Err(SchedulerError::AlreadyScheduled(peer));
        }

        let priority = self
            .history
            .read()
            .get(&peer)
            .map(|h| h.priority())
            .unwrap_or(ProbePriority::High);

        let probe = ScheduledProbe {
            peer,
            priority,
            scheduled_at: Instant::now(),
            attempts: 0,
        };

        let queue = match priority {
            ProbePriority::High => &self.high_priority,
            ProbePriority::Normal => &self.normal_priority,
            ProbePriority::Low => &self.low_priority,
        };
        let mut queue = queue.write();
        if queue.len() >= self.max_queue_size {
            return Err(SchedulerError::QueueFull);
        }
        queue.push_back(probe);
        Ok(())
    }

    pub fn next_probe(&self) -> Option<ScheduledProbe> {
        for queue in [&self.high_priority, &self.normal_priority, &self.low_priority] {
            if let Some(probe) = queue.write().pop_front() {
                self.in_flight.write().insert(probe.peer);
                return Some(probe);
            }
        }
        None
    }

    pub fn report_result(&self, peer: &NodeId, passed: bool) {
        self.in_flight.write().remove(peer);
        if let Some(history) = self.history.write().get_mut(peer) {
            history.record(passed);
        }
    }

    /// Schedule probes for every peer whose `suggested_interval` has elapsed,
    /// highest priority and oldest-probed first, up to `max_count`.
    pub fn schedule_due_probes(&self, max_count: usize) -> usize {
        let now = Instant::now();
        let peers: Vec<NodeId> = self.peers.read().iter().copied().collect();

        let mut candidates: Vec<(NodeId, ProbePriority, Duration)> = Vec::new();

        for peer in peers {
            if self.in_flight.read().contains(&peer) {
                continue;
            }

            let history = self.history.read();
            let hist = history.get(&peer);

            let should_probe = match hist {
                None => true,
                Some(h) => match h.last_probe {
                    None => true,
                    Some(last) => now.duration_since(last) >= h.suggested_interval(),
                },
            };

            if should_probe {
                let priority = hist.map(|h| h.priority()).unwrap_or(ProbePriority::High);
                let age = hist
                    .and_then(|h| h.last_probe)
                    .map(|lp| now.duration_since(lp))
                    .unwrap_or(Duration::from_secs(3600));
                candidates.push((peer, priority, age));
            }
        }

        candidates.sort_by(|a, b| match (a.1, b.1) {
            (ProbePriority::High, ProbePriority::High) => b.2.cmp(&a.2),
            (ProbePriority::High, _) => std::cmp::Ordering::Less,
            (_, ProbePriority::High) => std::cmp::Ordering::Greater,
            (ProbePriority::Normal, ProbePriority::Normal) => b.2.cmp(&a.2),
            (ProbePriority::Normal, _) => std::cmp::Ordering::Less,
            (_, ProbePriority::Normal) => std::cmp::Ordering::Greater,
            (ProbePriority::Low, ProbePriority::Low) => b.2.cmp(&a.2),
        });

        let mut scheduled = 0;
        for (peer, _, _) in candidates.into_iter().take(max_count) {
            if self.schedule_probe(peer).is_ok() {
                scheduled += 1;
            }
        }
        scheduled
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            peers: self.peers.read().len(),
            high_priority_queued: self.high_priority.read().len(),
            normal_priority_queued: self.normal_priority.read().len(),
            low_priority_queued: self.low_priority.read().len(),
            in_flight: self.in_flight.read().len(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub peers: usize,
    pub high_priority_queued: usize,
    pub normal_priority_queued: usize,
    pub low_priority_queued: usize,
    pub in_flight: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_history_is_high_priority_with_short_interval() {
        let history = ProbeHistory::default();
        assert_eq!(history.priority(), ProbePriority::High);
        assert_eq!(history.suggested_interval(), T_PROBE);
    }

    #[test]
    fn connected_streak_backs_off_interval_and_priority() {
        let mut history = ProbeHistory::default();
        history.set_connected(true);
        for _ in 0..10 {
            history.record(true);
        }
        assert_eq!(history.priority(), ProbePriority::Low);
        assert_eq!(history.suggested_interval(), T_PROBE * CONNECTED_INTERVAL_MULTIPLIER);
    }

    #[test]
    fn scheduling_round_trip() {
        let scheduler = Scheduler::new(100);
        let peer = NodeId([1; 16]);

        scheduler.register_peer(peer);
        scheduler.schedule_probe(peer).unwrap();

        let probe = scheduler.next_probe();
        assert_eq!(probe.unwrap().peer, peer);
    }

    #[test]
    fn due_probes_are_bounded_by_max_count() {
        let scheduler = Scheduler::new(100);
        for i in 0..5u8 {
            scheduler.register_peer(NodeId([i; 16]));
        }
        let scheduled = scheduler.schedule_due_probes(3);
        assert!(scheduled <= 3);
    }
}
