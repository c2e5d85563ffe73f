//! Per-(peer, transport) heartbeat bookkeeping and the Suspect/Dead
//! liveness state machine (§4.10, §4.4).
//!
//! Tracks timestamps and consecutive-failure counts per target, wired into
//! the richer `PeerState` data model keyed by `NodeId` rather than a bare
//! `[u8; 32]`.

use atmosphere_core::{LivenessState, PeerState, TransportKind};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Three missed heartbeats mark a transport unhealthy (§4.4).
const MISSED_THRESHOLD: u32 = 3;
/// Losing the last healthy transport suspends the peer for 2x its timeout
/// before declaring it Dead (§4.4).
const SUSPECT_MULTIPLIER: u32 = 2;
/// Reconnect backoff floor and ceiling (§4.4).
const RECONNECT_BACKOFF_FLOOR: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

/// The mutable heartbeat/liveness bookkeeping for one peer, layered over
/// the plain-data `PeerState` snapshot shared across crate boundaries.
pub struct PeerEntry {
    pub state: PeerState,
    last_sent: HashMap<TransportKind, Instant>,
    last_recv: HashMap<TransportKind, Instant>,
    probe_success: HashMap<TransportKind, Instant>,
    suspect_since: Option<Instant>,
    reconnect_backoff: Duration,
    next_reconnect_attempt: Option<Instant>,
}

impl PeerEntry {
    pub fn new(state: PeerState) -> Self {
        Self {
            state,
            last_sent: HashMap::new(),
            last_recv: HashMap::new(),
            probe_success: HashMap::new(),
            suspect_since: None,
            reconnect_backoff: RECONNECT_BACKOFF_FLOOR,
            next_reconnect_attempt: None,
        }
    }

    /// Exponential backoff on a failed reconnect attempt, capped at 60s (§4.4).
    pub fn note_reconnect_failure(&mut self, now: Instant) {
        self.next_reconnect_attempt = Some(now + self.reconnect_backoff);
        self.reconnect_backoff = (self.reconnect_backoff * 2).min(RECONNECT_BACKOFF_CAP);
    }

    /// A successful connection resets backoff to the floor.
    pub fn reset_backoff(&mut self) {
        self.reconnect_backoff = RECONNECT_BACKOFF_FLOOR;
        self.next_reconnect_attempt = None;
    }

    pub fn ready_to_reconnect(&self, now: Instant) -> bool {
        match self.next_reconnect_attempt {
            None => true,
            Some(at) => now >= at,
        }
    }

    pub fn record_heartbeat_sent(&mut self, transport: TransportKind, now: Instant) {
        self.last_sent.insert(transport, now);
    }

    /// §4.10: `RTT EWMA = 0.2 x (now - sent) + 0.8 x old`; resets missed_count
    /// to zero and clears Suspect if this was the active transport.
    pub fn record_heartbeat_recv(&mut self, transport: TransportKind, now: Instant) {
        if let Some(sent) = self.last_sent.get(&transport) {
            let rtt_ms = now.saturating_duration_since(*sent).as_secs_f64() * 1000.0;
            let old = self.state.rtt_ewma_ms.get(&transport).copied().unwrap_or(rtt_ms);
            self.state.rtt_ewma_ms.insert(transport, 0.2 * rtt_ms + 0.8 * old);
        }
        self.last_recv.insert(transport, now);
        self.state.missed_heartbeats.insert(transport, 0);

        if Some(transport) == self.state.active_transport
            && matches!(self.state.liveness, LivenessState::Suspect | LivenessState::Probing | LivenessState::Unknown)
        {
            self.state.liveness = LivenessState::Connected;
            self.suspect_since = None;
        }
    }

    /// Called on each heartbeat tick. Returns `true` if this transport just
    /// crossed the missed-heartbeat threshold. Three consecutive misses on
    /// the active transport move the peer to Suspect; staying Suspect for
    /// `2 x timeout` moves it to Dead (§4.4).
    pub fn check_timeout(&mut self, transport: TransportKind, now: Instant) -> bool {
        let interval = transport.heartbeat_interval();
        let timeout = interval * MISSED_THRESHOLD;
        let last = self.last_recv.get(&transport).or_else(|| self.last_sent.get(&transport));

        let missed_this_tick = match last {
            Some(last) => now.saturating_duration_since(*last) > timeout,
            None => false,
        };
        if missed_this_tick {
            *self.state.missed_heartbeats.entry(transport).or_insert(0) += 1;
        }

        let unhealthy = self.state.missed_heartbeats.get(&transport).copied().unwrap_or(0) >= MISSED_THRESHOLD;

        if unhealthy && self.state.active_transport == Some(transport) {
            match self.suspect_since {
                None => {
                    self.state.liveness = LivenessState::Suspect;
                    self.suspect_since = Some(now);
                }
                Some(since) if now.saturating_duration_since(since) >= timeout * SUSPECT_MULTIPLIER => {
                    self.state.liveness = LivenessState::Dead;
                }
                Some(_) => {}
            }
        }
        unhealthy
    }

    pub fn is_healthy(&self, transport: TransportKind) -> bool {
        self.state.missed_heartbeats.get(&transport).copied().unwrap_or(0) < MISSED_THRESHOLD
    }

    /// Transport's measured RTT, if any heartbeat has completed.
    pub fn rtt_ms(&self, transport: TransportKind) -> Option<f64> {
        self.state.rtt_ewma_ms.get(&transport).copied()
    }

    pub fn record_probe_success(&mut self, transport: TransportKind, now: Instant) {
        self.probe_success.insert(transport, now);
    }

    /// Highest-priority transport with a successful probe within the last
    /// 30s (§4.4's freshness window for transport selection).
    pub fn freshest_transport(&self, now: Instant, fresh_window: Duration) -> Option<TransportKind> {
        TransportKind::PRIORITY_ORDER
            .iter()
            .copied()
            .find(|t| matches!(self.probe_success.get(t), Some(at) if now.saturating_duration_since(*at) < fresh_window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atmosphere_core::NodeId;

    fn entry() -> PeerEntry {
        let mut state = PeerState::new(NodeId([1; 16]), [2; 32]);
        state.active_transport = Some(TransportKind::Lan);
        PeerEntry::new(state)
    }

    #[test]
    fn heartbeat_recv_updates_rtt_and_resets_missed() {
        let mut e = entry();
        let t0 = Instant::now();
        e.record_heartbeat_sent(TransportKind::Lan, t0);
        e.state.missed_heartbeats.insert(TransportKind::Lan, 2);
        e.record_heartbeat_recv(TransportKind::Lan, t0 + Duration::from_millis(50));
        assert_eq!(e.state.missed_heartbeats[&TransportKind::Lan], 0);
        assert!(e.rtt_ms(TransportKind::Lan).unwrap() > 0.0);
    }

    #[test]
    fn three_missed_marks_unhealthy_and_suspect() {
        let mut e = entry();
        let t0 = Instant::now();
        e.record_heartbeat_sent(TransportKind::Lan, t0);
        let timeout = TransportKind::Lan.heartbeat_interval() * 3;

        for i in 1..=3u32 {
            let now = t0 + timeout * i + Duration::from_secs(1);
            e.check_timeout(TransportKind::Lan, now);
        }
        assert!(!e.is_healthy(TransportKind::Lan));
        assert_eq!(e.state.liveness, LivenessState::Suspect);
    }

    #[test]
    fn suspect_escalates_to_dead_after_grace_period() {
        let mut e = entry();
        let t0 = Instant::now();
        e.record_heartbeat_sent(TransportKind::Lan, t0);
        let timeout = TransportKind::Lan.heartbeat_interval() * 3;

        for i in 1..=3u32 {
            e.check_timeout(TransportKind::Lan, t0 + timeout * i + Duration::from_secs(1));
        }
        assert_eq!(e.state.liveness, LivenessState::Suspect);

        e.check_timeout(TransportKind::Lan, t0 + timeout * 3 + timeout * 2 + Duration::from_secs(2));
        assert_eq!(e.state.liveness, LivenessState::Dead);
    }
}
