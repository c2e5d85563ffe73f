//! Dialing information for a remote peer.
//!
//! This is deliberately thin: the rich, mutable per-peer state machine
//! (liveness, RTT EWMA, missed heartbeats) lives in `atmosphere-supervisor`,
//! which owns connection supervision end to end (§4.4). This
//! crate only needs enough to know who to dial and over which transport.

use atmosphere_core::{Endpoint, NodeId, TransportKind};
use std::collections::BTreeMap;

/// Everything the transport layer needs to attempt a connection to a peer.
#[derive(Clone, Debug)]
pub struct PeerAddressBook {
    pub node_id: NodeId,
    pub public_key: [u8; 32],
    pub endpoints: BTreeMap<TransportKind, Endpoint>,
}

impl PeerAddressBook {
    pub fn new(node_id: NodeId, public_key: [u8; 32]) -> Self {
        Self {
            node_id,
            public_key,
            endpoints: BTreeMap::new(),
        }
    }

    pub fn add_endpoint(&mut self, endpoint: Endpoint) {
        self.endpoints.insert(endpoint.transport_kind(), endpoint);
    }

    /// Endpoints in transport priority order (LAN, UDP, Relay, BLE), skipping
    /// transports we have no endpoint for.
    pub fn dial_order(&self) -> Vec<&Endpoint> {
        TransportKind::PRIORITY_ORDER
            .iter()
            .filter_map(|kind| self.endpoints.get(kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dial_order_follows_transport_priority() {
        let mut book = PeerAddressBook::new(NodeId([1; 16]), [2; 32]);
        book.add_endpoint(Endpoint::Ble { mac: "aa:bb".into() });
        book.add_endpoint(Endpoint::Lan {
            host: "10.0.0.1".into(),
            port: 7420,
        });
        book.add_endpoint(Endpoint::Relay {
            url: "wss://relay.example".into(),
            session_id: "s1".into(),
        });

        let order: Vec<_> = book.dial_order().into_iter().map(|e| e.transport_kind()).collect();
        assert_eq!(
            order,
            vec![TransportKind::Lan, TransportKind::Relay, TransportKind::Ble]
        );
    }
}
