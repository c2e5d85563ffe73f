//! Networking primitives for the Atmosphere mesh runtime.
//!
//! This crate provides:
//! - Wire framing (CBOR, length-prefixed, BLE fragmentation)
//! - STUN-based public endpoint discovery
//! - The four uniform transports: LAN, UDP, Relay, BLE

pub mod framing;
pub mod peer;
pub mod stun;
pub mod transport;

pub use framing::{Frame, FrameCodec, FrameKind};
pub use peer::PeerAddressBook;
pub use stun::{StunClient, StunConfig, StunError, StunResult};
pub use transport::{
    BleAdapter, BleRadio, Connection, LanAdapter, RelayAdapter, RelayServer, TransportAdapter,
    TransportError, TransportEvent, UdpAdapter,
};
