//! STUN client (RFC 5389 Binding Request/Response) for public-endpoint
//! discovery ahead of UDP hole punching (§4.2, §6).
//!
//! Adapted from a synchronous std-socket STUN client to
//! `tokio::net::UdpSocket`, carrying over that client's error/retry
//! conventions into this crate's own error type.

use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;
const MAPPED_ADDRESS: u16 = 0x0001;

#[derive(Debug, Error)]
pub enum StunError {
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("STUN request timed out")]
    Timeout,
    #[error("invalid STUN response: {0}")]
    InvalidResponse(String),
    #[error("no STUN servers configured")]
    NoServers,
    #[error("all STUN servers failed")]
    AllServersFailed,
}

#[derive(Debug, Clone)]
pub struct StunConfig {
    pub servers: Vec<SocketAddr>,
    pub request_timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(74, 125, 250, 129)), 19302), // stun.l.google.com
                SocketAddr::new(IpAddr::V4(Ipv4Addr::new(74, 125, 197, 127)), 19302),
            ],
            // §5 default timeout budget: 1s per STUN server.
            request_timeout: Duration::from_secs(1),
            retries: 2,
            retry_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StunResult {
    pub mapped_address: SocketAddr,
    pub rtt: Duration,
}

pub struct StunClient {
    config: StunConfig,
}

impl StunClient {
    pub fn new(config: StunConfig) -> Self {
        Self { config }
    }

    /// Ask each configured STUN server in turn, returning the first success.
    pub async fn discover_public_address(&self, socket: &UdpSocket) -> Result<StunResult, StunError> {
        if self.config.servers.is_empty() {
            return Err(StunError::NoServers);
        }
        for server in &self.config.servers {
            match self.query_server(socket, *server).await {
                Ok(result) => return Ok(result),
                Err(_) => continue,
            }
        }
        Err(StunError::AllServersFailed)
    }

    async fn query_server(&self, socket: &UdpSocket, server: SocketAddr) -> Result<StunResult, StunError> {
        let mut last_err = None;
        for attempt in 0..=self.config.retries {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry_delay).await;
            }
            let transaction_id = generate_transaction_id();
            let request = build_binding_request(&transaction_id);
            let started = tokio::time::Instant::now();

            if let Err(e) = socket.send_to(&request, server).await {
                last_err = Some(StunError::Network(e));
                continue;
            }

            let mut buf = [0u8; 512];
            let recv = timeout(self.config.request_timeout, socket.recv_from(&mut buf)).await;
            let (len, from) = match recv {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    last_err = Some(StunError::Network(e));
                    continue;
                }
                Err(_) => {
                    last_err = Some(StunError::Timeout);
                    continue;
                }
            };
            if from != server {
                last_err = Some(StunError::InvalidResponse("response from unexpected address".into()));
                continue;
            }

            match parse_binding_response(&buf[..len], &transaction_id) {
                Ok(mapped_address) => {
                    return Ok(StunResult {
                        mapped_address,
                        rtt: started.elapsed(),
                    })
                }
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            }
        }
        Err(last_err.unwrap_or(StunError::AllServersFailed))
    }
}

fn generate_transaction_id() -> [u8; 12] {
    let mut id = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(20);
    msg.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    msg.extend_from_slice(&0u16.to_be_bytes()); // message length: no attributes
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction_id);
    msg
}

fn parse_binding_response(buf: &[u8], expected_transaction_id: &[u8; 12]) -> Result<SocketAddr, StunError> {
    if buf.len() < 20 {
        return Err(StunError::InvalidResponse("response shorter than STUN header".into()));
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(StunError::InvalidResponse(format!(
            "unexpected message type: {msg_type:#06x}"
        )));
    }
    let msg_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let cookie = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(StunError::InvalidResponse("bad magic cookie".into()));
    }
    if &buf[8..20] != expected_transaction_id {
        return Err(StunError::InvalidResponse("transaction id mismatch".into()));
    }

    let attrs_end = (20 + msg_len).min(buf.len());
    let mut offset = 20;
    let mut fallback_mapped = None;

    while offset + 4 <= attrs_end {
        let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let value_start = offset + 4;
        let value_end = value_start + attr_len;
        if value_end > attrs_end {
            break;
        }
        let value = &buf[value_start..value_end];

        if attr_type == XOR_MAPPED_ADDRESS {
            if let Some(addr) = parse_xor_mapped_address(value) {
                return Ok(addr);
            }
        } else if attr_type == MAPPED_ADDRESS && fallback_mapped.is_none() {
            fallback_mapped = parse_mapped_address(value);
        }

        // Attributes are padded to a 4-byte boundary.
        offset = value_end + ((4 - (attr_len % 4)) % 4);
    }

    fallback_mapped.ok_or_else(|| StunError::InvalidResponse("no mapped address attribute".into()))
}

fn parse_xor_mapped_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != 0x01 {
        return None; // family must be IPv4; IPv6 not needed for this protocol
    }
    let xport = u16::from_be_bytes([value[2], value[3]]);
    let port = xport ^ ((MAGIC_COOKIE >> 16) as u16);

    let cookie_bytes = MAGIC_COOKIE.to_be_bytes();
    let mut ip_bytes = [0u8; 4];
    for i in 0..4 {
        ip_bytes[i] = value[4 + i] ^ cookie_bytes[i];
    }
    Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip_bytes)), port))
}

fn parse_mapped_address(value: &[u8]) -> Option<SocketAddr> {
    if value.len() < 8 || value[1] != 0x01 {
        return None;
    }
    let port = u16::from_be_bytes([value[2], value[3]]);
    let ip_bytes = [value[4], value[5], value[6], value[7]];
    Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip_bytes)), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xor_mapped_address_roundtrip() {
        let transaction_id = generate_transaction_id();
        let want = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 42)), 54321);

        let xport = 54321u16 ^ ((MAGIC_COOKIE >> 16) as u16);
        let cookie_bytes = MAGIC_COOKIE.to_be_bytes();
        let ip = [203u8, 0, 113, 42];
        let mut xip = [0u8; 4];
        for i in 0..4 {
            xip[i] = ip[i] ^ cookie_bytes[i];
        }

        let mut attr_value = Vec::new();
        attr_value.push(0);
        attr_value.push(0x01);
        attr_value.extend_from_slice(&xport.to_be_bytes());
        attr_value.extend_from_slice(&xip);

        let mut response = Vec::new();
        response.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        response.extend_from_slice(&((4 + attr_value.len()) as u16).to_be_bytes());
        response.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        response.extend_from_slice(&transaction_id);
        response.extend_from_slice(&XOR_MAPPED_ADDRESS.to_be_bytes());
        response.extend_from_slice(&(attr_value.len() as u16).to_be_bytes());
        response.extend_from_slice(&attr_value);

        let got = parse_binding_response(&response, &transaction_id).unwrap();
        assert_eq!(got, want);
    }

    #[test]
    fn rejects_wrong_transaction_id() {
        let transaction_id = generate_transaction_id();
        let other_id = generate_transaction_id();

        let mut response = Vec::new();
        response.extend_from_slice(&BINDING_RESPONSE.to_be_bytes());
        response.extend_from_slice(&0u16.to_be_bytes());
        response.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        response.extend_from_slice(&other_id);

        assert!(parse_binding_response(&response, &transaction_id).is_err());
    }

    #[test]
    fn build_request_has_correct_header() {
        let transaction_id = generate_transaction_id();
        let req = build_binding_request(&transaction_id);
        assert_eq!(req.len(), 20);
        assert_eq!(u16::from_be_bytes([req[0], req[1]]), BINDING_REQUEST);
        assert_eq!(u32::from_be_bytes([req[4], req[5], req[6], req[7]]), MAGIC_COOKIE);
    }
}
