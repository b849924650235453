use crate::registry::{ConnectionKey, ConnectionKeyUdp};
use crate::socks5::protocol::{AuthMethod, Socks5Step};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Socks5Info is one relay message: a step-tagged slice of the client's
/// SOCKS5 conversation plus the identity of the session it belongs to.
///
/// The same value doubles as the session context on the relay side. A
/// TCP session's read loop owns its copy exclusively and reuses the
/// `response` buffer for every reply it emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Socks5Info {
    pub step: Socks5Step,
    /// id of the tunnel/client the message travelled on
    pub client_id: u64,
    /// per-client request id, one per SOCKS5 conversation
    pub request_id: u32,
    pub auth_type: AuthMethod,
    /// client-side UDP source, set on ForwardUdp messages
    pub source_ep: Option<SocketAddr>,
    /// destination of the first datagram of a UDP mapping
    pub target_ep: Option<SocketAddr>,
    pub data: Bytes,
    #[serde(skip)]
    response: [u8; 1],
}

impl Socks5Info {
    pub fn new(step: Socks5Step, client_id: u64, request_id: u32, data: impl Into<Bytes>) -> Self {
        Self {
            step,
            client_id,
            request_id,
            auth_type: AuthMethod::NoAuth,
            source_ep: None,
            target_ep: None,
            data: data.into(),
            response: [0],
        }
    }

    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source_ep = Some(source);
        self
    }

    /// set_response replaces the payload with a single status byte
    pub fn set_response(&mut self, code: u8) {
        self.response[0] = code;
        self.data = Bytes::copy_from_slice(&self.response);
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            connect_id: self.client_id,
            request_id: self.request_id,
        }
    }

    pub fn udp_key(&self) -> Option<ConnectionKeyUdp> {
        self.source_ep.map(|source| ConnectionKeyUdp {
            connect_id: self.client_id,
            source,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
