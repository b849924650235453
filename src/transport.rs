//! The messenger seam between this crate and the tunnel transport.
//!
//! The tunnel itself (framing, encryption, the registration handshake) is
//! owned by the host. This module only names what the relay and the
//! hole-punch coordinator need from it: a handle to a connection, and two
//! ways of sending a message over one.

use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// Connection is a live tunnel connection to one peer (or to the
/// signaling server)
pub trait Connection: Send + Sync + Debug {
    /// connect_id is the id the server assigned to this end of the tunnel
    fn connect_id(&self) -> u64;

    fn is_connected(&self) -> bool {
        true
    }
}

pub type ConnectionRef = Arc<dyn Connection>;

/// MessageRequest is the envelope handed to the transport
#[derive(Debug, Clone)]
pub struct MessageRequest {
    pub connection: ConnectionRef,
    pub messenger_id: u16,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageResponseCode {
    Ok,
    NotFound,
    Timeout,
    Error,
}

/// MessageResponse is what the remote messenger answered to a
/// [`MessengerTransport::send_reply`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageResponse {
    pub code: MessageResponseCode,
    pub data: Vec<u8>,
}

impl MessageResponse {
    pub fn ok(data: Vec<u8>) -> Self {
        Self {
            code: MessageResponseCode::Ok,
            data,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection {0} is not connected")]
    NotConnected(u64),

    #[error("transport closed")]
    Closed,

    #[error("timed out waiting for reply")]
    Timeout,

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// MessengerTransport delivers envelopes. `send_only` returns once the
/// frame is handed off; `send_reply` waits for the peer's answer. Neither
/// retries.
#[async_trait]
pub trait MessengerTransport: Send + Sync {
    async fn send_only(&self, request: MessageRequest) -> Result<(), TransportError>;

    async fn send_reply(&self, request: MessageRequest) -> Result<MessageResponse, TransportError>;
}
