use crate::registry::Registry;
use crate::socks5::info::Socks5Info;
use crate::transport::{ConnectionRef, MessageRequest, MessengerTransport};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// Messenger id of relay data frames going back to the tunnel side
pub const SOCKS5_RESPONSE_MESSENGER_ID: u16 = 0x0501;

/// Messenger id of session close frames
pub const SOCKS5_CLOSE_MESSENGER_ID: u16 = 0x0502;

/// Socks5MessengerSender is where the relay engine hands its replies.
/// Every call is made with the engine's send gate held, so an
/// implementation never sees two frames interleaved.
#[async_trait]
pub trait Socks5MessengerSender: Send + Sync {
    /// response delivers `info.data` to the tunnel side; false means the
    /// tunnel is gone and the session should be torn down
    async fn response(&self, info: &Socks5Info) -> bool;

    /// response_close tells the tunnel side the session is finished
    async fn response_close(&self, info: &Socks5Info);
}

/// TunnelSocks5Sender re-encapsulates relay replies and pushes them
/// through a [`MessengerTransport`], routed by client id
pub struct TunnelSocks5Sender {
    transport: Arc<dyn MessengerTransport>,
    tunnels: Registry<u64, ConnectionRef>,
}

impl TunnelSocks5Sender {
    pub fn new(transport: Arc<dyn MessengerTransport>) -> Self {
        Self {
            transport,
            tunnels: Registry::new(),
        }
    }

    /// bind routes replies for `client_id` over `connection`; an existing
    /// binding is kept
    pub fn bind(&self, client_id: u64, connection: ConnectionRef) -> bool {
        self.tunnels.add(client_id, connection)
    }

    pub fn unbind(&self, client_id: u64) {
        self.tunnels.remove(&client_id);
    }

    async fn deliver(&self, info: &Socks5Info, messenger_id: u16) -> bool {
        let Some(connection) = self.tunnels.try_get(&info.client_id) else {
            debug!("no tunnel bound for client {}", info.client_id);
            return false;
        };

        let payload = match info.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode relay message: {e}");
                return false;
            }
        };

        let request = MessageRequest {
            connection,
            messenger_id,
            payload,
        };

        match self.transport.send_only(request).await {
            Ok(()) => true,
            Err(e) => {
                debug!("relay delivery to client {} failed: {e}", info.client_id);
                false
            }
        }
    }
}

#[async_trait]
impl Socks5MessengerSender for TunnelSocks5Sender {
    async fn response(&self, info: &Socks5Info) -> bool {
        self.deliver(info, SOCKS5_RESPONSE_MESSENGER_ID).await
    }

    async fn response_close(&self, info: &Socks5Info) {
        let mut close = info.clone();
        close.data = bytes::Bytes::new();
        self.deliver(&close, SOCKS5_CLOSE_MESSENGER_ID).await;
    }
}
