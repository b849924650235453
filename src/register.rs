//! Client-side registration bookkeeping.
//!
//! The registration handshake itself belongs to the host. This module only
//! keeps what the signaling side reads and writes: the control-plane
//! connection, the peers we know about, and the reset/offline requests
//! peers send us.

use crate::registry::Registry;
use crate::transport::ConnectionRef;
use std::sync::RwLock;
use tokio::sync::broadcast;
use tracing::info;

/// ClientInfo is what we know about another registered peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: u64,
    pub name: String,
    /// how many reverse-connect attempts the peer should make
    pub try_reverse: u8,
}

/// RegisterEvent is published when a peer asks us to drop our registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterEvent {
    /// register again from scratch
    Reset,
    /// stop and stay offline
    Offline,
}

pub struct RegisterState {
    online: RwLock<Option<ConnectionRef>>,
    peers: Registry<u64, ClientInfo>,
    events: broadcast::Sender<RegisterEvent>,
}

impl Default for RegisterState {
    fn default() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            online: RwLock::new(None),
            peers: Registry::new(),
            events,
        }
    }
}

impl RegisterState {
    pub fn new() -> Self {
        Self::default()
    }

    /// online_connection is the control-plane connection, if registered
    pub fn online_connection(&self) -> Option<ConnectionRef> {
        self.online.read().ok().and_then(|online| online.clone())
    }

    pub fn set_online(&self, connection: ConnectionRef) {
        info!("registered as {}", connection.connect_id());
        if let Ok(mut online) = self.online.write() {
            *online = Some(connection);
        }
    }

    pub fn is_online(&self) -> bool {
        self.online_connection().is_some()
    }

    pub fn add_peer(&self, peer: ClientInfo) -> bool {
        self.peers.add(peer.id, peer)
    }

    pub fn peer(&self, id: u64) -> Option<ClientInfo> {
        self.peers.try_get(&id)
    }

    pub fn remove_peer(&self, id: u64) -> Option<ClientInfo> {
        self.peers.remove(&id)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegisterEvent> {
        self.events.subscribe()
    }

    /// reset drops the current registration so the host registers again
    pub fn reset(&self) {
        info!("registration reset requested");
        self.clear();
        let _ = self.events.send(RegisterEvent::Reset);
    }

    /// exit drops the current registration and stays offline
    pub fn exit(&self) {
        info!("going offline");
        self.clear();
        let _ = self.events.send(RegisterEvent::Offline);
    }

    fn clear(&self) {
        if let Ok(mut online) = self.online.write() {
            *online = None;
        }
    }
}
