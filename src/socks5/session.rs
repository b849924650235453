use crate::eviction::Idle;
use crate::registry::{ConnectionKey, ConnectionKeyUdp};
use crate::socks5::info::Socks5Info;
use anyhow::{Result, anyhow};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UdpSocket;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::time::Instant;

/// TcpSession is the registry's view of a relayed TCP connection: the
/// write half of the destination socket plus the teardown state. The
/// read half lives in the session's read loop.
#[derive(Debug)]
pub(crate) struct TcpSession {
    pub key: ConnectionKey,
    writer: AsyncMutex<OwnedWriteHalf>,
    closed: AtomicBool,
    shutdown: Notify,
    // identity fields only, used for the close notice
    close_info: Socks5Info,
}

impl TcpSession {
    pub fn new(writer: OwnedWriteHalf, info: &Socks5Info) -> Self {
        let mut close_info = info.clone();
        close_info.data = bytes::Bytes::new();

        Self {
            key: info.key(),
            writer: AsyncMutex::new(writer),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            close_info,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// mark_closed flips the closed flag and returns true for the one
    /// caller that actually closed the session
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn close_info(&self) -> &Socks5Info {
        &self.close_info
    }

    /// shutdown wakes the read loop and half-closes the destination
    /// socket unless a write currently owns it
    pub async fn shutdown(&self) {
        self.shutdown.notify_one();
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
    }

    pub async fn closed(&self) {
        self.shutdown.notified().await
    }

    /// write sends the whole payload or fails after `limit`
    pub async fn write(&self, data: &[u8], limit: Duration) -> Result<()> {
        let mut writer = self.writer.lock().await;
        tokio::time::timeout(limit, writer.write_all(data))
            .await
            .map_err(|_| anyhow!("write timed out after {limit:?}"))??;
        Ok(())
    }
}

/// UdpMapping is one outbound UDP socket dedicated to a client source
/// endpoint
#[derive(Debug)]
pub(crate) struct UdpMapping {
    pub key: ConnectionKeyUdp,
    pub socket: UdpSocket,
    target: Mutex<SocketAddr>,
    last_activity: Mutex<Instant>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl UdpMapping {
    pub fn new(key: ConnectionKeyUdp, socket: UdpSocket, target: SocketAddr) -> Self {
        Self {
            key,
            socket,
            target: Mutex::new(target),
            last_activity: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn touch(&self) {
        if let Ok(mut last) = self.last_activity.lock() {
            *last = Instant::now();
        }
    }

    pub fn last_activity(&self) -> Instant {
        match self.last_activity.lock() {
            Ok(last) => *last,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn set_target(&self, target: SocketAddr) {
        if let Ok(mut current) = self.target.lock() {
            *current = target;
        }
    }

    pub fn target(&self) -> Option<SocketAddr> {
        self.target.lock().ok().map(|target| *target)
    }

    pub async fn closed(&self) {
        self.shutdown.notified().await
    }
}

impl Idle for std::sync::Arc<UdpMapping> {
    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    fn release(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown.notify_one();
        }
    }
}
