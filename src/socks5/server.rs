use crate::config::RelayConfig;
use crate::eviction::{Idle, IdleEvictionScheduler};
use crate::registry::{ConnectionKey, ConnectionKeyUdp, Registry};
use crate::socks5::address::TargetAddr;
use crate::socks5::auth::{Socks5AuthValidator, Socks5Validator};
use crate::socks5::info::Socks5Info;
use crate::socks5::messenger::Socks5MessengerSender;
use crate::socks5::parser::{command_target, greeting_methods, udp_envelope, udp_response_envelope};
use crate::socks5::protocol::{AuthMethod, Command, MAX_DGRAM, ReplyCode, Socks5Step};
use crate::socks5::session::{TcpSession, UdpMapping};
use anyhow::{Result, anyhow};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Socks5RelayEngine terminates the SOCKS5 conversation of tunneled
/// clients and performs the real network I/O on their behalf.
///
/// Cloning is cheap; all clones share the same session tables.
#[derive(Clone)]
pub struct Socks5RelayEngine {
    inner: Arc<Inner>,
}

struct Inner {
    config: RelayConfig,
    connections: Registry<ConnectionKey, Arc<TcpSession>>,
    udp_connections: Arc<Registry<ConnectionKeyUdp, Arc<UdpMapping>>>,
    sender: Arc<dyn Socks5MessengerSender>,
    validator: Arc<dyn Socks5Validator>,
    auth_validator: Arc<dyn Socks5AuthValidator>,
    // one reply in flight to the tunnel at a time
    gate: Mutex<()>,
    _eviction: IdleEvictionScheduler,
}

/// Socks5RelayEngine implementation block
impl Socks5RelayEngine {
    /// new builds the engine and starts the UDP idle sweep, so it must
    /// be called inside a tokio runtime
    pub fn new(
        config: RelayConfig,
        sender: Arc<dyn Socks5MessengerSender>,
        validator: Arc<dyn Socks5Validator>,
        auth_validator: Arc<dyn Socks5AuthValidator>,
    ) -> Self {
        let udp_connections = Arc::new(Registry::new());
        let eviction = IdleEvictionScheduler::spawn(
            Arc::clone(&udp_connections),
            config.udp_sweep_interval,
            config.udp_idle_timeout,
        );

        Self {
            inner: Arc::new(Inner {
                config,
                connections: Registry::new(),
                udp_connections,
                sender,
                validator,
                auth_validator,
                gate: Mutex::new(()),
                _eviction: eviction,
            }),
        }
    }

    /// input_data dispatches one relay message by its step. An empty
    /// payload is the tunnel side's close signal and is routed to Forward.
    pub async fn input_data(&self, mut info: Socks5Info) {
        if info.data.is_empty() {
            info.step = Socks5Step::Forward;
        }

        let step = info.step;
        let key = info.key();
        let result = match step {
            Socks5Step::Greeting => self.handle_greeting(info).await,
            Socks5Step::Auth => self.handle_auth(info).await,
            Socks5Step::Command => self.handle_command(info).await,
            Socks5Step::Forward => self.handle_forward(info).await,
            Socks5Step::ForwardUdp => self.handle_forward_udp(info).await,
        };

        if let Err(e) = result {
            debug!("{step:?} for {key:?} failed: {e}");
        }
    }

    /// close tears down the TCP session with this identity, if any
    pub async fn close(&self, key: &ConnectionKey) {
        if let Some(session) = self.inner.connections.try_get(key) {
            self.close_session(&session).await;
        }
    }

    pub fn has_session(&self, key: &ConnectionKey) -> bool {
        self.inner.connections.contains(key)
    }

    pub fn session_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn udp_mapping_count(&self) -> usize {
        self.inner.udp_connections.len()
    }

    /// udp_last_activity returns when the mapping last saw a datagram in
    /// either direction
    pub fn udp_last_activity(&self, key: &ConnectionKeyUdp) -> Option<Instant> {
        self.inner
            .udp_connections
            .try_get(key)
            .map(|mapping| mapping.last_activity())
    }

    // =========
    // GREETING
    // =========

    async fn handle_greeting(&self, mut info: Socks5Info) -> Result<()> {
        let method = match greeting_methods(&info.data) {
            Ok(offered) => self.inner.auth_validator.get_auth_type(offered),
            Err(e) => {
                debug!("bad client hello from {:?}: {e}", info.key());
                AuthMethod::NoAcceptable
            }
        };

        info.auth_type = method;
        info.set_response(method as u8);
        self.respond(&info).await;
        Ok(())
    }

    // =====
    // AUTH
    // =====

    async fn handle_auth(&self, mut info: Socks5Info) -> Result<()> {
        let status = self.inner.auth_validator.validate(&info.data, info.auth_type);
        info.set_response(status as u8);
        self.respond(&info).await;
        Ok(())
    }

    // ========
    // COMMAND
    // ========

    async fn handle_command(&self, mut info: Socks5Info) -> Result<()> {
        if !self.inner.validator.validate(&info) {
            self.reply(&mut info, ReplyCode::CommandNotSupported).await;
            return Ok(());
        }

        let (command, target) = match command_target(&info.data) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.reply(&mut info, ReplyCode::HostUnreachable).await;
                return Err(e);
            }
        };

        if target.port() == 0 {
            self.reply(&mut info, ReplyCode::NetworkUnreachable).await;
            return Ok(());
        }

        match command {
            Some(Command::Connect) => {
                // The connect completes in its own task; the caller gets
                // the outcome as a reply through the sender
                let engine = self.clone();
                tokio::spawn(async move { engine.connect(info, target).await });
            }
            Some(Command::UdpAssociate) => {
                self.reply(&mut info, ReplyCode::Succeeded).await;
            }
            Some(Command::Bind) | None => {
                self.reply(&mut info, ReplyCode::CommandNotSupported).await;
            }
        }

        Ok(())
    }

    /// connect opens the destination socket and, on success, registers
    /// the session and runs its read loop until teardown
    async fn connect(&self, mut info: Socks5Info, target: TargetAddr) {
        let result = match target.resolve().await {
            Ok(addr) => open_tcp(addr).await.map_err(ConnectError::Io),
            Err(e) => Err(ConnectError::Resolve(e)),
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                let code = e.reply_code();
                warn!("connect to {target} failed ({code:?}): {e}");
                self.reply(&mut info, code).await;
                self.notify_close(&info).await;
                return;
            }
        };

        let (reader, writer) = stream.into_split();
        let session = Arc::new(TcpSession::new(writer, &info));
        if !self.inner.connections.add(session.key, Arc::clone(&session)) {
            warn!("session {:?} is already live, refusing second connect", session.key);
            self.reply(&mut info, ReplyCode::ServerFailure).await;
            return;
        }

        info!("connected {:?} -> {target}", session.key);

        // Success reply goes out before any destination data can
        if !self.reply(&mut info, ReplyCode::Succeeded).await {
            self.close_session(&session).await;
            return;
        }
        info.step = Socks5Step::Forward;

        self.read_loop(session, reader, info).await;
    }

    /// read_loop streams destination data back through the tunnel
    async fn read_loop(&self, session: Arc<TcpSession>, mut reader: OwnedReadHalf, mut info: Socks5Info) {
        let buffer_size = self.inner.config.buffer_size;
        let mut buffer = BytesMut::with_capacity(buffer_size);

        'session: loop {
            buffer.reserve(buffer_size);
            let read = tokio::select! {
                _ = session.closed() => break 'session,
                read = reader.read_buf(&mut buffer) => read,
            };

            match read {
                Ok(0) => {
                    debug!("destination closed {:?}", session.key);
                    break 'session;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("read from destination failed {:?}: {e}", session.key);
                    break 'session;
                }
            }

            info.data = buffer.split().freeze();
            if !self.respond(&info).await {
                break 'session;
            }

            // Drain whatever is already buffered before waiting again
            loop {
                buffer.reserve(buffer_size);
                match reader.try_read_buf(&mut buffer) {
                    Ok(0) => break 'session,
                    Ok(_) => {
                        info.data = buffer.split().freeze();
                        if !self.respond(&info).await {
                            break 'session;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!("read from destination failed {:?}: {e}", session.key);
                        break 'session;
                    }
                }
            }

            if session.is_closed() {
                break 'session;
            }
        }

        self.close_session(&session).await;
    }

    // ========
    // FORWARD
    // ========

    async fn handle_forward(&self, info: Socks5Info) -> Result<()> {
        let Some(session) = self.inner.connections.try_get(&info.key()) else {
            return Ok(());
        };

        if info.data.is_empty() || session.is_closed() {
            self.close_session(&session).await;
            return Ok(());
        }

        if let Err(e) = session.write(&info.data, self.inner.config.write_timeout).await {
            self.close_session(&session).await;
            return Err(anyhow!("write to destination failed: {e}"));
        }

        Ok(())
    }

    // ============
    // FORWARD UDP
    // ============

    async fn handle_forward_udp(&self, info: Socks5Info) -> Result<()> {
        let (target, payload) = udp_envelope(&info.data)?;
        if target.port() == 0 {
            return Ok(());
        }
        let payload = info.data.slice_ref(payload);

        let key = info
            .udp_key()
            .ok_or_else(|| anyhow!("UDP datagram without a source endpoint"))?;
        let remote = target.resolve().await?;

        let result = match self.inner.udp_connections.try_get(&key) {
            Some(mapping) => {
                mapping.touch();
                mapping.set_target(remote);
                let sent = mapping.socket.send_to(&payload, remote).await;
                if sent.is_err() {
                    self.drop_mapping(&mapping);
                }
                sent.map(|_| ()).map_err(anyhow::Error::from)
            }
            None => self.open_udp(key, info, remote, target.is_broadcast(), &payload).await,
        };

        if let Err(e) = result {
            debug!("forward udp {key:?} -> {remote} ({} bytes) failed: {e}", payload.len());
        }

        Ok(())
    }

    /// drop_mapping evicts `mapping` only if it is still the registered
    /// one for its key
    fn drop_mapping(&self, mapping: &Arc<UdpMapping>) {
        let removed = self
            .inner
            .udp_connections
            .remove_if(&mapping.key, |current| Arc::ptr_eq(current, mapping));
        if removed.is_some() {
            mapping.release();
        }
    }

    async fn open_udp(
        &self,
        key: ConnectionKeyUdp,
        mut info: Socks5Info,
        remote: SocketAddr,
        broadcast: bool,
        payload: &[u8],
    ) -> Result<()> {
        let bind_addr = match remote {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        if broadcast {
            socket.set_broadcast(true)?;
        }

        let mapping = Arc::new(UdpMapping::new(key, socket, remote));
        if !self.inner.udp_connections.add(key, Arc::clone(&mapping)) {
            // A concurrent first datagram won; send through its socket
            let existing = self
                .inner
                .udp_connections
                .try_get(&key)
                .ok_or_else(|| anyhow!("mapping {key:?} vanished"))?;
            existing.touch();
            existing.socket.send_to(payload, remote).await?;
            return Ok(());
        }

        if let Err(e) = mapping.socket.send_to(payload, remote).await {
            self.drop_mapping(&mapping);
            return Err(e.into());
        }
        info!("created UDP mapping {key:?} -> {remote} (broadcast: {broadcast})");

        info.target_ep = Some(remote);
        info.data = Bytes::new();
        let engine = self.clone();
        tokio::spawn(async move { engine.receive_udp(mapping, info).await });

        Ok(())
    }

    /// receive_udp pushes datagrams from the destination back through the
    /// tunnel until the mapping is evicted or the socket fails
    async fn receive_udp(&self, mapping: Arc<UdpMapping>, mut info: Socks5Info) {
        let mut buffer = vec![0u8; MAX_DGRAM];

        loop {
            let received = tokio::select! {
                _ = mapping.closed() => break,
                received = mapping.socket.recv_from(&mut buffer) => received,
            };

            match received {
                Ok((len, from)) => {
                    if len == 0 {
                        continue;
                    }
                    mapping.touch();
                    info.data = udp_response_envelope(from, &buffer[..len]).into();
                    if !self.respond(&info).await {
                        debug!("tunnel dropped UDP response for {:?}", mapping.key);
                    }
                }
                Err(e) => {
                    self.drop_mapping(&mapping);
                    debug!("receive on UDP mapping {:?} failed: {e}", mapping.key);
                    break;
                }
            }
        }

        debug!(
            "stopped receiving for {:?} (last target {:?})",
            mapping.key,
            mapping.target()
        );
    }

    // =========
    // HELPERS
    // =========

    /// close_session is the single teardown path: it runs once per session
    /// no matter how many of read failure, write failure or close signal
    /// race to it
    async fn close_session(&self, session: &Arc<TcpSession>) {
        if !session.mark_closed() {
            return;
        }

        self.inner
            .connections
            .remove_if(&session.key, |current| Arc::ptr_eq(current, session));
        session.shutdown().await;

        debug!("closed session {:?}", session.key);
        self.notify_close(session.close_info()).await;
    }

    async fn notify_close(&self, info: &Socks5Info) {
        let _gate = self.inner.gate.lock().await;
        self.inner.sender.response_close(info).await;
    }

    async fn reply(&self, info: &mut Socks5Info, code: ReplyCode) -> bool {
        info.set_response(code as u8);
        self.respond(info).await
    }

    async fn respond(&self, info: &Socks5Info) -> bool {
        let _gate = self.inner.gate.lock().await;
        self.inner.sender.response(info).await
    }
}

/// ConnectError is why a CONNECT could not be completed
#[derive(Debug, thiserror::Error)]
enum ConnectError {
    #[error("resolve failed: {0}")]
    Resolve(anyhow::Error),

    #[error(transparent)]
    Io(io::Error),
}

impl ConnectError {
    fn reply_code(&self) -> ReplyCode {
        match self {
            ConnectError::Resolve(_) => ReplyCode::HostUnreachable,
            ConnectError::Io(e) => reply_code_for(e),
        }
    }
}

/// reply_code_for maps a failed connect to the SOCKS5 reply the client sees
pub fn reply_code_for(error: &io::Error) -> ReplyCode {
    match error.kind() {
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset => ReplyCode::ConnectionRefused,
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::NetworkDown => ReplyCode::NetworkUnreachable,
        io::ErrorKind::Unsupported => ReplyCode::AddrTypeUnsupported,
        _ => ReplyCode::ServerFailure,
    }
}

async fn open_tcp(addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_keepalive(true)?;
    socket.connect(addr).await
}
