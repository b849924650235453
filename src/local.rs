//! Local loopback front end.
//!
//! Accepts real SOCKS5 clients, splits their conversation into
//! step-tagged [`Socks5Info`] messages the way the tunnel client would,
//! and feeds them to an in-process [`Socks5RelayEngine`]. Replies come back
//! through [`LocalSender`] and are written to the client in standard
//! SOCKS5 framing.

use crate::config::RelayConfig;
use crate::registry::{ConnectionKey, Registry};
use crate::socks5::auth::{AllowAllValidator, UserPass, UserPassAuthValidator};
use crate::socks5::info::Socks5Info;
use crate::socks5::messenger::Socks5MessengerSender;
use crate::socks5::parser::command_reply;
use crate::socks5::protocol::{
    AddressType, AuthMethod, AuthStatus, Command, MAX_DGRAM, ReplyCode, Socks5Step, USERPASS_VERSION, Version,
};
use crate::socks5::server::Socks5RelayEngine;
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Client id used for every session of the loopback front end
pub const LOCAL_CLIENT_ID: u64 = 0;

/// Relayed is what the engine sent back for one request
#[derive(Debug)]
pub enum Relayed {
    Data(Socks5Info),
    Close,
}

/// LocalSender routes engine replies to the per-connection channel of the
/// request they belong to
#[derive(Default)]
pub struct LocalSender {
    clients: Registry<u32, mpsc::UnboundedSender<Relayed>>,
}

impl LocalSender {
    pub fn attach(&self, request_id: u32) -> mpsc::UnboundedReceiver<Relayed> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.remove(&request_id);
        self.clients.add(request_id, tx);
        rx
    }

    pub fn detach(&self, request_id: u32) {
        self.clients.remove(&request_id);
    }
}

#[async_trait]
impl Socks5MessengerSender for LocalSender {
    async fn response(&self, info: &Socks5Info) -> bool {
        match self.clients.try_get(&info.request_id) {
            Some(tx) => tx.send(Relayed::Data(info.clone())).is_ok(),
            None => false,
        }
    }

    async fn response_close(&self, info: &Socks5Info) {
        if let Some(tx) = self.clients.try_get(&info.request_id) {
            let _ = tx.send(Relayed::Close);
        }
    }
}

/// LocalProxy is a SOCKS5 listener backed by the relay engine
pub struct LocalProxy {
    pub listen_addr: String,
    pub auth_config: Option<UserPass>,
    pub config: RelayConfig,
    listener: Option<TcpListener>,
}

/// LocalProxy implementation block
impl LocalProxy {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            auth_config: None,
            config: RelayConfig::default(),
            listener: None,
        }
    }

    /// with_auth applies the desired authentication
    pub fn with_auth(mut self, auth: Option<UserPass>) -> Self {
        self.auth_config = auth;
        self
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// bind to the listen address; a second call is an error
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        if self.listener.is_some() {
            bail!("listener already bound");
        }

        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;
        info!("SOCKS5 front end listening on {:?}", addr);

        self.listener = Some(listener);
        Ok(addr)
    }

    /// run accepts clients until the listener fails
    pub async fn run(&mut self) -> Result<()> {
        if self.listener.is_none() {
            self.bind().await?;
        }
        let listener = self
            .listener
            .take()
            .ok_or_else(|| anyhow!("listener not bound"))?;

        let sender = Arc::new(LocalSender::default());
        let engine = Socks5RelayEngine::new(
            self.config.clone(),
            Arc::clone(&sender) as Arc<dyn Socks5MessengerSender>,
            Arc::new(AllowAllValidator),
            Arc::new(UserPassAuthValidator::new(self.auth_config.clone())),
        );
        let next_request_id = AtomicU32::new(1);

        loop {
            let (inbound, peer_addr) = listener.accept().await?;
            let request_id = next_request_id.fetch_add(1, Ordering::Relaxed);

            let engine = engine.clone();
            let sender = Arc::clone(&sender);
            let buffer_size = self.config.buffer_size;

            tokio::spawn(async move {
                debug!("new client {peer_addr} as request {request_id}");
                if let Err(e) = handle_connection(&engine, &sender, inbound, request_id, buffer_size).await {
                    error!("connection error: {e}");
                }
            });
        }
    }
}

/// handle_connection drives one client through the relay engine
pub async fn handle_connection(
    engine: &Socks5RelayEngine,
    sender: &LocalSender,
    mut stream: TcpStream,
    request_id: u32,
    buffer_size: usize,
) -> Result<()> {
    let mut rx = sender.attach(request_id);
    let mut client = Client {
        engine,
        rx: &mut rx,
        request_id,
    };

    let result = client.run(&mut stream, buffer_size).await;

    sender.detach(request_id);
    engine
        .close(&ConnectionKey {
            connect_id: LOCAL_CLIENT_ID,
            request_id,
        })
        .await;
    result
}

struct Client<'a> {
    engine: &'a Socks5RelayEngine,
    rx: &'a mut mpsc::UnboundedReceiver<Relayed>,
    request_id: u32,
}

impl Client<'_> {
    async fn run(&mut self, stream: &mut TcpStream, buffer_size: usize) -> Result<()> {
        // Greeting
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        let mut greeting = vec![0u8; 2 + head[1] as usize];
        greeting[..2].copy_from_slice(&head);
        stream.read_exact(&mut greeting[2..]).await?;

        let reply = self.exchange(self.info(Socks5Step::Greeting, greeting)).await?;
        let method = AuthMethod::from_byte(first_byte(&reply)?);
        stream.write_all(&[Version::SOCKS5 as u8, method as u8]).await?;

        // Auth
        match method {
            AuthMethod::NoAcceptable => bail!("no acceptable auth method"),
            AuthMethod::UserPass => {
                let frame = read_credentials_frame(stream).await?;
                let mut info = self.info(Socks5Step::Auth, frame);
                info.auth_type = method;

                let status = first_byte(&self.exchange(info).await?)?;
                stream.write_all(&[USERPASS_VERSION, status]).await?;
                if status != AuthStatus::Success as u8 {
                    bail!("authentication failed");
                }
            }
            _ => {}
        }

        // Command
        let frame = read_command_frame(stream).await?;
        let command = Command::from_byte(frame[1]);
        let mut info = self.info(Socks5Step::Command, frame);
        info.auth_type = method;

        let code = ReplyCode::from_byte(first_byte(&self.exchange(info).await?)?).unwrap_or(ReplyCode::ServerFailure);
        if code != ReplyCode::Succeeded {
            let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
            stream.write_all(&command_reply(code, unspecified)).await?;
            bail!("command refused: {code:?}");
        }

        match command {
            Some(Command::Connect) => {
                stream
                    .write_all(&command_reply(ReplyCode::Succeeded, stream.local_addr()?))
                    .await?;
                self.pump_tcp(stream, buffer_size).await
            }
            Some(Command::UdpAssociate) => self.associate_udp(stream).await,
            _ => bail!("unsupported command"),
        }
    }

    /// pump_tcp shuttles bytes between the client and the engine until
    /// either side closes
    async fn pump_tcp(&mut self, stream: &mut TcpStream, buffer_size: usize) -> Result<()> {
        let (mut reader, mut writer) = stream.split();
        let mut buffer = vec![0u8; buffer_size];

        loop {
            tokio::select! {
                read = reader.read(&mut buffer) => {
                    let n = read?;
                    // an empty Forward is the close signal
                    let data = Bytes::copy_from_slice(&buffer[..n]);
                    self.engine.input_data(self.info(Socks5Step::Forward, data)).await;
                    if n == 0 {
                        debug!("client closed request {}", self.request_id);
                        return Ok(());
                    }
                }
                relayed = self.rx.recv() => match relayed {
                    Some(Relayed::Data(info)) => writer.write_all(&info.data).await?,
                    Some(Relayed::Close) | None => {
                        debug!("relay closed request {}", self.request_id);
                        return Ok(());
                    }
                }
            }
        }
    }

    /// associate_udp relays client datagrams until the control connection
    /// goes away
    async fn associate_udp(&mut self, stream: &mut TcpStream) -> Result<()> {
        let peer_addr = stream.peer_addr()?;
        let socket = UdpSocket::bind((stream.local_addr()?.ip(), 0)).await?;
        stream
            .write_all(&command_reply(ReplyCode::Succeeded, socket.local_addr()?))
            .await?;

        let mut buffer = vec![0u8; MAX_DGRAM];
        let mut probe = [0u8; 1];

        loop {
            tokio::select! {
                read = stream.read(&mut probe) => match read {
                    Ok(0) | Err(_) => {
                        info!("control connection closed: terminating UDP association");
                        return Ok(());
                    }
                    Ok(_) => debug!("unexpected data on TCP connection during UDP association"),
                },
                received = socket.recv_from(&mut buffer) => {
                    let (len, from) = received?;
                    // As per the SOCKS5 protocol, the IP address must match
                    // the one of the TCP connection
                    if from.ip() != peer_addr.ip() {
                        error!("rejected UDP from unauthorized client: {from}");
                        continue;
                    }
                    let data = Bytes::copy_from_slice(&buffer[..len]);
                    let info = self.info(Socks5Step::ForwardUdp, data).with_source(from);
                    self.engine.input_data(info).await;
                }
                relayed = self.rx.recv() => match relayed {
                    Some(Relayed::Data(info)) => {
                        if let Some(client) = info.source_ep {
                            socket.send_to(&info.data, client).await?;
                        }
                    }
                    Some(Relayed::Close) | None => return Ok(()),
                }
            }
        }
    }

    async fn exchange(&mut self, info: Socks5Info) -> Result<Socks5Info> {
        self.engine.input_data(info).await;
        match self.rx.recv().await {
            Some(Relayed::Data(reply)) => Ok(reply),
            Some(Relayed::Close) | None => bail!("relay closed request {}", self.request_id),
        }
    }

    fn info(&self, step: Socks5Step, data: impl Into<Bytes>) -> Socks5Info {
        Socks5Info::new(step, LOCAL_CLIENT_ID, self.request_id, data)
    }
}

fn first_byte(info: &Socks5Info) -> Result<u8> {
    info.data
        .first()
        .copied()
        .ok_or_else(|| anyhow!("empty reply from relay"))
}

/// read_credentials_frame reads a whole RFC 1929 request off the stream
async fn read_credentials_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut frame = vec![0u8; 2];
    stream.read_exact(&mut frame).await?;

    let username_len = frame[1] as usize;
    frame.resize(2 + username_len + 1, 0);
    stream.read_exact(&mut frame[2..]).await?;

    let password_len = frame[2 + username_len] as usize;
    let start = frame.len();
    frame.resize(start + password_len, 0);
    stream.read_exact(&mut frame[start..]).await?;

    Ok(frame)
}

/// read_command_frame reads VER/CMD/RSV/ATYP/DST.ADDR/DST.PORT off the stream
async fn read_command_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut frame = vec![0u8; 4];
    stream.read_exact(&mut frame).await?;

    if frame[0] != Version::SOCKS5 as u8 {
        bail!("not SOCKS5");
    }

    // Address plus the two port bytes
    let remaining = match AddressType::from_byte(frame[3]) {
        Some(AddressType::IPv4) => 4 + 2,
        Some(AddressType::IPv6) => 16 + 2,
        Some(AddressType::DomainName) => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            frame.push(len[0]);
            len[0] as usize + 2
        }
        None => bail!("unsupported or unknown address type"),
    };

    let start = frame.len();
    frame.resize(start + remaining, 0);
    stream.read_exact(&mut frame[start..]).await?;
    Ok(frame)
}
