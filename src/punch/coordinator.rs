use crate::punch::message::{
    PunchHoleOfflineInfo, PunchHoleParams, PunchHoleResetInfo, PunchHoleReverseInfo, PunchHoleStepInfo,
    PunchHoleTunnelInfo, PunchHoleType, ServerType,
};
use crate::punch::strategy::{
    BUILTIN_STRATEGIES, OnPunchHoleArg, PunchHole, StrategyConstructor, StrategyContext, StrategyRegistry,
};
use crate::punch::subscribe::Subscribers;
use crate::register::{ClientInfo, RegisterState};
use crate::transport::{ConnectionRef, MessageRequest, MessageResponse, MessengerTransport, TransportError};
use std::sync::Arc;
use tracing::debug;

/// Messenger id hole-punch envelopes are sent under
pub const PUNCH_HOLE_MESSENGER_ID: u16 = 0x0301;

#[derive(Debug, thiserror::Error)]
pub enum PunchHoleError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("not registered: no online connection")]
    NotOnline,
}

/// SendPunchHoleArg addresses one outgoing step message
#[derive(Debug, Clone)]
pub struct SendPunchHoleArg<T> {
    pub connection: ConnectionRef,
    pub to_id: u64,
    pub tunnel_name: u64,
    pub index: u8,
    pub data: T,
}

impl<T> SendPunchHoleArg<T> {
    pub fn new(connection: ConnectionRef, to_id: u64, data: T) -> Self {
        Self {
            connection,
            to_id,
            tunnel_name: 0,
            index: 0,
            data,
        }
    }

    pub fn with_tunnel(mut self, tunnel_name: u64, index: u8) -> Self {
        self.tunnel_name = tunnel_name;
        self.index = index;
        self
    }
}

/// PunchHoleCoordinator routes hole-punch signaling: outgoing step
/// messages go through the [`MessengerTransport`], incoming ones are
/// handed to the strategy registered for their punch type.
pub struct PunchHoleCoordinator {
    transport: Arc<dyn MessengerTransport>,
    register: Arc<RegisterState>,
    strategies: StrategyRegistry,
    on_reverse: Arc<Subscribers<OnPunchHoleArg>>,
    on_tunnel: Arc<Subscribers<PunchHoleTunnelInfo>>,
}

pub struct PunchHoleCoordinatorBuilder {
    transport: Arc<dyn MessengerTransport>,
    register: Arc<RegisterState>,
    constructors: Vec<StrategyConstructor>,
    builtin: bool,
}

impl PunchHoleCoordinatorBuilder {
    /// strategy registers a host-supplied strategy; these load before the
    /// built-in ones, so they take precedence for the same punch type
    pub fn strategy<F>(mut self, constructor: F) -> Self
    where
        F: FnOnce(&StrategyContext) -> Arc<dyn PunchHole> + Send + 'static,
    {
        self.constructors.push(Box::new(constructor));
        self
    }

    /// without_builtin skips the reverse/tunnel/reset/offline strategies
    pub fn without_builtin(mut self) -> Self {
        self.builtin = false;
        self
    }

    pub fn build(self) -> PunchHoleCoordinator {
        let context = StrategyContext {
            register: Arc::clone(&self.register),
            on_reverse: Arc::new(Subscribers::default()),
            on_tunnel: Arc::new(Subscribers::default()),
        };

        let builtin = if self.builtin { BUILTIN_STRATEGIES } else { &[] };
        let builtin = builtin
            .iter()
            .map(|create| Box::new(*create) as StrategyConstructor);
        let strategies = StrategyRegistry::load(&context, self.constructors.into_iter().chain(builtin));
        debug!("loaded {} punch-hole strategies", strategies.len());

        PunchHoleCoordinator {
            transport: self.transport,
            register: self.register,
            strategies,
            on_reverse: context.on_reverse,
            on_tunnel: context.on_tunnel,
        }
    }
}

impl PunchHoleCoordinator {
    pub fn builder(transport: Arc<dyn MessengerTransport>, register: Arc<RegisterState>) -> PunchHoleCoordinatorBuilder {
        PunchHoleCoordinatorBuilder {
            transport,
            register,
            constructors: Vec::new(),
            builtin: true,
        }
    }

    /// on_punch_hole runs the strategy for the event's punch type. Unknown
    /// or unregistered types are dropped.
    pub async fn on_punch_hole(&self, arg: OnPunchHoleArg) {
        let Some(punch_type) = arg.data.kind() else {
            debug!("dropping unknown punch type {} from {}", arg.data.punch_type, arg.data.from_id);
            return;
        };

        match self.strategies.get(punch_type) {
            Some(strategy) => strategy.execute(arg).await,
            None => debug!("no strategy for {punch_type:?}, dropping message from {}", arg.data.from_id),
        }
    }

    /// on_message decodes a raw envelope received on `connection` and
    /// dispatches it
    pub async fn on_message(&self, connection: ConnectionRef, payload: &[u8]) -> Result<(), PunchHoleError> {
        let data = PunchHoleParams::from_bytes(payload)?;
        self.on_punch_hole(OnPunchHoleArg { connection, data }).await;
        Ok(())
    }

    /// send delivers a step message without waiting for the peer
    pub async fn send<T: PunchHoleStepInfo>(&self, arg: SendPunchHoleArg<T>) -> Result<(), PunchHoleError> {
        let request = build_request(&arg)?;
        self.transport.send_only(request).await?;
        Ok(())
    }

    /// send_reply delivers a step message and waits for the peer's answer
    pub async fn send_reply<T: PunchHoleStepInfo>(
        &self,
        arg: SendPunchHoleArg<T>,
    ) -> Result<MessageResponse, PunchHoleError> {
        let request = build_request(&arg)?;
        Ok(self.transport.send_reply(request).await?)
    }

    /// send_reverse asks `peer` to connect back to us
    pub async fn send_reverse(&self, peer: &ClientInfo) -> Result<(), PunchHoleError> {
        let data = PunchHoleReverseInfo {
            try_reverse: peer.try_reverse,
        };
        self.send(SendPunchHoleArg::new(self.online()?, peer.id, data)).await
    }

    /// send_tunnel asks `to_id` to open a new tunnel channel and waits for
    /// its acknowledgement
    pub async fn send_tunnel(
        &self,
        to_id: u64,
        tunnel_name: u64,
        server_type: ServerType,
    ) -> Result<MessageResponse, PunchHoleError> {
        let data = PunchHoleTunnelInfo {
            tunnel_name,
            server_type,
        };
        self.send_reply(SendPunchHoleArg::new(self.online()?, to_id, data)).await
    }

    /// send_reset asks `to_id` to drop and redo its registration
    pub async fn send_reset(&self, to_id: u64) -> Result<(), PunchHoleError> {
        self.send(SendPunchHoleArg::new(self.online()?, to_id, PunchHoleResetInfo))
            .await
    }

    /// send_offline asks `to_id` to go offline
    pub async fn send_offline(&self, to_id: u64) -> Result<(), PunchHoleError> {
        self.send(SendPunchHoleArg::new(self.online()?, to_id, PunchHoleOfflineInfo))
            .await
    }

    pub fn on_reverse(&self) -> &Subscribers<OnPunchHoleArg> {
        &self.on_reverse
    }

    pub fn on_tunnel(&self) -> &Subscribers<PunchHoleTunnelInfo> {
        &self.on_tunnel
    }

    pub fn register_state(&self) -> &Arc<RegisterState> {
        &self.register
    }

    pub fn has_strategy(&self, punch_type: PunchHoleType) -> bool {
        self.strategies.get(punch_type).is_some()
    }

    fn online(&self) -> Result<ConnectionRef, PunchHoleError> {
        self.register.online_connection().ok_or(PunchHoleError::NotOnline)
    }
}

fn build_request<T: PunchHoleStepInfo>(arg: &SendPunchHoleArg<T>) -> Result<MessageRequest, bincode::Error> {
    let msg = &arg.data;
    let payload = PunchHoleParams {
        punch_type: msg.punch_type() as u8,
        step: msg.step(),
        forward_type: msg.forward_type(),
        tunnel_name: arg.tunnel_name,
        index: arg.index,
        from_id: arg.connection.connect_id(),
        to_id: arg.to_id,
        data: msg.to_bytes()?,
    }
    .to_bytes()?;

    Ok(MessageRequest {
        connection: Arc::clone(&arg.connection),
        messenger_id: PUNCH_HOLE_MESSENGER_ID,
        payload,
    })
}
