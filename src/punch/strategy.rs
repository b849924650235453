//! Hole-punch strategies and the table that maps punch types to them.

use crate::punch::message::{PunchHoleParams, PunchHoleTunnelInfo, PunchHoleType, decode};
use crate::punch::subscribe::Subscribers;
use crate::register::RegisterState;
use crate::transport::ConnectionRef;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// OnPunchHoleArg is an incoming hole-punch message and the connection it
/// arrived on
#[derive(Debug, Clone)]
pub struct OnPunchHoleArg {
    pub connection: ConnectionRef,
    pub data: PunchHoleParams,
}

/// PunchHole is one traversal technique (or signaling action) bound to a
/// single punch type
#[async_trait]
pub trait PunchHole: Send + Sync {
    fn punch_type(&self) -> PunchHoleType;

    async fn execute(&self, arg: OnPunchHoleArg);
}

/// StrategyContext is what a strategy constructor may capture
#[derive(Clone)]
pub struct StrategyContext {
    pub register: Arc<RegisterState>,
    pub on_reverse: Arc<Subscribers<OnPunchHoleArg>>,
    pub on_tunnel: Arc<Subscribers<PunchHoleTunnelInfo>>,
}

pub type StrategyConstructor = Box<dyn FnOnce(&StrategyContext) -> Arc<dyn PunchHole> + Send>;

/// Strategies every coordinator carries, registered after the host's own
pub const BUILTIN_STRATEGIES: &[fn(&StrategyContext) -> Arc<dyn PunchHole>] = &[
    ReverseStrategy::create,
    TunnelStrategy::create,
    ResetStrategy::create,
    OfflineStrategy::create,
];

/// StrategyRegistry is read-only once loaded
pub struct StrategyRegistry {
    strategies: HashMap<PunchHoleType, Arc<dyn PunchHole>>,
}

impl StrategyRegistry {
    /// load builds every constructor in order; the first strategy for a
    /// punch type wins and later ones are dropped
    pub fn load(context: &StrategyContext, constructors: impl IntoIterator<Item = StrategyConstructor>) -> Self {
        let mut strategies: HashMap<PunchHoleType, Arc<dyn PunchHole>> = HashMap::new();

        for constructor in constructors {
            let strategy = constructor(context);
            let punch_type = strategy.punch_type();
            if strategies.contains_key(&punch_type) {
                debug!("ignoring duplicate strategy for {punch_type:?}");
                continue;
            }
            strategies.insert(punch_type, strategy);
        }

        Self { strategies }
    }

    pub fn get(&self, punch_type: PunchHoleType) -> Option<&Arc<dyn PunchHole>> {
        self.strategies.get(&punch_type)
    }

    pub fn types(&self) -> Vec<PunchHoleType> {
        self.strategies.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

/// ReverseStrategy hands reverse-connect requests to whoever subscribed
pub struct ReverseStrategy {
    on_reverse: Arc<Subscribers<OnPunchHoleArg>>,
}

impl ReverseStrategy {
    pub fn create(context: &StrategyContext) -> Arc<dyn PunchHole> {
        Arc::new(Self {
            on_reverse: Arc::clone(&context.on_reverse),
        })
    }
}

#[async_trait]
impl PunchHole for ReverseStrategy {
    fn punch_type(&self) -> PunchHoleType {
        PunchHoleType::Reverse
    }

    async fn execute(&self, arg: OnPunchHoleArg) {
        debug!("reverse connect requested by {}", arg.data.from_id);
        self.on_reverse.push(arg);
    }
}

/// TunnelStrategy publishes requests to open a new tunnel channel
pub struct TunnelStrategy {
    on_tunnel: Arc<Subscribers<PunchHoleTunnelInfo>>,
}

impl TunnelStrategy {
    pub fn create(context: &StrategyContext) -> Arc<dyn PunchHole> {
        Arc::new(Self {
            on_tunnel: Arc::clone(&context.on_tunnel),
        })
    }
}

#[async_trait]
impl PunchHole for TunnelStrategy {
    fn punch_type(&self) -> PunchHoleType {
        PunchHoleType::Tunnel
    }

    async fn execute(&self, arg: OnPunchHoleArg) {
        match decode::<PunchHoleTunnelInfo>(&arg.data.data) {
            Ok(info) => {
                debug!("tunnel {} requested by {}", info.tunnel_name, arg.data.from_id);
                self.on_tunnel.push(info);
            }
            Err(e) => warn!("malformed tunnel request from {}: {e}", arg.data.from_id),
        }
    }
}

pub struct ResetStrategy {
    register: Arc<RegisterState>,
}

impl ResetStrategy {
    pub fn create(context: &StrategyContext) -> Arc<dyn PunchHole> {
        Arc::new(Self {
            register: Arc::clone(&context.register),
        })
    }
}

#[async_trait]
impl PunchHole for ResetStrategy {
    fn punch_type(&self) -> PunchHoleType {
        PunchHoleType::Reset
    }

    async fn execute(&self, arg: OnPunchHoleArg) {
        debug!("reset requested by {}", arg.data.from_id);
        self.register.reset();
    }
}

pub struct OfflineStrategy {
    register: Arc<RegisterState>,
}

impl OfflineStrategy {
    pub fn create(context: &StrategyContext) -> Arc<dyn PunchHole> {
        Arc::new(Self {
            register: Arc::clone(&context.register),
        })
    }
}

#[async_trait]
impl PunchHole for OfflineStrategy {
    fn punch_type(&self) -> PunchHoleType {
        PunchHoleType::Offline
    }

    async fn execute(&self, arg: OnPunchHoleArg) {
        debug!("offline requested by {}", arg.data.from_id);
        self.register.exit();
    }
}
