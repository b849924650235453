//! NAT hole-punch signaling.
//!
//! Peers negotiate direct connectivity by exchanging step messages over
//! the control-plane connection. [`PunchHoleCoordinator`] builds and sends
//! those messages and dispatches incoming ones to the [`PunchHole`]
//! strategy registered for their punch type.

pub mod coordinator;
pub mod message;
pub mod strategy;
pub mod subscribe;

pub use coordinator::{PUNCH_HOLE_MESSENGER_ID, PunchHoleCoordinator, PunchHoleError, SendPunchHoleArg};
pub use message::{PunchForwardType, PunchHoleParams, PunchHoleStepInfo, PunchHoleTunnelInfo, PunchHoleType, ServerType};
pub use strategy::{OnPunchHoleArg, PunchHole, StrategyContext};
pub use subscribe::Subscribers;
