//! # Hole-punch signaling messages
//!
//! Every hole-punch message travels as a [`PunchHoleParams`] envelope: the
//! routing header (punch type, step, forward type, tunnel name, index,
//! from/to ids) plus the serialized step payload in `data`.
//!
//! Envelopes and payloads are bincode-encoded with fixed-width integers
//! and a size limit on decode.

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Upper bound on a decoded envelope
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
}

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// PunchHoleType selects the strategy that handles a message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PunchHoleType {
    Udp = 0,
    TcpNutssa = 1,
    TcpNutssb = 2,
    Reverse = 3,
    Tunnel = 4,
    Reset = 5,
    Offline = 6,
}

impl PunchHoleType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(PunchHoleType::Udp),
            1 => Some(PunchHoleType::TcpNutssa),
            2 => Some(PunchHoleType::TcpNutssb),
            3 => Some(PunchHoleType::Reverse),
            4 => Some(PunchHoleType::Tunnel),
            5 => Some(PunchHoleType::Reset),
            6 => Some(PunchHoleType::Offline),
            _ => None,
        }
    }
}

/// PunchForwardType tells the signaling server whether to relay the
/// message to `to_id` or only notify
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PunchForwardType {
    Notify = 0,
    Forward = 1,
}

/// ServerType is the role of a tunnel channel
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerType {
    Tcp = 0,
    Udp = 1,
}

/// PunchHoleParams is the envelope every step message travels in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchHoleParams {
    /// raw punch type byte; unknown values are kept so they can be dropped
    /// by the receiver
    pub punch_type: u8,
    pub step: u8,
    pub forward_type: PunchForwardType,
    pub tunnel_name: u64,
    pub index: u8,
    pub from_id: u64,
    pub to_id: u64,
    pub data: Vec<u8>,
}

impl PunchHoleParams {
    pub fn kind(&self) -> Option<PunchHoleType> {
        PunchHoleType::from_byte(self.punch_type)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        encode(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        decode(bytes)
    }
}

/// PunchHoleStepInfo is one step payload of a punch-type's handshake
pub trait PunchHoleStepInfo: Serialize + Send + Sync {
    fn punch_type(&self) -> PunchHoleType;

    fn step(&self) -> u8;

    fn forward_type(&self) -> PunchForwardType {
        PunchForwardType::Forward
    }

    fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        encode(self)
    }
}

/// Step number of the single-message punch types
pub const SINGLE_STEP: u8 = 0;

/// PunchHoleReverseInfo asks the peer to connect back to us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchHoleReverseInfo {
    pub try_reverse: u8,
}

impl PunchHoleStepInfo for PunchHoleReverseInfo {
    fn punch_type(&self) -> PunchHoleType {
        PunchHoleType::Reverse
    }

    fn step(&self) -> u8 {
        SINGLE_STEP
    }
}

/// PunchHoleTunnelInfo asks the peer to open a new tunnel channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchHoleTunnelInfo {
    pub tunnel_name: u64,
    pub server_type: ServerType,
}

impl PunchHoleStepInfo for PunchHoleTunnelInfo {
    fn punch_type(&self) -> PunchHoleType {
        PunchHoleType::Tunnel
    }

    fn step(&self) -> u8 {
        SINGLE_STEP
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchHoleResetInfo;

impl PunchHoleStepInfo for PunchHoleResetInfo {
    fn punch_type(&self) -> PunchHoleType {
        PunchHoleType::Reset
    }

    fn step(&self) -> u8 {
        SINGLE_STEP
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchHoleOfflineInfo;

impl PunchHoleStepInfo for PunchHoleOfflineInfo {
    fn punch_type(&self) -> PunchHoleType {
        PunchHoleType::Offline
    }

    fn step(&self) -> u8 {
        SINGLE_STEP
    }
}
