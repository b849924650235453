//! Data-plane and signaling core of a peer-to-peer tunnel
//!
//! ## SOCKS5 relay
//!
//! - Features:
//!     - CONNECT
//!     - UDP ASSOCIATE (per-datagram forwarding)
//!     - No Authentication
//!     - Username/Password Authentication
//!     - SOCKS5 conversation carried as step-tagged messages over a tunnel
//!     - One outbound socket per session, tracked in concurrent tables
//!     - Idle-sweep cleanup of UDP mappings
//!
//! ## Hole punching
//!
//! - Step messages routed to per-punch-type strategies
//! - Reverse-connect, new-tunnel, reset and offline signaling
//! - Publish/subscribe hooks for reverse and tunnel requests
//!
//! # Example
//! ```no_run
//! use minitunnel::local::LocalProxy;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut proxy = LocalProxy::new("127.0.0.1:1080");
//!     proxy.run().await
//! }
//! ```

pub mod config;
pub mod eviction;
pub mod local;
pub mod punch;
pub mod register;
pub mod registry;
pub mod socks5;
pub mod transport;

// Re-export main types at crate root for convenience
pub use config::RelayConfig;
pub use punch::{PunchHoleCoordinator, PunchHoleError};
pub use register::{ClientInfo, RegisterState};
pub use registry::{ConnectionKey, ConnectionKeyUdp, Registry};
pub use socks5::{Socks5Info, Socks5RelayEngine, UserPass};
pub use transport::{Connection, ConnectionRef, MessengerTransport, TransportError};
