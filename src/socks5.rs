//! SOCKS5 termination on behalf of tunneled clients.
//!
//! The client's SOCKS5 bytes arrive over the tunnel, one step-tagged
//! [`Socks5Info`] at a time. [`Socks5RelayEngine`] answers the
//! negotiation steps, opens the real outbound sockets and streams the
//! destination's data back through a [`Socks5MessengerSender`].
//!
//! - [SOCKS5 (RFC 1928)](https://datatracker.ietf.org/doc/html/rfc1928)
//! - [Username/Password Authentication (RFC 1929)](https://datatracker.ietf.org/doc/html/rfc1929)

pub mod address;
pub mod auth;
pub mod info;
pub mod messenger;
pub mod parser;
pub mod protocol;
pub mod server;
mod session;

pub use auth::{AllowAllValidator, Socks5AuthValidator, Socks5Validator, UserPass, UserPassAuthValidator};
pub use info::Socks5Info;
pub use messenger::{Socks5MessengerSender, TunnelSocks5Sender};
pub use protocol::{AuthMethod, Command, ReplyCode, Socks5Step};
pub use server::Socks5RelayEngine;
