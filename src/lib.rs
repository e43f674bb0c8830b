//! carabiner — mobile connectivity core for a remote agent gateway.
//!
//! Provides the pieces a host app needs to talk to a remote gateway over a
//! single duplex WebSocket: a request/response/event multiplexer with
//! automatic reconnection, a persistent Ed25519 device identity and the
//! challenge-signing handshake, the streaming chat protocol, and a session
//! catalog that reconciles remote rows with locally pinned/labelled state.

pub mod chat;
pub mod client;
pub mod credentials;
pub(crate) mod crypto;
pub mod identity;
pub mod logging;
pub mod requester;
pub mod sessions;
pub mod store;
pub(crate) mod util;

pub use client::{ClientConfig, ConnectionStatus, GatewayClient, GatewayError};
pub use requester::Requester;
