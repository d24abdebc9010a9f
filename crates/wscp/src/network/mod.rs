//! Network layer for WScp.
//!
//! This module carries transfer sessions over WebSockets:
//!
//! - [`websocket`]: [`WebSocketTransport`], the [`protocol::Transport`]
//!   implementation over `tokio-tungstenite`
//! - [`connect`]: client connection establishment, Basic credentials and
//!   HTTP `CONNECT` proxy tunnelling

pub mod connect;
pub mod websocket;

pub use connect::{connect, normalize_url, ClientTransport};
pub use websocket::WebSocketTransport;

use percent_encoding::percent_decode_str;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors that can occur while establishing a connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The address could not be parsed as a URL.
    #[error("invalid address {address}: {reason}")]
    InvalidUrl {
        /// The address as given.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The URL scheme is neither `ws` nor `wss`.
    #[error("unsupported scheme {0}, expected ws or wss")]
    UnsupportedScheme(String),

    /// The proxy URL scheme is not `http`.
    #[error("unsupported proxy scheme {0}, expected http")]
    UnsupportedProxy(String),

    /// The proxy did not open the tunnel.
    #[error("proxy refused tunnel: {0}")]
    ProxyRefused(String),

    /// Credentials could not be turned into a header.
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    /// TCP-level failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The WebSocket upgrade failed.
    #[error("WebSocket handshake failed: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Decodes `%XX` escapes in URL userinfo. Malformed escapes are kept as
/// written; the result must be UTF-8.
pub(crate) fn decode_userinfo(input: &str) -> Result<String, ConnectError> {
    percent_decode_str(input)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| ConnectError::InvalidCredentials(e.to_string()))
}
