//! # WScp
//!
//! Secure point-to-point file copy over WebSockets.
//!
//! ## Overview
//!
//! A sender connects to a receiving server, performs an RSA-OAEP handshake
//! that delivers an AES-256-GCM session key, announces the file and streams
//! it in encrypted chunks. Every chunk is acknowledged; a corrupted chunk is
//! replayed on request. The receiver re-hashes the finished file and rejects
//! it unless the whole-file SHA-256 matches.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐                         ┌──────────────────────┐
//! │  wscp send   │                         │      wscp serve      │
//! │   (client)   │                         │   (server, 1 task    │
//! │              │                         │    per connection)   │
//! ├──────────────┤   WebSocket (binary)    ├──────────────────────┤
//! │ Transfer     │ ──────────────────────► │ Transfer             │
//! │ Session      │ ◄────────────────────── │ Session              │
//! │ (Sender)     │   Handshake/Init/       │ (Receiver)           │
//! │              │   Content/Ack/Replay    │                      │
//! └──────────────┘                         └──────────────────────┘
//! ```
//!
//! The session state machine and the wire format live in the [`protocol`]
//! crate; this crate adds the WebSocket transport, connection establishment,
//! configuration and the command-line driver.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::path::Path;
//! use wscp::client::{send_file, ProgressMode};
//! use wscp::protocol::SessionConfig;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let report = send_file(
//!     "ws://127.0.0.1:8989/api",
//!     Path::new("notes.txt"),
//!     None,
//!     SessionConfig::default(),
//!     ProgressMode::Hidden,
//! )
//! .await?;
//! println!("sent {} bytes, sha256 {}", report.bytes, report.checksum);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`client`]: Sending a file to a server
//! - [`config`]: TOML configuration
//! - [`network`]: WebSocket transport and connection establishment
//! - [`progress`]: Terminal progress bar
//! - [`server`]: Receiving server

pub mod client;
pub mod config;
pub mod network;
pub mod progress;
pub mod server;

pub use protocol;

pub use client::{send_file, ProgressMode};
pub use config::Config;
pub use network::{connect, ConnectError, WebSocketTransport};
pub use server::{ServeError, Server, ServerOptions};
