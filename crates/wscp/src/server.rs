//! WScp receiving server.
//!
//! Accepts WebSocket upgrades on a single endpoint path and runs one
//! receiving [`TransferSession`] per connection. Every accepted connection
//! gets its own task; a failed transfer is logged and never stops the
//! server.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use protocol::{NoProgress, ProtocolError, SessionConfig, TransferReport, TransferSession, Transport};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Error as WsError;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::network::connect::basic_auth;
use crate::network::WebSocketTransport;

/// Pause before accepting again after the listener reported an error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors produced while serving a single connection.
#[derive(Debug, Error)]
pub enum ServeError {
    /// The WebSocket upgrade was refused or failed.
    #[error("WebSocket handshake failed: {0}")]
    Handshake(#[from] WsError),

    /// The transfer session failed.
    #[error("transfer failed: {0}")]
    Transfer(#[from] ProtocolError),

    /// Listener or filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Settings for a [`Server`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address to listen on.
    pub listen: String,
    /// Endpoint path that accepts upgrades.
    pub path: String,
    /// Directory received files are written into.
    pub output_dir: PathBuf,
    /// Required `user:password`, if any.
    pub credentials: Option<String>,
    /// Tunables for every receiving session.
    pub session: SessionConfig,
}

impl ServerOptions {
    /// Builds server options from a validated configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            listen: config.server.listen.clone(),
            path: config.server.path.clone(),
            output_dir: config.server.output_dir.clone(),
            credentials: config.server.credentials(),
            session: config.session_config(),
        }
    }
}

/// A bound WScp server.
pub struct Server {
    listener: TcpListener,
    options: Arc<ServerOptions>,
}

impl Server {
    /// Creates the output directory and binds the listener.
    pub async fn bind(options: ServerOptions) -> Result<Self, ServeError> {
        options.session.validate()?;
        std::fs::create_dir_all(&options.output_dir)?;

        let listener = TcpListener::bind(&options.listen).await?;
        info!(
            address = %listener.local_addr()?,
            path = %options.path,
            output_dir = %options.output_dir.display(),
            "Server listening"
        );

        Ok(Self {
            listener,
            options: Arc::new(options),
        })
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until the process ends.
    pub async fn run(self) -> Result<(), ServeError> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts connections until `shutdown` completes.
    ///
    /// Transfers already in progress keep running in their own tasks.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServeError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Server shutting down");
                    return Ok(());
                }
                (stream, peer) = accept_retrying(|| self.listener.accept()) => {
                    let options = Arc::clone(&self.options);
                    tokio::spawn(async move {
                        match handle_connection(stream, peer, options).await {
                            Ok(report) => info!(
                                peer = %peer,
                                file = %report.path.display(),
                                bytes = report.bytes,
                                checksum = %report.checksum,
                                replays = report.replays,
                                "File received"
                            ),
                            Err(ServeError::Handshake(e)) => {
                                debug!(peer = %peer, error = %e, "Upgrade rejected")
                            }
                            Err(e) => error!(peer = %peer, error = %e, "Transfer failed"),
                        }
                    });
                }
            }
        }
    }
}

/// Waits for the next connection. Accept errors such as descriptor
/// exhaustion are logged and retried after a short pause.
async fn accept_retrying<A, Fut, T>(mut accept: A) -> T
where
    A: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed, retrying");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Upgrades one connection and receives a single file over it.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    options: Arc<ServerOptions>,
) -> Result<TransferReport, ServeError> {
    debug!(peer = %peer, "Accepted TCP connection");

    let gate = Arc::clone(&options);
    let callback = move |request: &Request, response: Response| authorize(&gate, request, response);
    let stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    info!(peer = %peer, "Transfer connection opened");

    let mut transport = WebSocketTransport::new(stream);
    let mut session = TransferSession::receiver(&options.output_dir, options.session.clone())?;
    let report = session.run(&mut transport, &mut NoProgress).await?;

    if let Err(e) = transport.close().await {
        debug!(peer = %peer, error = %e, "Close after transfer failed");
    }
    Ok(report)
}

/// Checks the request path and, when configured, its Basic credentials.
fn authorize(
    options: &ServerOptions,
    request: &Request,
    response: Response,
) -> Result<Response, ErrorResponse> {
    if request.uri().path() != options.path {
        warn!(path = %request.uri().path(), "Upgrade for unknown path");
        return Err(reject(StatusCode::NOT_FOUND, "not found"));
    }

    if let Some(expected) = &options.credentials {
        let wanted = basic_auth(expected);
        let authorized = request
            .headers()
            .get(AUTHORIZATION)
            .is_some_and(|value| bool::from(value.as_bytes().ct_eq(wanted.as_bytes())));
        if !authorized {
            warn!("Upgrade with missing or wrong credentials");
            let mut rejection = reject(StatusCode::UNAUTHORIZED, "unauthorized");
            rejection.headers_mut().insert(
                WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"wscp\""),
            );
            return Err(rejection);
        }
    }

    Ok(response)
}

fn reject(status: StatusCode, body: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(body.to_string()));
    *response.status_mut() = status;
    response
}
