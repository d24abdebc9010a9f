//! WebSocket transport for transfer sessions.
//!
//! Every protocol packet travels as one binary frame. A close frame with
//! code 1000 (Normal) is the clean end of a transfer; any other close code,
//! a dropped TCP stream or a text frame is a failure.

use futures_util::{SinkExt, StreamExt};
use protocol::{ProtocolError, Result, Transport, TransportFuture};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;

/// [`Transport`] over an established WebSocket stream.
pub struct WebSocketTransport<S> {
    stream: WebSocketStream<S>,
    closed: bool,
}

impl<S> WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an established WebSocket stream.
    pub fn new(stream: WebSocketStream<S>) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    /// Returns the underlying stream.
    pub fn into_inner(self) -> WebSocketStream<S> {
        self.stream
    }
}

impl<S> std::fmt::Debug for WebSocketTransport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<S> Transport for WebSocketTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn send<'a>(&'a mut self, data: &'a [u8]) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.stream
                .send(WsMessage::Binary(data.to_vec()))
                .await
                .map_err(map_ws_error)
        })
    }

    fn recv<'a>(&'a mut self) -> TransportFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            loop {
                match self.stream.next().await {
                    Some(Ok(WsMessage::Binary(data))) => return Ok(Some(data)),
                    Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                        continue
                    }
                    Some(Ok(WsMessage::Text(_))) => {
                        return Err(ProtocolError::Deserialization(
                            "unexpected text frame".to_string(),
                        ))
                    }
                    Some(Ok(WsMessage::Close(frame))) => return close_outcome(frame),
                    Some(Err(e)) => return Err(map_ws_error(e)),
                    None => {
                        return Err(ProtocolError::ConnectionClosed(
                            "stream ended without a close frame".to_string(),
                        ))
                    }
                }
            }
        })
    }

    fn close<'a>(&'a mut self) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if self.closed {
                return Ok(());
            }
            self.closed = true;

            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            match self.stream.close(Some(frame)).await {
                Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => {}
                Err(e) => return Err(map_ws_error(e)),
            }

            // Wait for the peer to acknowledge the close
            while let Some(message) = self.stream.next().await {
                if let Err(e) = message {
                    tracing::debug!(error = %e, "WebSocket ended while closing");
                    break;
                }
            }
            Ok(())
        })
    }
}

/// Close code 1000 is the clean end of a transfer, anything else is abrupt.
fn close_outcome(frame: Option<CloseFrame<'static>>) -> Result<Option<Vec<u8>>> {
    match frame {
        Some(frame) if frame.code == CloseCode::Normal => Ok(None),
        Some(frame) => Err(ProtocolError::ConnectionClosed(format!(
            "peer closed with code {}: {}",
            u16::from(frame.code),
            frame.reason
        ))),
        None => Err(ProtocolError::ConnectionClosed(
            "peer closed without a status code".to_string(),
        )),
    }
}

fn map_ws_error(error: WsError) -> ProtocolError {
    match error {
        WsError::Io(e) => ProtocolError::Io(e),
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            ProtocolError::ConnectionClosed("WebSocket already closed".to_string())
        }
        WsError::Capacity(e) => ProtocolError::Deserialization(format!("frame too large: {}", e)),
        other => ProtocolError::ConnectionClosed(format!("WebSocket error: {}", other)),
    }
}
