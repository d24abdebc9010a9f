//! Transport abstraction for transfer sessions.
//!
//! A session needs nothing more from the network than an ordered,
//! message-oriented pipe with a distinguishable clean shutdown. The
//! [`Transport`] trait captures exactly that, so the protocol crate stays free
//! of networking dependencies. [`MemoryTransport`] is an in-process
//! implementation used by tests and by embedders that run both peers locally.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::error::{ProtocolError, Result};

/// Boxed future returned by [`Transport`] methods.
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// An ordered, message-oriented connection to the peer.
pub trait Transport: Send {
    /// Sends one message.
    fn send<'a>(&'a mut self, data: &'a [u8]) -> TransportFuture<'a, ()>;

    /// Receives the next message.
    ///
    /// Returns `Ok(None)` when the peer shut the connection down cleanly.
    /// An abrupt closure is a [`ProtocolError::ConnectionClosed`] error.
    fn recv<'a>(&'a mut self) -> TransportFuture<'a, Option<Vec<u8>>>;

    /// Signals a clean shutdown to the peer.
    fn close<'a>(&'a mut self) -> TransportFuture<'a, ()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send<'a>(&'a mut self, data: &'a [u8]) -> TransportFuture<'a, ()> {
        (**self).send(data)
    }

    fn recv<'a>(&'a mut self) -> TransportFuture<'a, Option<Vec<u8>>> {
        (**self).recv()
    }

    fn close<'a>(&'a mut self) -> TransportFuture<'a, ()> {
        (**self).close()
    }
}

#[derive(Debug)]
enum Frame {
    Data(Vec<u8>),
    Close,
}

/// One end of an in-memory transport pair.
#[derive(Debug)]
pub struct MemoryTransport {
    tx: mpsc::UnboundedSender<Frame>,
    rx: mpsc::UnboundedReceiver<Frame>,
    closed_locally: bool,
    closed_by_peer: bool,
}

impl MemoryTransport {
    /// Creates two connected ends.
    pub fn pair() -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Self::new(a_tx, b_rx), Self::new(b_tx, a_rx))
    }

    fn new(tx: mpsc::UnboundedSender<Frame>, rx: mpsc::UnboundedReceiver<Frame>) -> Self {
        Self {
            tx,
            rx,
            closed_locally: false,
            closed_by_peer: false,
        }
    }
}

impl Transport for MemoryTransport {
    fn send<'a>(&'a mut self, data: &'a [u8]) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if self.closed_locally {
                return Err(ProtocolError::ConnectionClosed(
                    "transport already closed".to_string(),
                ));
            }
            self.tx
                .send(Frame::Data(data.to_vec()))
                .map_err(|_| ProtocolError::ConnectionClosed("peer dropped".to_string()))
        })
    }

    fn recv<'a>(&'a mut self) -> TransportFuture<'a, Option<Vec<u8>>> {
        Box::pin(async move {
            if self.closed_by_peer {
                return Ok(None);
            }
            match self.rx.recv().await {
                Some(Frame::Data(data)) => Ok(Some(data)),
                Some(Frame::Close) => {
                    self.closed_by_peer = true;
                    Ok(None)
                }
                None => Err(ProtocolError::ConnectionClosed(
                    "peer dropped without closing".to_string(),
                )),
            }
        })
    }

    fn close<'a>(&'a mut self) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if !self.closed_locally {
                self.closed_locally = true;
                // The peer may already be gone; closing is still complete.
                let _ = self.tx.send(Frame::Close);
            }
            Ok(())
        })
    }
}
