//! Transport boundary
//!
//! A session talks to its client through an abstract duplex message channel.
//! The channel is split once so the read and write units of a session can run
//! independently. Adapters are provided for axum WebSockets and for an
//! in-process pair used by embedders and tests.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};

use crate::error::{Error, Result};

/// Outbound half of a connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSink: Send + 'static {
    /// Write one message
    async fn send(&mut self, text: Arc<str>) -> Result<()>;

    /// Close the connection
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSource: Send + 'static {
    /// Receive the next message; `None` once the peer has gone away
    async fn recv(&mut self) -> Option<Result<String>>;
}

/// A duplex message channel that can be split into its two halves
pub trait Connection: Send + 'static {
    /// Outbound half
    type Sink: MessageSink;
    /// Inbound half
    type Source: MessageSource;

    /// Split into outbound and inbound halves
    fn split(self) -> (Self::Sink, Self::Source);
}

/// Boxed outbound half
pub type BoxSink = Box<dyn MessageSink>;
/// Boxed inbound half
pub type BoxSource = Box<dyn MessageSource>;

/// Split a connection and erase its concrete type
pub fn split_boxed<C: Connection>(conn: C) -> (BoxSink, BoxSource) {
    let (sink, source) = conn.split();
    (Box::new(sink), Box::new(source))
}

#[async_trait]
impl MessageSink for SplitSink<WebSocket, WsMessage> {
    async fn send(&mut self, text: Arc<str>) -> Result<()> {
        SinkExt::send(self, WsMessage::Text(text.to_string()))
            .await
            .map_err(Error::from)
    }

    async fn close(&mut self) -> Result<()> {
        SinkExt::close(self).await.map_err(Error::from)
    }
}

#[async_trait]
impl MessageSource for SplitStream<WebSocket> {
    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => tracing::debug!("Ignoring non-UTF-8 binary frame"),
                },
                Ok(WsMessage::Close(_)) => return None,
                // axum answers pings itself
                Ok(WsMessage::Ping(_) | WsMessage::Pong(_)) => {}
                Err(e) => return Some(Err(Error::from(e))),
            }
        }
    }
}

impl Connection for WebSocket {
    type Sink = SplitSink<WebSocket, WsMessage>;
    type Source = SplitStream<WebSocket>;

    fn split(self) -> (Self::Sink, Self::Source) {
        StreamExt::split(self)
    }
}

pub mod memory {
    //! In-process connections backed by bounded tokio channels.

    use super::*;
    use tokio::sync::mpsc;

    /// Server end of an in-process connection
    pub struct MemoryConnection {
        inbound: mpsc::Receiver<String>,
        outbound: mpsc::Sender<String>,
    }

    /// Client end of an in-process connection
    pub struct MemoryPeer {
        tx: Option<mpsc::Sender<String>>,
        rx: mpsc::Receiver<String>,
    }

    /// Create a connected pair.
    ///
    /// `capacity` bounds both directions; a peer that stops reading
    /// eventually blocks the server's writes like a stalled socket would.
    #[must_use]
    pub fn memory_pair(capacity: usize) -> (MemoryConnection, MemoryPeer) {
        let (client_tx, server_rx) = mpsc::channel(capacity.max(1));
        let (server_tx, client_rx) = mpsc::channel(capacity.max(1));
        (
            MemoryConnection {
                inbound: server_rx,
                outbound: server_tx,
            },
            MemoryPeer {
                tx: Some(client_tx),
                rx: client_rx,
            },
        )
    }

    impl MemoryPeer {
        /// Send a message to the server
        pub async fn send(&self, text: impl Into<String>) -> Result<()> {
            match &self.tx {
                Some(tx) => tx
                    .send(text.into())
                    .await
                    .map_err(|_| Error::ConnectionClosed),
                None => Err(Error::ConnectionClosed),
            }
        }

        /// Receive the next message from the server; `None` once closed
        pub async fn recv(&mut self) -> Option<String> {
            self.rx.recv().await
        }

        /// Receive without waiting
        pub fn try_recv(&mut self) -> Option<String> {
            self.rx.try_recv().ok()
        }

        /// Stop sending; the server sees end of stream
        pub fn disconnect(&mut self) {
            self.tx = None;
        }
    }

    /// Outbound half of a [`MemoryConnection`]
    pub struct MemorySink(Option<mpsc::Sender<String>>);

    /// Inbound half of a [`MemoryConnection`]
    pub struct MemorySource(mpsc::Receiver<String>);

    #[async_trait]
    impl MessageSink for MemorySink {
        async fn send(&mut self, text: Arc<str>) -> Result<()> {
            let tx = self.0.as_ref().ok_or(Error::ConnectionClosed)?;
            tx.send(text.to_string())
                .await
                .map_err(|_| Error::ConnectionClosed)
        }

        async fn close(&mut self) -> Result<()> {
            self.0 = None;
            Ok(())
        }
    }

    #[async_trait]
    impl MessageSource for MemorySource {
        async fn recv(&mut self) -> Option<Result<String>> {
            self.0.recv().await.map(Ok)
        }
    }

    impl Connection for MemoryConnection {
        type Sink = MemorySink;
        type Source = MemorySource;

        fn split(self) -> (Self::Sink, Self::Source) {
            (MemorySink(Some(self.outbound)), MemorySource(self.inbound))
        }
    }
}
