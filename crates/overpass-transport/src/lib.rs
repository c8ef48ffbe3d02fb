//! Message-connection primitive for tunnels and control channels
//!
//! Everything above the transport works with discrete binary messages: a
//! tunnel connection is a pair of channel halves fed by one reader task and
//! drained by one writer task wrapped around the real endpoint (a WebSocket,
//! or an in-memory peer in tests). The writer task is deliberately the only
//! place that touches the underlying sink, so every producer that clones the
//! sender gets serialized through it.

pub mod splice;

pub use splice::{splice, splice_tcp, SOCKET_BUFFER_LENGTH};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Messages buffered per direction before backpressure kicks in
const CHANNEL_CAPACITY: usize = 256;

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type TransportResult<T> = Result<T, TransportError>;

/// Writing half of an endpoint carrying discrete binary messages
#[async_trait]
pub trait MessageSink: Send + 'static {
    async fn send(&mut self, message: Bytes) -> TransportResult<()>;
    /// Best-effort close notification to the peer
    async fn close(&mut self);
}

/// Reading half of an endpoint carrying discrete binary messages
#[async_trait]
pub trait MessageSource: Send + 'static {
    /// `Ok(None)` signals a clean close by the peer
    async fn recv(&mut self) -> TransportResult<Option<Bytes>>;
}

/// Sending half of a [`MessageConnection`]
///
/// Cheap to clone; every clone feeds the same writer task. Sends fail once
/// the connection is gone.
#[derive(Debug, Clone)]
pub struct MessageSender {
    tx: mpsc::Sender<Bytes>,
}

impl MessageSender {
    pub async fn send(&self, message: Bytes) -> TransportResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving half of a [`MessageConnection`]
#[derive(Debug)]
pub struct MessageReceiver {
    rx: mpsc::Receiver<Bytes>,
}

impl MessageReceiver {
    /// `None` once the connection is closed and drained
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// A duplex message connection
///
/// Dropping the last sender clone closes the underlying endpoint; the
/// receiver yields `None` once the peer has gone away.
#[derive(Debug)]
pub struct MessageConnection {
    pub sender: MessageSender,
    pub receiver: MessageReceiver,
}

impl MessageConnection {
    pub fn split(self) -> (MessageSender, MessageReceiver) {
        (self.sender, self.receiver)
    }

    /// Two connected in-memory endpoints, for tests and local wiring
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self {
                sender: MessageSender { tx: a_tx },
                receiver: MessageReceiver { rx: a_rx },
            },
            Self {
                sender: MessageSender { tx: b_tx },
                receiver: MessageReceiver { rx: b_rx },
            },
        )
    }
}

/// Wrap a sink/source pair into a [`MessageConnection`]
///
/// Spawns the reader and writer pump tasks. The writer closes the sink when
/// every sender clone is gone; the reader ends the receiver when the source
/// closes or errors.
pub fn spawn_pumps<S, R>(mut sink: S, mut source: R) -> MessageConnection
where
    S: MessageSink,
    R: MessageSource,
{
    let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel::<Bytes>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if let Err(e) = sink.send(message).await {
                debug!("writer pump ended: {e}");
                return;
            }
        }
        sink.close().await;
    });

    tokio::spawn(async move {
        loop {
            match source.recv().await {
                Ok(Some(message)) => {
                    if in_tx.send(message).await.is_err() {
                        debug!("reader pump ended: receiver dropped");
                        return;
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    debug!("reader pump ended: {e}");
                    return;
                }
            }
        }
    });

    MessageConnection {
        sender: MessageSender { tx: out_tx },
        receiver: MessageReceiver { rx: in_rx },
    }
}

#[cfg(test)]
mod tests;
