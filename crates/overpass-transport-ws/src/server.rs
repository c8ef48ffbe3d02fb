//! Relay-side adapter for sockets accepted through an axum upgrade

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use overpass_transport::{
    spawn_pumps, MessageConnection, MessageSink, MessageSource, TransportError, TransportResult,
};
use tracing::trace;

struct AxumSink {
    sink: SplitSink<WebSocket, Message>,
}

struct AxumSource {
    source: SplitStream<WebSocket>,
}

#[async_trait]
impl MessageSink for AxumSink {
    async fn send(&mut self, message: Bytes) -> TransportResult<()> {
        self.sink
            .send(Message::Binary(message))
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

#[async_trait]
impl MessageSource for AxumSource {
    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        while let Some(result) = self.source.next().await {
            match result {
                Ok(Message::Binary(data)) => return Ok(Some(data)),
                Ok(Message::Close(_)) => return Ok(None),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Pong replies are handled by the protocol layer
                    trace!("websocket ping/pong");
                }
                Ok(Message::Text(_)) => {
                    trace!("ignoring text message on binary tunnel");
                }
                Err(e) => return Err(TransportError::Connection(e.to_string())),
            }
        }
        Ok(None)
    }
}

/// Wrap an upgraded axum WebSocket into a [`MessageConnection`]
pub fn accept_socket(socket: WebSocket) -> MessageConnection {
    let (sink, source) = socket.split();
    spawn_pumps(AxumSink { sink }, AxumSource { source })
}
