//! Dial-out adapter and tunnel URL construction

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use overpass_proto::{Mode, Role};
use overpass_transport::{
    spawn_pumps, MessageConnection, MessageSink, MessageSource, TransportError, TransportResult,
};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

/// Path every tunnel connection is established on
pub const TUNNEL_PATH: &str = "/api/tunnel";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Parameters announced when establishing a tunnel connection
///
/// Conveyed as query parameters; absent fields are omitted from the URL.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub role: Role,
    pub mode: Option<Mode>,
    pub name: Option<String>,
    pub code: Option<String>,
    pub addr: Option<String>,
}

impl TunnelRequest {
    /// A manage connection registering under `name`
    pub fn manage(name: &str) -> Self {
        Self {
            role: Role::Manage,
            mode: None,
            name: Some(name.to_owned()),
            code: None,
            addr: None,
        }
    }

    /// A direct connection carrying its own destination
    pub fn direct(role: Role, mode: Mode, addr: &str) -> Self {
        Self {
            role,
            mode: Some(mode),
            name: None,
            code: None,
            addr: Some(addr.to_owned()),
        }
    }

    /// A forward connection rendezvousing on `code`
    ///
    /// `name` addresses the agent that should originate the other side; the
    /// agent's own dial-back carries no name.
    pub fn forward(role: Role, mode: Mode, code: &str, name: Option<&str>, addr: Option<&str>) -> Self {
        Self {
            role,
            mode: Some(mode),
            name: name.map(str::to_owned),
            code: Some(code.to_owned()),
            addr: addr.map(str::to_owned),
        }
    }

    /// Build the full tunnel URL against `server` (`ws://host:port`, scheme
    /// optional)
    pub fn url(&self, server: &str) -> TransportResult<Url> {
        let base = if server.contains("://") {
            server.to_owned()
        } else {
            format!("ws://{server}")
        };
        let mut url =
            Url::parse(&base).map_err(|e| TransportError::Connection(e.to_string()))?;
        url.set_path(TUNNEL_PATH);

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("rule", self.role.as_str());
            if let Some(mode) = self.mode {
                query.append_pair("mode", mode.as_str());
            }
            if let Some(name) = &self.name {
                query.append_pair("name", name);
            }
            if let Some(code) = &self.code {
                query.append_pair("code", code);
            }
            if let Some(addr) = &self.addr {
                query.append_pair("addr", addr);
            }
        }
        Ok(url)
    }
}

struct ClientSink {
    sink: SplitSink<WsStream, Message>,
}

struct ClientSource {
    source: SplitStream<WsStream>,
}

#[async_trait]
impl MessageSink for ClientSink {
    async fn send(&mut self, message: Bytes) -> TransportResult<()> {
        self.sink
            .send(Message::Binary(message.to_vec()))
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
        let _ = self.sink.close().await;
    }
}

#[async_trait]
impl MessageSource for ClientSource {
    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        while let Some(result) = self.source.next().await {
            match result {
                Ok(Message::Binary(data)) => return Ok(Some(Bytes::from(data))),
                Ok(Message::Close(_)) => return Ok(None),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    trace!("websocket ping/pong");
                }
                Ok(other) => {
                    trace!("ignoring {other:?} on binary tunnel");
                }
                Err(e) => return Err(TransportError::Connection(e.to_string())),
            }
        }
        Ok(None)
    }
}

/// Dial `server` with the given announcement and wrap the socket
pub async fn dial(server: &str, request: &TunnelRequest) -> TransportResult<MessageConnection> {
    let url = request.url(server)?;
    debug!(%url, "dialing relay");

    let (socket, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    let (sink, source) = socket.split();
    Ok(spawn_pumps(ClientSink { sink }, ClientSource { source }))
}
