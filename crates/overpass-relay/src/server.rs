//! HTTP upgrade front end
//!
//! Every tunnel connection arrives as a WebSocket upgrade on one route and is
//! classified by its query parameters before the upgrade completes, so
//! refusals (unknown agent, failed direct dial, malformed parameters) surface
//! as plain HTTP errors instead of short-lived sockets.

use crate::broker::{OpenOutcome, RendezvousBroker};
use crate::registry::ControlRegistry;
use crate::RelayError;
use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use overpass_mux::MuxTunnel;
use overpass_proto::{Mode, Role};
use overpass_transport::{splice, splice_tcp};
use overpass_transport_ws::{accept_socket, TUNNEL_PATH};
use serde::Deserialize;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Shared tables behind the front end
#[derive(Clone)]
pub struct RelayState {
    pub registry: ControlRegistry,
    pub broker: RendezvousBroker,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            registry: ControlRegistry::new(),
            broker: RendezvousBroker::new(),
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct TunnelParams {
    rule: String,
    mode: Option<String>,
    name: Option<String>,
    code: Option<String>,
    addr: Option<String>,
}

/// Build the relay router around `state`
pub fn router(state: RelayState) -> Router {
    Router::new()
        .route(TUNNEL_PATH, get(tunnel_handler))
        .with_state(state)
}

/// A bound relay ready to serve tunnel connections
pub struct RelayServer {
    listener: TcpListener,
    state: RelayState,
}

impl RelayServer {
    pub async fn bind(addr: &str) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            state: RelayState::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(self) -> Result<(), RelayError> {
        info!(addr = %self.listener.local_addr()?, "relay listening");
        axum::serve(self.listener, router(self.state)).await?;
        Ok(())
    }
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, message).into_response()
}

fn valid_addr(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

async fn tunnel_handler(
    State(state): State<RelayState>,
    Query(params): Query<TunnelParams>,
    ws: WebSocketUpgrade,
) -> Response {
    debug!(?params, "tunnel connection arriving");

    let role = match params.rule.parse::<Role>() {
        Ok(role) => role,
        Err(e) => return bad_request(e),
    };
    let mode = match params.mode.as_deref().map(str::parse::<Mode>) {
        None => None,
        Some(Ok(mode)) => Some(mode),
        Some(Err(e)) => return bad_request(e),
    };

    match role {
        Role::Manage => {
            let Some(name) = params.name.filter(|n| !n.is_empty()) else {
                return bad_request("manage connection without a name".to_owned());
            };
            ws.on_upgrade(move |socket| run_manage(state, name, socket))
        }
        Role::Agent | Role::Connector => match mode {
            Some(mode) if mode.is_direct() => {
                let Some(addr) = params.addr.filter(|a| valid_addr(a)) else {
                    return bad_request("direct connection without a valid addr".to_owned());
                };
                if mode.is_mux() {
                    ws.on_upgrade(run_direct_mux)
                } else {
                    // dial before upgrading so a refused destination surfaces
                    // as an HTTP error
                    match TcpStream::connect(&addr).await {
                        Ok(stream) => ws.on_upgrade(move |socket| run_direct(socket, stream)),
                        Err(e) => {
                            warn!(%addr, "direct dial failed: {e}");
                            (
                                StatusCode::INTERNAL_SERVER_ERROR,
                                format!("tcp connect failed: {e}"),
                            )
                                .into_response()
                        }
                    }
                }
            }
            _ => {
                let Some(code) = params.code.filter(|c| !c.is_empty()) else {
                    return bad_request("forward connection without a code".to_owned());
                };
                let name = params.name.filter(|n| !n.is_empty());
                if let Some(name) = &name {
                    if !state.registry.contains(name).await {
                        return bad_request(format!("agent [{name}] not connected"));
                    }
                }
                let mux = mode.is_some_and(|m| m.is_mux());
                let addr = params.addr.unwrap_or_default();
                ws.on_upgrade(move |socket| run_forward(state, socket, code, name, addr, mux))
            }
        },
    }
}

/// Hold a manage channel open and registered until the agent goes away
async fn run_manage(state: RelayState, name: String, socket: WebSocket) {
    let conn = accept_socket(socket);
    let (sender, mut receiver) = conn.split();
    let id = state.registry.register(&name, sender).await;

    // manage channels only carry relay-to-agent traffic; inbound messages
    // are keep-alives to drain
    while receiver.recv().await.is_some() {}
    state.registry.deregister(&name, id).await;
}

/// Serve one direct (unframed) connection
async fn run_direct(socket: WebSocket, stream: TcpStream) {
    splice_tcp(accept_socket(socket), stream).await;
}

/// Serve one direct multiplexed tunnel
async fn run_direct_mux(socket: WebSocket) {
    if let Err(e) = MuxTunnel::run(accept_socket(socket)).await {
        warn!("mux tunnel failed: {e}");
    }
}

/// Rendezvous one forward connection, splicing when its peer is present
async fn run_forward(
    state: RelayState,
    socket: WebSocket,
    code: String,
    name: Option<String>,
    addr: String,
    mux: bool,
) {
    let conn = accept_socket(socket);
    match state.broker.open(&code, conn).await {
        Ok(OpenOutcome::Waiting) => {
            // only the first arrival carrying a name asks the agent to dial
            // back; the pair completes when that dial-back reaches the broker
            if let Some(name) = name {
                if let Err(e) = state.registry.originate(&name, &code, &addr, mux).await {
                    warn!(code, "originate failed: {e}");
                    state.broker.abandon(&code).await;
                }
            }
        }
        Ok(OpenOutcome::Matched { first, second }) => splice(first, second).await,
        Err(e) => warn!("rejecting rendezvous connection: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_addr() {
        assert!(valid_addr("127.0.0.1:22"));
        assert!(valid_addr("example.com:8080"));
        assert!(!valid_addr("no-port"));
        assert!(!valid_addr(":22"));
        assert!(!valid_addr("host:"));
        assert!(!valid_addr("host:notaport"));
        assert!(!valid_addr("host:99999"));
    }
}
