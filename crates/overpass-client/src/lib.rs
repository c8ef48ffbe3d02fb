//! Local connector
//!
//! The connector listens on a local port and bridges every accepted
//! connection to a destination through the relay. Without an agent name the
//! relay dials the destination itself (direct modes); with one, each bridge
//! rendezvouses with that agent under a fresh one-time code (forward modes).
//! The mux flag trades one relay connection per local connection for
//! sessions multiplexed over a single shared tunnel.

use overpass_mux::{MuxConnector, MuxError};
use overpass_proto::{Mode, Role};
use overpass_transport::{splice_tcp, TransportError};
use overpass_transport_ws::{dial, TunnelRequest};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connector errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Connector configuration
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Relay endpoint, `ws://host:port` (scheme optional)
    pub relay: String,
    /// Local address to listen on
    pub listen: String,
    /// Destination the bridged connections should reach, `host:port`
    pub addr: String,
    /// Route through this named agent instead of the relay dialing directly
    pub agent: Option<String>,
    /// Multiplex sessions over one shared tunnel
    pub mux: bool,
}

/// A bound local listener bridging connections through the relay
pub struct Connector {
    config: ConnectorConfig,
    listener: TcpListener,
}

impl Connector {
    pub async fn bind(config: ConnectorConfig) -> Result<Self, ClientError> {
        let listener = TcpListener::bind(&config.listen).await?;
        Ok(Self { config, listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept and bridge local connections until the task stops
    pub async fn run(self) -> Result<(), ClientError> {
        info!(
            listen = %self.listener.local_addr()?,
            addr = %self.config.addr,
            agent = self.config.agent.as_deref().unwrap_or("<relay>"),
            mux = self.config.mux,
            "connector ready"
        );
        if self.config.mux {
            self.run_mux().await
        } else {
            self.run_plain().await
        }
    }

    /// One relay connection per local connection
    async fn run_plain(self) -> Result<(), ClientError> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "bridging local connection");
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = bridge_plain(&config, stream).await {
                    warn!("bridge failed: {e}");
                }
            });
        }
    }

    /// All local connections as sessions over one shared tunnel
    async fn run_mux(self) -> Result<(), ClientError> {
        let mut tunnel: Option<MuxConnector> = None;
        loop {
            let (stream, peer) = self.listener.accept().await?;
            debug!(%peer, "bridging local connection over shared tunnel");

            let connector = match &tunnel {
                Some(t) if !t.is_closed() => t.clone(),
                _ => match self.establish_tunnel().await {
                    Ok(t) => {
                        tunnel = Some(t.clone());
                        t
                    }
                    Err(e) => {
                        warn!("tunnel dial failed: {e}");
                        continue;
                    }
                },
            };

            if let Err(e) = connector.open(&self.config.addr, stream).await {
                warn!("session open failed: {e}");
                // force a fresh dial for the next connection
                tunnel = None;
            }
        }
    }

    async fn establish_tunnel(&self) -> Result<MuxConnector, ClientError> {
        let request = match &self.config.agent {
            Some(name) => TunnelRequest::forward(
                Role::Connector,
                Mode::ForwardMux,
                &fresh_code(),
                Some(name),
                Some(&self.config.addr),
            ),
            None => TunnelRequest::direct(Role::Connector, Mode::DirectMux, &self.config.addr),
        };
        let conn = dial(&self.config.relay, &request).await?;
        Ok(MuxConnector::start(conn))
    }
}

/// Bridge one local connection over its own relay connection
async fn bridge_plain(config: &ConnectorConfig, stream: TcpStream) -> Result<(), ClientError> {
    let request = match &config.agent {
        Some(name) => TunnelRequest::forward(
            Role::Connector,
            Mode::Forward,
            &fresh_code(),
            Some(name),
            Some(&config.addr),
        ),
        None => TunnelRequest::direct(Role::Connector, Mode::Direct, &config.addr),
    };
    let conn = dial(&config.relay, &request).await?;
    splice_tcp(conn, stream).await;
    Ok(())
}

/// One-time rendezvous code; never reused by construction
fn fresh_code() -> String {
    Uuid::new_v4().to_string()
}
