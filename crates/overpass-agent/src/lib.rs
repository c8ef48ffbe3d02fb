//! Relay-side agent
//!
//! An agent keeps a manage channel registered under its name and waits to be
//! told to originate: each control message makes it dial the relay back with
//! the given rendezvous code, either running the dial end of a multiplexed
//! tunnel over the paired channel or splicing one destination connection
//! into it. Losing the manage channel triggers reconnection with exponential
//! backoff; a failing link never takes the manage loop down with it.

use bytes::Bytes;
use overpass_mux::{MuxError, MuxTunnel};
use overpass_proto::{ControlMessage, Mode, OriginateData, Role, COMMAND_ORIGINATE};
use overpass_transport::{splice_tcp, MessageConnection, MessageSender, TransportError};
use overpass_transport_ws::{dial, TunnelRequest};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, info, warn};

/// First reconnect delay after losing the manage channel
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect delay ceiling
const MAX_BACKOFF: Duration = Duration::from_secs(64);

/// How often the agent nudges an idle manage channel
const MANAGE_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Agent configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Relay endpoint, `ws://host:port` (scheme optional)
    pub relay: String,
    /// Name this agent registers under
    pub name: String,
}

/// A relay-side agent serving originate requests
pub struct Agent {
    config: AgentConfig,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }

    /// Keep a manage channel open, reconnecting for as long as the task runs
    pub async fn run(&self) -> Result<(), AgentError> {
        let mut delay = INITIAL_BACKOFF;
        loop {
            match dial(&self.config.relay, &TunnelRequest::manage(&self.config.name)).await {
                Ok(conn) => {
                    info!(name = %self.config.name, relay = %self.config.relay, "manage channel up");
                    delay = INITIAL_BACKOFF;
                    self.serve_manage(conn).await;
                    warn!("manage channel lost, reconnecting");
                }
                Err(e) => warn!("manage dial failed: {e}"),
            }
            sleep(delay).await;
            delay = (delay * 2).min(MAX_BACKOFF);
        }
    }

    /// Handle control messages until the manage channel closes
    async fn serve_manage(&self, conn: MessageConnection) {
        let (sender, mut receiver) = conn.split();
        let keep_alive = tokio::spawn(manage_keep_alive(sender));

        while let Some(raw) = receiver.recv().await {
            if raw.is_empty() {
                continue;
            }
            match ControlMessage::from_bytes(&raw) {
                Ok(message) if message.command == COMMAND_ORIGINATE => {
                    let relay = self.config.relay.clone();
                    tokio::spawn(async move {
                        let code = message.data.code.clone();
                        if let Err(e) = originate_link(&relay, message.data).await {
                            warn!(code, "link failed: {e}");
                        }
                    });
                }
                Ok(message) => {
                    debug!(command = message.command, "ignoring unknown command");
                }
                Err(e) => warn!("undecodable control message: {e}"),
            }
        }
        keep_alive.abort();
    }
}

/// Dial the relay back for one rendezvous and serve it to completion
async fn originate_link(relay: &str, data: OriginateData) -> Result<(), AgentError> {
    info!(code = %data.code, addr = %data.addr, mux = data.mux, "originating link");

    if data.mux {
        // destinations arrive per session once the pair is spliced
        let request = TunnelRequest::forward(Role::Agent, Mode::ForwardMux, &data.code, None, None);
        let conn = dial(relay, &request).await?;
        MuxTunnel::run(conn).await?;
    } else {
        let stream = TcpStream::connect(&data.addr).await?;
        let request = TunnelRequest::forward(Role::Agent, Mode::Forward, &data.code, None, None);
        let conn = dial(relay, &request).await?;
        splice_tcp(conn, stream).await;
    }
    debug!(code = %data.code, "link finished");
    Ok(())
}

/// Send empty messages so intermediaries keep the manage channel alive
async fn manage_keep_alive(sender: MessageSender) {
    let mut ticker = interval(MANAGE_KEEP_ALIVE_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if sender.send(Bytes::new()).await.is_err() {
            return;
        }
    }
}
