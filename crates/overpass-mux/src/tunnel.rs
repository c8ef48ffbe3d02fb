//! Dial end of a multiplexed tunnel
//!
//! The dial end opens destination connections on demand: every `New` frame
//! becomes an outbound TCP connect, every `Keep` block is written to the
//! matching destination, and everything the destinations send back is chunked
//! into `Keep` units on the shared connection. The relay runs this for
//! `directMux` connections; agents run it on the paired channel of a
//! `forwardMux` rendezvous.

use crate::session::{write_stream, SessionTable, SESSION_CHANNEL_CAPACITY};
use crate::MuxError;
use overpass_proto::{
    encode_data_chunk, Frame, Reassembler, TargetNetwork, TunnelEvent, DATA_CHUNK_SIZE,
};
use overpass_transport::{MessageConnection, MessageSender};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// One multiplexed tunnel and the sessions living inside it
pub struct MuxTunnel {
    table: SessionTable,
}

impl MuxTunnel {
    fn new() -> Self {
        Self {
            table: SessionTable::new(),
        }
    }

    /// Run a tunnel over `conn` until the peer goes away
    ///
    /// A clean close by the peer resolves to `Ok`. Structural protocol
    /// violations (reassembly desync, duplicate session ids) are returned
    /// after every session has been torn down; the connection itself is
    /// dropped either way.
    pub async fn run(conn: MessageConnection) -> Result<(), MuxError> {
        let tunnel = Self::new();
        let (sender, mut receiver) = conn.split();
        let mut reassembler = Reassembler::new();

        let result = 'tunnel: loop {
            let Some(message) = receiver.recv().await else {
                break Ok(());
            };
            let events = match reassembler.feed(&message) {
                Ok(events) => events,
                Err(e) => break Err(MuxError::Protocol(e)),
            };
            for event in events {
                if let Err(e) = tunnel.dispatch(event, &sender).await {
                    break 'tunnel Err(e);
                }
            }
        };

        if let Err(e) = &result {
            let sessions = tunnel.table.len().await;
            warn!(sessions, "tunnel failed: {e}");
        }
        tunnel.table.clear().await;
        result
    }

    async fn dispatch(&self, event: TunnelEvent, sender: &MessageSender) -> Result<(), MuxError> {
        match event {
            TunnelEvent::NewSession {
                session_id,
                network,
                destination,
            } => {
                if !self.table.reserve(session_id).await {
                    return Err(MuxError::DuplicateSession(session_id));
                }
                if network != TargetNetwork::Tcp {
                    // refused like a failed dial; the tunnel keeps running
                    warn!(session = session_id, ?network, "refusing non-tcp session");
                    self.table.remove(session_id).await;
                    let _ = sender.send(Frame::end_error(session_id).encode()?).await;
                    return Ok(());
                }
                let table = self.table.clone();
                let sender = sender.clone();
                tokio::spawn(open_session(table, sender, session_id, destination));
            }
            TunnelEvent::Data {
                session_id,
                payload,
            } => match self.table.data_sender(session_id).await {
                Some(data_tx) => {
                    let _ = data_tx.send(payload).await;
                }
                // ended, still connecting, or never existed; End may race
                // with in-flight data
                None => trace!(session = session_id, "dropping data for absent session"),
            },
            TunnelEvent::End { session_id, .. } => self.table.remove(session_id).await,
            TunnelEvent::KeepAlive => {}
        }
        Ok(())
    }
}

/// Connect to the destination and wire the session up, or report failure
async fn open_session(table: SessionTable, sender: MessageSender, id: u16, destination: String) {
    debug!(session = id, %destination, "opening session");

    let stream = match TcpStream::connect(&destination).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(session = id, %destination, "connect failed: {e}");
            table.remove(id).await;
            if let Ok(frame) = Frame::end_error(id).encode() {
                let _ = sender.send(frame).await;
            }
            return;
        }
    };

    let (read_half, write_half) = stream.into_split();
    let (data_tx, data_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
    tokio::spawn(write_stream(write_half, data_rx));

    let forward = tokio::spawn(forward_stream(read_half, sender, id));
    if !table.open(id, data_tx, forward.abort_handle()).await {
        // the session was ended while the dial was in flight
        forward.abort();
    }
}

/// Pump destination bytes into the tunnel as chunked `Keep` units
///
/// Destination EOF stops the pump without ending the session; only the peer
/// decides when a session is over.
async fn forward_stream(mut read_half: OwnedReadHalf, sender: MessageSender, id: u16) {
    let mut buf = vec![0u8; DATA_CHUNK_SIZE];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if sender.send(encode_data_chunk(id, &buf[..n])).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                trace!(session = id, "destination read failed: {e}");
                break;
            }
        }
    }
    trace!(session = id, "destination finished sending");
}
