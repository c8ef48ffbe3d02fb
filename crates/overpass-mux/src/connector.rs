//! Originating end of a multiplexed tunnel
//!
//! The originating end turns accepted local connections into sessions: it
//! allocates ids, announces them with `New` frames, and pumps local bytes
//! through the shared connection while a dispatch task routes inbound data
//! blocks back to the right local stream.

use crate::session::{write_stream, SESSION_CHANNEL_CAPACITY};
use crate::MuxError;
use bytes::Bytes;
use overpass_proto::{
    encode_data_chunk, Frame, Reassembler, TargetNetwork, TunnelEvent, DATA_CHUNK_SIZE,
};
use overpass_transport::{MessageConnection, MessageReceiver, MessageSender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration};
use tracing::{debug, trace, warn};

/// How often protocol keep-alive frames are sent on an idle tunnel
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(20);

type StreamMap = Arc<Mutex<HashMap<u16, mpsc::Sender<Bytes>>>>;

/// Session originator over one multiplexed tunnel connection
///
/// Cheap to clone; all clones share the tunnel. Sessions opened here are
/// served by a [`crate::MuxTunnel`] on the far side.
#[derive(Clone)]
pub struct MuxConnector {
    sender: MessageSender,
    streams: StreamMap,
    next_id: Arc<AtomicU16>,
}

impl MuxConnector {
    /// Take over `conn` and start dispatching inbound frames
    pub fn start(conn: MessageConnection) -> Self {
        let (sender, receiver) = conn.split();
        let streams: StreamMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(dispatch(streams.clone(), receiver));
        tokio::spawn(keep_alive(sender.clone()));

        Self {
            sender,
            streams,
            next_id: Arc::new(AtomicU16::new(1)),
        }
    }

    /// Whether the underlying tunnel connection has gone away
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Open a session toward `destination`, bridging `stream` through it
    ///
    /// Returns the allocated session id once the `New` frame is on its way.
    pub async fn open(&self, destination: &str, stream: TcpStream) -> Result<u16, MuxError> {
        let id = self.allocate_id().await;
        let frame = Frame::new_session(id, TargetNetwork::Tcp, destination).encode()?;

        let (read_half, write_half) = stream.into_split();
        let (data_tx, data_rx) = mpsc::channel(SESSION_CHANNEL_CAPACITY);
        self.streams.lock().await.insert(id, data_tx);

        if let Err(e) = self.sender.send(frame).await {
            self.streams.lock().await.remove(&id);
            return Err(MuxError::Transport(e));
        }
        debug!(session = id, %destination, "session opened");

        tokio::spawn(write_stream(write_half, data_rx));
        tokio::spawn(outbound_stream(
            read_half,
            self.sender.clone(),
            self.streams.clone(),
            id,
        ));
        Ok(id)
    }

    /// Next unused id; wraps around and skips ids still in flight
    async fn allocate_id(&self) -> u16 {
        let streams = self.streams.lock().await;
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if !streams.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Route inbound frames to their local streams until the tunnel closes
async fn dispatch(streams: StreamMap, mut receiver: MessageReceiver) {
    let mut reassembler = Reassembler::new();

    'tunnel: while let Some(message) = receiver.recv().await {
        let events = match reassembler.feed(&message) {
            Ok(events) => events,
            Err(e) => {
                warn!("tunnel desynced: {e}");
                break;
            }
        };
        for event in events {
            match event {
                TunnelEvent::Data {
                    session_id,
                    payload,
                } => {
                    let data_tx = streams.lock().await.get(&session_id).cloned();
                    match data_tx {
                        Some(data_tx) => {
                            let _ = data_tx.send(payload).await;
                        }
                        None => trace!(session = session_id, "dropping data for absent session"),
                    }
                }
                TunnelEvent::End { session_id, .. } => {
                    // dropping the sender shuts the local write half down
                    streams.lock().await.remove(&session_id);
                }
                TunnelEvent::NewSession { session_id, .. } => {
                    warn!("{}", MuxError::UnexpectedNewSession(session_id));
                    break 'tunnel;
                }
                TunnelEvent::KeepAlive => {}
            }
        }
    }

    streams.lock().await.clear();
    debug!("tunnel dispatch finished");
}

/// Pump local bytes into the tunnel, then end the session
async fn outbound_stream(
    mut read_half: OwnedReadHalf,
    sender: MessageSender,
    streams: StreamMap,
    id: u16,
) {
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
                trace!(session = id, "local read failed: {e}");
                break;
            }
        }
    }

    streams.lock().await.remove(&id);
    if let Ok(frame) = Frame::end(id).encode() {
        let _ = sender.send(frame).await;
    }
    trace!(session = id, "local side finished");
}

/// Tick keep-alive frames until the tunnel stops accepting them
async fn keep_alive(sender: MessageSender) {
    let mut ticker = interval(KEEP_ALIVE_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Ok(frame) = Frame::keep_alive().encode() else {
            return;
        };
        if sender.send(frame).await.is_err() {
            return;
        }
    }
}
