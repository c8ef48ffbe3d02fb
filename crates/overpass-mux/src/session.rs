//! Session lifecycle tracking for one tunnel
//!
//! Sessions are tunnel-scoped: the table lives and dies with its tunnel, and
//! ids are opaque outside of it. An id is reserved as soon as its `New` frame
//! arrives so duplicates are caught while the destination connect is still in
//! flight; the writer side is attached once the connect resolves.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tracing::trace;

/// Data blocks buffered toward one destination before backpressure
pub(crate) const SESSION_CHANNEL_CAPACITY: usize = 64;

struct Session {
    /// Feeds the destination writer task; absent while the connect is in
    /// flight
    data_tx: Option<mpsc::Sender<Bytes>>,
    /// Destination-to-tunnel forward task
    forward: Option<AbortHandle>,
}

/// Map from session id to its destination connection state
///
/// Mutated from the tunnel's inbound task and from per-session connect tasks;
/// every access takes the table lock for the whole read-modify-write.
#[derive(Clone)]
pub struct SessionTable {
    sessions: Arc<Mutex<HashMap<u16, Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Reserve an id for a session whose connect is still pending
    ///
    /// Returns false when the id is already present, which the caller must
    /// treat as a protocol violation.
    pub async fn reserve(&self, id: u16) -> bool {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(&id) {
            return false;
        }
        sessions.insert(
            id,
            Session {
                data_tx: None,
                forward: None,
            },
        );
        true
    }

    /// Attach the connected destination to a reserved session
    ///
    /// Returns false when the reservation is gone (the session was ended or
    /// the tunnel tore down while connecting); the caller then unwinds the
    /// tasks it just spawned.
    pub async fn open(&self, id: u16, data_tx: mpsc::Sender<Bytes>, forward: AbortHandle) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get_mut(&id) {
            Some(session) => {
                session.data_tx = Some(data_tx);
                session.forward = Some(forward);
                true
            }
            None => false,
        }
    }

    /// Sender toward the destination of `id`, if the session is open
    pub async fn data_sender(&self, id: u16) -> Option<mpsc::Sender<Bytes>> {
        let sessions = self.sessions.lock().await;
        sessions.get(&id).and_then(|s| s.data_tx.clone())
    }

    /// Remove one session, stopping its forwarding
    ///
    /// Unknown ids are a no-op: an `End` may race with frames already in
    /// flight. The writer task is not aborted; it drains and closes the
    /// destination once its channel is dropped here.
    pub async fn remove(&self, id: u16) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.remove(&id) {
            if let Some(forward) = session.forward {
                forward.abort();
            }
            trace!(session = id, "session removed");
        }
    }

    /// Tear down every session; called when the tunnel itself closes
    pub async fn clear(&self) {
        let mut sessions = self.sessions.lock().await;
        for (_, session) in sessions.drain() {
            if let Some(forward) = session.forward {
                forward.abort();
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain data blocks into a destination write half, then shut it down
///
/// Shared by both tunnel ends; ends when the feeding channel closes or the
/// peer stops accepting writes.
pub(crate) async fn write_stream(mut write_half: OwnedWriteHalf, mut data_rx: mpsc::Receiver<Bytes>) {
    while let Some(data) = data_rx.recv().await {
        if write_half.write_all(&data).await.is_err() {
            return;
        }
    }
    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_channel() -> mpsc::Sender<Bytes> {
        mpsc::channel(1).0
    }

    fn dummy_abort_handle() -> AbortHandle {
        tokio::spawn(async {}).abort_handle()
    }

    #[tokio::test]
    async fn test_reserve_then_open() {
        let table = SessionTable::new();
        assert!(table.reserve(4).await);
        assert!(table.data_sender(4).await.is_none());

        assert!(table.open(4, dummy_channel(), dummy_abort_handle()).await);
        assert!(table.data_sender(4).await.is_some());
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_reservation_rejected() {
        let table = SessionTable::new();
        assert!(table.reserve(4).await);
        assert!(!table.reserve(4).await);
    }

    #[tokio::test]
    async fn test_open_after_remove_fails() {
        let table = SessionTable::new();
        assert!(table.reserve(9).await);
        table.remove(9).await;
        assert!(!table.open(9, dummy_channel(), dummy_abort_handle()).await);
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn test_remove_unknown_is_noop() {
        let table = SessionTable::new();
        table.remove(123).await;
        assert_eq!(table.len().await, 0);
    }

    #[tokio::test]
    async fn test_clear_empties_table() {
        let table = SessionTable::new();
        for id in [1u16, 2, 3] {
            assert!(table.reserve(id).await);
            assert!(table.open(id, dummy_channel(), dummy_abort_handle()).await);
        }
        table.clear().await;
        assert_eq!(table.len().await, 0);
    }
}
