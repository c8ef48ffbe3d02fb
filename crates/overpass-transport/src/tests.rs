//! Tests for the message-connection layer

use super::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Mock endpoint halves wired over plain channels
struct MockSink {
    tx: mpsc::Sender<Bytes>,
    closed: Arc<AtomicBool>,
}

struct MockSource {
    rx: mpsc::Receiver<Bytes>,
    fail: bool,
}

#[async_trait]
impl MessageSink for MockSink {
    async fn send(&mut self, message: Bytes) -> TransportResult<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageSource for MockSource {
    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        if self.fail {
            return Err(TransportError::Connection("mock failure".to_owned()));
        }
        Ok(self.rx.recv().await)
    }
}

#[tokio::test]
async fn test_pair_round_trip() {
    let (a, mut b) = MessageConnection::pair();

    a.sender.send(Bytes::from_static(b"ping")).await.unwrap();
    assert_eq!(b.receiver.recv().await.unwrap(), Bytes::from_static(b"ping"));

    b.sender.send(Bytes::from_static(b"pong")).await.unwrap();
    let (_, mut a_rx) = a.split();
    assert_eq!(a_rx.recv().await.unwrap(), Bytes::from_static(b"pong"));
}

#[tokio::test]
async fn test_pair_close_propagates() {
    let (a, mut b) = MessageConnection::pair();
    drop(a);
    assert!(b.receiver.recv().await.is_none());
    assert!(b.sender.send(Bytes::from_static(b"late")).await.is_err());
}

#[tokio::test]
async fn test_cloned_senders_share_one_connection() {
    let (a, mut b) = MessageConnection::pair();
    let second = a.sender.clone();

    a.sender.send(Bytes::from_static(b"one")).await.unwrap();
    second.send(Bytes::from_static(b"two")).await.unwrap();

    assert_eq!(b.receiver.recv().await.unwrap(), Bytes::from_static(b"one"));
    assert_eq!(b.receiver.recv().await.unwrap(), Bytes::from_static(b"two"));
}

#[tokio::test]
async fn test_pumps_forward_both_directions() {
    let (wire_tx, mut wire_rx) = mpsc::channel(8);
    let (peer_tx, peer_rx) = mpsc::channel(8);
    let closed = Arc::new(AtomicBool::new(false));

    let mut conn = spawn_pumps(
        MockSink {
            tx: wire_tx,
            closed: closed.clone(),
        },
        MockSource {
            rx: peer_rx,
            fail: false,
        },
    );

    conn.sender.send(Bytes::from_static(b"out")).await.unwrap();
    assert_eq!(wire_rx.recv().await.unwrap(), Bytes::from_static(b"out"));

    peer_tx.send(Bytes::from_static(b"in")).await.unwrap();
    assert_eq!(conn.receiver.recv().await.unwrap(), Bytes::from_static(b"in"));
}

#[tokio::test]
async fn test_dropping_sender_closes_sink() {
    let (wire_tx, _wire_rx) = mpsc::channel(8);
    let (_peer_tx, peer_rx) = mpsc::channel(8);
    let closed = Arc::new(AtomicBool::new(false));

    let conn = spawn_pumps(
        MockSink {
            tx: wire_tx,
            closed: closed.clone(),
        },
        MockSource {
            rx: peer_rx,
            fail: false,
        },
    );

    drop(conn);
    tokio::task::yield_now().await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert!(closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_source_error_ends_receiver() {
    let (wire_tx, _wire_rx) = mpsc::channel(8);
    let (_peer_tx, peer_rx) = mpsc::channel(8);

    let mut conn = spawn_pumps(
        MockSink {
            tx: wire_tx,
            closed: Arc::new(AtomicBool::new(false)),
        },
        MockSource {
            rx: peer_rx,
            fail: true,
        },
    );

    assert!(conn.receiver.recv().await.is_none());
}
