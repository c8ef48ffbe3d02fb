//! Bidirectional splicing of byte streams
//!
//! Rendezvoused pairs and direct-mode connections are wired together without
//! any framing: whatever one side sends, the other receives. Closing or
//! failing one side tears the other down.

use crate::MessageConnection;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

/// Read size for the socket side of a splice
pub const SOCKET_BUFFER_LENGTH: usize = 16384;

/// Copy messages between two connections until either side goes away
pub async fn splice(a: MessageConnection, b: MessageConnection) {
    let (a_tx, mut a_rx) = a.split();
    let (b_tx, mut b_rx) = b.split();

    let forward = async {
        while let Some(message) = a_rx.recv().await {
            if b_tx.send(message).await.is_err() {
                break;
            }
        }
    };
    let backward = async {
        while let Some(message) = b_rx.recv().await {
            if a_tx.send(message).await.is_err() {
                break;
            }
        }
    };

    // either direction finishing drops both senders, closing both sides
    tokio::select! {
        _ = forward => trace!("splice finished forward"),
        _ = backward => trace!("splice finished backward"),
    }
}

/// Copy between a message connection and a raw TCP stream
///
/// Messages become plain socket writes; socket reads become messages of at
/// most [`SOCKET_BUFFER_LENGTH`] bytes. Ends when either side closes or
/// errors, shutting the other down.
pub async fn splice_tcp(conn: MessageConnection, stream: TcpStream) {
    let (tx, mut rx) = conn.split();
    let (mut read_half, mut write_half) = stream.into_split();

    let to_socket = async {
        while let Some(message) = rx.recv().await {
            if write_half.write_all(&message).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    };
    let to_messages = async {
        let mut buf = vec![0u8; SOCKET_BUFFER_LENGTH];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        break;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = to_socket => trace!("splice finished toward socket"),
        _ = to_messages => trace!("splice finished toward messages"),
    }
}
