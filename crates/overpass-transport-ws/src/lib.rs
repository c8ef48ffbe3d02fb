//! WebSocket endpoints for the message-connection layer
//!
//! Two adapters around [`overpass_transport::spawn_pumps`]: the relay wraps
//! sockets accepted through an axum upgrade, agents and connectors dial out
//! with tokio-tungstenite. Both surface the same [`MessageConnection`], so
//! everything above the transport is oblivious to which side it sits on.

pub mod client;
pub mod server;

pub use client::{dial, TunnelRequest, TUNNEL_PATH};
pub use server::accept_socket;

pub use overpass_transport::MessageConnection;
