//! Session multiplexing over one message connection
//!
//! A tunnel carries many independent TCP-like sessions as interleaved frames.
//! [`MuxTunnel`] runs the dial end (the side that opens destination
//! connections on demand), [`MuxConnector`] the originating end (the side
//! that turns accepted local connections into sessions). The two ends of one
//! tunnel always run on different processes; the relay either runs the dial
//! end itself (direct mode) or splices two rendezvoused connections so the
//! connector and agent ends talk to each other.

pub mod connector;
pub mod session;
pub mod tunnel;

pub use connector::MuxConnector;
pub use session::SessionTable;
pub use tunnel::MuxTunnel;

use overpass_proto::ProtoError;
use overpass_transport::TransportError;
use thiserror::Error;

/// Multiplexer errors; all of them are fatal to the tunnel
#[derive(Debug, Error)]
pub enum MuxError {
    #[error(transparent)]
    Protocol(#[from] ProtoError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("duplicate session id {0}")]
    DuplicateSession(u16),

    #[error("peer tried to open session {0} toward the originating end")]
    UnexpectedNewSession(u16),
}
