//! Relay core: rendezvous brokering, agent control channels, and the
//! upgrade front end
//!
//! The relay pairs independently-arriving tunnel connections by one-time
//! code, keeps a registry of named agent control channels used to originate
//! those pairs on demand, and classifies every inbound connection into the
//! direct, manage, or forward paths.

pub mod broker;
pub mod fair_mutex;
pub mod registry;
pub mod server;

pub use broker::{OpenOutcome, RendezvousBroker};
pub use fair_mutex::{FairMutex, FairMutexGuard};
pub use registry::ControlRegistry;
pub use server::{router, RelayServer, RelayState};

use overpass_proto::ProtoError;
use thiserror::Error;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("agent [{0}] not connected")]
    AgentNotRunning(String),

    #[error("rendezvous code {0:?} already consumed")]
    CodeConsumed(String),

    #[error(transparent)]
    Protocol(#[from] ProtoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
