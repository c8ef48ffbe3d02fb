//! Rendezvous broker
//!
//! Two tunnel connections sharing a one-time code arrive independently and in
//! either order; the broker parks the first and hands both to the caller when
//! the second shows up. A code whose pair has been made is remembered as
//! consumed, and any later arrival for it is rejected instead of being wired
//! into a window where it could hijack the pair.

use crate::fair_mutex::FairMutex;
use crate::RelayError;
use overpass_transport::MessageConnection;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

struct BrokerState {
    waiting: HashMap<String, MessageConnection>,
    consumed: HashSet<String>,
}

/// What an [`open`](RendezvousBroker::open) call produced
pub enum OpenOutcome {
    /// First arrival; the connection is parked until its peer shows up
    Waiting,
    /// Second arrival; the caller wires the two together
    Matched {
        first: MessageConnection,
        second: MessageConnection,
    },
}

/// Process-wide map from rendezvous code to its pending slot
#[derive(Clone)]
pub struct RendezvousBroker {
    state: Arc<FairMutex<BrokerState>>,
}

impl RendezvousBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FairMutex::new(BrokerState {
                waiting: HashMap::new(),
                consumed: HashSet::new(),
            })),
        }
    }

    /// Attach `conn` to the slot for `code`
    ///
    /// Exactly one pair is produced per code regardless of arrival order; the
    /// second arrival receives both connections. A consumed code is rejected
    /// and the offending connection dropped.
    pub async fn open(
        &self,
        code: &str,
        conn: MessageConnection,
    ) -> Result<OpenOutcome, RelayError> {
        let mut state = self.state.lock().await;
        if state.consumed.contains(code) {
            return Err(RelayError::CodeConsumed(code.to_owned()));
        }
        match state.waiting.remove(code) {
            Some(first) => {
                state.consumed.insert(code.to_owned());
                info!(code, "rendezvous pair matched");
                Ok(OpenOutcome::Matched {
                    first,
                    second: conn,
                })
            }
            None => {
                state.waiting.insert(code.to_owned(), conn);
                debug!(code, "rendezvous slot opened, waiting for peer");
                Ok(OpenOutcome::Waiting)
            }
        }
    }

    /// Drop a waiting slot whose pair will never arrive
    ///
    /// Used when the originate command for a freshly-parked connection could
    /// not be delivered. The code is not marked consumed; it was never paired.
    pub async fn abandon(&self, code: &str) {
        let mut state = self.state.lock().await;
        if state.waiting.remove(code).is_some() {
            debug!(code, "rendezvous slot abandoned");
        }
    }

    /// Number of connections parked waiting for their peer
    pub async fn waiting_len(&self) -> usize {
        self.state.lock().await.waiting.len()
    }
}

impl Default for RendezvousBroker {
    fn default() -> Self {
        Self::new()
    }
}
