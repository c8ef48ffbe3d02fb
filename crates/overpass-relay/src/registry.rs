//! Named control-channel registry
//!
//! Agents keep one long-lived manage connection open and are addressed by
//! name; originating a rendezvous session means sending a control message
//! down that connection. Registration is last-writer-wins so a reconnecting
//! agent displaces its stale entry, and deregistration is id-checked so the
//! stale connection's teardown cannot evict its replacement.

use crate::fair_mutex::FairMutex;
use crate::RelayError;
use bytes::Bytes;
use overpass_proto::ControlMessage;
use overpass_transport::MessageSender;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

struct ControlChannel {
    id: u64,
    sender: MessageSender,
}

/// Process-wide map from agent name to its live control channel
#[derive(Clone)]
pub struct ControlRegistry {
    channels: Arc<FairMutex<HashMap<String, ControlChannel>>>,
    next_id: Arc<AtomicU64>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(FairMutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register `sender` as the control channel for `name`
    ///
    /// Returns the channel id to pass back to [`deregister`]. An existing
    /// registration under the same name is displaced.
    ///
    /// [`deregister`]: ControlRegistry::deregister
    pub async fn register(&self, name: &str, sender: MessageSender) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut channels = self.channels.lock().await;
        let replaced = channels
            .insert(name.to_owned(), ControlChannel { id, sender })
            .is_some();
        if replaced {
            info!(agent = name, "re-registered agent, displacing stale channel");
        } else {
            info!(agent = name, "registered agent");
        }
        id
    }

    /// Remove the registration for `name`, but only if it still is channel `id`
    pub async fn deregister(&self, name: &str, id: u64) {
        let mut channels = self.channels.lock().await;
        if channels.get(name).is_some_and(|c| c.id == id) {
            channels.remove(name);
            info!(agent = name, "deregistered agent");
        } else {
            debug!(agent = name, "skipping deregistration of displaced channel");
        }
    }

    /// Whether an agent is currently registered under `name`
    pub async fn contains(&self, name: &str) -> bool {
        self.channels.lock().await.contains_key(name)
    }

    /// Ask the agent named `name` to originate a session for `code`
    ///
    /// Fails immediately when the agent is not registered; on success the
    /// control message is on its way, and establishment is signalled only by
    /// the agent's data channel arriving at the rendezvous broker.
    pub async fn originate(
        &self,
        name: &str,
        code: &str,
        addr: &str,
        mux: bool,
    ) -> Result<(), RelayError> {
        let sender = {
            let channels = self.channels.lock().await;
            match channels.get(name) {
                Some(channel) => channel.sender.clone(),
                None => return Err(RelayError::AgentNotRunning(name.to_owned())),
            }
        };

        let message = ControlMessage::originate(code, addr, mux)
            .to_bytes()
            .map_err(RelayError::Protocol)?;
        debug!(agent = name, code, addr, mux, "sending originate command");
        sender
            .send(Bytes::from(message))
            .await
            .map_err(|_| RelayError::AgentNotRunning(name.to_owned()))
    }
}

impl Default for ControlRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overpass_transport::MessageConnection;

    #[tokio::test]
    async fn test_register_and_originate() {
        let registry = ControlRegistry::new();
        let (relay_end, mut agent_end) = MessageConnection::pair();
        registry.register("laptop", relay_end.sender.clone()).await;

        registry
            .originate("laptop", "c0de", "127.0.0.1:22", true)
            .await
            .unwrap();

        let raw = agent_end.receiver.recv().await.unwrap();
        let message = ControlMessage::from_bytes(&raw).unwrap();
        assert_eq!(message, ControlMessage::originate("c0de", "127.0.0.1:22", true));
    }

    #[tokio::test]
    async fn test_originate_unknown_agent_fails_immediately() {
        let registry = ControlRegistry::new();
        let result = registry.originate("ghost", "c0de", "127.0.0.1:22", false).await;
        assert!(matches!(result, Err(RelayError::AgentNotRunning(name)) if name == "ghost"));
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let registry = ControlRegistry::new();
        let (first, _first_peer) = MessageConnection::pair();
        let (second, mut second_peer) = MessageConnection::pair();

        registry.register("laptop", first.sender.clone()).await;
        registry.register("laptop", second.sender.clone()).await;

        registry
            .originate("laptop", "c0de", "host:1", false)
            .await
            .unwrap();
        assert!(second_peer.receiver.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_deregister_checks_channel_id() {
        let registry = ControlRegistry::new();
        let (first, _first_peer) = MessageConnection::pair();
        let (second, _second_peer) = MessageConnection::pair();

        let stale = registry.register("laptop", first.sender.clone()).await;
        let fresh = registry.register("laptop", second.sender.clone()).await;

        // the displaced channel's teardown must not evict its replacement
        registry.deregister("laptop", stale).await;
        assert!(registry.contains("laptop").await);

        registry.deregister("laptop", fresh).await;
        assert!(!registry.contains("laptop").await);
    }
}
