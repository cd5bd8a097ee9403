//! Channel registry
//!
//! Live control channels keyed by peer fingerprint. The broadcast engine
//! asks it "is this peer currently connected"; unpair uses it to
//! proactively close a removed peer's connection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use cribcall_protocol::{ControlMessage, ProtocolError};
use tracing::{debug, info};

use crate::channel::ControlChannel;

#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: Arc<RwLock<HashMap<String, ControlChannel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel for its peer. An existing channel for the same
    /// fingerprint is disposed — one live channel per peer.
    pub fn insert(&self, channel: ControlChannel) {
        let fingerprint = channel.info().peer_fingerprint.clone();
        let previous = self
            .channels
            .write()
            .unwrap()
            .insert(fingerprint.clone(), channel);
        if let Some(previous) = previous {
            debug!(peer = %fingerprint, "replacing existing channel");
            previous.dispose();
        }
    }

    /// Drop the registry entry if it still refers to this connection.
    pub fn remove_connection(&self, peer_fingerprint: &str, connection_id: &str) {
        let mut channels = self.channels.write().unwrap();
        if let Some(channel) = channels.get(peer_fingerprint) {
            if channel.info().connection_id == connection_id {
                channels.remove(peer_fingerprint);
                debug!(peer = %peer_fingerprint, connection_id, "channel unregistered");
            }
        }
    }

    pub fn get(&self, peer_fingerprint: &str) -> Option<ControlChannel> {
        self.channels.read().unwrap().get(peer_fingerprint).cloned()
    }

    /// Whether a live, connected channel exists for this peer.
    pub fn is_connected(&self, peer_fingerprint: &str) -> bool {
        self.get(peer_fingerprint)
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    /// Send to a peer's channel if one is connected.
    pub async fn send_to(
        &self,
        peer_fingerprint: &str,
        message: ControlMessage,
    ) -> Result<(), ProtocolError> {
        match self.get(peer_fingerprint) {
            Some(channel) => channel.send(message).await,
            None => Err(ProtocolError::Closed(format!(
                "no channel for peer {peer_fingerprint}"
            ))),
        }
    }

    /// Dispose and remove the channel for a peer (unpair). Best effort.
    pub fn close_peer(&self, peer_fingerprint: &str) {
        if let Some(channel) = self.channels.write().unwrap().remove(peer_fingerprint) {
            info!(peer = %peer_fingerprint, "closing channel for removed peer");
            channel.dispose();
        }
    }

    pub fn connected_count(&self) -> usize {
        self.channels
            .read()
            .unwrap()
            .values()
            .filter(|c| c.is_connected())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_has_no_connections() {
        let registry = ChannelRegistry::new();
        assert!(!registry.is_connected("aa"));
        assert_eq!(registry.connected_count(), 0);
    }
}
