//! Status and alert events for external collaborators

use oblivion_net::{NatType, PeerId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::circuit::{CircuitId, CircuitPurpose};

/// Kinds of interference a collaborator can report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterferenceKind {
    DnsPoisoning,
    ConnectionReset,
    TlsInterference,
    Throttling,
    /// Public relays are unreachable
    RelayBlocked,
    /// A specific bridge stopped working
    BridgeBlocked,
}

impl InterferenceKind {
    /// Interference that makes direct relay entry unusable
    pub fn blocks_relays(&self) -> bool {
        matches!(
            self,
            InterferenceKind::RelayBlocked | InterferenceKind::TlsInterference
        )
    }
}

/// Engine events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayEvent {
    NatTypeChanged {
        previous: NatType,
        current: NatType,
    },
    PeerConnected {
        peer_id: PeerId,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    CircuitBuilt {
        circuit_id: CircuitId,
        purpose: CircuitPurpose,
    },
    CircuitDestroyed {
        circuit_id: CircuitId,
        reason: String,
    },
    BridgeEvicted {
        fingerprint: String,
        failures: u32,
    },
    BridgeSessionClosed {
        session_id: u64,
        reason: String,
    },
    RelaySessionClosed {
        session_id: u64,
        reason: String,
    },
    InterferenceReported {
        kind: InterferenceKind,
        target: String,
    },
    /// Circuit building switched to bridge entry
    BridgesOnly,
    OnionResolved {
        address: String,
    },
    IdentityRotated {
        peer_id: PeerId,
    },
}

/// Broadcast bus; slow subscribers lose old events instead of blocking
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OverlayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers, returning how many received it
    pub fn publish(&self, event: OverlayEvent) -> usize {
        trace!("Event: {:?}", event);
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::RecvError;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.publish(OverlayEvent::BridgesOnly), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_old_events() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for id in 0..4 {
            bus.publish(OverlayEvent::CircuitDestroyed {
                circuit_id: id,
                reason: "test".into(),
            });
        }
        assert!(matches!(rx.recv().await, Err(RecvError::Lagged(2))));
        assert_eq!(
            rx.recv().await.unwrap(),
            OverlayEvent::CircuitDestroyed {
                circuit_id: 2,
                reason: "test".into()
            }
        );
    }
}
