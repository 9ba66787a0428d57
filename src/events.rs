// =============================================================================
// Engine Event Bus — core → UI fan-out
// =============================================================================
//
// Commands flow UI → core through the REST API; everything the core wants the
// UI to see flows back through this one-way broadcast channel. Slow or absent
// subscribers never block the engine: `tokio::sync::broadcast` drops the
// oldest entries for lagging receivers and `publish` ignores the no-receiver
// case.
// =============================================================================

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{OrderResult, Signal, SkipReason, TradeRecord};

/// Capacity of the broadcast ring. Laggards skip ahead rather than stall.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the engine reports to external observers, tagged for the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EngineEvent {
    Connected,
    Disconnected {
        reason: String,
    },
    TradeDetected {
        signal: Signal,
    },
    TradeExecuted {
        record: TradeRecord,
        result: OrderResult,
    },
    TradeSkipped {
        record: TradeRecord,
        reason: SkipReason,
    },
    Error {
        message: String,
    },
    Log {
        level: String,
        message: String,
    },
}

/// Cheaply cloneable handle to the engine's broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. A send error only means no subscriber is listening,
    /// which is normal when the UI is closed.
    pub fn publish(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            debug!("engine event dropped (no subscribers)");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_kebab_case_tag() {
        let json = serde_json::to_string(&EngineEvent::Connected).unwrap();
        assert_eq!(json, r#"{"type":"connected"}"#);

        let json = serde_json::to_string(&EngineEvent::Disconnected {
            reason: "read error".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"disconnected""#));

        let json = serde_json::to_string(&EngineEvent::Log {
            level: "info".to_string(),
            message: "started".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"log""#));
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(EngineEvent::Connected);
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::Error {
            message: "boom".to_string(),
        });
        match rx.recv().await.unwrap() {
            EngineEvent::Error { message } => assert_eq!(message, "boom"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
