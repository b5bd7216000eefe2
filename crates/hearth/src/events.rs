//! Hub events
//!
//! Typed notifications fanned out to any number of subscribers (HTTP layer,
//! rules engine, tests) over a broadcast channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EventKind {
    AdapterAdded {
        adapter_id: String,
        package_name: String,
    },
    NotifierAdded {
        notifier_id: String,
        package_name: String,
    },
    ApiHandlerAdded {
        package_name: String,
    },
    ThingAdded {
        thing_id: String,
        adapter_id: String,
    },
    ThingModified {
        thing_id: String,
    },
    ThingRemoved {
        thing_id: String,
        adapter_id: String,
    },
    PropertyChanged {
        thing_id: String,
        property: String,
        value: Value,
    },
    ActionStatus {
        thing_id: String,
        action: Value,
    },
    Event {
        thing_id: String,
        event: Value,
    },
    ConnectedState {
        thing_id: String,
        connected: bool,
    },
    OutletAdded {
        notifier_id: String,
        outlet_id: String,
    },
    OutletRemoved {
        notifier_id: String,
        outlet_id: String,
    },
    PairingTimeout,
    Prompt {
        adapter_id: String,
        thing_id: Option<String>,
        message: String,
        url: Option<String>,
    },
    AddonLoaded {
        package_name: String,
    },
    AddonUnloaded {
        package_name: String,
    },
    PluginError {
        plugin_id: String,
        message: String,
    },
}

/// A published event with its timestamp
#[derive(Debug, Clone, Serialize)]
pub struct HubEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// A handle for publishing and subscribing to hub events
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HubEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, kind: EventKind) {
        let _ = self.tx.send(HubEvent {
            at: Utc::now(),
            kind,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HubEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_sees_events() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.publish(EventKind::PairingTimeout);

        assert_eq!(first.recv().await.unwrap().kind, EventKind::PairingTimeout);
        assert_eq!(second.recv().await.unwrap().kind, EventKind::PairingTimeout);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        bus.publish(EventKind::AddonLoaded {
            package_name: "zigbee".into(),
        });
    }

    #[test]
    fn test_serializes_tagged() {
        let event = HubEvent {
            at: Utc::now(),
            kind: EventKind::ThingRemoved {
                thing_id: "lamp".into(),
                adapter_id: "mock".into(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "thingRemoved");
        assert_eq!(value["thingId"], "lamp");
        assert_eq!(value["adapterId"], "mock");
    }
}
