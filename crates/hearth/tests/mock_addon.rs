//! End-to-end tests against the reference add-on over loopback TCP

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::{TempDir, tempdir};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use hearth::settings::MemorySettings;
use hearth::{AddonManager, Error, EventKind, HubConfig, HubEvent};
use hearth_ipc::schema::{DeviceDescription, PinDescription, PropertyDescription};
use hearth_mock_addon::MockAddonConfig;

const PACKAGE: &str = "mock-addon";
const ADAPTER: &str = "mock-adapter";

struct Hub {
    _home: TempDir,
    manager: Arc<AddonManager>,
    addon: JoinHandle<anyhow::Result<()>>,
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

async fn hub() -> Hub {
    let home = tempdir().unwrap();
    let config = HubConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        base_dir: home.path().to_path_buf(),
        unload_kill_delay_ms: 200,
        unload_wait_margin_ms: 10,
        removal_timeout_ms: 2000,
        ..HubConfig::default()
    };
    let manager = AddonManager::new(config, Arc::new(MemorySettings::new()));
    let addr = manager.start().await.unwrap();
    let addon = tokio::spawn(hearth_mock_addon::run(MockAddonConfig::new(addr, PACKAGE)));
    within(manager.wait_for_adapter(ADAPTER)).await.unwrap();
    Hub {
        _home: home,
        manager,
        addon,
    }
}

fn dimmer(id: &str) -> DeviceDescription {
    DeviceDescription::new(id, "Dimmer")
        .with_property(
            "level",
            PropertyDescription {
                kind: Some("integer".to_string()),
                minimum: Some(0.0),
                maximum: Some(100.0),
                value: json!(0),
                ..PropertyDescription::default()
            },
        )
        .with_action("blink", json!({"title": "Blink"}))
}

async fn next_matching(
    events: &mut broadcast::Receiver<HubEvent>,
    pred: impl Fn(&EventKind) -> bool,
) -> EventKind {
    loop {
        let event = within(events.recv()).await.unwrap();
        if pred(&event.kind) {
            return event.kind;
        }
    }
}

#[tokio::test]
async fn test_mock_device_and_clamped_property_echo() {
    let hub = hub().await;
    let mut events = hub.manager.subscribe();
    let adapter = hub.manager.get_adapter(ADAPTER).unwrap();
    assert_eq!(adapter.package_name(), PACKAGE);

    within(adapter.mock_add_device(dimmer("dimmer-1"))).await.unwrap();
    assert!(hub.manager.get_device("dimmer-1").is_some());

    // The add-on clamps to the declared maximum and echoes what it applied.
    let value = within(hub.manager.set_property("dimmer-1", "level", json!(150)))
        .await
        .unwrap();
    assert_eq!(value, json!(100));
    assert_eq!(hub.manager.get_property("dimmer-1", "level").unwrap(), json!(100));

    let changed = next_matching(&mut events, |k| matches!(k, EventKind::PropertyChanged { .. })).await;
    assert_eq!(
        changed,
        EventKind::PropertyChanged {
            thing_id: "dimmer-1".to_string(),
            property: "level".to_string(),
            value: json!(100),
        }
    );

    let duplicate = within(adapter.mock_add_device(dimmer("dimmer-1"))).await;
    assert_eq!(
        duplicate.unwrap_err().to_string(),
        "Device: dimmer-1 already exists."
    );
}

#[tokio::test]
async fn test_pairing_resolves_with_staged_device() {
    let hub = hub().await;
    let adapter = hub.manager.get_adapter(ADAPTER).unwrap();
    adapter.mock_pair_device(dimmer("paired")).unwrap();

    let pending = hub.manager.add_new_thing(10).unwrap();
    let device = within(pending).await.unwrap();
    assert_eq!(device.id(), "paired");
    assert_eq!(device.adapter_id(), ADAPTER);

    // The slot is free again.
    let again = hub.manager.add_new_thing(10).unwrap();
    hub.manager.cancel_add_new_thing();
    assert!(matches!(within(again).await, Err(Error::Cancelled(_))));
}

#[tokio::test]
async fn test_actions_are_correlated() {
    let hub = hub().await;
    let mut events = hub.manager.subscribe();
    let adapter = hub.manager.get_adapter(ADAPTER).unwrap();
    within(adapter.mock_add_device(dimmer("dimmer-1"))).await.unwrap();

    within(hub.manager.request_action("dimmer-1", "act-1", "blink", json!({"times": 2})))
        .await
        .unwrap();
    let status = next_matching(&mut events, |k| matches!(k, EventKind::ActionStatus { .. })).await;
    let EventKind::ActionStatus { thing_id, action } = status else {
        unreachable!()
    };
    assert_eq!(thing_id, "dimmer-1");
    assert_eq!(action["id"], "act-1");
    assert_eq!(action["status"], "completed");

    within(hub.manager.remove_action("dimmer-1", "act-1", "blink"))
        .await
        .unwrap();

    let generated = within(hub.manager.start_action("dimmer-1", "blink", json!({})))
        .await
        .unwrap();
    assert_eq!(generated.len(), 36);

    let unknown = hub
        .manager
        .request_action("dimmer-1", "act-2", "explode", json!(null))
        .await;
    assert_eq!(unknown.unwrap_err().to_string(), "Action \"explode\" not found");
}

#[tokio::test]
async fn test_set_pin_replaces_device() {
    let hub = hub().await;
    let adapter = hub.manager.get_adapter(ADAPTER).unwrap();
    let mut locked = dimmer("lock");
    locked.pin = PinDescription {
        required: true,
        pattern: None,
    };
    within(adapter.mock_add_device(locked)).await.unwrap();

    let rejected = within(hub.manager.set_pin("lock", json!(null))).await;
    assert!(matches!(rejected, Err(Error::Rejected(reason)) if reason == "Invalid PIN"));

    let updated = within(hub.manager.set_pin("lock", json!("1234"))).await.unwrap();
    assert!(!updated.pin.required);
    assert!(!hub.manager.get_device("lock").unwrap().description().pin.required);
}

#[tokio::test]
async fn test_remove_thing_resolves_with_removed_id() {
    let hub = hub().await;
    let adapter = hub.manager.get_adapter(ADAPTER).unwrap();
    within(adapter.mock_add_device(dimmer("a"))).await.unwrap();
    within(adapter.mock_add_device(dimmer("b"))).await.unwrap();

    let removed = within(hub.manager.remove_thing("a").unwrap()).await.unwrap();
    assert_eq!(removed, "a");
    assert!(hub.manager.get_device("a").is_none());

    // The adapter may report a different device than the one asked for.
    adapter.mock_unpair_device("b").unwrap();
    within(adapter.mock_add_device(dimmer("c"))).await.unwrap();
    let removed = within(hub.manager.remove_thing("c").unwrap()).await.unwrap();
    assert_eq!(removed, "b");
    assert!(hub.manager.get_device("c").is_some());
}

#[tokio::test]
async fn test_unload_cascades_and_drops_devices() {
    let hub = hub().await;
    let mut events = hub.manager.subscribe();
    let adapter = hub.manager.get_adapter(ADAPTER).unwrap();
    within(adapter.mock_add_device(dimmer("dimmer-1"))).await.unwrap();

    within(hub.manager.unload_addon(PACKAGE, true)).await.unwrap();

    assert!(hub.manager.get_adapter(ADAPTER).is_none());
    assert!(hub.manager.get_things().is_empty());
    assert!(hub.manager.server().unwrap().get_plugin(PACKAGE).is_none());
    next_matching(&mut events, |k| matches!(k, EventKind::AddonUnloaded { .. })).await;

    // The add-on exits cleanly once its unload is confirmed.
    within(hub.addon).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_disconnect_rejects_outstanding_requests() {
    let hub = hub().await;
    let adapter = hub.manager.get_adapter(ADAPTER).unwrap();
    within(adapter.mock_add_device(dimmer("dimmer-1"))).await.unwrap();

    hub.addon.abort();
    let _ = hub.addon.await;

    // Either the send fails outright or the pending reply is abandoned.
    let result = within(hub.manager.request_action("dimmer-1", "act-1", "blink", json!({}))).await;
    assert!(result.is_err());
}
