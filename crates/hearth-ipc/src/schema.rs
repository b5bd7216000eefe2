//! Payload schemas
//!
//! Field names follow the protocol's camelCase convention. Structs only name
//! the fields the hub or the reference add-on read; unknown fields are kept in
//! `extra` maps where the hub has to hand them back unchanged.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

fn default_context() -> Value {
    Value::String("https://webthings.io/schemas".to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// Registration
// ─────────────────────────────────────────────────────────────────────────────

/// Directories an add-on needs to initialize
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub base_dir: PathBuf,
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub media_dir: PathBuf,
    pub log_dir: PathBuf,
    pub gateway_dir: PathBuf,
    pub addons_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Units {
    pub temperature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preferences {
    pub language: String,
    pub units: Units,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            units: Units {
                temperature: "degree celsius".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub plugin_id: String,
    pub gateway_version: String,
    pub user_profile: UserProfile,
    pub preferences: Preferences,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorNotification {
    pub message: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Descriptions
// ─────────────────────────────────────────────────────────────────────────────

/// Property metadata plus its current value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enumeration: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PinDescription {
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

/// Everything an adapter announces about a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescription {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "@context", default = "default_context")]
    pub context: Value,
    #[serde(rename = "@type", default)]
    pub types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDescription>,
    #[serde(default)]
    pub actions: BTreeMap<String, Value>,
    #[serde(default)]
    pub events: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_href: Option<String>,
    #[serde(default)]
    pub pin: PinDescription,
    #[serde(default)]
    pub credentials_required: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceDescription {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            context: default_context(),
            types: Vec::new(),
            description: None,
            properties: BTreeMap::new(),
            actions: BTreeMap::new(),
            events: BTreeMap::new(),
            links: Vec::new(),
            base_href: None,
            pin: PinDescription::default(),
            credentials_required: false,
            extra: Map::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, mut property: PropertyDescription) -> Self {
        let name = name.into();
        property.name = Some(name.clone());
        self.properties.insert(name, property);
        self
    }

    pub fn with_action(mut self, name: impl Into<String>, metadata: Value) -> Self {
        self.actions.insert(name.into(), metadata);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutletDescription {
    pub id: String,
    pub name: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Adapter messages
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterAdded {
    pub adapter_id: String,
    pub name: String,
    pub package_name: String,
}

/// Payload of commands that only address an adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterRef {
    pub adapter_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPairing {
    pub adapter_id: String,
    /// Pairing window in seconds
    pub timeout: u64,
}

/// Payload addressing one device of one adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRef {
    pub adapter_id: String,
    pub device_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingPrompt {
    pub adapter_id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Device messages
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceAdded {
    pub adapter_id: String,
    pub device: DeviceDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetProperty {
    pub adapter_id: String,
    pub device_id: String,
    pub property_name: String,
    pub property_value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyChanged {
    pub adapter_id: String,
    pub device_id: String,
    pub property: PropertyDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRequest {
    pub adapter_id: String,
    pub device_id: String,
    pub action_name: String,
    pub action_id: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionStatus {
    pub adapter_id: String,
    pub device_id: String,
    pub action: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub adapter_id: String,
    pub device_id: String,
    pub event: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedState {
    pub adapter_id: String,
    pub device_id: String,
    pub connected: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetPin {
    pub adapter_id: String,
    pub device_id: String,
    pub pin: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCredentials {
    pub adapter_id: String,
    pub device_id: String,
    pub username: String,
    pub password: String,
}

/// Reply to a set-PIN or set-credentials request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdateResponse {
    pub adapter_id: String,
    pub device_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome carried by every response message
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseStatus {
    #[serde(default)]
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseStatus {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifier / Outlet messages
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierAdded {
    pub notifier_id: String,
    pub name: String,
    pub package_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifierRef {
    pub notifier_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutletAdded {
    pub notifier_id: String,
    pub outlet: OutletDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutletRemoved {
    pub notifier_id: String,
    pub outlet_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutletNotify {
    pub notifier_id: String,
    pub outlet_id: String,
    pub title: String,
    pub message: String,
    pub level: u8,
}

// ─────────────────────────────────────────────────────────────────────────────
// API handler messages
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiHandlerRef {
    pub package_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    pub package_name: String,
    pub request: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse {
    pub package_name: String,
    #[serde(default)]
    pub response: Value,
}

// ─────────────────────────────────────────────────────────────────────────────
// Mock adapter messages
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockDevice {
    pub adapter_id: String,
    pub device_id: String,
    pub device_description: DeviceDescription,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_device_description_defaults_and_extras() {
        let device: DeviceDescription = serde_json::from_value(json!({
            "id": "lamp-1",
            "title": "Lamp",
            "@type": ["Light", "OnOffSwitch"],
            "properties": {
                "on": {"type": "boolean", "value": false, "@type": "OnOffProperty"}
            },
            "pin": {"required": true, "pattern": "^\\d{4}$"},
            "vendor": "acme"
        }))
        .unwrap();

        assert_eq!(device.context, json!("https://webthings.io/schemas"));
        assert!(device.pin.required);
        assert_eq!(device.extra["vendor"], "acme");
        let on = &device.properties["on"];
        assert_eq!(on.kind.as_deref(), Some("boolean"));
        assert_eq!(on.extra["@type"], "OnOffProperty");
    }

    #[test]
    fn test_preferences_defaults() {
        let prefs = Preferences::default();
        assert_eq!(prefs.language, "en-US");
        assert_eq!(prefs.units.temperature, "degree celsius");
    }
}
