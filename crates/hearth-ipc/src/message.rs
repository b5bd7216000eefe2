//! Message taxonomy and envelope

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{IpcError, IpcResult};

/// Message types for the add-on protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    // Plugin
    PluginRegisterRequest = 1,
    PluginRegisterResponse = 2,
    PluginUnloadRequest = 3,
    PluginUnloadResponse = 4,
    PluginErrorNotification = 5,

    // Adapter
    AdapterAddedNotification = 10,
    AdapterStartPairingCommand = 11,
    AdapterCancelPairingCommand = 12,
    AdapterRemoveDeviceRequest = 13,
    AdapterRemoveDeviceResponse = 14,
    AdapterCancelRemoveDeviceCommand = 15,
    AdapterUnloadRequest = 16,
    AdapterUnloadResponse = 17,
    AdapterPairingPromptNotification = 18,
    AdapterUnpairingPromptNotification = 19,

    // Device
    DeviceAddedNotification = 30,
    DeviceSetPropertyCommand = 31,
    DevicePropertyChangedNotification = 32,
    DeviceRequestActionRequest = 33,
    DeviceRequestActionResponse = 34,
    DeviceRemoveActionRequest = 35,
    DeviceRemoveActionResponse = 36,
    DeviceActionStatusNotification = 37,
    DeviceEventNotification = 38,
    DeviceConnectedStateNotification = 39,
    DeviceSetPinRequest = 40,
    DeviceSetPinResponse = 41,
    DeviceSetCredentialsRequest = 42,
    DeviceSetCredentialsResponse = 43,
    DeviceSavedNotification = 44,

    // Notifier / Outlet
    NotifierAddedNotification = 50,
    NotifierUnloadRequest = 51,
    NotifierUnloadResponse = 52,
    OutletAddedNotification = 53,
    OutletRemovedNotification = 54,
    OutletNotifyRequest = 55,
    OutletNotifyResponse = 56,

    // API handler
    ApiHandlerAddedNotification = 60,
    ApiHandlerUnloadRequest = 61,
    ApiHandlerUnloadResponse = 62,
    ApiHandlerApiRequest = 63,
    ApiHandlerApiResponse = 64,

    // Mock adapter (test surface)
    MockAdapterClearStateRequest = 70,
    MockAdapterClearStateResponse = 71,
    MockAdapterAddDeviceRequest = 72,
    MockAdapterAddDeviceResponse = 73,
    MockAdapterRemoveDeviceRequest = 74,
    MockAdapterRemoveDeviceResponse = 75,
    MockAdapterPairDeviceCommand = 76,
    MockAdapterUnpairDeviceCommand = 77,
}

impl TryFrom<u8> for MessageType {
    type Error = IpcError;

    fn try_from(value: u8) -> IpcResult<Self> {
        use MessageType::*;

        let msg_type = match value {
            1 => PluginRegisterRequest,
            2 => PluginRegisterResponse,
            3 => PluginUnloadRequest,
            4 => PluginUnloadResponse,
            5 => PluginErrorNotification,
            10 => AdapterAddedNotification,
            11 => AdapterStartPairingCommand,
            12 => AdapterCancelPairingCommand,
            13 => AdapterRemoveDeviceRequest,
            14 => AdapterRemoveDeviceResponse,
            15 => AdapterCancelRemoveDeviceCommand,
            16 => AdapterUnloadRequest,
            17 => AdapterUnloadResponse,
            18 => AdapterPairingPromptNotification,
            19 => AdapterUnpairingPromptNotification,
            30 => DeviceAddedNotification,
            31 => DeviceSetPropertyCommand,
            32 => DevicePropertyChangedNotification,
            33 => DeviceRequestActionRequest,
            34 => DeviceRequestActionResponse,
            35 => DeviceRemoveActionRequest,
            36 => DeviceRemoveActionResponse,
            37 => DeviceActionStatusNotification,
            38 => DeviceEventNotification,
            39 => DeviceConnectedStateNotification,
            40 => DeviceSetPinRequest,
            41 => DeviceSetPinResponse,
            42 => DeviceSetCredentialsRequest,
            43 => DeviceSetCredentialsResponse,
            44 => DeviceSavedNotification,
            50 => NotifierAddedNotification,
            51 => NotifierUnloadRequest,
            52 => NotifierUnloadResponse,
            53 => OutletAddedNotification,
            54 => OutletRemovedNotification,
            55 => OutletNotifyRequest,
            56 => OutletNotifyResponse,
            60 => ApiHandlerAddedNotification,
            61 => ApiHandlerUnloadRequest,
            62 => ApiHandlerUnloadResponse,
            63 => ApiHandlerApiRequest,
            64 => ApiHandlerApiResponse,
            70 => MockAdapterClearStateRequest,
            71 => MockAdapterClearStateResponse,
            72 => MockAdapterAddDeviceRequest,
            73 => MockAdapterAddDeviceResponse,
            74 => MockAdapterRemoveDeviceRequest,
            75 => MockAdapterRemoveDeviceResponse,
            76 => MockAdapterPairDeviceCommand,
            77 => MockAdapterUnpairDeviceCommand,
            _ => return Err(IpcError::UnknownMessageType(value)),
        };
        Ok(msg_type)
    }
}

/// Wire envelope wrapped around every payload
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeRef<'a> {
    plugin_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<u64>,
    data: &'a Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    plugin_id: String,
    #[serde(default)]
    message_id: Option<u64>,
    #[serde(default)]
    data: Value,
}

/// A message exchanged between the hub and an add-on
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub msg_type: MessageType,
    /// Add-on the message belongs to
    pub plugin_id: String,
    /// Correlation id, present on requests awaiting a reply and on replies
    pub message_id: Option<u64>,
    pub data: Value,
}

impl Message {
    pub fn new(msg_type: MessageType, plugin_id: impl Into<String>, data: Value) -> Self {
        Self {
            msg_type,
            plugin_id: plugin_id.into(),
            message_id: None,
            data,
        }
    }

    /// Build a message whose data is a serialized payload struct
    pub fn with_payload<T: Serialize>(
        msg_type: MessageType,
        plugin_id: impl Into<String>,
        payload: &T,
    ) -> IpcResult<Self> {
        Ok(Self::new(msg_type, plugin_id, serde_json::to_value(payload)?))
    }

    pub fn with_message_id(mut self, message_id: u64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Build a reply carrying the same correlation id as `self`
    pub fn reply(&self, msg_type: MessageType, data: Value) -> Self {
        Self {
            msg_type,
            plugin_id: self.plugin_id.clone(),
            message_id: self.message_id,
            data,
        }
    }

    /// Parse data as a payload struct
    pub fn parse_data<T: DeserializeOwned>(&self) -> IpcResult<T> {
        Ok(T::deserialize(&self.data)?)
    }

    /// Read a string field of the data object
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    /// Serialize the envelope (everything after the type byte)
    pub fn encode_envelope(&self) -> IpcResult<Vec<u8>> {
        let envelope = EnvelopeRef {
            plugin_id: &self.plugin_id,
            message_id: self.message_id,
            data: &self.data,
        };
        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Decode a frame body into a message
    pub fn decode(type_byte: u8, envelope: &[u8]) -> IpcResult<Self> {
        let msg_type = MessageType::try_from(type_byte)?;
        let envelope: Envelope = serde_json::from_slice(envelope)?;
        Ok(Self {
            msg_type,
            plugin_id: envelope.plugin_id,
            message_id: envelope.message_id,
            data: envelope.data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_codes_are_stable() {
        assert_eq!(MessageType::PluginRegisterRequest as u8, 1);
        assert_eq!(MessageType::DevicePropertyChangedNotification as u8, 32);
        assert_eq!(
            MessageType::try_from(64).unwrap(),
            MessageType::ApiHandlerApiResponse
        );
        assert!(matches!(
            MessageType::try_from(200),
            Err(IpcError::UnknownMessageType(200))
        ));
    }

    #[test]
    fn test_envelope_omits_missing_message_id() {
        let msg = Message::new(
            MessageType::AdapterCancelPairingCommand,
            "zigbee",
            json!({"adapterId": "zb-1"}),
        );
        let bytes = msg.encode_envelope().unwrap();
        let raw: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(raw["pluginId"], "zigbee");
        assert!(raw.get("messageId").is_none());
        assert_eq!(raw["data"]["adapterId"], "zb-1");
    }

    #[test]
    fn test_reply_keeps_correlation() {
        let request = Message::new(
            MessageType::DeviceRequestActionRequest,
            "zigbee",
            json!({}),
        )
        .with_message_id(7);
        let reply = request.reply(MessageType::DeviceRequestActionResponse, json!({"success": true}));
        assert_eq!(reply.message_id, Some(7));
        assert_eq!(reply.plugin_id, "zigbee");
    }

    #[test]
    fn test_decode_tolerates_missing_data() {
        let msg = Message::decode(4, br#"{"pluginId":"x"}"#).unwrap();
        assert_eq!(msg.msg_type, MessageType::PluginUnloadResponse);
        assert_eq!(msg.data, Value::Null);
    }
}
