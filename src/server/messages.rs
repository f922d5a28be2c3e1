//! JSON messages exchanged with WebSocket consumers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ble::ConnectionStatus;
use crate::broadcast::StateUpdate;
use crate::data::MachineState;

/// A consumer request: `{"id": ..., "command": "setFan", "value": 40}`.
///
/// Every field is optional at this level; the handler reports what is
/// missing.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Request {
    /// Echoed back in the response. Any JSON value.
    #[serde(default)]
    pub id: Option<Value>,
    /// Command name.
    #[serde(default)]
    pub command: Option<String>,
    /// Argument for value commands.
    #[serde(default)]
    pub value: Option<Value>,
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// The command ran.
    Success,
    /// The command was rejected or failed.
    Error,
    /// The command was replaced by an identical, newer one.
    Accepted,
}

/// `getData` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingData {
    /// Bean temperature, two decimals.
    #[serde(rename = "BT")]
    pub bean_temperature: String,
    /// Environment temperature, two decimals.
    #[serde(rename = "ET")]
    pub environment_temperature: String,
    /// Heater output.
    pub heater: i32,
    /// Fan output.
    pub fan: i32,
}

impl From<&MachineState> for ReadingData {
    fn from(state: &MachineState) -> Self {
        Self {
            bean_temperature: state.bean_temperature_display(),
            environment_temperature: state.environment_temperature_display(),
            heater: state.heater,
            fan: state.fan,
        }
    }
}

/// Reply to one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    /// The request's id; `null` if it had none, omitted when the request
    /// could not be parsed at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Outcome.
    pub status: ResponseStatus,
    /// Human-readable explanation for errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Present on `getData` only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ReadingData>,
}

impl Response {
    /// A successful reply.
    pub fn success(id: Option<Value>) -> Self {
        Self {
            id: Some(id.unwrap_or(Value::Null)),
            status: ResponseStatus::Success,
            message: None,
            data: None,
        }
    }

    /// An error reply.
    pub fn error(id: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            id: Some(id.unwrap_or(Value::Null)),
            status: ResponseStatus::Error,
            message: Some(message.into()),
            data: None,
        }
    }

    /// A reply for a command superseded by a newer identical one.
    pub fn accepted(id: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            id: Some(id.unwrap_or(Value::Null)),
            status: ResponseStatus::Accepted,
            message: Some(message.into()),
            data: None,
        }
    }

    /// A reply to text that was not valid JSON.
    pub fn invalid_json() -> Self {
        Self {
            id: None,
            status: ResponseStatus::Error,
            message: Some("Invalid JSON".to_string()),
            data: None,
        }
    }

    /// Attach a `getData` payload.
    pub fn with_data(mut self, data: ReadingData) -> Self {
        self.data = Some(data);
        self
    }
}

/// Push payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushData {
    /// Bean temperature, two decimals.
    #[serde(rename = "BT")]
    pub bean_temperature: String,
    /// Environment temperature, two decimals.
    #[serde(rename = "ET")]
    pub environment_temperature: String,
    /// Connection status.
    pub status: ConnectionStatus,
}

/// Unsolicited update sent on every decoded frame: `{"data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Push {
    /// The update.
    pub data: PushData,
}

impl From<&StateUpdate> for Push {
    fn from(update: &StateUpdate) -> Self {
        Self {
            data: PushData {
                bean_temperature: update.state.bean_temperature_display(),
                environment_temperature: update.state.environment_temperature_display(),
                status: update.status,
            },
        }
    }
}
