//! Maps consumer requests onto bridge operations.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::bridge::{Bridge, CommandOutcome};
use crate::error::Error;
use crate::protocol::{Command, CommandKind, ValueKind};
use crate::server::messages::{ReadingData, Request, Response};

/// The read-only command.
pub const GET_DATA: &str = "getData";

/// Turns requests into bridge calls and bridge results into responses.
#[derive(Clone)]
pub struct CommandHandler {
    bridge: Arc<Bridge>,
}

impl CommandHandler {
    /// Create a handler for `bridge`.
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self { bridge }
    }

    /// Handle one text message from a consumer.
    pub async fn handle_text(&self, text: &str) -> Response {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!("Invalid JSON received from client: {}", e);
                return Response::invalid_json();
            }
        };

        let id = value.get("id").cloned();
        match serde_json::from_value::<Request>(value) {
            Ok(request) => self.process(request).await,
            Err(e) => {
                warn!("Malformed request: {}", e);
                Response::error(id, format!("Invalid request: {}", e))
            }
        }
    }

    /// Handle one parsed request.
    pub async fn process(&self, request: Request) -> Response {
        let Request { id, command, value } = request;

        let name = match command.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => return Response::error(id, "No command specified"),
        };

        if name == GET_DATA {
            let state = self.bridge.query();
            return Response::success(id).with_data(ReadingData::from(&state));
        }

        let Some(kind) = CommandKind::from_name(name) else {
            warn!("Unknown command received: {}", name);
            return Response::error(id, format!("Unknown command: {}", name));
        };

        let status = self.bridge.status();
        if !status.is_connected() {
            return Response::error(
                id,
                format!("Cannot execute '{}': BLE client is {}", name, status),
            );
        }

        let command = match build_command(kind, value.as_ref()) {
            Ok(command) => command,
            Err(message) => return Response::error(id, message),
        };

        debug!("Executing {}", command);
        match self.bridge.execute(command).await {
            Ok(CommandOutcome::Sent) => Response::success(id),
            Ok(CommandOutcome::Failed) => {
                Response::error(id, format!("Failed to execute {}", name))
            }
            Ok(CommandOutcome::Superseded) => Response::accepted(
                id,
                format!("Superseded by a newer {} request", command),
            ),
            Err(Error::Validation { value, .. }) => Response::error(
                id,
                format!("Invalid {} value: {} is out of range", value_label(kind), value),
            ),
            Err(Error::NotConnected) => Response::error(
                id,
                format!(
                    "Cannot execute '{}': BLE client is {}",
                    name,
                    self.bridge.status()
                ),
            ),
            Err(e) => {
                warn!("{} failed: {}", command, e);
                Response::error(id, format!("Failed to execute {}", name))
            }
        }
    }
}

/// What the value is called in error messages.
fn value_label(kind: CommandKind) -> &'static str {
    match kind {
        CommandKind::SetFan => "fan",
        CommandKind::SetHeater => "heater",
        CommandKind::SetPid => "pid",
        _ => "command",
    }
}

/// Build a typed command from its kind and the request's raw value.
///
/// The error is the message sent back to the consumer.
fn build_command(kind: CommandKind, value: Option<&Value>) -> Result<Command, String> {
    let simple = match kind {
        CommandKind::FanUp => Some(Command::FanUp),
        CommandKind::FanDown => Some(Command::FanDown),
        CommandKind::HeaterUp => Some(Command::HeaterUp),
        CommandKind::HeaterDown => Some(Command::HeaterDown),
        CommandKind::PidOn => Some(Command::PidOn),
        CommandKind::PidOff => Some(Command::PidOff),
        CommandKind::SetFan | CommandKind::SetHeater | CommandKind::SetPid => None,
    };
    if let Some(command) = simple {
        return Ok(command);
    }

    let value = match value {
        Some(Value::Null) | None => {
            return Err(format!("Command '{}' requires a value", kind.name()));
        }
        Some(value) => value,
    };
    let invalid = |reason: String| format!("Invalid {} value: {}", value_label(kind), reason);

    match kind.value_kind() {
        ValueKind::Percent => {
            let n = parse_integer(value).map_err(invalid)?;
            Ok(match kind {
                CommandKind::SetFan => Command::SetFan(n),
                _ => Command::SetHeater(n),
            })
        }
        ValueKind::Setpoint => Ok(Command::SetPid(parse_real(value).map_err(invalid)?)),
        ValueKind::None => Err(format!("Command '{}' takes no value", kind.name())),
    }
}

/// Integers: JSON numbers (fractions truncated) or numeric strings.
fn parse_integer(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            .ok_or_else(|| format!("{} is not an integer", n)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("'{}' is not an integer", s)),
        other => Err(format!("expected a number, got {}", other)),
    }
}

/// Reals: JSON numbers or numeric strings.
fn parse_real(value: &Value) -> Result<f64, String> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("{} is not a number", n)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("'{}' is not a number", s)),
        other => Err(format!("expected a number, got {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::MockTransport;
    use crate::server::messages::ResponseStatus;
    use crate::supervisor::SupervisorConfig;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn request(value: Value) -> Request {
        serde_json::from_value(value).unwrap()
    }

    async fn connected_handler() -> (CommandHandler, Arc<Bridge>, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::with_device("MATCHBOX-1"));
        let bridge = Arc::new(Bridge::new(transport.clone(), SupervisorConfig::default()));
        tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.run().await }
        });
        while !bridge.status().is_connected() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        (CommandHandler::new(bridge.clone()), bridge, transport)
    }

    fn idle_handler() -> CommandHandler {
        CommandHandler::new(Arc::new(Bridge::new(
            Arc::new(MockTransport::new()),
            SupervisorConfig::default(),
        )))
    }

    #[test]
    fn test_build_command_values() {
        assert_eq!(
            build_command(CommandKind::SetFan, Some(&json!(40))),
            Ok(Command::SetFan(40))
        );
        assert_eq!(
            build_command(CommandKind::SetHeater, Some(&json!("55"))),
            Ok(Command::SetHeater(55))
        );
        assert_eq!(
            build_command(CommandKind::SetFan, Some(&json!(40.9))),
            Ok(Command::SetFan(40))
        );
        assert_eq!(
            build_command(CommandKind::SetPid, Some(&json!("212.5"))),
            Ok(Command::SetPid(212.5))
        );
        assert_eq!(
            build_command(CommandKind::PidOn, Some(&json!(1))),
            Ok(Command::PidOn)
        );
    }

    #[test]
    fn test_build_command_errors() {
        assert_eq!(
            build_command(CommandKind::SetFan, None),
            Err("Command 'setFan' requires a value".to_string())
        );
        assert_eq!(
            build_command(CommandKind::SetPid, Some(&Value::Null)),
            Err("Command 'setPID' requires a value".to_string())
        );
        let err = build_command(CommandKind::SetHeater, Some(&json!("hot"))).unwrap_err();
        assert!(err.starts_with("Invalid heater value:"), "{}", err);
        let err = build_command(CommandKind::SetPid, Some(&json!([1]))).unwrap_err();
        assert!(err.starts_with("Invalid pid value:"), "{}", err);
    }

    #[tokio::test]
    async fn test_missing_and_unknown_commands() {
        let handler = idle_handler();

        let response = handler.process(request(json!({"id": 1}))).await;
        assert_eq!(response, Response::error(Some(json!(1)), "No command specified"));

        let response = handler.process(request(json!({"command": "explode"}))).await;
        assert_eq!(response, Response::error(None, "Unknown command: explode"));
    }

    #[tokio::test]
    async fn test_write_rejected_while_disconnected() {
        let handler = idle_handler();
        let response = handler
            .process(request(json!({"id": "x", "command": "fanUp"})))
            .await;
        assert_eq!(
            response,
            Response::error(
                Some(json!("x")),
                "Cannot execute 'fanUp': BLE client is Disconnected"
            )
        );
    }

    #[tokio::test]
    async fn test_get_data_while_disconnected() {
        let handler = idle_handler();
        let response = handler.process(request(json!({"command": "getData"}))).await;
        assert_eq!(response.status, ResponseStatus::Success);
        assert_eq!(
            serde_json::to_value(response.data.unwrap()).unwrap(),
            json!({"BT": "0.00", "ET": "0.00", "heater": 0, "fan": 0})
        );
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let handler = idle_handler();
        assert_eq!(handler.handle_text("{not json").await, Response::invalid_json());

        let response = handler.handle_text(r#"{"id": 3, "command": 12}"#).await;
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.id, Some(json!(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_fan_is_not_written() {
        let (handler, bridge, transport) = connected_handler().await;

        let response = handler
            .handle_text(r#"{"id": 9, "command": "setFan", "value": 150}"#)
            .await;

        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(
            response.message.as_deref(),
            Some("Invalid fan value: 150 is out of range")
        );
        assert!(transport.connection().unwrap().writes().is_empty());
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_reach_the_roaster() {
        let (handler, bridge, transport) = connected_handler().await;

        for (text, expected) in [
            (r#"{"command": "setFan", "value": 40}"#, "IO3,40\n"),
            (r#"{"command": "setHeater", "value": "70"}"#, "OT1,70\n"),
            (r#"{"command": "setPID", "value": 205.8}"#, "PID,SV,205\n"),
            (r#"{"command": "pidOn"}"#, "PID,on\n"),
        ] {
            let response = handler.handle_text(text).await;
            assert_eq!(response.status, ResponseStatus::Success, "{}", text);
            assert_eq!(
                transport.connection().unwrap().written_commands().last().map(String::as_str),
                Some(expected)
            );
        }
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_message() {
        let (handler, bridge, transport) = connected_handler().await;
        transport.connection().unwrap().set_fail_writes(true);

        let response = handler
            .process(request(json!({"id": 4, "command": "heaterDown"})))
            .await;
        assert_eq!(
            response,
            Response::error(Some(json!(4)), "Failed to execute heaterDown")
        );
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_request_is_accepted() {
        let (handler, bridge, transport) = connected_handler().await;

        // The first fanUp queues behind heaterUp's settle delay.
        let busy = tokio::spawn({
            let handler = handler.clone();
            async move {
                handler
                    .process(request(json!({"id": 0, "command": "heaterUp"})))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = tokio::spawn({
            let handler = handler.clone();
            async move {
                handler
                    .process(request(json!({"id": 1, "command": "fanUp"})))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = handler
            .process(request(json!({"id": 2, "command": "fanUp"})))
            .await;

        assert_eq!(busy.await.unwrap(), Response::success(Some(json!(0))));
        assert_eq!(first.await.unwrap().status, ResponseStatus::Accepted);
        assert_eq!(second, Response::success(Some(json!(2))));
        assert_eq!(
            transport.connection().unwrap().written_commands(),
            vec!["OT1,up\n".to_string(), "IO3,up\n".to_string()]
        );
        bridge.shutdown().await;
    }
}
