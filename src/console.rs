//! Interactive development console.
//!
//! Runs the same bridge as the server but takes commands line by line from
//! a terminal, which is handy for poking at a roaster on the bench.

use std::io::Write;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::bridge::{Bridge, CommandOutcome};
use crate::error::{Error, Result};
use crate::protocol::Command;

const HELP: &str = "\
=== Development Mode Commands ===
getData            - Get current machine data
fanUp              - Increase fan speed
fanDown            - Decrease fan speed
setFan <value>     - Set fan speed (0-100)
heaterUp           - Increase heater power
heaterDown         - Decrease heater power
setHeater <value>  - Set heater power (0-100)
pidOn              - Turn PID control on
pidOff             - Turn PID control off
setPID <value>     - Set PID setpoint value
connect            - Drop the current link and reconnect
status             - Show connection status
help               - Show this help message
exit               - Exit dev mode
=================================";

/// A parsed console line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConsoleCommand {
    /// Print the command list.
    Help,
    /// Leave the console.
    Exit,
    /// Print connection status and readings.
    Status,
    /// Force a reconnect.
    Connect,
    /// Print the readings.
    GetData,
    /// Send a command to the roaster.
    Roaster(Command),
}

/// Parse one line. `Ok(None)` for a blank line; the error is printed as is.
pub fn parse_line(line: &str) -> std::result::Result<Option<ConsoleCommand>, String> {
    let mut parts = line.split_whitespace();
    let Some(name) = parts.next() else {
        return Ok(None);
    };
    let argument = parts.next();

    let integer = |label: &str, display: &str| -> std::result::Result<i64, String> {
        let raw = argument.ok_or_else(|| format!("Error: Missing value for {} command", display))?;
        raw.parse::<i64>()
            .map_err(|_| format!("Error: Invalid {} value '{}'", label, raw))
    };

    let command = match name.to_lowercase().as_str() {
        "help" => ConsoleCommand::Help,
        "exit" | "quit" => ConsoleCommand::Exit,
        "status" => ConsoleCommand::Status,
        "connect" => ConsoleCommand::Connect,
        "getdata" => ConsoleCommand::GetData,
        "fanup" => ConsoleCommand::Roaster(Command::FanUp),
        "fandown" => ConsoleCommand::Roaster(Command::FanDown),
        "heaterup" => ConsoleCommand::Roaster(Command::HeaterUp),
        "heaterdown" => ConsoleCommand::Roaster(Command::HeaterDown),
        "pidon" => ConsoleCommand::Roaster(Command::PidOn),
        "pidoff" => ConsoleCommand::Roaster(Command::PidOff),
        "setfan" => ConsoleCommand::Roaster(Command::SetFan(integer("fan", "setFan")?)),
        "setheater" => {
            ConsoleCommand::Roaster(Command::SetHeater(integer("heater", "setHeater")?))
        }
        "setpid" => {
            let raw =
                argument.ok_or_else(|| "Error: Missing value for setPID command".to_string())?;
            let value = raw
                .parse::<f64>()
                .map_err(|_| format!("Error: Invalid PID value '{}'", raw))?;
            ConsoleCommand::Roaster(Command::SetPid(value))
        }
        other => {
            return Err(format!(
                "Unknown command: {}\nType 'help' for a list of commands",
                other
            ))
        }
    };

    Ok(Some(command))
}

/// Line-oriented front end to a [`Bridge`].
pub struct Console {
    bridge: Arc<Bridge>,
}

impl Console {
    /// Create a console for `bridge`.
    pub fn new(bridge: Arc<Bridge>) -> Self {
        Self { bridge }
    }

    /// Read commands from `input` until `exit`, end of input or shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if reading or writing fails.
    pub async fn run<R, W>(&self, input: R, out: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let stop = self.bridge.stop_token();
        let mut lines = input.lines();

        writeln!(out, "{}", HELP)?;
        loop {
            write!(out, "> ")?;
            out.flush()?;

            let line = tokio::select! {
                _ = stop.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };

            match parse_line(&line) {
                Ok(None) => {}
                Ok(Some(ConsoleCommand::Exit)) => break,
                Ok(Some(command)) => self.execute(command, out).await?,
                Err(message) => writeln!(out, "{}", message)?,
            }
        }

        Ok(())
    }

    /// Carry out one command, writing the result to `out`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if writing fails.
    pub async fn execute<W: Write>(&self, command: ConsoleCommand, out: &mut W) -> Result<()> {
        match command {
            ConsoleCommand::Help => writeln!(out, "{}", HELP)?,
            ConsoleCommand::Exit => {}
            ConsoleCommand::Status => {
                let status = self.bridge.status();
                writeln!(out, "Status: {}", status)?;
                if status.is_connected() {
                    self.print_readings(out)?;
                } else {
                    writeln!(out, "Reconnection failures: {}", self.bridge.failures())?;
                }
            }
            ConsoleCommand::Connect => {
                if self.bridge.status().is_connected() {
                    writeln!(out, "Dropping current link to reconnect...")?;
                } else {
                    writeln!(out, "Reconnection in progress...")?;
                }
                self.bridge.reconnect().await;
            }
            ConsoleCommand::GetData => self.print_readings(out)?,
            ConsoleCommand::Roaster(command) => {
                let result = match self.bridge.execute(command).await {
                    Ok(CommandOutcome::Sent) => "Success".to_string(),
                    Ok(CommandOutcome::Failed) => "Failed".to_string(),
                    Ok(CommandOutcome::Superseded) => "Superseded".to_string(),
                    Err(Error::NotConnected) => {
                        writeln!(out, "Error: BLE device is not connected")?;
                        writeln!(out, "Use 'connect' command to attempt reconnection")?;
                        return Ok(());
                    }
                    Err(e) => format!("Error: {}", e),
                };
                writeln!(out, "{}: {}", command, result)?;
            }
        }
        Ok(())
    }

    fn print_readings<W: Write>(&self, out: &mut W) -> Result<()> {
        let state = self.bridge.query();
        writeln!(
            out,
            "Bean Temperature: {}°C",
            state.bean_temperature_display()
        )?;
        writeln!(
            out,
            "Environment Temperature: {}°C",
            state.environment_temperature_display()
        )?;
        writeln!(out, "Heater Value: {}", state.heater)?;
        writeln!(out, "Fan Value: {}", state.fan)?;
        if let Some(at) = state.updated_at {
            writeln!(out, "Last frame: {}", at.format("%H:%M:%S%.3f"))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::MockTransport;
    use crate::supervisor::SupervisorConfig;
    use std::time::Duration;

    fn output(buffer: Vec<u8>) -> String {
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_line("   "), Ok(None));
        assert_eq!(parse_line("HELP"), Ok(Some(ConsoleCommand::Help)));
        assert_eq!(
            parse_line("setfan 40"),
            Ok(Some(ConsoleCommand::Roaster(Command::SetFan(40))))
        );
        assert_eq!(
            parse_line("setPID 210.5"),
            Ok(Some(ConsoleCommand::Roaster(Command::SetPid(210.5))))
        );
        assert_eq!(
            parse_line("pidOff"),
            Ok(Some(ConsoleCommand::Roaster(Command::PidOff)))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_line("setHeater"),
            Err("Error: Missing value for setHeater command".to_string())
        );
        assert_eq!(
            parse_line("setFan fast"),
            Err("Error: Invalid fan value 'fast'".to_string())
        );
        assert!(parse_line("launch").unwrap_err().starts_with("Unknown command: launch"));
    }

    #[tokio::test]
    async fn test_command_while_disconnected() {
        let bridge = Arc::new(Bridge::new(
            Arc::new(MockTransport::new()),
            SupervisorConfig::default(),
        ));
        let console = Console::new(bridge);

        let mut out = Vec::new();
        console
            .execute(ConsoleCommand::Roaster(Command::FanUp), &mut out)
            .await
            .unwrap();
        assert!(output(out).starts_with("Error: BLE device is not connected"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_script() {
        let transport = Arc::new(MockTransport::with_device("MATCHBOX-1"));
        let bridge = Arc::new(Bridge::new(transport.clone(), SupervisorConfig::default()));
        tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.run().await }
        });
        while !bridge.status().is_connected() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        transport.connection().unwrap().notify(b"[25.0,101.3,40,60]");

        let console = Console::new(bridge.clone());
        let script: &[u8] = b"status\nsetFan 55\nsetFan 500\nbogus\nexit\nfanUp\n";
        let mut out = Vec::new();
        console.run(script, &mut out).await.unwrap();
        let out = output(out);

        assert!(out.contains("Status: Connected"));
        assert!(out.contains("Bean Temperature: 101.30°C"));
        assert!(out.contains("setFan(55): Success"));
        assert!(out.contains("setFan(500): Error: Invalid parameter"));
        assert!(out.contains("Unknown command: bogus"));
        // Nothing after exit runs.
        assert_eq!(
            transport.connection().unwrap().written_commands(),
            vec!["IO3,55\n".to_string()]
        );
        bridge.shutdown().await;
    }
}
