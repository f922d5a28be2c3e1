//! Roaster commands and their wire encoding.
//!
//! Every command the bridge can send is a variant of [`Command`]. The wire
//! string for each one comes from a single static table, [`COMMAND_TABLE`],
//! which also names the command in the consumer protocol.

use bytes::Bytes;

use crate::error::{Error, Result};

/// Lowest accepted value for absolute fan/heater commands.
pub const PERCENT_MIN: i64 = 0;
/// Highest accepted value for absolute fan/heater commands.
pub const PERCENT_MAX: i64 = 100;

/// Placeholder substituted with the command value in wire templates.
const VALUE_PLACEHOLDER: &str = "{n}";

/// The kind of a command, without its argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Step the fan up.
    FanUp,
    /// Step the fan down.
    FanDown,
    /// Set the fan to an absolute value.
    SetFan,
    /// Step the heater up.
    HeaterUp,
    /// Step the heater down.
    HeaterDown,
    /// Set the heater to an absolute value.
    SetHeater,
    /// Enable PID control.
    PidOn,
    /// Disable PID control.
    PidOff,
    /// Set the PID setpoint.
    SetPid,
}

/// The argument a command kind takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// No argument.
    None,
    /// An integer percentage, 0-100.
    Percent,
    /// A setpoint, truncated to an integer on the wire.
    Setpoint,
}

/// One row of the command table.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    /// The command kind.
    pub kind: CommandKind,
    /// Name used by consumers (`"setFan"`, ...).
    pub name: &'static str,
    /// Wire template; `{n}` is replaced by the value.
    pub wire: &'static str,
    /// The argument this command takes.
    pub value: ValueKind,
}

/// Static table mapping each command to its consumer name and wire string.
pub const COMMAND_TABLE: &[CommandSpec] = &[
    CommandSpec {
        kind: CommandKind::FanUp,
        name: "fanUp",
        wire: "IO3,up",
        value: ValueKind::None,
    },
    CommandSpec {
        kind: CommandKind::FanDown,
        name: "fanDown",
        wire: "IO3,down",
        value: ValueKind::None,
    },
    CommandSpec {
        kind: CommandKind::SetFan,
        name: "setFan",
        wire: "IO3,{n}",
        value: ValueKind::Percent,
    },
    CommandSpec {
        kind: CommandKind::HeaterUp,
        name: "heaterUp",
        wire: "OT1,up",
        value: ValueKind::None,
    },
    CommandSpec {
        kind: CommandKind::HeaterDown,
        name: "heaterDown",
        wire: "OT1,down",
        value: ValueKind::None,
    },
    CommandSpec {
        kind: CommandKind::SetHeater,
        name: "setHeater",
        wire: "OT1,{n}",
        value: ValueKind::Percent,
    },
    CommandSpec {
        kind: CommandKind::PidOn,
        name: "pidOn",
        wire: "PID,on",
        value: ValueKind::None,
    },
    CommandSpec {
        kind: CommandKind::PidOff,
        name: "pidOff",
        wire: "PID,off",
        value: ValueKind::None,
    },
    CommandSpec {
        kind: CommandKind::SetPid,
        name: "setPID",
        wire: "PID,SV,{n}",
        value: ValueKind::Setpoint,
    },
];

impl CommandKind {
    /// Look up a command kind by its consumer name.
    pub fn from_name(name: &str) -> Option<Self> {
        COMMAND_TABLE
            .iter()
            .find(|spec| spec.name == name)
            .map(|spec| spec.kind)
    }

    /// The table row for this kind.
    pub fn spec(&self) -> &'static CommandSpec {
        // Every variant has a row; the table is checked by tests.
        COMMAND_TABLE
            .iter()
            .find(|spec| spec.kind == *self)
            .unwrap_or(&COMMAND_TABLE[0])
    }

    /// The consumer-facing name.
    pub fn name(&self) -> &'static str {
        self.spec().name
    }

    /// The argument this kind takes.
    pub fn value_kind(&self) -> ValueKind {
        self.spec().value
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A command with its typed argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    /// Step the fan up.
    FanUp,
    /// Step the fan down.
    FanDown,
    /// Set the fan to an absolute value (0-100).
    SetFan(i64),
    /// Step the heater up.
    HeaterUp,
    /// Step the heater down.
    HeaterDown,
    /// Set the heater to an absolute value (0-100).
    SetHeater(i64),
    /// Enable PID control.
    PidOn,
    /// Disable PID control.
    PidOff,
    /// Set the PID setpoint.
    SetPid(f64),
}

impl Command {
    /// The kind of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::FanUp => CommandKind::FanUp,
            Self::FanDown => CommandKind::FanDown,
            Self::SetFan(_) => CommandKind::SetFan,
            Self::HeaterUp => CommandKind::HeaterUp,
            Self::HeaterDown => CommandKind::HeaterDown,
            Self::SetHeater(_) => CommandKind::SetHeater,
            Self::PidOn => CommandKind::PidOn,
            Self::PidOff => CommandKind::PidOff,
            Self::SetPid(_) => CommandKind::SetPid,
        }
    }

    /// The wire value substituted into the template, if any.
    ///
    /// Setpoints are truncated to an integer.
    pub fn wire_value(&self) -> Option<i64> {
        match *self {
            Self::SetFan(value) | Self::SetHeater(value) => Some(value),
            Self::SetPid(value) => Some(value.trunc() as i64),
            _ => None,
        }
    }

    /// Check the command's argument against its declared range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for fan/heater values outside 0-100
    /// and for non-finite setpoints.
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::SetFan(value) | Self::SetHeater(value) => {
                if !(PERCENT_MIN..=PERCENT_MAX).contains(&value) {
                    return Err(Error::Validation {
                        name: self.kind().name().to_string(),
                        value: value.to_string(),
                    });
                }
            }
            Self::SetPid(value) => {
                if !value.is_finite() {
                    return Err(Error::Validation {
                        name: self.kind().name().to_string(),
                        value: value.to_string(),
                    });
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// The wire string without the newline terminator.
    pub fn wire_string(&self) -> String {
        let template = self.kind().spec().wire;
        match self.wire_value() {
            Some(value) => template.replace(VALUE_PLACEHOLDER, &value.to_string()),
            None => template.to_string(),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.wire_value() {
            Some(value) => write!(f, "{}({})", self.kind(), value),
            None => write!(f, "{}", self.kind()),
        }
    }
}

/// Encode a command into the bytes written to the peripheral.
///
/// The codec does not range-check values; see [`Command::validate`].
///
/// # Example
///
/// ```
/// use matchbox_bridge::protocol::{encode, Command};
///
/// assert_eq!(&encode(&Command::SetFan(55))[..], b"IO3,55\n");
/// assert_eq!(&encode(&Command::SetPid(212.9))[..], b"PID,SV,212\n");
/// ```
pub fn encode(command: &Command) -> Bytes {
    let mut wire = command.wire_string();
    wire.push('\n');
    Bytes::from(wire.into_bytes())
}
