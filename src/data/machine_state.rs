//! Roaster state data structures.
//!
//! Contains the latest known state of the roaster as assembled from
//! decoded frames and locally issued commands.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::protocol::FrameReading;

/// The latest known state of the roaster.
///
/// Values start zeroed. Whether they are live is told by the
/// [`ConnectionStatus`](crate::ble::ConnectionStatus), not by the values.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct MachineState {
    /// Bean temperature.
    pub bean_temperature: f64,
    /// Environment (exhaust) temperature.
    pub environment_temperature: f64,
    /// Heater output, 0-100.
    pub heater: i32,
    /// Fan output, 0-100.
    pub fan: i32,
    /// Last PID setpoint issued by the bridge.
    ///
    /// The roaster never reports it back, so this is what was sent,
    /// not what the device confirmed.
    pub pid_setpoint: f64,
    /// When the last frame was applied.
    pub updated_at: Option<DateTime<Utc>>,
}

impl MachineState {
    /// Create a zeroed state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a decoded frame.
    pub fn apply(&mut self, reading: &FrameReading) {
        self.environment_temperature = reading.environment_temperature;
        self.bean_temperature = reading.bean_temperature;
        self.heater = reading.heater;
        self.fan = reading.fan;
        self.updated_at = Some(Utc::now());
    }

    /// Whether any frame has been applied yet.
    pub fn has_data(&self) -> bool {
        self.updated_at.is_some()
    }

    /// Bean temperature formatted the way consumers expect it.
    pub fn bean_temperature_display(&self) -> String {
        format!("{:.2}", self.bean_temperature)
    }

    /// Environment temperature formatted the way consumers expect it.
    pub fn environment_temperature_display(&self) -> String {
        format!("{:.2}", self.environment_temperature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_zeroed() {
        let state = MachineState::new();
        assert_eq!(state.bean_temperature, 0.0);
        assert_eq!(state.fan, 0);
        assert!(!state.has_data());
    }

    #[test]
    fn test_apply_keeps_setpoint() {
        let mut state = MachineState {
            pid_setpoint: 200.0,
            ..Default::default()
        };
        state.apply(&FrameReading {
            environment_temperature: 25.0,
            bean_temperature: 101.3,
            heater: 40,
            fan: 60,
        });

        assert_eq!(state.environment_temperature, 25.0);
        assert_eq!(state.bean_temperature, 101.3);
        assert_eq!(state.heater, 40);
        assert_eq!(state.fan, 60);
        assert_eq!(state.pid_setpoint, 200.0);
        assert!(state.has_data());
    }

    #[test]
    fn test_display_formatting() {
        let state = MachineState {
            bean_temperature: 101.3,
            environment_temperature: 25.0,
            ..Default::default()
        };
        assert_eq!(state.bean_temperature_display(), "101.30");
        assert_eq!(state.environment_temperature_display(), "25.00");
    }
}
