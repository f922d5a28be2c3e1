//! Connection status of the peripheral link.

use serde::Serialize;

/// Connection status of the bridge's link to the roaster.
///
/// Only the [`ReconnectionSupervisor`](crate::supervisor::ReconnectionSupervisor)
/// moves the status out of `Disconnected`; any disconnect sends it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ConnectionStatus {
    /// Not connected to the roaster.
    #[default]
    Disconnected,
    /// Connecting to the roaster and bringing up the session.
    Connecting,
    /// Session ready; frames are flowing and commands are accepted.
    Connected,
}

impl ConnectionStatus {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if in a transitional state.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, Self::Connecting)
    }

    /// The status as consumers see it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
