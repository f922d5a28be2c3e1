//! The bridge: one owner for everything the consumers talk to.
//!
//! [`Bridge`] holds the [`StateBroadcaster`], the active-session slot, the
//! pending-command registry and the stop token, and runs the
//! [`ReconnectionSupervisor`]. The WebSocket server and the dev console go
//! through it for every query and command.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use matchbox_bridge::{BleScanner, Bridge, Command, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> matchbox_bridge::Result<()> {
//!     let scanner = BleScanner::new().await?;
//!     let bridge = Arc::new(Bridge::new(Arc::new(scanner), SupervisorConfig::default()));
//!
//!     tokio::spawn({
//!         let bridge = bridge.clone();
//!         async move { bridge.run().await }
//!     });
//!
//!     let (_, mut updates) = bridge.subscribe();
//!     while let Some(update) = updates.recv().await {
//!         println!("BT {}", update.state.bean_temperature_display());
//!         if update.state.bean_temperature > 200.0 {
//!             bridge.execute(Command::SetHeater(40)).await?;
//!         }
//!     }
//!
//!     bridge.shutdown().await;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::ble::transport::Transport;
use crate::ble::ConnectionStatus;
use crate::broadcast::{StateBroadcaster, StateUpdate, SubscriberId};
use crate::data::MachineState;
use crate::error::{Error, Result};
use crate::pending::{Outcome, PendingCommands};
use crate::protocol::Command;
use crate::supervisor::{ReconnectionSupervisor, SessionSlot, SupervisorConfig};

/// Result of a command that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Written and acknowledged.
    Sent,
    /// The write failed or the link dropped.
    Failed,
    /// Replaced by an identical command issued later, before being written.
    Superseded,
}

/// Owns the bridge's shared state and its supervisor.
pub struct Bridge {
    broadcaster: Arc<StateBroadcaster>,
    active: SessionSlot,
    pending: PendingCommands,
    supervisor: ReconnectionSupervisor,
    stop: CancellationToken,
}

impl Bridge {
    /// Create a bridge over `transport`. Nothing happens until [`Bridge::run`].
    pub fn new(transport: Arc<dyn Transport>, config: SupervisorConfig) -> Self {
        let broadcaster = Arc::new(StateBroadcaster::new());
        let active = SessionSlot::default();
        let supervisor =
            ReconnectionSupervisor::new(transport, broadcaster.clone(), active.clone(), config);

        Self {
            broadcaster,
            active,
            pending: PendingCommands::new(),
            supervisor,
            stop: CancellationToken::new(),
        }
    }

    /// Keep the roaster connected until [`Bridge::shutdown`].
    pub async fn run(&self) {
        self.supervisor.run(self.stop.clone()).await;
    }

    /// Send a command to the roaster.
    ///
    /// A command identical to one still in flight (same name and value)
    /// supersedes it. If the earlier one had not reached the wire yet, its
    /// caller gets [`CommandOutcome::Superseded`]; otherwise it finishes
    /// normally and the newer one follows after the settle delay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless the status is `Connected`, and
    /// [`Error::Validation`] for out-of-range values. Neither touches the link.
    pub async fn execute(&self, command: Command) -> Result<CommandOutcome> {
        if !self.status().is_connected() {
            return Err(Error::NotConnected);
        }
        command.validate()?;

        let key = command.to_string();
        let outcome = self
            .pending
            .run(&key, |superseded| async move {
                let session = self.active.read().clone();
                let Some(session) = session else {
                    return Some(Err(Error::NotConnected));
                };
                session
                    .send_command_unless_superseded(&command, &superseded)
                    .await
                    .transpose()
            })
            .await;

        match outcome {
            Outcome::Completed(Ok(true)) => Ok(CommandOutcome::Sent),
            Outcome::Completed(Ok(false)) => Ok(CommandOutcome::Failed),
            Outcome::Completed(Err(e)) => Err(e),
            Outcome::Superseded => Ok(CommandOutcome::Superseded),
        }
    }

    /// Current state snapshot.
    pub fn query(&self) -> MachineState {
        self.broadcaster.query()
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.broadcaster.status()
    }

    /// Consecutive reconnection failures.
    pub fn failures(&self) -> u32 {
        self.supervisor.failures()
    }

    /// Receive an update for every decoded frame.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<StateUpdate>) {
        self.broadcaster.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }

    /// Stop receiving updates.
    pub fn unsubscribe(&self, id: SubscriberId) {
        self.broadcaster.unsubscribe(id);
    }

    /// Drop the current session so the supervisor connects afresh.
    pub async fn reconnect(&self) {
        let session = self.active.read().clone();
        match session {
            Some(session) => {
                info!("Reconnect requested, closing current session");
                session.close().await;
            }
            None => debug!("Reconnect requested with no active session"),
        }
    }

    /// A token cancelled once shutdown starts.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Stop the supervisor, cancel pending commands and close the session.
    pub async fn shutdown(&self) {
        info!("Shutting down bridge");
        self.stop.cancel();
        self.pending.cancel_all();

        let session = self.active.read().clone();
        if let Some(session) = session {
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::mock::MockTransport;
    use crate::gate::GatePolicy;
    use std::time::Duration;

    async fn connected(transport: MockTransport) -> (Arc<Bridge>, Arc<MockTransport>) {
        let transport = Arc::new(transport);
        let bridge = Arc::new(Bridge::new(transport.clone(), SupervisorConfig::default()));
        tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.run().await }
        });
        while !bridge.status().is_connected() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        (bridge, transport)
    }

    #[tokio::test]
    async fn test_execute_requires_connection() {
        let bridge = Bridge::new(Arc::new(MockTransport::new()), SupervisorConfig::default());
        assert!(matches!(
            bridge.execute(Command::FanUp).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_sends() {
        let (bridge, transport) = connected(MockTransport::with_device("MATCHBOX-1")).await;

        assert_eq!(
            bridge.execute(Command::HeaterUp).await.unwrap(),
            CommandOutcome::Sent
        );
        assert_eq!(
            transport.connection().unwrap().written_commands(),
            vec!["OT1,up\n".to_string()]
        );
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_never_written() {
        let (bridge, transport) = connected(MockTransport::with_device("MATCHBOX-1")).await;

        assert!(matches!(
            bridge.execute(Command::SetFan(150)).await,
            Err(Error::Validation { .. })
        ));
        assert!(transport.connection().unwrap().writes().is_empty());
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_commands_collapse() {
        let (bridge, transport) = connected(MockTransport::with_device("MATCHBOX-1")).await;

        // Keep the gate busy so the first setFan is still queued.
        let busy = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.execute(Command::HeaterUp).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.execute(Command::SetFan(40)).await }
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        let second = bridge.execute(Command::SetFan(40)).await.unwrap();

        assert_eq!(busy.await.unwrap().unwrap(), CommandOutcome::Sent);
        assert_eq!(first.await.unwrap().unwrap(), CommandOutcome::Superseded);
        assert_eq!(second, CommandOutcome::Sent);
        assert_eq!(
            transport.connection().unwrap().written_commands(),
            vec!["OT1,up\n".to_string(), "IO3,40\n".to_string()]
        );
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseding_a_written_command_keeps_settle_delay() {
        let (bridge, transport) = connected(MockTransport::with_device("MATCHBOX-1")).await;

        let first = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.execute(Command::SetFan(40)).await }
        });
        tokio::time::sleep(Duration::from_millis(300)).await;
        let second = bridge.execute(Command::SetFan(40)).await.unwrap();

        // The first write went out before the second arrived.
        assert_eq!(first.await.unwrap().unwrap(), CommandOutcome::Sent);
        assert_eq!(second, CommandOutcome::Sent);

        let writes = transport.connection().unwrap().writes();
        assert_eq!(writes.len(), 2);
        assert!(writes[1].at - writes[0].at >= GatePolicy::default().settle_delay);
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_commands_both_sent() {
        let (bridge, transport) = connected(MockTransport::with_device("MATCHBOX-1")).await;

        let (a, b) = tokio::join!(
            bridge.execute(Command::SetFan(40)),
            bridge.execute(Command::SetFan(50))
        );
        assert_eq!(a.unwrap(), CommandOutcome::Sent);
        assert_eq!(b.unwrap(), CommandOutcome::Sent);

        let writes = transport.connection().unwrap().writes();
        assert_eq!(writes.len(), 2);
        assert!(writes[1].at - writes[0].at >= Duration::from_secs(1));
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_reported() {
        let (bridge, transport) = connected(MockTransport::with_device("MATCHBOX-1")).await;
        transport.connection().unwrap().set_fail_writes(true);

        assert_eq!(
            bridge.execute(Command::PidOff).await.unwrap(),
            CommandOutcome::Failed
        );
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_starts_new_session() {
        let (bridge, transport) = connected(MockTransport::with_device("MATCHBOX-1")).await;
        let first = transport.connection().unwrap();

        bridge.reconnect().await;
        assert!(first.was_disconnected());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(bridge.status().is_connected());
        assert_eq!(transport.connect_times().len(), 2);
        bridge.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_disconnects() {
        let (bridge, transport) = connected(MockTransport::with_device("MATCHBOX-1")).await;

        bridge.shutdown().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let connection = transport.connection().unwrap();
        assert!(connection.was_unsubscribed());
        assert!(connection.was_disconnected());
        assert!(connection.is_dropped());
        assert_eq!(bridge.status(), ConnectionStatus::Disconnected);
        assert!(bridge.stop_token().is_cancelled());
    }
}
