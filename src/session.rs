//! One live connection to the roaster.
//!
//! A [`LinkSession`] is built from a connected [`Link`] and walks through
//! [`SessionPhase::Discovering`] and [`SessionPhase::Subscribing`] to
//! [`SessionPhase::Ready`]. Once ready it decodes every notification into the
//! [`StateBroadcaster`], runs the keep-alive heartbeat and accepts commands.
//!
//! The session ends when the link's disconnect token is cancelled, whether
//! by the transport, by [`LinkSession::close`], or by a failed bring-up.
//! A terminated session is never revived; reconnecting builds a new one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::ble::transport::{ChannelId, ChannelInfo, Link, NotificationHandler};
use crate::broadcast::StateBroadcaster;
use crate::data::MachineState;
use crate::error::{Error, Result};
use crate::gate::{CommandGate, GatePolicy};
use crate::protocol::{decode, Command};

/// Keep-alive timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    /// How often the heartbeat wakes.
    pub interval: Duration,
    /// Idle time after which a keep-alive command is sent.
    pub idle_threshold: Duration,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            idle_threshold: Duration::from_secs(20),
        }
    }
}

/// Settings for every session the supervisor creates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionConfig {
    /// Command pacing.
    pub gate: GatePolicy,
    /// Keep-alive timing.
    pub heartbeat: HeartbeatPolicy,
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Listing channels.
    Discovering,
    /// Registering the notification handler.
    Subscribing,
    /// Frames flowing, commands accepted.
    Ready,
    /// Over for good.
    Terminated,
}

/// The two channels a session needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSet {
    /// Channel frames arrive on.
    pub notify: ChannelId,
    /// Channel commands are written to.
    pub write: ChannelId,
}

impl ChannelSet {
    /// Pick the first notify-capable and the first writable channel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelDiscovery`] naming the missing capability.
    pub fn select(channels: &[ChannelInfo]) -> Result<Self> {
        let notify = channels
            .iter()
            .find(|c| c.properties.notify)
            .ok_or_else(|| Error::ChannelDiscovery {
                missing: "notify".to_string(),
            })?;
        let write = channels
            .iter()
            .find(|c| c.properties.is_writable())
            .ok_or_else(|| Error::ChannelDiscovery {
                missing: "write".to_string(),
            })?;

        Ok(Self {
            notify: notify.id,
            write: write.id,
        })
    }
}

/// Build the notification handler that feeds decoded frames to `broadcaster`.
/// `frame_seen` is set on the first good frame.
fn frame_handler(
    broadcaster: Arc<StateBroadcaster>,
    frame_seen: Arc<AtomicBool>,
) -> NotificationHandler {
    Arc::new(move |bytes: &[u8]| match decode(bytes) {
        Ok(reading) => {
            trace!("Frame: {:?}", reading);
            broadcaster.apply_frame(&reading);
            frame_seen.store(true, Ordering::Release);
        }
        Err(e) => debug!("Ignoring malformed frame {:?}: {}", bytes, e),
    })
}

/// A live connection to the roaster.
pub struct LinkSession {
    link: Arc<dyn Link>,
    channels: ChannelSet,
    gate: Arc<CommandGate>,
    broadcaster: Arc<StateBroadcaster>,
    disconnected: CancellationToken,
    /// Whether this session has decoded a frame yet.
    frame_seen: Arc<AtomicBool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for LinkSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkSession")
            .field("channels", &self.channels)
            .field("phase", &self.phase())
            .finish()
    }
}

impl LinkSession {
    /// Bring up a session on a connected link.
    ///
    /// `disconnected` must be the token handed to the transport's `connect`.
    /// On failure the link is disconnected before returning.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelDiscovery`] if a required channel is missing,
    /// [`Error::Subscription`] if notifications cannot be enabled, and
    /// [`Error::NotConnected`] if the link dropped during bring-up.
    pub async fn establish(
        link: Arc<dyn Link>,
        disconnected: CancellationToken,
        broadcaster: Arc<StateBroadcaster>,
        config: SessionConfig,
    ) -> Result<Self> {
        let frame_seen = Arc::new(AtomicBool::new(false));

        match Self::bring_up(&link, &disconnected, &broadcaster, &frame_seen).await {
            Ok(channels) => {
                let gate = Arc::new(CommandGate::new(
                    link.clone(),
                    channels.write,
                    config.gate,
                    disconnected.clone(),
                ));

                let session = Self {
                    link,
                    channels,
                    gate,
                    broadcaster,
                    disconnected,
                    frame_seen,
                    heartbeat: Mutex::new(None),
                };
                session.start_heartbeat(config.heartbeat);

                info!("Session ready");
                Ok(session)
            }
            Err(e) => {
                if let Err(disconnect_error) = link.disconnect().await {
                    debug!("Disconnect after failed bring-up: {}", disconnect_error);
                }
                disconnected.cancel();
                Err(e)
            }
        }
    }

    async fn bring_up(
        link: &Arc<dyn Link>,
        disconnected: &CancellationToken,
        broadcaster: &Arc<StateBroadcaster>,
        frame_seen: &Arc<AtomicBool>,
    ) -> Result<ChannelSet> {
        debug!("Session phase: {:?}", SessionPhase::Discovering);
        let channels = ChannelSet::select(&link.list_channels().await?)?;
        debug!(
            "Using notify channel {} and write channel {}",
            channels.notify, channels.write
        );

        debug!("Session phase: {:?}", SessionPhase::Subscribing);
        let handler = frame_handler(broadcaster.clone(), frame_seen.clone());
        link.subscribe(channels.notify, handler)
            .await
            .map_err(|e| Error::Subscription {
                reason: e.to_string(),
            })?;

        if disconnected.is_cancelled() {
            return Err(Error::NotConnected);
        }

        Ok(channels)
    }

    fn start_heartbeat(&self, policy: HeartbeatPolicy) {
        let gate = self.gate.clone();
        let broadcaster = self.broadcaster.clone();
        let disconnected = self.disconnected.clone();
        let frame_seen = self.frame_seen.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + policy.interval,
                policy.interval,
            );

            loop {
                tokio::select! {
                    _ = disconnected.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if gate.idle_for() <= policy.idle_threshold {
                    continue;
                }
                // Until this link reports a fan value, the held one may be
                // stale or the zero default.
                if !frame_seen.load(Ordering::Acquire) {
                    trace!("No frame yet, skipping heartbeat");
                    continue;
                }

                let fan = i64::from(broadcaster.query().fan);
                debug!("Sending heartbeat to keep connection alive");
                match gate.send(&Command::SetFan(fan)).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Heartbeat write failed"),
                    Err(e) => warn!("Heartbeat not sent: {}", e),
                }
            }

            debug!("Heartbeat stopped");
        });

        *self.heartbeat.lock() = Some(handle);
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        if self.disconnected.is_cancelled() {
            SessionPhase::Terminated
        } else {
            SessionPhase::Ready
        }
    }

    /// The channels in use.
    pub fn channels(&self) -> ChannelSet {
        self.channels
    }

    /// Send a command through the gate.
    ///
    /// Returns `Ok(false)` if the write failed or the link dropped meanwhile.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for out-of-range values and
    /// [`Error::NotConnected`] once the session has terminated.
    pub async fn send_command(&self, command: &Command) -> Result<bool> {
        let sent = self
            .send_command_unless_superseded(command, &CancellationToken::new())
            .await?;
        Ok(sent.unwrap_or(false))
    }

    /// Like [`LinkSession::send_command`], but gives up with `Ok(None)` if
    /// `superseded` fires before the write starts.
    ///
    /// # Errors
    ///
    /// Same as [`LinkSession::send_command`].
    pub async fn send_command_unless_superseded(
        &self,
        command: &Command,
        superseded: &CancellationToken,
    ) -> Result<Option<bool>> {
        if self.phase() == SessionPhase::Terminated {
            return Err(Error::NotConnected);
        }

        command.validate()?;
        if let Command::SetPid(setpoint) = *command {
            self.broadcaster.set_pid_setpoint(setpoint.trunc());
        }

        self.gate.send_unless_superseded(command, superseded).await
    }

    /// Latest state.
    pub fn current_state(&self) -> MachineState {
        self.broadcaster.query()
    }

    /// Wait until the session terminates.
    pub async fn terminated(&self) {
        self.disconnected.cancelled().await;
    }

    /// End the session: stop the heartbeat, unsubscribe and disconnect.
    ///
    /// Every step is best-effort; failures are logged.
    pub async fn close(&self) {
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }

        if self.disconnected.is_cancelled() {
            debug!("Session already terminated");
            return;
        }

        if let Err(e) = self.link.unsubscribe(self.channels.notify).await {
            warn!("Failed to unsubscribe: {}", e);
        }
        if let Err(e) = self.link.disconnect().await {
            warn!("Failed to disconnect: {}", e);
        }
        self.disconnected.cancel();

        info!("Session closed");
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.get_mut().take() {
            handle.abort();
        }
    }
}
