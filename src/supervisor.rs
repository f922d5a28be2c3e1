//! Discovery, connection and reconnection with backoff.
//!
//! The [`ReconnectionSupervisor`] runs for the life of the process. Each
//! round it scans for a peripheral whose name starts with the configured
//! prefix, connects, brings up a [`LinkSession`] and waits for it to end.
//! Failures are counted and spaced out with exponential backoff; after too
//! many in a row it rests for a long cool-down and starts over.
//!
//! It is the only writer of [`ConnectionStatus`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ble::transport::Transport;
use crate::ble::ConnectionStatus;
use crate::broadcast::StateBroadcaster;
use crate::error::{Error, Result};
use crate::session::{LinkSession, SessionConfig};

/// Default name prefix of the roaster.
pub const DEFAULT_NAME_PREFIX: &str = "MATCHBOX";

/// The slot holding the active session, shared with the bridge.
pub type SessionSlot = Arc<RwLock<Option<Arc<LinkSession>>>>;

/// Reconnection timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay with no failures.
    pub base: Duration,
    /// Growth factor per failure.
    pub multiplier: f64,
    /// Failures beyond this no longer grow the delay.
    pub exponent_cap: u32,
    /// Upper bound on any backoff delay.
    pub cap: Duration,
    /// Consecutive failures that trigger the cool-down.
    pub max_failures: u32,
    /// Rest after `max_failures` consecutive failures.
    pub cooldown: Duration,
    /// Wait before rescanning when no matching peripheral was found.
    pub not_found_delay: Duration,
    /// Duration of each scan.
    pub scan_timeout: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            multiplier: 1.5,
            exponent_cap: 10,
            cap: Duration::from_secs(60),
            max_failures: 5,
            cooldown: Duration::from_secs(60),
            not_found_delay: Duration::from_secs(10),
            scan_timeout: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    ///
    /// `min(cap, base * multiplier^min(failures, exponent_cap))`
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.min(self.exponent_cap) as i32;
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.cap.as_secs_f64() {
            self.cap
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Settings for the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Advertised name prefix to connect to.
    pub name_prefix: String,
    /// Reconnection timing.
    pub backoff: BackoffPolicy,
    /// Settings for each session.
    pub session: SessionConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            backoff: BackoffPolicy::default(),
            session: SessionConfig::default(),
        }
    }
}

/// How one round of the loop ended.
enum Round {
    /// No peripheral with the prefix was seen.
    NotFound,
    /// Scan, connect or bring-up failed.
    Failed(Error),
    /// A session ran and then dropped.
    Disconnected,
    /// The stop token fired.
    Stopped,
}

/// Keeps the bridge connected to the roaster.
pub struct ReconnectionSupervisor {
    transport: Arc<dyn Transport>,
    broadcaster: Arc<StateBroadcaster>,
    active: SessionSlot,
    config: SupervisorConfig,
    failures: AtomicU32,
}

impl ReconnectionSupervisor {
    /// Create a supervisor publishing status to `broadcaster` and the active
    /// session into `active`.
    pub fn new(
        transport: Arc<dyn Transport>,
        broadcaster: Arc<StateBroadcaster>,
        active: SessionSlot,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            transport,
            broadcaster,
            active,
            config,
            failures: AtomicU32::new(0),
        }
    }

    /// Consecutive failures so far.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// The active session, if any.
    pub fn active_session(&self) -> Option<Arc<LinkSession>> {
        self.active.read().clone()
    }

    /// Run until `stop` is cancelled.
    pub async fn run(&self, stop: CancellationToken) {
        info!(
            "Looking for a device starting with '{}'",
            self.config.name_prefix
        );
        let backoff = self.config.backoff;

        loop {
            if stop.is_cancelled() {
                break;
            }

            if self.failures() >= backoff.max_failures {
                warn!(
                    "Maximum reconnection attempts ({}) reached. Waiting {:?} before retrying",
                    backoff.max_failures, backoff.cooldown
                );
                if !sleep_or_stop(backoff.cooldown, &stop).await {
                    break;
                }
                self.failures.store(0, Ordering::SeqCst);
            }

            match self.round(&stop).await {
                Round::NotFound => {
                    warn!(
                        "No device starting with '{}' found. Retrying in {:?}",
                        self.config.name_prefix, backoff.not_found_delay
                    );
                    if !sleep_or_stop(backoff.not_found_delay, &stop).await {
                        break;
                    }
                    continue;
                }
                Round::Failed(e) => {
                    error!("Connection attempt failed: {}", e);
                    self.failures.fetch_add(1, Ordering::SeqCst);
                }
                Round::Disconnected => {
                    self.failures.fetch_add(1, Ordering::SeqCst);
                }
                Round::Stopped => break,
            }

            let delay = backoff.delay_for(self.failures());
            debug!(
                "Reconnecting in {:?} after {} failures",
                delay,
                self.failures()
            );
            if !sleep_or_stop(delay, &stop).await {
                break;
            }
        }

        info!("Supervisor stopped");
    }

    async fn round(&self, stop: &CancellationToken) -> Round {
        let scanned = tokio::select! {
            result = self.transport.scan(self.config.backoff.scan_timeout) => result,
            _ = stop.cancelled() => return Round::Stopped,
        };
        let found = match scanned {
            Ok(found) => found,
            Err(e) => return Round::Failed(e),
        };

        let Some(device) = found
            .into_iter()
            .find(|d| d.matches_prefix(&self.config.name_prefix))
        else {
            return Round::NotFound;
        };
        debug!(
            "Found matching device: {:?} ({})",
            device.name, device.address
        );

        self.broadcaster.set_status(ConnectionStatus::Connecting);

        let session = match self.bring_up(&device, stop).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                self.broadcaster.set_status(ConnectionStatus::Disconnected);
                return Round::Stopped;
            }
            Err(e) => {
                self.broadcaster.set_status(ConnectionStatus::Disconnected);
                return Round::Failed(e);
            }
        };

        *self.active.write() = Some(session.clone());
        self.failures.store(0, Ordering::SeqCst);
        self.broadcaster.set_status(ConnectionStatus::Connected);
        info!("Connected to {:?} ({})", device.name, device.address);

        let stopped = tokio::select! {
            _ = session.terminated() => false,
            _ = stop.cancelled() => true,
        };

        *self.active.write() = None;
        self.broadcaster.set_status(ConnectionStatus::Disconnected);
        session.close().await;

        if stopped {
            Round::Stopped
        } else {
            warn!("Disconnected from {:?}", device.name);
            Round::Disconnected
        }
    }

    /// Connect and establish a session. `Ok(None)` means stop fired.
    async fn bring_up(
        &self,
        device: &crate::ble::PeripheralHandle,
        stop: &CancellationToken,
    ) -> Result<Option<Arc<LinkSession>>> {
        let disconnected = CancellationToken::new();

        let link = tokio::select! {
            result = self.transport.connect(device, disconnected.clone()) => result?,
            _ = stop.cancelled() => return Ok(None),
        };

        let session = LinkSession::establish(
            link,
            disconnected,
            self.broadcaster.clone(),
            self.config.session,
        )
        .await?;

        Ok(Some(Arc::new(session)))
    }
}

/// Sleep for `duration`; returns `false` if `stop` fired first.
async fn sleep_or_stop(duration: Duration, stop: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = stop.cancelled() => false,
    }
}
