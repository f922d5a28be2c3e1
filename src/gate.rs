//! Rate-limited, single-writer access to the write channel.
//!
//! Every command reaches the roaster through [`CommandGate::send`]. The gate
//! holds one lock for the whole write cycle, so commands never interleave on
//! the wire, and it paces writes:
//!
//! 1. wait until `min_interval` has passed since the last successful write;
//! 2. write with acknowledgement;
//! 3. on success, keep the lock for `settle_delay` so the roaster can act on
//!    the command; on failure, keep it for `failure_penalty` instead.
//!
//! The gate never retries. Retry policy belongs to the caller.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::ble::transport::{ChannelId, Link};
use crate::error::{Error, Result};
use crate::protocol::{encode, Command};

/// Pacing applied by the [`CommandGate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatePolicy {
    /// Minimum time between the end of one successful write and the next.
    pub min_interval: Duration,
    /// Time the lock stays held after a successful write.
    pub settle_delay: Duration,
    /// Time the lock stays held after a failed write.
    pub failure_penalty: Duration,
}

impl Default for GatePolicy {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            settle_delay: Duration::from_secs(1),
            failure_penalty: Duration::from_secs(2),
        }
    }
}

/// Serializes and paces writes to one link.
pub struct CommandGate {
    link: Arc<dyn Link>,
    channel: ChannelId,
    policy: GatePolicy,
    /// Held for the whole write cycle; the value is the last successful write.
    lock: Mutex<Option<Instant>>,
    /// Last successful write, or creation time; read by the heartbeat.
    last_activity: RwLock<Instant>,
    /// Cancelled when the link drops.
    disconnected: CancellationToken,
}

impl CommandGate {
    /// Create a gate writing to `channel` on `link`.
    pub fn new(
        link: Arc<dyn Link>,
        channel: ChannelId,
        policy: GatePolicy,
        disconnected: CancellationToken,
    ) -> Self {
        Self {
            link,
            channel,
            policy,
            lock: Mutex::new(None),
            last_activity: RwLock::new(Instant::now()),
            disconnected,
        }
    }

    /// The pacing policy.
    pub fn policy(&self) -> GatePolicy {
        self.policy
    }

    /// Time since the last successful write (or since the gate was created).
    pub fn idle_for(&self) -> Duration {
        self.last_activity.read().elapsed()
    }

    /// Send a command.
    ///
    /// Returns `Ok(true)` when the write succeeded and `Ok(false)` when it
    /// failed or the link dropped while waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for out-of-range values, before any I/O,
    /// and [`Error::NotConnected`] if the link is already gone.
    pub async fn send(&self, command: &Command) -> Result<bool> {
        let sent = self
            .send_unless_superseded(command, &CancellationToken::new())
            .await?;
        Ok(sent.unwrap_or(false))
    }

    /// Send a command unless `superseded` fires before the write begins.
    ///
    /// `superseded` is only observed while waiting for the lock and the rate
    /// limit. Once the write has started, it runs to completion together with
    /// its settle delay or failure penalty, so the lock is never released
    /// early. Returns `Ok(None)` when the command was given up unsent.
    ///
    /// # Errors
    ///
    /// Same as [`CommandGate::send`].
    pub async fn send_unless_superseded(
        &self,
        command: &Command,
        superseded: &CancellationToken,
    ) -> Result<Option<bool>> {
        command.validate()?;

        if self.disconnected.is_cancelled() {
            return Err(Error::NotConnected);
        }

        let payload = encode(command);

        let mut last_write = tokio::select! {
            guard = self.lock.lock() => guard,
            _ = superseded.cancelled() => {
                debug!("{} superseded while queued", command);
                return Ok(None);
            }
        };

        if let Some(last) = *last_write {
            let since = last.elapsed();
            if since < self.policy.min_interval {
                let wait = self.policy.min_interval - since;
                trace!("Rate limiting {} for {:?}", command, wait);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = superseded.cancelled() => {
                        debug!("{} superseded while rate limited", command);
                        return Ok(None);
                    }
                    _ = self.disconnected.cancelled() => {
                        debug!("Link dropped before {} was sent", command);
                        return Ok(Some(false));
                    }
                }
            }
        }

        if superseded.is_cancelled() {
            return Ok(None);
        }

        let result = tokio::select! {
            result = self.link.write(self.channel, &payload, true) => result,
            _ = self.disconnected.cancelled() => {
                debug!("Link dropped while sending {}", command);
                return Ok(Some(false));
            }
        };

        match result {
            Ok(()) => {
                let now = Instant::now();
                *last_write = Some(now);
                *self.last_activity.write() = now;
                debug!("Sent {}", command);

                tokio::select! {
                    _ = tokio::time::sleep(self.policy.settle_delay) => {}
                    _ = self.disconnected.cancelled() => {}
                }
                Ok(Some(true))
            }
            Err(e) => {
                error!("Error sending {}: {}", command, e);

                tokio::select! {
                    _ = tokio::time::sleep(self.policy.failure_penalty) => {}
                    _ = self.disconnected.cancelled() => {}
                }
                Ok(Some(false))
            }
        }
    }
}
