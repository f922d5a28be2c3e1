//! Latest machine state and its fan-out to subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::ble::ConnectionStatus;
use crate::data::MachineState;
use crate::protocol::FrameReading;

/// Capacity of each subscriber's queue.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// Identifier handed out by [`StateBroadcaster::subscribe`].
pub type SubscriberId = u64;

/// What subscribers receive on every decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StateUpdate {
    /// Snapshot after the frame was applied.
    pub state: MachineState,
    /// Connection status at publish time.
    pub status: ConnectionStatus,
}

/// Holds the current [`MachineState`] and the live subscriber set.
///
/// State is replaced whole under a lock, so readers never see a half-applied
/// frame. The subscriber set is mutated and fanned out under one lock.
#[derive(Debug)]
pub struct StateBroadcaster {
    state: RwLock<MachineState>,
    status: RwLock<ConnectionStatus>,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<StateUpdate>>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Default for StateBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StateBroadcaster {
    /// Create a broadcaster with zeroed state and no subscribers.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create a broadcaster whose subscriber queues hold `capacity` updates.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: RwLock::new(MachineState::new()),
            status: RwLock::new(ConnectionStatus::Disconnected),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    /// Add a subscriber. It receives the next update published, no history.
    pub fn subscribe(&self) -> (SubscriberId, mpsc::Receiver<StateUpdate>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers.lock().insert(id, tx);
        debug!("Subscriber {} added", id);
        (id, rx)
    }

    /// Remove a subscriber. Removing an unknown id is a no-op.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.subscribers.lock().remove(&id).is_some() {
            debug!("Subscriber {} removed", id);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Send the current snapshot to every subscriber.
    ///
    /// A subscriber whose queue is closed or full is dropped; the others
    /// still receive the update.
    pub fn publish(&self) {
        let update = StateUpdate {
            state: self.query(),
            status: self.status(),
        };

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|id, tx| match tx.try_send(update) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Subscriber {} is not keeping up, dropping it", id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Subscriber {} went away", id);
                false
            }
        });
        trace!("Published update to {} subscribers", subscribers.len());
    }

    /// Apply a decoded frame and publish the result.
    pub fn apply_frame(&self, reading: &FrameReading) {
        self.state.write().apply(reading);
        self.publish();
    }

    /// Record a setpoint issued by this bridge.
    pub fn set_pid_setpoint(&self, setpoint: f64) {
        self.state.write().pid_setpoint = setpoint;
    }

    /// Current state snapshot, whatever the connection status.
    pub fn query(&self) -> MachineState {
        *self.state.read()
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        let previous = std::mem::replace(&mut *self.status.write(), status);
        if previous != status {
            debug!("Connection status {} -> {}", previous, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> FrameReading {
        FrameReading {
            environment_temperature: 25.0,
            bean_temperature: 101.3,
            heater: 40,
            fan: 60,
        }
    }

    #[test]
    fn test_query_before_any_frame() {
        let broadcaster = StateBroadcaster::new();
        let state = broadcaster.query();
        assert!(!state.has_data());
        assert_eq!(state.fan, 0);
        assert_eq!(broadcaster.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_all_subscribers_receive_update() {
        let broadcaster = StateBroadcaster::new();
        broadcaster.set_status(ConnectionStatus::Connected);
        let (_, mut a) = broadcaster.subscribe();
        let (_, mut b) = broadcaster.subscribe();

        broadcaster.apply_frame(&reading());

        for rx in [&mut a, &mut b] {
            let update = rx.try_recv().unwrap();
            assert_eq!(update.state.bean_temperature, 101.3);
            assert_eq!(update.state.fan, 60);
            assert_eq!(update.status, ConnectionStatus::Connected);
        }
    }

    #[test]
    fn test_no_backfill_on_subscribe() {
        let broadcaster = StateBroadcaster::new();
        broadcaster.apply_frame(&reading());

        let (_, mut rx) = broadcaster.subscribe();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_subscriber_is_removed() {
        let broadcaster = StateBroadcaster::new();
        let (_, closed) = broadcaster.subscribe();
        let (_, mut open) = broadcaster.subscribe();
        drop(closed);

        broadcaster.apply_frame(&reading());

        assert!(open.try_recv().is_ok());
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[test]
    fn test_full_subscriber_is_removed() {
        let broadcaster = StateBroadcaster::with_capacity(1);
        let (_, _stalled) = broadcaster.subscribe();
        let (_, mut live) = broadcaster.subscribe();

        broadcaster.apply_frame(&reading());
        assert!(live.try_recv().is_ok());
        broadcaster.apply_frame(&reading());

        assert!(live.try_recv().is_ok());
        assert_eq!(broadcaster.subscriber_count(), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let broadcaster = StateBroadcaster::new();
        let (id, _rx) = broadcaster.subscribe();
        broadcaster.unsubscribe(id);
        broadcaster.unsubscribe(id);
        broadcaster.unsubscribe(9999);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_setpoint_survives_frames() {
        let broadcaster = StateBroadcaster::new();
        broadcaster.set_pid_setpoint(210.5);
        broadcaster.apply_frame(&reading());
        assert_eq!(broadcaster.query().pid_setpoint, 210.5);
        assert!(broadcaster.query().has_data());
    }
}
