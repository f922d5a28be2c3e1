//! Keyed registry of in-flight commands.
//!
//! Issuing a command whose key matches one still in flight supersedes the
//! older one: its cancellation token is fired and its entry replaced under a
//! single lock, and the newer command does not start until the older one
//! has finished. The older command decides how far the cancellation reaches:
//! it gives up while still queued, but a write already on the wire runs to
//! the end.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a registered command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The command ran to completion.
    Completed(T),
    /// A newer command with the same key replaced this one.
    Superseded,
}

impl<T> Outcome<T> {
    /// Check if the command was superseded.
    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded)
    }
}

#[derive(Debug)]
struct Entry {
    id: u64,
    cancel: CancellationToken,
    /// Cancelled once the command's future has been dropped.
    finished: CancellationToken,
}

/// In-flight commands by key.
#[derive(Debug, Default)]
pub struct PendingCommands {
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
}

/// Removes the entry when its command ends, unless it was already replaced.
struct EntryGuard<'a> {
    registry: &'a PendingCommands,
    key: &'a str,
    id: u64,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        let mut entries = self.registry.entries.lock();
        if entries.get(self.key).map(|e| e.id) == Some(self.id) {
            entries.remove(self.key);
        }
    }
}

impl PendingCommands {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `command` under `key`, superseding any command in flight with the
    /// same key.
    ///
    /// `command` receives the token fired when a newer command takes the key
    /// and resolves to `None` if it gave up because of it.
    pub async fn run<F, Fut, T>(&self, key: &str, command: F) -> Outcome<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();

        let previous = {
            let mut entries = self.entries.lock();
            let previous = entries.insert(
                key.to_string(),
                Entry {
                    id,
                    cancel: cancel.clone(),
                    finished: finished.clone(),
                },
            );
            if let Some(previous) = &previous {
                previous.cancel.cancel();
            }
            previous
        };

        let _finished = finished.drop_guard();
        let _entry = EntryGuard {
            registry: self,
            key,
            id,
        };

        if let Some(previous) = previous {
            debug!("Superseding in-flight {}", key);
            tokio::select! {
                _ = previous.finished.cancelled() => {}
                _ = cancel.cancelled() => return Outcome::Superseded,
            }
        }

        if cancel.is_cancelled() {
            return Outcome::Superseded;
        }

        match command(cancel).await {
            Some(value) => Outcome::Completed(value),
            None => {
                debug!("{} superseded", key);
                Outcome::Superseded
            }
        }
    }

    /// Number of commands in flight.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if no command is in flight.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Cancel every command in flight.
    pub fn cancel_all(&self) {
        let entries: Vec<Entry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        if !entries.is_empty() {
            debug!("Cancelling {} pending commands", entries.len());
        }
        for entry in entries {
            entry.cancel.cancel();
        }
    }
}
