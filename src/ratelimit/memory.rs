//! In-process window store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::clock::Clock;
use super::store::WindowStore;
use super::window::{whole_millis, Window, WindowRecord, WindowState};
use crate::error::Result;

/// Default extra idle time before a record may be swept.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// A key's record plus its reclamation bookkeeping.
#[derive(Debug)]
struct Slot {
    record: WindowRecord,
    /// Idle deadline after which the sweeper may remove the slot.
    expires_at_ms: u64,
    /// Set by the sweeper once the slot has left the map.
    retired: bool,
}

/// Window store for a single process.
///
/// Each key owns its own mutex, so concurrent attempts for one key serialize
/// while other keys proceed. The map lock is only held long enough to look up
/// or insert a slot.
pub struct InMemoryStore {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    grace_ms: u64,
}

impl InMemoryStore {
    /// Create an empty store with the default grace period.
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    /// Create an empty store with a custom grace period.
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            slots: DashMap::new(),
            grace_ms: whole_millis(grace),
        }
    }

    fn slot(&self, key: &str, window: &Window) -> Arc<Mutex<Slot>> {
        if let Some(slot) = self.slots.get(key) {
            return slot.value().clone();
        }

        self.slots
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key = %key, algorithm = %window.algorithm, "Creating window record");
                Arc::new(Mutex::new(Slot {
                    record: WindowRecord::new(window),
                    expires_at_ms: 0,
                    retired: false,
                }))
            })
            .value()
            .clone()
    }

    /// Remove every record idle past its deadline. Returns how many were removed.
    ///
    /// Slots that are locked at the time of the sweep are in use and are kept.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let mut removed = 0;
        self.slots.retain(|_, slot| match slot.try_lock() {
            Some(mut slot) if slot.expires_at_ms <= now_ms => {
                slot.retired = true;
                removed += 1;
                false
            }
            _ => true,
        });
        removed
    }

    /// Run `sweep` every `interval` on the Tokio runtime.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.sweep(clock.now_millis());
                if removed > 0 {
                    debug!(removed, remaining = self.len(), "Swept idle window records");
                }
            }
        })
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Drop all records.
    pub fn clear(&self) {
        self.slots.clear();
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowStore for InMemoryStore {
    async fn record(&self, key: &str, now_ms: u64, window: &Window) -> Result<WindowState> {
        loop {
            let slot = self.slot(key, window);
            let mut slot = slot.lock();
            if slot.retired {
                // Swept between lookup and lock; the map now holds a fresh slot.
                continue;
            }

            let state = slot.record.record(now_ms, window);
            slot.expires_at_ms = now_ms
                .saturating_add(window.duration_ms)
                .saturating_add(self.grace_ms);

            trace!(key = %key, count = state.count, "Recorded attempt");
            return Ok(state);
        }
    }

    async fn peek(&self, key: &str, now_ms: u64, window: &Window) -> Result<WindowState> {
        let slot = self.slots.get(key).map(|slot| slot.value().clone());
        Ok(match slot {
            Some(slot) => slot.lock().record.peek(now_ms, window),
            None => WindowState {
                count: 0,
                window_start_ms: now_ms,
            },
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
