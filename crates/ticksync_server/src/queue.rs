//! The device queue deciding who may start a session next.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use ticksync_protocol::{QueuedDeviceSummary, SyncRequest};
use ticksync_store::{Database, QueuedDevice};

/// Ordering of queued devices; the smallest entry goes first.
pub trait QueuePolicy: Send + Sync {
    /// Compares two queue entries.
    fn compare(&self, a: &QueuedDevice, b: &QueuedDevice) -> Ordering;
}

/// Urgent devices first, then the device furthest behind, then the one
/// waiting longest.
#[derive(Debug, Clone, Copy, Default)]
pub struct UrgentThenOldest;

impl QueuePolicy for UrgentThenOldest {
    fn compare(&self, a: &QueuedDevice, b: &QueuedDevice) -> Ordering {
        b.urgent
            .cmp(&a.urgent)
            .then(a.last_synced_tick.cmp(&b.last_synced_tick))
            .then(a.last_seen_time.cmp(&b.last_seen_time))
            .then_with(|| a.device_id.cmp(&b.device_id))
    }
}

/// Where a device stands in the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuePosition {
    /// Zero-based position among live entries.
    pub index: usize,
    /// The entry directly ahead, if any.
    pub ahead: Option<QueuedDevice>,
}

impl QueuePosition {
    /// Returns true if nobody is ahead.
    pub fn is_front(&self) -> bool {
        self.index == 0
    }

    /// Summary of the entry ahead, as sent to clients.
    pub fn behind(&self) -> Option<QueuedDeviceSummary> {
        self.ahead.as_ref().map(|q| QueuedDeviceSummary {
            device_id: q.device_id.clone(),
            last_synced_tick: q.last_synced_tick,
            urgent: q.urgent,
        })
    }
}

/// The persistent device queue.
#[derive(Clone)]
pub struct SyncQueue {
    db: Database,
    policy: Arc<dyn QueuePolicy>,
    seen_window: Duration,
}

impl SyncQueue {
    /// Creates a queue with the default ordering.
    pub fn new(db: Database, seen_window: Duration) -> Self {
        Self::with_policy(db, seen_window, Arc::new(UrgentThenOldest))
    }

    /// Creates a queue with a custom ordering.
    pub fn with_policy(db: Database, seen_window: Duration, policy: Arc<dyn QueuePolicy>) -> Self {
        Self {
            db,
            policy,
            seen_window,
        }
    }

    /// Records that a device is asking to sync.
    ///
    /// Once an entry is urgent it stays urgent until removed.
    pub fn check_in(&self, request: &SyncRequest) -> QueuedDevice {
        self.db
            .upsert_queued_device(&request.device_id, |existing| QueuedDevice {
                device_id: request.device_id.clone(),
                last_seen_time: SystemTime::now(),
                last_synced_tick: request.last_synced_tick,
                urgent: request.urgent || existing.map_or(false, |q| q.urgent),
                facility_ids: request.facility_ids.clone(),
            })
    }

    /// Live entries in queue order.
    pub fn entries(&self) -> Vec<QueuedDevice> {
        let mut live: Vec<QueuedDevice> = self
            .db
            .queued_devices()
            .into_iter()
            .filter(|q| {
                q.last_seen_time
                    .elapsed()
                    .map_or(true, |age| age <= self.seen_window)
            })
            .collect();
        live.sort_by(|a, b| self.policy.compare(a, b));
        live
    }

    /// Position of `device_id`, or `None` if it is not queued.
    pub fn position(&self, device_id: &str) -> Option<QueuePosition> {
        let entries = self.entries();
        let index = entries.iter().position(|q| q.device_id == device_id)?;
        Some(QueuePosition {
            index,
            ahead: index.checked_sub(1).map(|i| entries[i].clone()),
        })
    }

    /// Removes a device from the queue.
    pub fn remove(&self, device_id: &str) -> bool {
        self.db.remove_queued_device(device_id)
    }
}
