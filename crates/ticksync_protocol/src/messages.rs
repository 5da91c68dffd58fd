//! Request and response messages for each protocol step.

use crate::change::{SyncChange, SyncRecord};
use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// Admission request sent by a device that wants to sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Stable identifier of the requesting device.
    pub device_id: String,
    /// Highest tick the device has already pulled.
    #[serde(default)]
    pub last_synced_tick: i64,
    /// Whether the device asks to jump the queue.
    #[serde(default)]
    pub urgent: bool,
    /// Facilities the device serves.
    #[serde(default)]
    pub facility_ids: Vec<String>,
    /// Whether the device is a mobile client.
    #[serde(default)]
    pub is_mobile: bool,
}

impl SyncRequest {
    /// Creates a non-urgent request for a facility server.
    pub fn new(device_id: impl Into<String>, last_synced_tick: i64, facility_ids: Vec<String>) -> Self {
        Self {
            device_id: device_id.into(),
            last_synced_tick,
            urgent: false,
            facility_ids,
            is_mobile: false,
        }
    }

    /// Marks the request as urgent.
    pub fn urgent(mut self) -> Self {
        self.urgent = true;
        self
    }

    /// Marks the request as coming from a mobile client.
    pub fn mobile(mut self) -> Self {
        self.is_mobile = true;
        self
    }

    /// Validates required fields.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.device_id.trim().is_empty() {
            return Err(ProtocolError::InvalidMessage(
                "device id is required".into(),
            ));
        }
        Ok(())
    }
}

/// Summary of a queued device, returned to devices waiting behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedDeviceSummary {
    /// Device at the head of the queue.
    pub device_id: String,
    /// Its last synced tick.
    pub last_synced_tick: i64,
    /// Whether it is urgent.
    pub urgent: bool,
}

/// Outcome of an admission request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SyncRequestStatus {
    /// Another device is ahead; retry later.
    WaitingInQueue {
        /// The device ahead of the caller.
        behind: Option<QueuedDeviceSummary>,
    },
    /// The caller is at the front but the center is at capacity.
    ActiveSync,
    /// A session was started for the caller.
    #[serde(rename_all = "camelCase")]
    GoodToGo {
        /// Identifier of the new session.
        session_id: String,
        /// Tick the session started at, when preparation was awaited.
        #[serde(skip_serializing_if = "Option::is_none")]
        tick: Option<i64>,
    },
}

impl SyncRequestStatus {
    /// Returns the session id if the caller was admitted.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            SyncRequestStatus::GoodToGo { session_id, .. } => Some(session_id),
            _ => None,
        }
    }

    /// Returns true if the caller should retry later.
    pub fn should_retry(&self) -> bool {
        !matches!(self, SyncRequestStatus::GoodToGo { .. })
    }
}

/// Parameters to initiate the pull phase of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Tick to pull changes after; `-1` pulls full history.
    pub since: Option<i64>,
    /// Facilities to pull for.
    #[serde(default)]
    pub facility_ids: Vec<String>,
    /// Restricts the pull to these models when present.
    #[serde(default)]
    pub tables_to_include: Option<Vec<String>>,
    /// Models to resend in full.
    #[serde(default)]
    pub tables_for_full_resync: Vec<String>,
}

impl PullRequest {
    /// Creates a pull request for the given tick and facilities.
    pub fn new(since: i64, facility_ids: Vec<String>) -> Self {
        Self {
            since: Some(since),
            facility_ids,
            tables_to_include: None,
            tables_for_full_resync: Vec::new(),
        }
    }

    /// Restricts the pull to the given models.
    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables_to_include = Some(tables);
        self
    }

    /// Requests a full resend of the given models.
    pub fn with_full_resync(mut self, tables: Vec<String>) -> Self {
        self.tables_for_full_resync = tables;
        self
    }
}

/// Size and upper bound of a prepared pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullMetadata {
    /// Number of outgoing records in the snapshot.
    pub total_to_pull: u64,
    /// Tick the snapshot was taken up to.
    pub pull_until: i64,
}

/// A page request over the outgoing snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    /// Return rows with an id strictly greater than this.
    #[serde(default)]
    pub from_id: Option<u64>,
    /// Maximum number of rows.
    #[serde(default)]
    pub limit: Option<usize>,
}

impl PageRequest {
    /// Creates a page request.
    pub fn new(from_id: Option<u64>, limit: usize) -> Self {
        Self {
            from_id,
            limit: Some(limit),
        }
    }
}

/// One page of outgoing records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingPage {
    /// Records in ascending id order.
    pub records: Vec<SyncRecord>,
}

impl OutgoingPage {
    /// Returns the cursor for the next page, if any rows were returned.
    pub fn next_from_id(&self) -> Option<u64> {
        self.records.last().map(|r| r.id)
    }
}

/// A batch of pushed changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    /// Changes in the batch.
    pub changes: Vec<SyncChange>,
}

/// Signals that the client has sent every push batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePushRequest {
    /// Device that pushed.
    pub device_id: String,
    /// Models the client pushed, used to scope per-model hooks.
    #[serde(default)]
    pub tables_to_include: Option<Vec<String>>,
}

/// Ends a session, optionally reporting a client-side failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndSessionRequest {
    /// Error reported by the client, if the sync failed locally.
    #[serde(default)]
    pub error: Option<String>,
}
