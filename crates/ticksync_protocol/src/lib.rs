//! # TickSync Protocol
//!
//! Wire types shared by the central sync server and its clients.
//!
//! This crate provides:
//! - `SyncDirection` and `SessionDirection` classifications
//! - `SyncChange` (pushed by clients) and `SyncRecord` (pulled by clients)
//! - Request/response messages for every protocol step and the routes
//!   they travel on
//! - Line-delimited JSON stream framing (`waiting`, `change`, `end`)
//! - The per-field update checksum
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
mod direction;
mod error;
mod messages;
mod route;
mod stream;

pub use change::{updated_at_by_field_sum, ChangelogRecord, RecordData, SyncChange, SyncRecord};
pub use direction::{SessionDirection, SyncDirection};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    CompletePushRequest, EndSessionRequest, OutgoingPage, PageRequest, PullMetadata,
    PullRequest, PushRequest, QueuedDeviceSummary, SyncRequest, SyncRequestStatus,
};
pub use route::SyncRoute;
pub use stream::{LineDecoder, StreamMessage};

/// Tick value meaning "from the beginning of history".
pub const FULL_HISTORY_SINCE: i64 = -1;
