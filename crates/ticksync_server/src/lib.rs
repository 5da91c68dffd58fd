//! # TickSync Server
//!
//! The central replication engine for offline-first facility and mobile
//! clients.
//!
//! This crate provides:
//! - A tick-tock logical clock giving every commit a unique place in one
//!   global order
//! - Admission control with a pluggable device queue
//! - Session lifecycle with timeouts and terminal-state enforcement
//! - Snapshot building from the live tables or from a lookup table, with
//!   echo suppression
//! - An incrementally maintained lookup table
//! - Push persistence with per-model hooks
//! - Line-delimited streaming of readiness and outgoing changes
//!
//! # Architecture
//!
//! All state lives in a [`ticksync_store::Database`]. Mutual exclusion is
//! built on its transaction-scoped advisory locks, so anything a crashed
//! task was holding is released with its transaction:
//! - a session-creation lock serializes admission
//! - a per-session processing marker is held while a background step runs
//! - writers hold a pending edit on their commit tick until they finish,
//!   and snapshots wait for every earlier pending edit before reading
//!
//! # Protocol
//!
//! 1. The client asks to sync and is queued until it is admitted
//! 2. It waits for the session to be prepared
//! 3. It pushes its changes and asks for them to be persisted
//! 4. It initiates a pull, waits for the snapshot and pages or streams it
//! 5. It ends the session
//!
//! ```rust,no_run
//! use ticksync_protocol::{SyncDirection, SyncRequest};
//! use ticksync_server::{ModelRegistry, SimpleModel, SyncConfig, SyncServer};
//! use ticksync_store::Database;
//!
//! # async fn run() -> ticksync_server::SyncResult<()> {
//! let models = ModelRegistry::new()
//!     .register(SimpleModel::new("patients", SyncDirection::Bidirectional).patient_root())
//!     .register(SimpleModel::new("reference_data", SyncDirection::PullFromCentral));
//! let server = SyncServer::new(Database::new(), SyncConfig::from_env()?, models)?;
//! server.start();
//! let status = server
//!     .manager()
//!     .check_sync_request(SyncRequest::new("facility-1", 0, vec!["f1".into()]))
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
// Production code MUST NOT use panic!/unwrap()/expect()
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod clock;
mod config;
mod error;
mod handler;
mod incoming;
mod locks;
mod lookup;
mod manager;
mod models;
mod queue;
mod server;
mod session;
mod snapshot;
mod stream;

pub use clock::{SyncClock, TickTock};
pub use config::{Backoff, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use handler::{HandlerResponse, RequestHandler};
pub use incoming::{IncomingApplier, PersistOutcome};
pub use locks::{
    session_lock_key, GlobalLockGuard, ProcessingMarker, SyncLocks, LOOKUP_REFRESH_LOCK,
    SESSION_CREATION_LOCK,
};
pub use lookup::{
    LookupRefresh, LookupUpdater, LOOKUP_DEBUG_LOG, LOOKUP_PENDING_TICK, LOOKUP_REBUILD_TYPES,
    LOOKUP_UP_TO_TICK,
};
pub use manager::{SyncManager, SNAPSHOT_INCOMPLETE};
pub use models::{Linkage, ModelRegistry, PatientLink, SimpleModel, SyncModel};
pub use queue::{QueuePolicy, QueuePosition, SyncQueue, UrgentThenOldest};
pub use server::SyncServer;
pub use session::{SessionRegistry, INITIATION_INCOMPLETE, LAPSED_REASON, RECONNECTED_REASON};
pub use snapshot::{MarkedPatients, SnapshotBuilder, SnapshotOutcome, SnapshotPermit, SnapshotPlan};
pub use stream::SyncStream;
pub use ticksync_protocol::SyncRoute;
