//! The central sync manager.
//!
//! [`SyncManager`] wires the clock, locks, queue, session registry,
//! snapshot builder, lookup updater and incoming applier together and
//! exposes one method per protocol step. Background phases (preparation,
//! snapshotting, persisting) run on spawned tasks; clients observe them by
//! polling or streaming.

use crate::clock::SyncClock;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::incoming::IncomingApplier;
use crate::locks::{ProcessingMarker, SyncLocks, SESSION_CREATION_LOCK};
use crate::lookup::LookupUpdater;
use crate::models::ModelRegistry;
use crate::queue::SyncQueue;
use crate::session::SessionRegistry;
use crate::snapshot::SnapshotBuilder;
use crate::stream::{self, SyncStream};
use serde_json::json;
use std::sync::Arc;
use ticksync_protocol::{
    CompletePushRequest, EndSessionRequest, OutgoingPage, PageRequest, PullMetadata, PullRequest,
    PushRequest, SessionDirection, SyncRequest, SyncRequestStatus,
};
use ticksync_store::{Database, SessionParameters};
use tracing::{debug, error, info};

/// Reason recorded when a snapshot was lost to a restart.
pub const SNAPSHOT_INCOMPLETE: &str =
    "Snapshot processing incomplete, likely because the central server restarted during the snapshot";

struct ManagerInner {
    db: Database,
    config: Arc<SyncConfig>,
    clock: SyncClock,
    locks: SyncLocks,
    models: Arc<ModelRegistry>,
    queue: SyncQueue,
    sessions: SessionRegistry,
    snapshots: SnapshotBuilder,
    lookup: LookupUpdater,
    incoming: IncomingApplier,
}

/// Entry point for every sync protocol step. Cloning is cheap.
///
/// # Example
///
/// ```rust,no_run
/// use ticksync_server::{ModelRegistry, SyncConfig, SyncManager};
/// use ticksync_protocol::SyncRequest;
/// use ticksync_store::Database;
///
/// # async fn run() -> ticksync_server::SyncResult<()> {
/// let manager = SyncManager::new(Database::new(), SyncConfig::default(), ModelRegistry::new())?;
/// let status = manager
///     .check_sync_request(SyncRequest::new("facility-1", 0, vec!["f1".into()]))
///     .await?;
/// if let Some(session_id) = status.session_id() {
///     manager.end_session(session_id, Default::default())?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SyncManager {
    inner: Arc<ManagerInner>,
}

impl SyncManager {
    /// Creates a manager over `db`.
    pub fn new(db: Database, config: SyncConfig, models: ModelRegistry) -> SyncResult<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let models = Arc::new(models);
        let clock = SyncClock::new(db.clone());
        let locks = SyncLocks::new(db.clone());
        let queue = SyncQueue::new(db.clone(), config.queue_seen_window);
        let sessions =
            SessionRegistry::new(db.clone(), config.clone(), clock.clone(), locks.clone());
        let snapshots = SnapshotBuilder::new(
            db.clone(),
            config.clone(),
            clock.clone(),
            sessions.clone(),
            models.clone(),
        );
        let lookup = LookupUpdater::new(
            db.clone(),
            config.clone(),
            clock.clone(),
            locks.clone(),
            models.clone(),
        );
        let incoming = IncomingApplier::new(
            db.clone(),
            config.clone(),
            clock.clone(),
            sessions.clone(),
            models.clone(),
        );
        info!(
            models = models.len(),
            max_concurrent_sessions = config.max_concurrent_sessions,
            lookup_table_enabled = config.lookup_table_enabled,
            "sync manager created"
        );
        Ok(Self {
            inner: Arc::new(ManagerInner {
                db,
                config,
                clock,
                locks,
                models,
                queue,
                sessions,
                snapshots,
                lookup,
                incoming,
            }),
        })
    }

    /// The underlying store.
    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    /// Effective configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// The sync clock.
    pub fn clock(&self) -> &SyncClock {
        &self.inner.clock
    }

    /// Registered models.
    pub fn models(&self) -> &ModelRegistry {
        &self.inner.models
    }

    /// The device queue.
    pub fn queue(&self) -> &SyncQueue {
        &self.inner.queue
    }

    /// The session registry.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// The snapshot builder.
    pub fn snapshots(&self) -> &SnapshotBuilder {
        &self.inner.snapshots
    }

    /// The lookup table updater.
    pub fn lookup(&self) -> &LookupUpdater {
        &self.inner.lookup
    }

    // Admission

    /// Decides whether a device may start a session now.
    ///
    /// The device is queued; if it is at the front, the center has capacity
    /// and the creation lock is free, a session is started for it.
    pub async fn check_sync_request(&self, request: SyncRequest) -> SyncResult<SyncRequestStatus> {
        request.validate()?;
        let device_id = request.device_id.clone();
        self.inner.sessions.reclaim_stale_sessions(&device_id)?;
        self.inner.queue.check_in(&request);

        let position = self
            .inner
            .queue
            .position(&device_id)
            .ok_or_else(|| SyncError::Internal(format!("device {device_id} missing from queue")))?;
        if !position.is_front() {
            debug!(device_id, index = position.index, "device waiting in queue");
            return Ok(SyncRequestStatus::WaitingInQueue {
                behind: position.behind(),
            });
        }

        let Some(creation_lock) = self.inner.locks.try_global(SESSION_CREATION_LOCK)? else {
            debug!(device_id, "session creation lock contended");
            return Ok(SyncRequestStatus::ActiveSync);
        };
        let active = self.inner.sessions.active_count();
        let max = self.inner.config.max_concurrent_sessions;
        if active >= max {
            debug!(device_id, active, max, "center at session capacity");
            return Ok(SyncRequestStatus::ActiveSync);
        }

        self.inner.queue.remove(&device_id);
        let (session_id, marker) = self.inner.sessions.start_session(SessionParameters {
            device_id,
            facility_ids: request.facility_ids,
            is_mobile: request.is_mobile,
            ..SessionParameters::default()
        })?;
        drop(creation_lock);

        let tick = self.prepare(&session_id, marker).await?;
        Ok(SyncRequestStatus::GoodToGo { session_id, tick })
    }

    /// Starts a session directly, bypassing the queue.
    ///
    /// Returns the session id and, when preparation is awaited, its start tick.
    pub async fn start_session(
        &self,
        parameters: SessionParameters,
    ) -> SyncResult<(String, Option<i64>)> {
        let (session_id, marker) = {
            let _creation_lock = self
                .inner
                .locks
                .try_global(SESSION_CREATION_LOCK)?
                .ok_or_else(|| SyncError::LockContended("session creation".into()))?;
            self.inner.sessions.reclaim_stale_sessions(&parameters.device_id)?;
            self.inner.sessions.start_session(parameters)?
        };
        let tick = self.prepare(&session_id, marker).await?;
        Ok((session_id, tick))
    }

    async fn prepare(&self, session_id: &str, marker: ProcessingMarker) -> SyncResult<Option<i64>> {
        if self.inner.config.await_preparation {
            return self.inner.sessions.prepare_session(session_id, marker).map(Some);
        }
        let sessions = self.inner.sessions.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            // Failures are recorded on the session.
            let _ = sessions.prepare_session(&session_id, marker);
        });
        Ok(None)
    }

    /// Returns true once the session has been prepared.
    pub fn check_session_ready(&self, session_id: &str) -> SyncResult<bool> {
        self.inner.sessions.check_session_ready(session_id)
    }

    /// Streams heartbeats until the session is prepared.
    pub fn stream_session_ready(&self, session_id: &str) -> SyncStream {
        stream::session_ready(self.clone(), session_id.to_string())
    }

    // Pull

    /// Starts building the session's outgoing snapshot in the background.
    pub fn initiate_pull(&self, session_id: &str, request: PullRequest) -> SyncResult<()> {
        let session = self.inner.sessions.connect(session_id)?;
        let since = request
            .since
            .ok_or_else(|| SyncError::InvalidRequest("since is required to initiate a pull".into()))?;

        let marker = match self.inner.locks.mark_processing(session_id)? {
            Some(marker) if session.snapshot_started_at.is_none() => marker,
            _ => {
                let e = SyncError::SnapshotInProgress(session_id.to_string());
                self.inner.sessions.mark_errored(session_id, &e.to_string())?;
                return Err(e);
            }
        };

        info!(session_id, since, "pull initiated");
        let snapshots = self.inner.snapshots.clone();
        let sessions = self.inner.sessions.clone();
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            let result = snapshots
                .build(
                    &session_id,
                    since,
                    request.facility_ids,
                    request.tables_to_include,
                    request.tables_for_full_resync,
                )
                .await;
            marker.release();
            if let Err(e) = result {
                error!(session_id, error = %e, "snapshot failed");
                if let Err(mark_err) = sessions.mark_errored(&session_id, &e.to_string()) {
                    error!(session_id, error = %mark_err, "could not record snapshot failure");
                }
            }
        });
        Ok(())
    }

    /// Returns true once the snapshot is complete.
    pub fn check_pull_ready(&self, session_id: &str) -> SyncResult<bool> {
        let session = self.inner.sessions.connect(session_id)?;
        if session.snapshot_completed_at.is_some() {
            return Ok(true);
        }
        if self.inner.locks.is_processing(session_id) {
            return Ok(false);
        }
        // Re-read: the snapshot may have finished since the first fetch.
        if self.inner.sessions.connect(session_id)?.snapshot_completed_at.is_some() {
            return Ok(true);
        }
        self.inner
            .sessions
            .mark_errored(session_id, SNAPSHOT_INCOMPLETE)?;
        Err(SyncError::SessionErrored {
            session_id: session_id.to_string(),
            message: SNAPSHOT_INCOMPLETE.to_string(),
        })
    }

    /// Size and boundary of a completed snapshot.
    pub fn fetch_pull_metadata(&self, session_id: &str) -> SyncResult<PullMetadata> {
        let session = self.inner.sessions.connect(session_id)?;
        let pull_until = match (session.snapshot_completed_at, session.pull_until) {
            (Some(_), Some(until)) => until,
            _ => {
                return Err(SyncError::InvalidRequest(format!(
                    "snapshot for session {session_id} is not ready"
                )))
            }
        };
        let total_to_pull = self
            .inner
            .db
            .begin()
            .count_snapshot(session_id, Some(SessionDirection::Outgoing));
        self.inner.sessions.add_debug_info(
            session_id,
            json!({ "totalToPull": total_to_pull, "pullUntil": pull_until }),
        )?;
        Ok(PullMetadata {
            total_to_pull,
            pull_until,
        })
    }

    /// One page of outgoing changes.
    pub fn get_outgoing_changes(&self, session_id: &str, page: PageRequest) -> SyncResult<OutgoingPage> {
        let limit = page.limit.unwrap_or(self.inner.config.max_records_per_page);
        let records = self
            .inner
            .snapshots
            .outgoing_page(session_id, page.from_id, limit)?;
        Ok(OutgoingPage { records })
    }

    /// Streams heartbeats until the snapshot is ready, then every outgoing change.
    pub fn stream_outgoing_changes(&self, session_id: &str) -> SyncStream {
        stream::outgoing_changes(self.clone(), session_id.to_string())
    }

    // Push

    /// Stages a batch of pushed changes.
    pub fn add_incoming_changes(&self, session_id: &str, request: PushRequest) -> SyncResult<usize> {
        self.inner
            .incoming
            .add_incoming_changes(session_id, &request.changes)
    }

    /// Persists every staged change in the background.
    pub fn complete_push(&self, session_id: &str, request: CompletePushRequest) -> SyncResult<()> {
        self.inner.sessions.connect(session_id)?;
        let marker = self
            .inner
            .locks
            .mark_processing(session_id)?
            .ok_or_else(|| SyncError::LockContended(format!("session {session_id}")))?;

        let incoming = self.inner.incoming.clone();
        let session_id = session_id.to_string();
        tokio::task::spawn_blocking(move || {
            // Failures are recorded on the session.
            let _ = incoming.persist(
                &session_id,
                &request.device_id,
                request.tables_to_include.as_deref(),
                marker,
            );
        });
        Ok(())
    }

    /// Returns true once the push has been persisted.
    pub fn check_push_complete(&self, session_id: &str) -> SyncResult<bool> {
        Ok(self
            .inner
            .sessions
            .connect(session_id)?
            .persist_completed_at
            .is_some())
    }

    // Teardown

    /// Ends a session, recording the client's error if it reported one.
    pub fn end_session(&self, session_id: &str, request: EndSessionRequest) -> SyncResult<()> {
        self.inner
            .sessions
            .end_session(session_id, request.error.as_deref())
    }

    /// Records a client-reported error without completing the session.
    ///
    /// Terminal sessions still accept the report; only unknown ids fail.
    pub fn mark_session_errored(&self, session_id: &str, message: &str) -> SyncResult<()> {
        self.inner.sessions.mark_errored(session_id, message)
    }
}
