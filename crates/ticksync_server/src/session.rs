//! Session registry and lifecycle.
//!
//! Every operation on an existing session goes through
//! [`SessionRegistry::connect`], which is where timeouts are applied and
//! terminal sessions are turned away.

use crate::clock::SyncClock;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::locks::{ProcessingMarker, SyncLocks};
use crate::lookup::LOOKUP_UP_TO_TICK;
use serde_json::Value;
use std::sync::Arc;
use std::time::SystemTime;
use ticksync_store::{Database, SessionParameters, SyncSession};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Reason recorded on sessions closed because their device started another.
pub const RECONNECTED_REASON: &str = "Session marked as completed due to its device reconnecting";

/// Reason recorded when preparation was lost to a restart.
pub const INITIATION_INCOMPLETE: &str =
    "Session initiation incomplete, likely because the central server restarted during the process";

/// Reason recorded on sessions closed by the lapsed-session purge.
pub const LAPSED_REASON: &str = "Session lapsed without activity";

/// CRUD and lifecycle transitions for sync sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    db: Database,
    config: Arc<SyncConfig>,
    clock: SyncClock,
    locks: SyncLocks,
}

impl SessionRegistry {
    /// Creates a registry.
    pub fn new(db: Database, config: Arc<SyncConfig>, clock: SyncClock, locks: SyncLocks) -> Self {
        Self {
            db,
            config,
            clock,
            locks,
        }
    }

    /// Inserts a new session and marks it as processing.
    ///
    /// The returned marker must be handed to
    /// [`prepare_session`](Self::prepare_session).
    pub fn start_session(
        &self,
        parameters: SessionParameters,
    ) -> SyncResult<(String, ProcessingMarker)> {
        let session_id = Uuid::new_v4().to_string();
        let marker = self
            .locks
            .mark_processing(&session_id)?
            .ok_or_else(|| SyncError::LockContended(format!("session {session_id}")))?;
        info!(
            session_id = %session_id,
            device_id = %parameters.device_id,
            facility_ids = ?parameters.facility_ids,
            is_mobile = parameters.is_mobile,
            "session started"
        );
        self.db
            .insert_session(SyncSession::new(session_id.clone(), parameters));
        Ok((session_id, marker))
    }

    /// Ticks the clock and records the session's start tick.
    ///
    /// Failures are recorded on the session. The marker is released either way.
    pub fn prepare_session(&self, session_id: &str, marker: ProcessingMarker) -> SyncResult<i64> {
        let result = self.prepare_inner(session_id);
        marker.release();
        if let Err(e) = &result {
            error!(session_id, error = %e, "session preparation failed");
            self.mark_errored(session_id, &e.to_string())?;
        }
        result
    }

    fn prepare_inner(&self, session_id: &str) -> SyncResult<i64> {
        if self.config.lookup_table_enabled && self.db.fact(LOOKUP_UP_TO_TICK).is_none() {
            return Err(SyncError::LookupNotBuilt);
        }
        let tick = self.clock.tick_tock()?.tick;
        self.update_open(session_id, |s| s.started_at_tick = Some(tick))?;
        info!(session_id, tick, "session prepared");
        Ok(tick)
    }

    /// Fetches a live session, bumping its last connection time.
    pub fn connect(&self, session_id: &str) -> SyncResult<SyncSession> {
        let session = self
            .db
            .session(session_id)
            .ok_or_else(|| SyncError::SessionNotFound(session_id.to_string()))?;

        if let Some(timeout) = self.config.session_timeout {
            if !session.is_terminal() && session.age() > timeout {
                let message = SyncError::SessionTimedOut(session_id.to_string()).to_string();
                warn!(session_id, age_ms = session.age().as_millis() as u64, "session timed out");
                self.mark_errored(session_id, &message)?;
                return Err(SyncError::SessionErrored {
                    session_id: session_id.to_string(),
                    message,
                });
            }
        }

        check_open(&session)?;
        Ok(self
            .db
            .update_session(session_id, |s| s.last_connection_time = SystemTime::now())?)
    }

    /// Looks up a session without connecting to it.
    pub fn get(&self, session_id: &str) -> Option<SyncSession> {
        self.db.session(session_id)
    }

    /// Applies `f` to a session that is not terminal.
    pub fn update_open(
        &self,
        session_id: &str,
        f: impl FnOnce(&mut SyncSession),
    ) -> SyncResult<SyncSession> {
        let mut outcome = Ok(());
        let session = self
            .db
            .update_session(session_id, |s| match check_open(s) {
                Ok(()) => f(s),
                Err(e) => outcome = Err(e),
            })
            .map_err(|_| SyncError::SessionNotFound(session_id.to_string()))?;
        outcome.map(|()| session)
    }

    /// Appends an error, making the session terminal.
    pub fn mark_errored(&self, session_id: &str, message: &str) -> SyncResult<()> {
        warn!(session_id, error = message, "session errored");
        self.db
            .update_session(session_id, |s| s.errors.push(message.to_string()))
            .map_err(|_| SyncError::SessionNotFound(session_id.to_string()))?;
        Ok(())
    }

    /// Merges `info` into the session's debug info.
    pub fn add_debug_info(&self, session_id: &str, info: Value) -> SyncResult<()> {
        self.db
            .update_session(session_id, |s| {
                if let Value::Object(fields) = info {
                    s.debug_info.extend(fields);
                }
            })
            .map_err(|_| SyncError::SessionNotFound(session_id.to_string()))?;
        Ok(())
    }

    /// Completes a session, with an error if the client reported one.
    pub fn end_session(&self, session_id: &str, error: Option<&str>) -> SyncResult<()> {
        let session = self.connect(session_id)?;
        self.complete(session_id, error)?;
        info!(
            session_id,
            duration_ms = session.start_time.elapsed().unwrap_or_default().as_millis() as u64,
            device_id = %session.parameters.device_id,
            facility_ids = ?session.parameters.facility_ids,
            is_mobile = session.parameters.is_mobile,
            errored = error.is_some(),
            "session completed"
        );
        Ok(())
    }

    fn complete(&self, session_id: &str, error: Option<&str>) -> SyncResult<()> {
        self.db
            .update_session(session_id, |s| {
                s.completed_at = Some(SystemTime::now());
                if let Some(message) = error {
                    s.errors.push(message.to_string());
                }
            })
            .map_err(|_| SyncError::SessionNotFound(session_id.to_string()))?;
        self.db.drop_snapshot_partition(session_id)?;
        Ok(())
    }

    /// Force-completes every open session of `device_id`.
    pub fn reclaim_stale_sessions(&self, device_id: &str) -> SyncResult<usize> {
        let stale = self
            .db
            .find_sessions(|s| s.completed_at.is_none() && s.parameters.device_id == device_id);
        for session in &stale {
            self.complete(&session.id, Some(RECONNECTED_REASON))?;
            warn!(
                session_id = %session.id,
                device_id,
                duration_ms = session.start_time.elapsed().unwrap_or_default().as_millis() as u64,
                "closed session of reconnecting device"
            );
        }
        Ok(stale.len())
    }

    /// Completes sessions idle for longer than the lapse threshold.
    pub fn purge_lapsed(&self) -> SyncResult<usize> {
        let after = self.config.lapsed_session_after;
        let lapsed = self
            .db
            .find_sessions(|s| s.completed_at.is_none() && s.idle_for() > after);
        let mut purged = 0;
        for session in &lapsed {
            if self.locks.is_processing(&session.id) {
                continue;
            }
            let reason = (!session.is_errored()).then_some(LAPSED_REASON);
            self.complete(&session.id, reason)?;
            purged += 1;
            info!(session_id = %session.id, idle_ms = session.idle_for().as_millis() as u64, "purged lapsed session");
        }
        Ok(purged)
    }

    /// Sessions counting against the concurrency limit.
    ///
    /// Idle sessions keep their slot until the purge completes them.
    pub fn active_count(&self) -> usize {
        self.db.count_sessions(|s| !s.is_terminal())
    }

    /// Returns true once the session has a start tick.
    pub fn check_session_ready(&self, session_id: &str) -> SyncResult<bool> {
        let session = self.connect(session_id)?;
        if session.started_at_tick.is_some() {
            return Ok(true);
        }
        if self.locks.is_processing(session_id) {
            return Ok(false);
        }
        // Re-read: preparation may have finished since the first fetch.
        if self.connect(session_id)?.started_at_tick.is_some() {
            return Ok(true);
        }
        self.mark_errored(session_id, INITIATION_INCOMPLETE)?;
        Err(SyncError::SessionErrored {
            session_id: session_id.to_string(),
            message: INITIATION_INCOMPLETE.to_string(),
        })
    }
}

fn check_open(session: &SyncSession) -> SyncResult<()> {
    if let Some(message) = session.last_error() {
        return Err(SyncError::SessionErrored {
            session_id: session.id.clone(),
            message: message.to_string(),
        });
    }
    if session.completed_at.is_some() {
        return Err(SyncError::SessionCompleted(session.id.clone()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn registry(config: SyncConfig) -> SessionRegistry {
        let db = Database::new();
        SessionRegistry::new(
            db.clone(),
            Arc::new(config),
            SyncClock::new(db.clone()),
            SyncLocks::new(db),
        )
    }

    fn params(device: &str) -> SessionParameters {
        SessionParameters {
            device_id: device.into(),
            ..SessionParameters::default()
        }
    }

    #[test]
    fn start_then_prepare() {
        let sessions = registry(SyncConfig::new());
        let (id, marker) = sessions.start_session(params("d1")).unwrap();
        assert!(!sessions.check_session_ready(&id).unwrap());

        let tick = sessions.prepare_session(&id, marker).unwrap();
        assert_eq!(tick % 2, 1);
        assert!(sessions.check_session_ready(&id).unwrap());
        assert_eq!(sessions.get(&id).unwrap().started_at_tick, Some(tick));
    }

    #[test]
    fn lost_preparation_errors_session() {
        let sessions = registry(SyncConfig::new());
        let (id, marker) = sessions.start_session(params("d1")).unwrap();
        drop(marker);

        let err = sessions.check_session_ready(&id).unwrap_err();
        assert!(err.to_string().contains(INITIATION_INCOMPLETE));
        assert!(matches!(
            sessions.connect(&id),
            Err(SyncError::SessionErrored { .. })
        ));
    }

    #[test]
    fn lookup_must_be_built_first() {
        let sessions = registry(SyncConfig::new().with_lookup_table(true));
        let (id, marker) = sessions.start_session(params("d1")).unwrap();
        assert!(matches!(
            sessions.prepare_session(&id, marker),
            Err(SyncError::LookupNotBuilt)
        ));
        let err = sessions.connect(&id).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!(
                "Sync session '{id}' encountered an error: Sync lookup table has not yet built. Cannot initiate sync."
            )
        );
    }

    #[test]
    fn terminal_sessions_reject_connections() {
        let sessions = registry(SyncConfig::new());
        assert!(matches!(
            sessions.connect("missing"),
            Err(SyncError::SessionNotFound(_))
        ));

        let (id, marker) = sessions.start_session(params("d1")).unwrap();
        sessions.prepare_session(&id, marker).unwrap();
        sessions.end_session(&id, None).unwrap();
        let err = sessions.connect(&id).unwrap_err();
        assert_eq!(err.to_string(), format!("Sync session '{id}' is already completed"));
        assert!(sessions.end_session(&id, None).is_err());
        assert!(sessions.update_open(&id, |s| s.pull_since = Some(1)).is_err());
        assert_eq!(sessions.get(&id).unwrap().pull_since, None);
    }

    #[test]
    fn end_with_error_records_it() {
        let sessions = registry(SyncConfig::new());
        let (id, marker) = sessions.start_session(params("d1")).unwrap();
        sessions.prepare_session(&id, marker).unwrap();
        sessions.end_session(&id, Some("client failed")).unwrap();
        let session = sessions.get(&id).unwrap();
        assert_eq!(session.last_error(), Some("client failed"));
        assert!(session.completed_at.is_some());
    }

    #[test]
    fn timeout_errors_session() {
        let sessions = registry(SyncConfig::new().with_session_timeout(Duration::from_millis(1)));
        let (id, marker) = sessions.start_session(params("d1")).unwrap();
        sessions.prepare_session(&id, marker).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        let err = sessions.connect(&id).unwrap_err();
        assert_eq!(
            err.to_string(),
            format!("Sync session '{id}' encountered an error: Sync session {id} timed out")
        );
    }

    #[test]
    fn reconnecting_device_reclaims_old_session() {
        let sessions = registry(SyncConfig::new());
        let (old, marker) = sessions.start_session(params("d1")).unwrap();
        sessions.prepare_session(&old, marker).unwrap();
        let (other, marker) = sessions.start_session(params("d2")).unwrap();
        sessions.prepare_session(&other, marker).unwrap();
        assert_eq!(sessions.active_count(), 2);

        assert_eq!(sessions.reclaim_stale_sessions("d1").unwrap(), 1);
        assert_eq!(sessions.get(&old).unwrap().last_error(), Some(RECONNECTED_REASON));
        assert!(sessions.connect(&other).is_ok());
        assert_eq!(sessions.active_count(), 1);
    }

    #[test]
    fn debug_info_merges() {
        let sessions = registry(SyncConfig::new());
        let (id, _marker) = sessions.start_session(params("d1")).unwrap();
        sessions.add_debug_info(&id, json!({"a": 1})).unwrap();
        sessions.add_debug_info(&id, json!({"b": 2})).unwrap();
        let info = sessions.get(&id).unwrap().debug_info;
        assert_eq!(info.get("a"), Some(&json!(1)));
        assert_eq!(info.get("b"), Some(&json!(2)));
    }

    #[test]
    fn purge_skips_processing_sessions() {
        let sessions = registry(SyncConfig::new().with_lapsed_session_after(Duration::ZERO));
        let (busy, _marker) = sessions.start_session(params("d1")).unwrap();
        let (idle, marker) = sessions.start_session(params("d2")).unwrap();
        sessions.prepare_session(&idle, marker).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(sessions.purge_lapsed().unwrap(), 1);
        assert!(sessions.get(&idle).unwrap().completed_at.is_some());
        assert!(sessions.get(&busy).unwrap().completed_at.is_none());
    }
}
