//! The client sync driver.
//!
//! One call to [`SyncClient::sync`] runs a whole session:
//! 1. Check in to the queue, backing off until admitted
//! 2. Wait for the session to be prepared
//! 3. Push local changes in batches and wait for them to be persisted
//! 4. Initiate a pull, wait for the snapshot, page or stream it and apply it
//! 5. End the session
//!
//! A failure after admission is reported to the center so the session is
//! marked errored rather than left to lapse.

use crate::config::{ClientConfig, RetryConfig};
use crate::error::{ClientError, ClientResult};
use crate::store::ClientStore;
use crate::transport::SyncTransport;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use ticksync_protocol::{
    CompletePushRequest, EndSessionRequest, OutgoingPage, PageRequest, PullMetadata, PullRequest,
    PushRequest, StreamMessage, SyncRecord, SyncRequest, SyncRequestStatus, SyncRoute,
};
use tracing::{debug, info, warn};

/// Result of one completed session.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    /// Session the sync ran in.
    pub session_id: String,
    /// Local changes the center persisted.
    pub pushed: usize,
    /// Records pulled and applied.
    pub pulled: usize,
    /// Tick the pull reached; the next pull starts here.
    pub pull_until: i64,
    /// Admission attempts before the session started.
    pub admission_attempts: u32,
    /// Wall time of the whole sync.
    pub duration: Duration,
}

/// Running totals across syncs.
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    /// Sessions completed successfully.
    pub sessions_completed: u64,
    /// Sessions that failed after admission.
    pub sessions_failed: u64,
    /// Total changes pushed.
    pub changes_pushed: u64,
    /// Total records pulled.
    pub records_pulled: u64,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Drives sync sessions for one device.
pub struct SyncClient<T: SyncTransport, S: ClientStore> {
    config: ClientConfig,
    transport: T,
    store: S,
    stats: RwLock<ClientStats>,
}

impl<T: SyncTransport, S: ClientStore> SyncClient<T, S> {
    /// Creates a client.
    pub fn new(config: ClientConfig, transport: T, store: S) -> Self {
        Self {
            config,
            transport,
            store,
            stats: RwLock::new(ClientStats::default()),
        }
    }

    /// The client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Local state.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Running totals.
    pub fn stats(&self) -> ClientStats {
        self.stats.read().clone()
    }

    /// Takes the client apart, keeping the local store for another client.
    pub fn into_parts(self) -> (ClientConfig, T, S) {
        (self.config, self.transport, self.store)
    }

    /// Runs one full sync session.
    pub async fn sync(&self) -> ClientResult<SyncOutcome> {
        let started = Instant::now();
        let (session_id, admission_attempts) = self.enqueue().await?;
        info!(
            device_id = %self.config.device_id,
            session_id = %session_id,
            admission_attempts,
            "sync session started"
        );

        match self.run_session(&session_id).await {
            Ok((pushed, pulled, pull_until)) => {
                self.end_session(&session_id, None).await?;
                let outcome = SyncOutcome {
                    session_id,
                    pushed,
                    pulled,
                    pull_until,
                    admission_attempts,
                    duration: started.elapsed(),
                };
                {
                    let mut stats = self.stats.write();
                    stats.sessions_completed += 1;
                    stats.changes_pushed += pushed as u64;
                    stats.records_pulled += pulled as u64;
                    stats.last_error = None;
                }
                info!(
                    device_id = %self.config.device_id,
                    session_id = %outcome.session_id,
                    pushed,
                    pulled,
                    pull_until,
                    duration_ms = outcome.duration.as_millis() as u64,
                    "sync session completed"
                );
                Ok(outcome)
            }
            Err(e) => {
                warn!(
                    device_id = %self.config.device_id,
                    session_id = %session_id,
                    error = %e,
                    "sync session failed"
                );
                {
                    let mut stats = self.stats.write();
                    stats.sessions_failed += 1;
                    stats.last_error = Some(e.to_string());
                }
                if !e.ends_session() {
                    // Best effort; the original error is what matters.
                    let _ = self.end_session(&session_id, Some(e.to_string())).await;
                }
                Err(e)
            }
        }
    }

    /// Checks in to the queue until admitted.
    ///
    /// Returns the session id and the number of attempts it took.
    pub async fn enqueue(&self) -> ClientResult<(String, u32)> {
        let retry = &self.config.admission;
        let mut request = SyncRequest::new(
            self.config.device_id.clone(),
            self.store.last_synced_tick()?,
            self.config.facility_ids.clone(),
        );
        request.urgent = self.config.urgent;
        request.is_mobile = self.config.is_mobile;

        for attempt in 0..retry.max_attempts {
            tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
            let status: SyncRequestStatus = match self
                .call(SyncRoute::CheckSyncRequest, None, &request)
                .await
            {
                Ok(status) => status,
                Err(e) if e.is_retryable() && attempt + 1 < retry.max_attempts => {
                    debug!(error = %e, attempt, "admission request failed, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            };
            match status {
                SyncRequestStatus::GoodToGo { session_id, .. } => {
                    return Ok((session_id, attempt + 1))
                }
                SyncRequestStatus::WaitingInQueue { behind } => {
                    debug!(attempt, behind = ?behind.map(|b| b.device_id), "waiting in queue");
                }
                SyncRequestStatus::ActiveSync => debug!(attempt, "center busy"),
            }
        }
        Err(ClientError::NotAdmitted {
            attempts: retry.max_attempts,
        })
    }

    async fn run_session(&self, session_id: &str) -> ClientResult<(usize, usize, i64)> {
        self.wait_until_ready(session_id).await?;
        let pushed = self.push(session_id).await?;
        let (pulled, pull_until) = self.pull(session_id).await?;
        Ok((pushed, pulled, pull_until))
    }

    async fn wait_until_ready(&self, session_id: &str) -> ClientResult<()> {
        if self.config.use_streaming {
            let stream = self
                .transport
                .open_stream(SyncRoute::SessionReady, session_id)
                .await?;
            stream.for_each_message(|_| Ok(())).await?;
            return Ok(());
        }
        self.poll(SyncRoute::SessionReady, session_id, "session ready")
            .await
    }

    /// Pushes every pending change and waits for the center to persist them.
    async fn push(&self, session_id: &str) -> ClientResult<usize> {
        let changes = self.store.pending_changes()?;
        if changes.is_empty() {
            return Ok(0);
        }
        for batch in changes.chunks(self.config.push_batch_size) {
            let request = PushRequest {
                changes: batch.to_vec(),
            };
            let _: Value = self.call(SyncRoute::Push, Some(session_id), &request).await?;
        }
        let complete = CompletePushRequest {
            device_id: self.config.device_id.clone(),
            tables_to_include: None,
        };
        let _: Value = self
            .call(SyncRoute::CompletePush, Some(session_id), &complete)
            .await?;
        self.poll(SyncRoute::PushComplete, session_id, "push to persist")
            .await?;
        self.store.acknowledge_pushed(changes.len())?;
        debug!(session_id, pushed = changes.len(), "push persisted");
        Ok(changes.len())
    }

    /// Pulls the session's snapshot and applies it.
    async fn pull(&self, session_id: &str) -> ClientResult<(usize, i64)> {
        let since = self.store.last_synced_tick()?;
        let request = PullRequest::new(since, self.config.facility_ids.clone())
            .with_full_resync(self.config.tables_for_full_resync.clone());
        let _: Value = self
            .call(SyncRoute::InitiatePull, Some(session_id), &request)
            .await?;

        let records = if self.config.use_streaming {
            self.stream_records(session_id).await?
        } else {
            self.poll(SyncRoute::PullReady, session_id, "snapshot").await?;
            self.page_records(session_id).await?
        };
        let metadata: PullMetadata = self
            .call(SyncRoute::PullMetadata, Some(session_id), &Value::Null)
            .await?;
        if metadata.total_to_pull != records.len() as u64 {
            return Err(ClientError::InvalidResponse(format!(
                "expected {} records, received {}",
                metadata.total_to_pull,
                records.len()
            )));
        }

        if !self.config.tables_for_full_resync.is_empty() {
            self.store.reset_tables(&self.config.tables_for_full_resync)?;
        }
        self.store.apply_pulled(&records)?;
        self.store.set_last_synced_tick(metadata.pull_until)?;
        debug!(session_id, pulled = records.len(), pull_until = metadata.pull_until, "pull applied");
        Ok((records.len(), metadata.pull_until))
    }

    async fn page_records(&self, session_id: &str) -> ClientResult<Vec<SyncRecord>> {
        let mut records = Vec::new();
        let mut from_id = None;
        loop {
            let page: OutgoingPage = self
                .call(
                    SyncRoute::OutgoingChanges,
                    Some(session_id),
                    &PageRequest::new(from_id, self.config.page_size),
                )
                .await?;
            let Some(next) = page.next_from_id() else {
                return Ok(records);
            };
            from_id = Some(next);
            records.extend(page.records);
        }
    }

    async fn stream_records(&self, session_id: &str) -> ClientResult<Vec<SyncRecord>> {
        let stream = self
            .transport
            .open_stream(SyncRoute::OutgoingChanges, session_id)
            .await?;
        let mut records = Vec::new();
        stream
            .for_each_message(|message| {
                if let StreamMessage::Change(record) = message {
                    records.push(*record);
                }
                Ok(())
            })
            .await?;
        Ok(records)
    }

    async fn end_session(&self, session_id: &str, error: Option<String>) -> ClientResult<()> {
        let _: Value = self
            .call(SyncRoute::EndSession, Some(session_id), &EndSessionRequest { error })
            .await?;
        Ok(())
    }

    /// Polls a boolean route until it answers true.
    async fn poll(&self, route: SyncRoute, session_id: &str, what: &'static str) -> ClientResult<()> {
        let retry: &RetryConfig = &self.config.polling;
        for attempt in 0..retry.max_attempts {
            tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
            let ready: bool = self.call(route, Some(session_id), &Value::Null).await?;
            if ready {
                return Ok(());
            }
        }
        Err(ClientError::Timeout(what))
    }

    async fn call<B: Serialize, R: DeserializeOwned>(
        &self,
        route: SyncRoute,
        session_id: Option<&str>,
        body: &B,
    ) -> ClientResult<R> {
        let body = serde_json::to_value(body)?;
        let response = self.transport.request(route, session_id, body).await?;
        Ok(serde_json::from_value(response)?)
    }
}

