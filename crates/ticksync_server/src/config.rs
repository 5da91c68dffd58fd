//! Server configuration.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Capped exponential backoff used by polling loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry.
    #[serde(with = "millis")]
    pub initial: Duration,
    /// Upper bound on any delay.
    #[serde(with = "millis")]
    pub max: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
}

impl Backoff {
    /// Creates a backoff.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            multiplier: 2.0,
        }
    }

    /// A fixed interval with no growth.
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
            multiplier: 1.0,
        }
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(32) as i32);
        let delay = self.initial.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_millis(500))
    }
}

/// Configuration for the central sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Sessions allowed to be open at once.
    pub max_concurrent_sessions: usize,
    /// Snapshots allowed to be built at once.
    pub max_concurrent_snapshots: usize,
    /// Rows read per chunk while snapshotting.
    pub max_records_per_snapshot_chunk: usize,
    /// Rows read per chunk while refreshing the lookup table.
    pub max_records_per_lookup_chunk: usize,
    /// Largest page a client may request.
    pub max_records_per_page: usize,
    /// Age after which an unfinished session is errored.
    #[serde(with = "millis_opt")]
    pub session_timeout: Option<Duration>,
    /// Upper bound on one snapshot transaction.
    #[serde(with = "millis_opt")]
    pub snapshot_transaction_timeout: Option<Duration>,
    /// Idle time after which the purge task closes a session.
    #[serde(with = "millis")]
    pub lapsed_session_after: Duration,
    /// Polling backoff for the snapshot capacity wait.
    pub poll_backoff: Backoff,
    /// Interval between `waiting` stream messages.
    #[serde(with = "millis")]
    pub stream_heartbeat: Duration,
    /// Build snapshots from the lookup table instead of the live tables.
    pub lookup_table_enabled: bool,
    /// Refresh the lookup table on this interval when enabled.
    #[serde(with = "millis_opt")]
    pub lookup_refresh_interval: Option<Duration>,
    /// Await session preparation before answering admission.
    pub await_preparation: bool,
    /// Queue entries not seen within this window are ignored.
    #[serde(with = "millis")]
    pub queue_seen_window: Duration,
    /// Send every lab request to facility servers regardless of patient.
    pub sync_all_lab_requests: bool,
    /// Record type linking patients to the facilities that sync them.
    pub patient_facilities_type: String,
}

impl SyncConfig {
    /// Creates a configuration with default limits.
    pub fn new() -> Self {
        Self {
            max_concurrent_sessions: 4,
            max_concurrent_snapshots: 3,
            max_records_per_snapshot_chunk: 10_000,
            max_records_per_lookup_chunk: 10_000,
            max_records_per_page: 1_000,
            session_timeout: None,
            snapshot_transaction_timeout: Some(Duration::from_secs(600)),
            lapsed_session_after: Duration::from_secs(20 * 60),
            poll_backoff: Backoff::default(),
            stream_heartbeat: Duration::from_millis(500),
            lookup_table_enabled: false,
            lookup_refresh_interval: Some(Duration::from_secs(60)),
            await_preparation: false,
            queue_seen_window: Duration::from_secs(5 * 60),
            sync_all_lab_requests: false,
            patient_facilities_type: "patient_facilities".to_string(),
        }
    }

    /// Sets the maximum number of open sessions.
    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max;
        self
    }

    /// Sets the maximum number of concurrent snapshots.
    pub fn with_max_concurrent_snapshots(mut self, max: usize) -> Self {
        self.max_concurrent_snapshots = max;
        self
    }

    /// Sets the snapshot and lookup chunk sizes.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.max_records_per_snapshot_chunk = size;
        self.max_records_per_lookup_chunk = size;
        self
    }

    /// Sets the session timeout.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = Some(timeout);
        self
    }

    /// Sets the snapshot transaction timeout.
    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_transaction_timeout = Some(timeout);
        self
    }

    /// Sets the idle time after which sessions are purged.
    pub fn with_lapsed_session_after(mut self, after: Duration) -> Self {
        self.lapsed_session_after = after;
        self
    }

    /// Sets the capacity polling backoff.
    pub fn with_poll_backoff(mut self, backoff: Backoff) -> Self {
        self.poll_backoff = backoff;
        self
    }

    /// Sets the interval between stream heartbeats.
    pub fn with_stream_heartbeat(mut self, interval: Duration) -> Self {
        self.stream_heartbeat = interval;
        self
    }

    /// Enables or disables the lookup table strategy.
    pub fn with_lookup_table(mut self, enabled: bool) -> Self {
        self.lookup_table_enabled = enabled;
        self
    }

    /// Sets or clears the lookup refresh schedule.
    pub fn with_lookup_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.lookup_refresh_interval = interval;
        self
    }

    /// Makes admission wait for session preparation.
    pub fn with_await_preparation(mut self, await_preparation: bool) -> Self {
        self.await_preparation = await_preparation;
        self
    }

    /// Enables the all-lab-requests override.
    pub fn with_sync_all_lab_requests(mut self, enabled: bool) -> Self {
        self.sync_all_lab_requests = enabled;
        self
    }

    /// Overlays `TICKSYNC_*` environment variables on the defaults.
    pub fn from_env() -> SyncResult<Self> {
        let mut config = Self::new();
        if let Some(v) = env_parse("TICKSYNC_MAX_CONCURRENT_SESSIONS")? {
            config.max_concurrent_sessions = v;
        }
        if let Some(v) = env_parse("TICKSYNC_MAX_CONCURRENT_SNAPSHOTS")? {
            config.max_concurrent_snapshots = v;
        }
        if let Some(v) = env_parse("TICKSYNC_SNAPSHOT_CHUNK_SIZE")? {
            config.max_records_per_snapshot_chunk = v;
        }
        if let Some(v) = env_parse("TICKSYNC_LOOKUP_CHUNK_SIZE")? {
            config.max_records_per_lookup_chunk = v;
        }
        if let Some(v) = env_parse::<u64>("TICKSYNC_SESSION_TIMEOUT_MS")? {
            config.session_timeout = Some(Duration::from_millis(v));
        }
        if let Some(v) = env_parse::<u64>("TICKSYNC_SNAPSHOT_TIMEOUT_MS")? {
            config.snapshot_transaction_timeout = Some(Duration::from_millis(v));
        }
        if let Some(v) = env_parse::<u64>("TICKSYNC_POLL_INTERVAL_MS")? {
            config.poll_backoff = Backoff::new(
                Duration::from_millis(v),
                config.poll_backoff.max.max(Duration::from_millis(v)),
            );
        }
        if let Some(v) = env_parse("TICKSYNC_LOOKUP_TABLE_ENABLED")? {
            config.lookup_table_enabled = v;
        }
        if let Some(v) = env_parse("TICKSYNC_AWAIT_PREPARATION")? {
            config.await_preparation = v;
        }
        if let Some(v) = env_parse("TICKSYNC_SYNC_ALL_LAB_REQUESTS")? {
            config.sync_all_lab_requests = v;
        }
        config.validate()?;
        Ok(config)
    }

    /// Loads a configuration from a JSON file; missing fields take defaults.
    pub fn from_json_file(path: &Path) -> SyncResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks limits that would make the engine unusable.
    pub fn validate(&self) -> SyncResult<()> {
        if self.max_concurrent_sessions == 0 {
            return Err(SyncError::Config(
                "max_concurrent_sessions must be at least 1".into(),
            ));
        }
        if self.max_concurrent_snapshots == 0 {
            return Err(SyncError::Config(
                "max_concurrent_snapshots must be at least 1".into(),
            ));
        }
        if self.max_records_per_snapshot_chunk == 0 || self.max_records_per_lookup_chunk == 0 {
            return Err(SyncError::Config("chunk sizes must be at least 1".into()));
        }
        if self.max_records_per_page == 0 {
            return Err(SyncError::Config(
                "max_records_per_page must be at least 1".into(),
            ));
        }
        if self.poll_backoff.initial.is_zero() || self.poll_backoff.max < self.poll_backoff.initial {
            return Err(SyncError::Config(
                "poll_backoff must start above zero and not exceed its max".into(),
            ));
        }
        if self.stream_heartbeat.is_zero() {
            return Err(SyncError::Config("stream_heartbeat must be above zero".into()));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn env_parse<T: FromStr>(name: &str) -> SyncResult<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| SyncError::Config(format!("{name} has invalid value {raw:?}"))),
        Err(_) => Ok(None),
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config() {
        let config = SyncConfig::default();
        assert_eq!(config.max_concurrent_sessions, 4);
        assert!(!config.lookup_table_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_builder() {
        let config = SyncConfig::new()
            .with_max_concurrent_sessions(2)
            .with_chunk_size(7)
            .with_lookup_table(true)
            .with_session_timeout(Duration::from_secs(1));

        assert_eq!(config.max_concurrent_sessions, 2);
        assert_eq!(config.max_records_per_snapshot_chunk, 7);
        assert_eq!(config.max_records_per_lookup_chunk, 7);
        assert!(config.lookup_table_enabled);
        assert_eq!(config.session_timeout, Some(Duration::from_secs(1)));
    }

    #[test]
    fn zero_limits_are_rejected() {
        let config = SyncConfig::new().with_max_concurrent_sessions(0);
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config = SyncConfig::new();
        config.max_records_per_page = 0;
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let config = SyncConfig::new().with_chunk_size(0);
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let config = SyncConfig::new().with_stream_heartbeat(Duration::ZERO);
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config = SyncConfig::new();
        config.poll_backoff = Backoff::new(Duration::ZERO, Duration::from_millis(50));
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config = SyncConfig::new();
        config.poll_backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(1));
        config.max_records_per_page = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_json_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_records_per_page": 0}}"#).unwrap();
        assert!(matches!(
            SyncConfig::from_json_file(file.path()),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn backoff_grows_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(10));
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(20));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(40));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(50));
        assert_eq!(backoff.delay_for_attempt(100), Duration::from_millis(50));
    }

    #[test]
    fn json_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_concurrent_sessions": 9, "session_timeout": 1500, "lookup_table_enabled": true}}"#
        )
        .unwrap();

        let config = SyncConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.max_concurrent_sessions, 9);
        assert_eq!(config.session_timeout, Some(Duration::from_millis(1500)));
        assert!(config.lookup_table_enabled);
        assert_eq!(config.max_concurrent_snapshots, 3);
    }

    #[test]
    fn json_round_trip_uses_millis() {
        let config = SyncConfig::new().with_stream_heartbeat(Duration::from_millis(250));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["stream_heartbeat"], 250);
        let back: SyncConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
