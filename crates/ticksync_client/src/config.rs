//! Configuration for the sync client.

use rand::Rng;
use std::time::Duration;

/// Configuration for one syncing device.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Device ID (unique per device).
    pub device_id: String,
    /// Facilities the device serves.
    pub facility_ids: Vec<String>,
    /// Whether the device is a mobile client.
    pub is_mobile: bool,
    /// Whether to jump the queue.
    pub urgent: bool,
    /// Maximum changes per push request.
    pub push_batch_size: usize,
    /// Maximum records per pulled page.
    pub page_size: usize,
    /// Pull over the line-delimited stream instead of paging.
    pub use_streaming: bool,
    /// Tables the device wants resent from scratch.
    pub tables_for_full_resync: Vec<String>,
    /// Backoff while waiting in the queue.
    pub admission: RetryConfig,
    /// Backoff while polling a background phase.
    pub polling: RetryConfig,
}

impl ClientConfig {
    /// Creates a configuration for `device_id`.
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            facility_ids: Vec::new(),
            is_mobile: false,
            urgent: false,
            push_batch_size: 100,
            page_size: 500,
            use_streaming: false,
            tables_for_full_resync: Vec::new(),
            admission: RetryConfig::new(30)
                .with_initial_delay(Duration::from_millis(250))
                .with_max_delay(Duration::from_secs(10)),
            polling: RetryConfig::new(600)
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(500)),
        }
    }

    /// Sets the facilities the device serves.
    pub fn with_facilities(mut self, facility_ids: Vec<String>) -> Self {
        self.facility_ids = facility_ids;
        self
    }

    /// Marks the device as a mobile client.
    pub fn mobile(mut self) -> Self {
        self.is_mobile = true;
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the pull page size.
    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    /// Pulls over the stream instead of paging.
    pub fn with_streaming(mut self, enabled: bool) -> Self {
        self.use_streaming = enabled;
        self
    }

    /// Requests a full resend of `tables`.
    pub fn with_full_resync(mut self, tables: Vec<String>) -> Self {
        self.tables_for_full_resync = tables;
        self
    }

    /// Sets the admission backoff.
    pub fn with_admission(mut self, retry: RetryConfig) -> Self {
        self.admission = retry;
        self
    }

    /// Sets the polling backoff.
    pub fn with_polling(mut self, retry: RetryConfig) -> Self {
        self.polling = retry;
        self
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// A fixed interval, no jitter.
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: interval,
            max_delay: interval,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% on top.
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_builder() {
        let config = ClientConfig::new("facility-a")
            .with_facilities(vec!["f1".into()])
            .with_push_batch_size(0)
            .with_page_size(25)
            .with_streaming(true);

        assert_eq!(config.device_id, "facility-a");
        assert_eq!(config.facility_ids, vec!["f1"]);
        assert_eq!(config.push_batch_size, 1);
        assert_eq!(config.page_size, 25);
        assert!(config.use_streaming);
        assert!(!config.is_mobile);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .without_jitter();
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }

    #[test]
    fn fixed_interval_is_flat() {
        let config = RetryConfig::fixed(4, Duration::from_millis(7));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(7));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(7));
    }
}
