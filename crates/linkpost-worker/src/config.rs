//! Worker configuration.

use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum concurrent job executions
    pub concurrency: usize,
    /// Executions admitted per rate-limit window; zero disables the limit
    pub rate_limit_max: u32,
    /// Rate-limit window
    pub rate_limit_window: Duration,
    /// Sleep between polls when nothing is due
    pub poll_interval: Duration,
    /// Upper bound on a single publish call
    pub publish_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// How often expired leases are returned to the queue
    pub reclaim_interval: Duration,
    /// How often overdue pending posts without a job are re-enqueued;
    /// zero disables the sweep
    pub reconcile_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            rate_limit_max: 10,
            rate_limit_window: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            publish_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            reclaim_interval: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(300),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            concurrency: std::env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            rate_limit_max: std::env::var("WORKER_RATE_LIMIT_MAX")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            rate_limit_window: Duration::from_secs(
                std::env::var("WORKER_RATE_LIMIT_WINDOW_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            poll_interval: Duration::from_millis(
                std::env::var("WORKER_POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(500),
            ),
            publish_timeout: Duration::from_secs(
                std::env::var("WORKER_PUBLISH_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            shutdown_timeout: Duration::from_secs(
                std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            reclaim_interval: Duration::from_secs(
                std::env::var("WORKER_RECLAIM_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            reconcile_interval: Duration::from_secs(
                std::env::var("WORKER_RECONCILE_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.rate_limit_max, 10);
        assert_eq!(config.rate_limit_window, Duration::from_secs(60));
        assert_eq!(config.publish_timeout, Duration::from_secs(30));
    }
}
