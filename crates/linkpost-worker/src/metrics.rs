//! Prometheus metrics for the worker.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use linkpost_queue::QueueStats;

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_TOTAL: &str = "linkpost_jobs_total";
    pub const PUBLISH_DURATION_SECONDS: &str = "linkpost_publish_duration_seconds";
    pub const TOKEN_REFRESH_TOTAL: &str = "linkpost_token_refresh_total";
    pub const JOBS_IN_FLIGHT: &str = "linkpost_jobs_in_flight";
    pub const QUEUE_DELAYED: &str = "linkpost_queue_delayed";
    pub const QUEUE_ACTIVE: &str = "linkpost_queue_active";
    pub const QUEUE_DEAD: &str = "linkpost_queue_dead";
}

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()
}

/// Record how a job execution ended.
pub fn record_job_outcome(outcome: &'static str) {
    counter!(names::JOBS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record the duration of a publish call.
pub fn record_publish_duration(result: &'static str, duration_secs: f64) {
    histogram!(names::PUBLISH_DURATION_SECONDS, "result" => result).record(duration_secs);
}

/// Record a credential refresh attempt.
pub fn record_token_refresh(result: &'static str) {
    counter!(names::TOKEN_REFRESH_TOTAL, "result" => result).increment(1);
}

pub fn set_jobs_in_flight(count: usize) {
    gauge!(names::JOBS_IN_FLIGHT).set(count as f64);
}

pub fn set_queue_stats(stats: &QueueStats) {
    gauge!(names::QUEUE_DELAYED).set(stats.delayed as f64);
    gauge!(names::QUEUE_ACTIVE).set(stats.active as f64);
    gauge!(names::QUEUE_DEAD).set(stats.dead as f64);
}
