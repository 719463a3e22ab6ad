//! Structured job logging utilities.

use tracing::{error, info, warn, Span};

/// Job logger carrying the job key and attempt into every line.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_key: String,
    operation: String,
    attempt: u32,
}

impl JobLogger {
    pub fn new(job_key: &str, operation: &str, attempt: u32) -> Self {
        Self {
            job_key: job_key.to_string(),
            operation: operation.to_string(),
            attempt,
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_key = %self.job_key,
            operation = %self.operation,
            attempt = self.attempt,
            "Job started: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_key = %self.job_key,
            operation = %self.operation,
            attempt = self.attempt,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_key = %self.job_key,
            operation = %self.operation,
            attempt = self.attempt,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_key = %self.job_key,
            operation = %self.operation,
            attempt = self.attempt,
            "Job completed: {}", message
        );
    }

    pub fn job_key(&self) -> &str {
        &self.job_key
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Span wrapping the whole execution.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_key = %self.job_key,
            operation = %self.operation,
            attempt = self.attempt
        )
    }
}
