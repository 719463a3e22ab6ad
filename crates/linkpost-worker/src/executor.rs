//! Job executor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use linkpost_queue::{FailOutcome, FailureKind, JobBackend, LeasedJob};

use crate::config::WorkerConfig;
use crate::error::{JobFailure, JobSuccess, WorkerError, WorkerResult};
use crate::handler::{JobContext, PublishHandler};
use crate::logging::JobLogger;
use crate::metrics;
use crate::rate_limit::ExecutionLimiter;

/// Pulls due jobs from the backend and runs them on a bounded pool.
pub struct JobExecutor {
    config: WorkerConfig,
    backend: Arc<dyn JobBackend>,
    handler: Arc<PublishHandler>,
    limiter: Option<Arc<ExecutionLimiter>>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    worker_name: String,
}

impl JobExecutor {
    /// Create a new job executor.
    pub fn new(config: WorkerConfig, backend: Arc<dyn JobBackend>, handler: PublishHandler) -> WorkerResult<Self> {
        if config.concurrency == 0 {
            return Err(WorkerError::config_error("concurrency must be positive"));
        }

        let limiter = if config.rate_limit_max == 0 {
            warn!("Rate limiting disabled");
            None
        } else {
            Some(Arc::new(ExecutionLimiter::new(
                config.rate_limit_max,
                config.rate_limit_window,
            )?))
        };
        let job_semaphore = Arc::new(Semaphore::new(config.concurrency));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            backend,
            handler: Arc::new(handler),
            limiter,
            job_semaphore,
            shutdown,
            worker_name: format!("worker-{}", Uuid::new_v4()),
        })
    }

    /// Run until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) -> WorkerResult<()> {
        info!(
            "Starting job executor '{}' with {} concurrent jobs",
            self.worker_name, self.config.concurrency
        );
        if let Some(limiter) = &self.limiter {
            info!("Rate limit: {} executions per {:?}", limiter.max(), limiter.window());
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let reclaim_task = self.spawn_reclaim_task();

        loop {
            if *shutdown_rx.borrow() {
                info!("Shutdown signal received, stopping executor");
                break;
            }

            // Only the wait for a slot is cancelled by shutdown; once jobs
            // are leased they are always started
            let permit = tokio::select! {
                _ = shutdown_rx.changed() => continue,
                permit = Arc::clone(&self.job_semaphore).acquire_owned() => {
                    permit.map_err(|_| WorkerError::config_error("job semaphore closed"))?
                }
            };

            let idle = match self.poll_once(permit).await {
                Ok(0) => self.config.poll_interval,
                Ok(_) => Duration::ZERO,
                Err(e) => {
                    error!("Error fetching jobs: {}", e);
                    Duration::from_secs(5)
                }
            };

            if !idle.is_zero() {
                tokio::select! {
                    _ = shutdown_rx.changed() => {}
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        }

        reclaim_task.abort();

        info!("Waiting for in-flight jobs to complete...");
        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!("Shutdown timeout reached with jobs still running; their leases will expire");
        }

        info!("Job executor stopped");
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Lease as many due jobs as there are free slots and start them.
    ///
    /// `first` is a slot already held, so leases never sit idle. Returns
    /// the number of jobs started.
    async fn poll_once(&self, first: OwnedSemaphorePermit) -> WorkerResult<usize> {
        let available = self.job_semaphore.available_permits() + 1;

        let jobs = self.backend.fetch_due(available).await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        debug!("Leased {} job(s)", jobs.len());
        let started = jobs.len();
        let mut first = Some(first);

        for job in jobs {
            let permit = match first.take() {
                Some(permit) => permit,
                None => Arc::clone(&self.job_semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| WorkerError::config_error("job semaphore closed"))?,
            };

            let backend = Arc::clone(&self.backend);
            let handler = Arc::clone(&self.handler);
            let limiter = self.limiter.clone();
            let semaphore = Arc::clone(&self.job_semaphore);
            let concurrency = self.config.concurrency;

            tokio::spawn(async move {
                metrics::set_jobs_in_flight(concurrency - semaphore.available_permits());
                if let Some(limiter) = limiter {
                    limiter.acquire().await;
                }
                Self::execute_job(backend, handler, job).await;
                drop(permit);
                metrics::set_jobs_in_flight(concurrency - semaphore.available_permits());
            });
        }

        Ok(started)
    }

    /// Run one leased job and report the result to the backend.
    async fn execute_job(backend: Arc<dyn JobBackend>, handler: Arc<PublishHandler>, job: LeasedJob) {
        let logger = JobLogger::new(&job.key, "publish_post", job.attempt);
        let span = logger.create_span();

        async {
            logger.log_start(&format!("attempt {}/{}", job.attempt, job.max_attempts));

            match handler.handle(&JobContext::from(&job)).await {
                Ok(success) => {
                    match &success {
                        JobSuccess::Published { external_post_id } => {
                            metrics::record_job_outcome("published");
                            logger.log_completion(&format!("published as {}", external_post_id));
                        }
                        JobSuccess::AlreadyTerminal(status) => {
                            metrics::record_job_outcome("skipped");
                            logger.log_completion(&format!("post already {}", status));
                        }
                    }

                    if let Err(e) = backend.complete(&job).await {
                        logger.log_error(&format!("Failed to ack job: {}", e));
                    }
                }
                Err(failure) => {
                    let (kind, label) = match &failure {
                        JobFailure::Retryable(_) => (FailureKind::Retryable, "retryable"),
                        JobFailure::Fatal(_) => (FailureKind::Fatal, "fatal"),
                    };
                    let message = failure.error().to_string();
                    logger.log_error(&format!("{} failure ({}): {}", label, failure.error().kind(), message));

                    match backend.fail(&job, &message, kind).await {
                        Ok(FailOutcome::Retrying { next_attempt, delay }) => {
                            metrics::record_job_outcome("retrying");
                            logger.log_warning(&format!(
                                "will retry as attempt {}/{} in {:?}",
                                next_attempt, job.max_attempts, delay
                            ));
                        }
                        Ok(FailOutcome::DeadLettered) => {
                            metrics::record_job_outcome("dead_lettered");
                            logger.log_error(&format!("moved to dead list after {} attempt(s)", job.attempt));
                            // Usually already failed by the handler; covers a lost status write
                            if let Err(e) = handler.mark_dead_lettered(job.payload.post_id, &message).await {
                                logger.log_error(&format!("Failed to mark post failed: {}", e));
                            }
                        }
                        Err(e) => logger.log_error(&format!("Failed to report failure: {}", e)),
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    fn spawn_reclaim_task(&self) -> tokio::task::JoinHandle<()> {
        let backend = Arc::clone(&self.backend);
        let handler = Arc::clone(&self.handler);
        let mut shutdown_rx = self.shutdown.subscribe();
        let period = self.config.reclaim_interval.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match backend.requeue_expired().await {
                            Ok(leases) if leases.is_empty() => {}
                            Ok(leases) => {
                                info!(
                                    "Recovered {} job(s) with expired leases, {} dead-lettered",
                                    leases.total(),
                                    leases.dead_lettered.len()
                                );
                                for dead in &leases.dead_lettered {
                                    metrics::record_job_outcome("dead_lettered");
                                    let error = format!("Publishing did not finish ({})", dead.error);
                                    if let Err(e) = handler.mark_dead_lettered(dead.payload.post_id, &error).await {
                                        warn!(post_id = %dead.payload.post_id, "Failed to mark post failed: {}", e);
                                    }
                                }
                            }
                            Err(e) => warn!("Failed to recover expired leases: {}", e),
                        }
                        match backend.stats().await {
                            Ok(stats) => metrics::set_queue_stats(&stats),
                            Err(e) => debug!("Failed to read queue stats: {}", e),
                        }
                    }
                }
            }
        })
    }

    /// Wait for all in-flight jobs to complete.
    async fn wait_for_jobs(&self) {
        loop {
            if self.job_semaphore.available_permits() == self.config.concurrency {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
