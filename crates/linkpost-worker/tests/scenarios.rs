//! End-to-end delivery scenarios on the in-memory store and queue.
//!
//! Tests run on a paused tokio clock; sleeping in the test lets the
//! executor's timers fire in order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use linkpost_linkedin::{LinkedInError, LinkedInResult, PostPublisher, TokenRefresher};
use linkpost_models::{AccountId, LinkedAccount, PostId, PostStatus, ScheduledPost, TokenGrant};
use linkpost_queue::{InMemoryJobQueue, JobBackend, PostScheduler, QueueError, RetryPolicy};
use linkpost_service::PostService;
use linkpost_store::{InMemoryStore, PostRepository};
use linkpost_worker::{JobExecutor, PublishHandler, WorkerConfig};

#[derive(Default)]
struct RecordingPublisher {
    calls: Mutex<Vec<(PostId, Instant)>>,
    failing: Vec<PostId>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingPublisher {
    fn failing(posts: &[PostId]) -> Self {
        Self {
            failing: posts.to_vec(),
            ..Default::default()
        }
    }

    fn slow(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    fn calls_for(&self, post_id: PostId) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == post_id)
            .map(|(_, at)| *at)
            .collect()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl PostPublisher for RecordingPublisher {
    async fn publish(&self, _account: &LinkedAccount, post: &ScheduledPost) -> LinkedInResult<String> {
        let attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((post.id, Instant::now()));
            calls.iter().filter(|(id, _)| *id == post.id).count()
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&post.id) {
            return Err(LinkedInError::Remote {
                status: 503,
                message: format!("upstream unavailable (try {})", attempt),
            });
        }
        Ok(format!("urn:li:share:{}", post.id))
    }
}

struct StaticRefresher;

#[async_trait]
impl TokenRefresher for StaticRefresher {
    async fn refresh(&self, _refresh_token: &str) -> LinkedInResult<TokenGrant> {
        Ok(TokenGrant {
            access_token: "refreshed".to_string(),
            refresh_token: None,
            expires_in: 3600,
        })
    }
}

struct Harness {
    store: InMemoryStore,
    queue: InMemoryJobQueue,
    scheduler: PostScheduler,
    publisher: Arc<RecordingPublisher>,
    executor: Arc<JobExecutor>,
    worker: Option<JoinHandle<()>>,
}

fn test_config() -> WorkerConfig {
    WorkerConfig {
        concurrency: 5,
        // The limiter runs on the wall clock; paced runs are covered below
        rate_limit_max: 0,
        rate_limit_window: Duration::from_secs(1),
        poll_interval: Duration::from_millis(100),
        publish_timeout: Duration::from_secs(30),
        shutdown_timeout: Duration::from_secs(5),
        reclaim_interval: Duration::from_secs(1),
        reconcile_interval: Duration::ZERO,
    }
}

impl Harness {
    async fn new(publisher: RecordingPublisher) -> Self {
        Self::with_config(publisher, test_config()).await
    }

    async fn with_config(publisher: RecordingPublisher, config: WorkerConfig) -> Self {
        Self::build(publisher, config, InMemoryJobQueue::default(), RetryPolicy::default()).await
    }

    async fn build(
        publisher: RecordingPublisher,
        config: WorkerConfig,
        queue: InMemoryJobQueue,
        policy: RetryPolicy,
    ) -> Self {
        let store = InMemoryStore::new();
        store
            .insert_account(LinkedAccount {
                id: AccountId(1),
                linkedin_id: "member-1".to_string(),
                access_token: "token".to_string(),
                refresh_token: Some("refresh".to_string()),
                token_expires_at: Some(Utc::now() + chrono::Duration::days(30)),
            })
            .await;

        let scheduler = PostScheduler::new(Arc::new(queue.clone()), policy);
        let publisher = Arc::new(publisher);

        let handler = PublishHandler::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            publisher.clone(),
            Arc::new(StaticRefresher),
            config.publish_timeout,
        );
        let executor = Arc::new(
            JobExecutor::new(config, Arc::new(queue.clone()), handler).expect("executor"),
        );

        Self {
            store,
            queue,
            scheduler,
            publisher,
            executor,
            worker: None,
        }
    }

    async fn add_post(&self, id: i64, status: PostStatus, scheduled_for: chrono::DateTime<Utc>) {
        self.store
            .insert_post(ScheduledPost {
                id: PostId(id),
                account_id: AccountId(1),
                content: format!("Post number {}", id),
                media_urls: Vec::new(),
                author_urn: None,
                scheduled_for,
                status,
                external_post_id: None,
                error_message: None,
                created_at: Utc::now(),
                published_at: None,
            })
            .await;
    }

    fn start(&mut self) {
        let executor = Arc::clone(&self.executor);
        self.worker = Some(tokio::spawn(async move {
            executor.run().await.expect("executor run");
        }));
    }

    async fn stop(mut self) {
        self.executor.shutdown();
        if let Some(worker) = self.worker.take() {
            worker.await.expect("worker task");
        }
    }

    async fn post(&self, id: i64) -> ScheduledPost {
        PostRepository::find_by_id(&self.store, PostId(id))
            .await
            .unwrap()
            .expect("post exists")
    }
}

#[tokio::test(start_paused = true)]
async fn scenario_a_scheduled_post_is_delivered_once_at_due_time() {
    let mut h = Harness::new(RecordingPublisher::default()).await;
    let due = Utc::now() + chrono::Duration::seconds(60);
    h.add_post(42, PostStatus::Pending, due).await;

    let start = Instant::now();
    h.scheduler.schedule(PostId(42), AccountId(1), due).await.unwrap();
    h.start();

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert_eq!(h.publisher.total_calls(), 0, "published before due time");

    tokio::time::sleep(Duration::from_secs(2)).await;
    let calls = h.publisher.calls_for(PostId(42));
    assert_eq!(calls.len(), 1);
    let at = calls[0] - start;
    assert!(at >= Duration::from_secs(59) && at <= Duration::from_secs(61), "published at {:?}", at);

    let post = h.post(42).await;
    assert_eq!(post.status, PostStatus::Published);
    assert_eq!(post.external_post_id.as_deref(), Some("urn:li:share:42"));
    assert!(post.published_at.is_some());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.publisher.calls_for(PostId(42)).len(), 1);
    assert!(h.queue.is_empty().await);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_b_past_time_is_rejected_without_a_job() {
    let h = Harness::new(RecordingPublisher::default()).await;
    let past = Utc::now() - chrono::Duration::minutes(1);
    h.add_post(7, PostStatus::Pending, past).await;

    let err = h.scheduler.schedule(PostId(7), AccountId(1), past).await.unwrap_err();

    assert!(matches!(err, QueueError::InvalidScheduleTime { .. }));
    assert!(!h.scheduler.is_scheduled(PostId(7)).await.unwrap());
    assert!(h.queue.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn scenario_c_failures_are_retried_then_marked_failed() {
    let mut h = Harness::new(RecordingPublisher::failing(&[PostId(9)])).await;
    h.add_post(9, PostStatus::Pending, Utc::now()).await;

    h.scheduler.enqueue_now(PostId(9), AccountId(1)).await.unwrap();
    let start = Instant::now();
    h.start();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.post(9).await.status, PostStatus::Pending, "still retrying");

    tokio::time::sleep(Duration::from_secs(60)).await;

    let calls = h.publisher.calls_for(PostId(9));
    assert_eq!(calls.len(), 3, "exactly three attempts");
    // Backoff of 2s then 4s between attempts
    assert!(calls[1] - calls[0] >= Duration::from_secs(2));
    assert!(calls[2] - calls[1] >= Duration::from_secs(4));
    assert!(calls[0] - start < Duration::from_secs(1));

    let post = h.post(9).await;
    assert_eq!(post.status, PostStatus::Failed);
    assert_eq!(
        post.error_message.as_deref(),
        Some("LinkedIn API error (503): upstream unavailable (try 3)")
    );

    let dead = h.queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].key, "post-9");
    assert_eq!(dead[0].attempts_made, 3);
    assert!(h.queue.is_empty().await);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_d_cancelled_post_is_never_published() {
    let mut h = Harness::new(RecordingPublisher::default()).await;
    let due = Utc::now() + chrono::Duration::seconds(60);
    h.add_post(11, PostStatus::Pending, due).await;

    h.scheduler.schedule(PostId(11), AccountId(1), due).await.unwrap();
    h.start();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.scheduler.cancel(PostId(11)).await.unwrap());
    assert!(!h.scheduler.cancel(PostId(11)).await.unwrap());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.publisher.total_calls(), 0);
    assert_eq!(h.post(11).await.status, PostStatus::Pending);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn scenario_e_already_published_post_is_acknowledged_without_side_effects() {
    let mut h = Harness::new(RecordingPublisher::default()).await;
    h.add_post(15, PostStatus::Published, Utc::now()).await;

    h.scheduler.enqueue_now(PostId(15), AccountId(1)).await.unwrap();
    h.start();

    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(h.publisher.total_calls(), 0);
    assert_eq!(h.store.status_write_count(), 0);
    assert!(h.queue.is_empty().await, "job was acknowledged");
    assert!(h.queue.dead_letters().await.is_empty());

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn missing_post_is_dead_lettered_without_retry() {
    let mut h = Harness::new(RecordingPublisher::default()).await;

    h.scheduler.enqueue_now(PostId(404), AccountId(1)).await.unwrap();
    h.start();

    tokio::time::sleep(Duration::from_secs(30)).await;

    let dead = h.queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts_made, 1);
    assert_eq!(h.publisher.total_calls(), 0);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_schedule_publishes_once() {
    let mut h = Harness::new(RecordingPublisher::default()).await;
    let due = Utc::now() + chrono::Duration::seconds(5);
    h.add_post(3, PostStatus::Pending, due).await;

    h.scheduler.schedule(PostId(3), AccountId(1), due).await.unwrap();
    let second = h.scheduler.schedule(PostId(3), AccountId(1), due).await;
    assert!(second.unwrap_err().is_duplicate());
    h.start();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.publisher.calls_for(PostId(3)).len(), 1);

    // A stray job after the post went out changes nothing
    h.scheduler.enqueue_now(PostId(3), AccountId(1)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.publisher.calls_for(PostId(3)).len(), 1);
    assert_eq!(h.store.status_write_count(), 1);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn pool_never_exceeds_concurrency() {
    let mut h = Harness::new(RecordingPublisher::slow(Duration::from_secs(10))).await;
    for id in 100..112 {
        h.add_post(id, PostStatus::Pending, Utc::now()).await;
        h.scheduler.enqueue_now(PostId(id), AccountId(1)).await.unwrap();
    }
    h.start();

    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(h.publisher.total_calls(), 12);
    assert!(h.publisher.max_in_flight.load(Ordering::SeqCst) <= 5);

    let mut statuses: HashMap<PostStatus, usize> = HashMap::new();
    for id in 100..112 {
        *statuses.entry(h.post(id).await.status).or_default() += 1;
    }
    assert_eq!(statuses.get(&PostStatus::Published), Some(&12));

    h.stop().await;
}

#[tokio::test]
async fn rate_limit_paces_a_backlog() {
    let config = WorkerConfig {
        rate_limit_max: 2,
        rate_limit_window: Duration::from_millis(400),
        poll_interval: Duration::from_millis(10),
        ..test_config()
    };
    let mut h = Harness::with_config(RecordingPublisher::default(), config).await;
    for id in 200..205 {
        h.add_post(id, PostStatus::Pending, Utc::now()).await;
        h.scheduler.enqueue_now(PostId(id), AccountId(1)).await.unwrap();
    }
    h.start();

    let deadline = Instant::now() + Duration::from_secs(5);
    while h.publisher.total_calls() < 5 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let mut starts: Vec<Instant> = h.publisher.calls.lock().unwrap().iter().map(|(_, at)| *at).collect();
    starts.sort();
    assert_eq!(starts.len(), 5);
    // Any three consecutive starts span at least one window
    for run in starts.windows(3) {
        assert!(run[2] - run[0] >= Duration::from_millis(380), "span {:?}", run[2] - run[0]);
    }

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stalled_last_attempt_fails_the_post_for_good() {
    let mut h = Harness::build(
        RecordingPublisher::default(),
        test_config(),
        InMemoryJobQueue::new(Duration::from_secs(60)),
        RetryPolicy::new(1, Duration::from_secs(2)),
    )
    .await;
    h.add_post(11, PostStatus::Pending, Utc::now()).await;
    h.scheduler.enqueue_now(PostId(11), AccountId(1)).await.unwrap();

    // A worker leases the only attempt and dies without reporting back
    let stranded = h.queue.fetch_due(1).await.unwrap();
    assert_eq!(stranded.len(), 1);
    h.start();

    tokio::time::sleep(Duration::from_secs(90)).await;

    let post = h.post(11).await;
    assert_eq!(post.status, PostStatus::Failed);
    assert!(post.error_message.unwrap_or_default().contains("lease expired"));
    assert_eq!(h.publisher.total_calls(), 0);
    assert!(h.queue.is_empty().await);
    assert_eq!(h.queue.dead_letters().await.len(), 1);

    let service = PostService::new(Arc::new(h.store.clone()), h.scheduler.clone());
    for _ in 0..3 {
        assert_eq!(service.reconcile_overdue().await.unwrap(), 0);
    }
    assert!(h.queue.is_empty().await);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.publisher.total_calls(), 0);

    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_no_stranded_leases() {
    let config = WorkerConfig {
        concurrency: 3,
        shutdown_timeout: Duration::from_secs(60),
        ..test_config()
    };
    let mut h = Harness::with_config(RecordingPublisher::slow(Duration::from_secs(10)), config).await;
    for id in 300..310 {
        h.add_post(id, PostStatus::Pending, Utc::now()).await;
        h.scheduler.enqueue_now(PostId(id), AccountId(1)).await.unwrap();
    }
    h.start();

    tokio::time::sleep(Duration::from_secs(15)).await;
    let queue = h.queue.clone();
    let publisher = Arc::clone(&h.publisher);
    h.stop().await;

    let stats = queue.stats().await.unwrap();
    assert_eq!(stats.active, 0, "every leased job was started and acked");
    assert_eq!(publisher.total_calls() as u64 + stats.delayed, 10);
}
