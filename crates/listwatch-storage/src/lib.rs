//! Task/seen-listing persistence and polite HTTP fetching for listwatch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listwatch_core::{CommitReceipt, RunCommit, RunLease, Task, TaskLogEntry};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

mod pg;

pub use pg::PgStore;

pub const CRATE_NAME: &str = "listwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("task {0} not found")]
    TaskNotFound(String),
    #[error("run lease for task {0} is no longer held by this run")]
    LeaseLost(String),
    #[error("corrupt task record: {0}")]
    Corrupt(String),
}

/// Durable task records plus the per-task seen-listing ledger.
///
/// All shared mutable state goes through this interface. Implementations
/// must make `mark_seen` idempotent per `(task_id, listing_id)` and apply a
/// [`RunCommit`] atomically.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    async fn list_tasks(&self, user_id: Option<&str>) -> Result<Vec<Task>, StoreError>;

    async fn eligible_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        Ok(self
            .list_tasks(None)
            .await?
            .into_iter()
            .filter(|task| task.is_eligible(now))
            .collect())
    }

    /// Pauses or resumes a task, returning the updated record.
    async fn set_active(
        &self,
        task_id: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError>;

    /// Removes the task. Its seen records are left in place.
    async fn delete_task(&self, task_id: &str) -> Result<bool, StoreError>;

    async fn append_log(&self, task_id: &str, entry: &TaskLogEntry) -> Result<(), StoreError>;

    async fn has_seen(&self, task_id: &str, listing_id: &str) -> Result<bool, StoreError>;

    async fn seen_among(
        &self,
        task_id: &str,
        listing_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let mut seen = HashSet::new();
        for id in listing_ids {
            if self.has_seen(task_id, id).await? {
                seen.insert(id.clone());
            }
        }
        Ok(seen)
    }

    /// Idempotent insert; returns how many records did not exist before.
    async fn mark_seen(
        &self,
        task_id: &str,
        listing_ids: &[String],
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    async fn seen_count(&self, task_id: &str) -> Result<usize, StoreError>;

    /// Takes the run lease unless another unexpired lease is held.
    async fn try_acquire_lease(
        &self,
        task_id: &str,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<Option<RunLease>, StoreError>;

    async fn release_lease(&self, lease: &RunLease) -> Result<(), StoreError>;

    /// Writes seen records, counters, schedule and log entry in one unit.
    /// Fails with [`StoreError::LeaseLost`] if `commit.lease_owner` no
    /// longer holds the task's lease.
    async fn commit_run(&self, commit: &RunCommit) -> Result<CommitReceipt, StoreError>;

    /// Pushes the cooldown forward without touching counters.
    async fn reschedule(
        &self,
        task_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: HashMap<String, Task>,
    seen: HashMap<String, HashSet<String>>,
    leases: HashMap<String, RunLease>,
}

/// In-process store for tests and single-node runs without Postgres.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        Ok(self.state.lock().await.tasks.get(task_id).cloned())
    }

    async fn list_tasks(&self, user_id: Option<&str>) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| user_id.map_or(true, |u| t.user_id == u))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn set_active(
        &self,
        task_id: &str,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(task) = state.tasks.get_mut(task_id) else {
            return Ok(None);
        };
        if active {
            task.resume(now);
        } else {
            task.pause(now);
        }
        Ok(Some(task.clone()))
    }

    async fn delete_task(&self, task_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.leases.remove(task_id);
        Ok(state.tasks.remove(task_id).is_some())
    }

    async fn append_log(&self, task_id: &str, entry: &TaskLogEntry) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        task.logs.push(entry.clone());
        Ok(())
    }

    async fn has_seen(&self, task_id: &str, listing_id: &str) -> Result<bool, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .seen
            .get(task_id)
            .is_some_and(|ids| ids.contains(listing_id)))
    }

    async fn seen_among(
        &self,
        task_id: &str,
        listing_ids: &[String],
    ) -> Result<HashSet<String>, StoreError> {
        let state = self.state.lock().await;
        let Some(ids) = state.seen.get(task_id) else {
            return Ok(HashSet::new());
        };
        Ok(listing_ids
            .iter()
            .filter(|id| ids.contains(id.as_str()))
            .cloned()
            .collect())
    }

    async fn mark_seen(
        &self,
        task_id: &str,
        listing_ids: &[String],
        _now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let ids = state.seen.entry(task_id.to_string()).or_default();
        Ok(listing_ids
            .iter()
            .filter(|id| ids.insert((*id).clone()))
            .count())
    }

    async fn seen_count(&self, task_id: &str) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.seen.get(task_id).map_or(0, HashSet::len))
    }

    async fn try_acquire_lease(
        &self,
        task_id: &str,
        owner: Uuid,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<Option<RunLease>, StoreError> {
        let mut state = self.state.lock().await;
        if !state.tasks.contains_key(task_id) {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        if let Some(held) = state.leases.get(task_id) {
            if !held.is_expired(now) {
                return Ok(None);
            }
            debug!(task_id, previous_owner = %held.owner, "taking over expired run lease");
        }
        let lease = RunLease::new(task_id, owner, now, ttl);
        state.leases.insert(task_id.to_string(), lease.clone());
        Ok(Some(lease))
    }

    async fn release_lease(&self, lease: &RunLease) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state
            .leases
            .get(&lease.task_id)
            .is_some_and(|held| held.owner == lease.owner)
        {
            state.leases.remove(&lease.task_id);
        }
        Ok(())
    }

    async fn commit_run(&self, commit: &RunCommit) -> Result<CommitReceipt, StoreError> {
        let mut state = self.state.lock().await;
        let MemoryState { tasks, seen, leases } = &mut *state;

        if !leases
            .get(&commit.task_id)
            .is_some_and(|held| held.owner == commit.lease_owner)
        {
            return Err(StoreError::LeaseLost(commit.task_id.clone()));
        }
        let task = tasks
            .get_mut(&commit.task_id)
            .ok_or_else(|| StoreError::TaskNotFound(commit.task_id.clone()))?;

        let ids = seen.entry(commit.task_id.clone()).or_default();
        let newly_seen = commit
            .seen_listing_ids
            .iter()
            .filter(|id| ids.insert((*id).clone()))
            .count();
        task.apply_commit(commit);

        Ok(CommitReceipt {
            newly_seen,
            next_cooldown: task.next_cooldown,
        })
    }

    async fn reschedule(
        &self,
        task_id: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let task = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| StoreError::TaskNotFound(task_id.to_string()))?;
        task.last_run = Some(completed_at);
        task.next_cooldown =
            listwatch_core::next_eligible_time(completed_at, task.frequency_minutes);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            global_concurrency: 8,
            per_host_concurrency: 2,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Spaces out requests; each `take` consumes one token.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed();
                if !self.refill_every.is_zero() && elapsed >= self.refill_every {
                    let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                    state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                    state.last_refill = Instant::now();
                }
                if state.tokens > 0 {
                    state.tokens -= 1;
                    return;
                }
            }
            tokio::time::sleep(self.refill_every).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

/// GET-only HTTP client with bounded retries, global and per-host
/// concurrency limits and an optional token bucket.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_host_limit: usize,
    per_host: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        Ok(Self {
            client: builder.build()?,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_host_limit: config.per_host_concurrency.max(1),
            per_host: Mutex::new(HashMap::new()),
            token_bucket: config
                .token_bucket
                .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every))),
            backoff: config.backoff,
        })
    }

    async fn host_semaphore(&self, host: &str) -> Arc<Semaphore> {
        let mut map = self.per_host.lock().await;
        map.entry(host.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_host_limit)))
            .clone()
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let parsed = reqwest::Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?
            .to_string();

        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;
        let per_host = self.host_semaphore(&host).await;
        let _host = per_host.acquire().await.map_err(|_| FetchError::Closed)?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        self.fetch_with_retries(parsed)
            .instrument(info_span!("http_fetch", host = %host, url))
            .await
    }

    async fn fetch_with_retries(&self, url: reqwest::Url) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url.clone()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable || !can_retry {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    debug!(%status, attempt, "retryable http status");
                }
                Err(err) => {
                    let retryable = classify_reqwest_error(&err) != RetryDisposition::NonRetryable;
                    if !retryable || !can_retry {
                        return Err(FetchError::Request(err));
                    }
                    debug!(error = %err, attempt, "retryable request error");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use listwatch_core::{FetchStatus, LogLevel, NewTask, Strictness};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 24, 12, 0, 0).single().unwrap()
    }

    fn task(id: &str) -> Task {
        NewTask {
            user_id: "user-1".into(),
            name: "Bike".into(),
            description: "road bike 54cm".into(),
            location: "94105".into(),
            distance: 15,
            frequency_minutes: 60,
            notification_target: "https://hooks.test/abc".into(),
            strictness: Strictness::Strict,
            enable_initial_scrape: false,
            initial_scrape_count: 6,
        }
        .into_task(id, t0())
        .unwrap()
    }

    fn commit(task_id: &str, owner: Uuid, ids: &[&str]) -> RunCommit {
        RunCommit {
            task_id: task_id.into(),
            lease_owner: owner,
            completed_at: t0(),
            seen_listing_ids: ids.iter().map(|s| s.to_string()).collect(),
            scraped: ids.len() as u64,
            matches: 0,
            count_run: true,
            fetch: FetchStatus::Succeeded,
            advance_cooldown: true,
            log_entry: Some(TaskLogEntry::new(t0(), LogLevel::Info, "run")),
        }
    }

    #[tokio::test]
    async fn mark_seen_is_idempotent() {
        let store = MemoryStore::new();
        store.insert_task(&task("t")).await.unwrap();
        let ids = vec!["a".to_string(), "b".to_string()];
        assert_eq!(store.mark_seen("t", &ids, t0()).await.unwrap(), 2);
        assert_eq!(store.mark_seen("t", &ids, t0()).await.unwrap(), 0);
        assert_eq!(store.seen_count("t").await.unwrap(), 2);
        assert!(store.has_seen("t", "a").await.unwrap());
        assert!(!store.has_seen("other", "a").await.unwrap());

        let candidates = vec!["a".to_string(), "z".to_string()];
        let seen = store.seen_among("t", &candidates).await.unwrap();
        assert_eq!(seen, HashSet::from(["a".to_string()]));
    }

    #[tokio::test]
    async fn lease_excludes_second_owner_until_expiry() {
        let store = MemoryStore::new();
        store.insert_task(&task("t")).await.unwrap();
        let ttl = chrono::Duration::seconds(60);

        let first = store
            .try_acquire_lease("t", Uuid::new_v4(), t0(), ttl)
            .await
            .unwrap()
            .expect("first lease");
        assert!(store
            .try_acquire_lease("t", Uuid::new_v4(), t0(), ttl)
            .await
            .unwrap()
            .is_none());

        let later = t0() + chrono::Duration::seconds(61);
        let takeover = store
            .try_acquire_lease("t", Uuid::new_v4(), later, ttl)
            .await
            .unwrap()
            .expect("expired lease is taken over");
        assert_ne!(takeover.owner, first.owner);

        // a stale owner cannot release or commit against the new lease
        store.release_lease(&first).await.unwrap();
        let err = store
            .commit_run(&commit("t", first.owner, &["a"]))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LeaseLost(_)));
        assert_eq!(store.seen_count("t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn commit_applies_counters_seen_and_schedule() {
        let store = MemoryStore::new();
        store.insert_task(&task("t")).await.unwrap();
        let owner = Uuid::new_v4();
        let lease = store
            .try_acquire_lease("t", owner, t0(), chrono::Duration::seconds(60))
            .await
            .unwrap()
            .unwrap();

        let receipt = store.commit_run(&commit("t", owner, &["a", "b"])).await.unwrap();
        assert_eq!(receipt.newly_seen, 2);
        assert_eq!(receipt.next_cooldown, t0() + chrono::Duration::minutes(60));
        store.release_lease(&lease).await.unwrap();

        let stored = store.get_task("t").await.unwrap().unwrap();
        assert_eq!(stored.total_runs, 1);
        assert_eq!(stored.total_scrapes, 2);
        assert_eq!(stored.logs.latest().unwrap().message, "run");
        assert!(store
            .try_acquire_lease("t", Uuid::new_v4(), t0(), chrono::Duration::seconds(60))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn delete_leaves_seen_records_orphaned() {
        let store = MemoryStore::new();
        store.insert_task(&task("t")).await.unwrap();
        store.mark_seen("t", &["a".to_string()], t0()).await.unwrap();
        assert!(store.delete_task("t").await.unwrap());
        assert!(!store.delete_task("t").await.unwrap());
        assert!(store.get_task("t").await.unwrap().is_none());
        assert_eq!(store.seen_count("t").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn eligible_tasks_skip_paused_and_cooling_down() {
        let store = MemoryStore::new();
        store.insert_task(&task("a")).await.unwrap();
        store.insert_task(&task("b")).await.unwrap();
        store.insert_task(&task("c")).await.unwrap();
        store.set_active("b", false, t0()).await.unwrap();
        store.reschedule("c", t0() + chrono::Duration::minutes(30)).await.unwrap();

        let now = t0() + chrono::Duration::minutes(60);
        let eligible = store.eligible_tasks(now).await.unwrap();
        let ids: Vec<_> = eligible.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn throttling_statuses_are_retryable() {
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }
}
