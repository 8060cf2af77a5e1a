//! Background job queue with priorities, retries, and retention
//!
//! Jobs are dequeued highest priority first, FIFO within a priority. A
//! failed attempt is rescheduled after its backoff delay until
//! `max_attempts` is reached, then the job is marked failed and handed to
//! the dead letter queue if one is configured. Finished jobs are kept for
//! inspection up to the configured retention counts.
//!
//! Every change to the job table is written to the `JobStore` before the
//! call returns, so a queue built with a durable store resumes its pending
//! work after a restart.

pub mod jobs;
pub mod store;

pub use jobs::BackgroundJob;
pub use store::{FileJobStore, JobStore, MemoryJobStore};

use crate::config::QueueConfig;
use crate::dlq::{DeadLetterJob, DlqHandler};
use crate::error::{BoxError, Result, StreamError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// How long an idle worker sleeps before re-checking the queue
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Failed jobs above which the queue reports unhealthy
const MAX_HEALTHY_FAILED: usize = 100;

/// Waiting jobs above which the queue reports unhealthy
const MAX_HEALTHY_WAITING: usize = 1_000;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Active,
    Completed,
    Failed,
    /// Waiting for a backoff or initial delay to elapse
    Delayed,
}

/// Delay between failed attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum BackoffPolicy {
    /// `delay_ms * 2^(attempt - 1)`
    Exponential { delay_ms: u64 },
    /// Constant `delay_ms`
    Fixed { delay_ms: u64 },
}

impl BackoffPolicy {
    /// Delay before the next attempt, after `attempts_made` attempts (1-based)
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        match *self {
            Self::Exponential { delay_ms } => {
                let exponent = attempts_made.saturating_sub(1).min(20);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exponent))
            }
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
        }
    }
}

/// One unit of background work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,

    #[serde(rename = "type")]
    pub job_type: String,

    pub payload: serde_json::Value,

    /// Higher runs first
    pub priority: i32,

    /// Attempts made so far
    pub attempts: u32,

    pub max_attempts: u32,

    pub backoff: BackoffPolicy,

    pub state: JobState,

    /// Enqueue order, breaks ties within a priority
    pub sequence: u64,

    pub created_at: DateTime<Utc>,

    /// Wall-clock time a delayed job becomes runnable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
}

/// Per-job overrides of the queue defaults
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub priority: i32,
    pub max_attempts: Option<u32>,
    pub backoff: Option<BackoffPolicy>,
    /// Hold the job back before its first attempt
    pub delay: Option<Duration>,
}

impl JobOptions {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Executes jobs of one type
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> std::result::Result<(), BoxError>;
}

/// `JobHandler` backed by an async closure
pub struct FnHandler<F>(F);

/// Wrap an async closure as a `JobHandler`
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), BoxError>> + Send,
{
    async fn handle(&self, job: &Job) -> std::result::Result<(), BoxError> {
        (self.0)(job.clone()).await
    }
}

/// Job counts per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub waiting: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
    pub delayed: usize,
    pub paused: bool,
}

/// Queue health summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub healthy: bool,
    pub issues: Vec<String>,
    pub stats: JobStats,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct WaitingEntry {
    priority: i32,
    order: Reverse<u64>,
    id: String,
}

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    waiting: BinaryHeap<WaitingEntry>,
    delayed: BinaryHeap<Reverse<(Instant, u64, String)>>,
}

impl QueueState {
    fn push_waiting(&mut self, job: &Job) {
        self.waiting.push(WaitingEntry {
            priority: job.priority,
            order: Reverse(job.sequence),
            id: job.id.clone(),
        });
    }

    /// Move delayed jobs whose time has come into the waiting heap
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse((ready_at, _, _))) = self.delayed.peek() {
            if *ready_at > now {
                break;
            }
            let Some(Reverse((_, _, id))) = self.delayed.pop() else {
                break;
            };
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            if job.state != JobState::Delayed {
                continue;
            }
            job.state = JobState::Waiting;
            job.ready_at = None;
            let job = job.clone();
            self.push_waiting(&job);
        }
    }

    /// Pop the next runnable job, skipping stale heap entries
    fn pop_waiting(&mut self) -> Option<String> {
        while let Some(entry) = self.waiting.pop() {
            if self
                .jobs
                .get(&entry.id)
                .is_some_and(|job| job.state == JobState::Waiting)
            {
                return Some(entry.id);
            }
        }
        None
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((at, _, _))| *at)
    }

    /// Drop the oldest jobs in `state` beyond the newest `keep`, returning them
    fn prune(&mut self, state: JobState, keep: usize) -> Vec<Job> {
        let mut finished: Vec<(u64, String)> = self
            .jobs
            .values()
            .filter(|job| job.state == state)
            .map(|job| (job.sequence, job.id.clone()))
            .collect();
        if finished.len() <= keep {
            return Vec::new();
        }
        finished.sort_unstable();
        let excess = finished.len() - keep;
        finished
            .into_iter()
            .take(excess)
            .filter_map(|(_, id)| self.jobs.remove(&id))
            .collect()
    }

    fn restore(&mut self, jobs: impl IntoIterator<Item = Job>) {
        for job in jobs {
            self.jobs.insert(job.id.clone(), job);
        }
    }

    fn stats(&self, paused: bool) -> JobStats {
        let mut stats = JobStats {
            paused,
            ..JobStats::default()
        };
        for job in self.jobs.values() {
            match job.state {
                JobState::Waiting => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
                JobState::Delayed => stats.delayed += 1,
            }
        }
        stats
    }
}

/// Priority job queue
pub struct JobQueue {
    name: String,
    config: QueueConfig,
    state: Mutex<QueueState>,
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
    store: Arc<dyn JobStore>,
    dlq: Option<Arc<dyn DlqHandler>>,
    notify: Notify,
    paused: AtomicBool,
    sequence: AtomicU64,
}

impl JobQueue {
    /// Create a queue backed by an in-memory store
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self::build(name.into(), config, Arc::new(MemoryJobStore::default()), QueueState::default(), 0)
    }

    /// Create a queue backed by `store`, resuming any jobs it holds
    ///
    /// Jobs that were active when the snapshot was taken run again. Delayed
    /// jobs keep whatever is left of their delay.
    pub fn with_store(
        name: impl Into<String>,
        config: QueueConfig,
        store: Arc<dyn JobStore>,
    ) -> Result<Self> {
        let name = name.into();
        let jobs = store.load()?;

        let mut state = QueueState::default();
        let mut next_sequence = 0;
        let mut resumed = 0;
        let now = Instant::now();
        for (id, mut job) in jobs {
            next_sequence = next_sequence.max(job.sequence + 1);
            match job.state {
                JobState::Waiting | JobState::Active => {
                    job.state = JobState::Waiting;
                    job.ready_at = None;
                    state.push_waiting(&job);
                    resumed += 1;
                }
                JobState::Delayed => {
                    // Already-elapsed deadlines come back as zero
                    let remaining = job
                        .ready_at
                        .and_then(|at| (at - Utc::now()).to_std().ok())
                        .unwrap_or(Duration::ZERO);
                    state
                        .delayed
                        .push(Reverse((now + remaining, job.sequence, job.id.clone())));
                    resumed += 1;
                }
                JobState::Completed | JobState::Failed => {}
            }
            state.jobs.insert(id, job);
        }

        tracing::info!(queue = %name, jobs = state.jobs.len(), resumed, "Job queue restored");
        Ok(Self::build(name, config, store, state, next_sequence))
    }

    fn build(
        name: String,
        config: QueueConfig,
        store: Arc<dyn JobStore>,
        state: QueueState,
        next_sequence: u64,
    ) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(state),
            handlers: RwLock::new(HashMap::new()),
            store,
            dlq: None,
            notify: Notify::new(),
            paused: AtomicBool::new(false),
            sequence: AtomicU64::new(next_sequence),
        }
    }

    /// Route jobs that exhaust their attempts to `dlq`
    pub fn with_dlq(mut self, dlq: Arc<dyn DlqHandler>) -> Self {
        self.dlq = Some(dlq);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register the handler for a job type, replacing any previous one
    pub fn register_handler(&self, job_type: &str, handler: Arc<dyn JobHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_type.to_string(), handler);
        tracing::debug!(queue = %self.name, job_type, "Job handler registered");
    }

    // ─── Producers ────────────────────────────────────────────────

    /// Add a job and persist it
    pub fn enqueue(
        &self,
        job_type: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Job> {
        let delay = options.delay.filter(|d| !d.is_zero());
        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type.to_string(),
            payload,
            priority: options.priority,
            attempts: 0,
            max_attempts: options
                .max_attempts
                .unwrap_or(self.config.default_attempts)
                .max(1),
            backoff: options.backoff.unwrap_or(BackoffPolicy::Exponential {
                delay_ms: self.config.backoff_base_ms,
            }),
            state: if delay.is_some() {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            created_at: Utc::now(),
            ready_at: delay.and_then(wall_deadline),
            completed_at: None,
            failed_at: None,
            failed_reason: None,
        };

        {
            let mut state = self.lock();
            state.jobs.insert(job.id.clone(), job.clone());
            if let Err(e) = self.store.save(&state.jobs) {
                state.jobs.remove(&job.id);
                return Err(e);
            }
            match delay {
                Some(delay) => state.delayed.push(Reverse((
                    Instant::now() + delay,
                    job.sequence,
                    job.id.clone(),
                ))),
                None => state.push_waiting(&job),
            }
        }
        self.notify.notify_one();

        tracing::info!(
            queue = %self.name,
            job_id = %job.id,
            job_type,
            priority = job.priority,
            "Job enqueued"
        );
        Ok(job)
    }

    /// Enqueue a typed background job at its default priority
    pub fn enqueue_background(&self, job: &BackgroundJob) -> Result<Job> {
        self.enqueue(
            job.job_type(),
            job.to_payload()?,
            JobOptions::priority(job.default_priority()),
        )
    }

    // ─── Execution ────────────────────────────────────────────────

    /// Run the next due job, if any, and return its updated record
    ///
    /// Returns `None` when the queue is paused or nothing is runnable.
    pub async fn process_next(&self) -> Option<Job> {
        if self.is_paused() {
            return None;
        }

        let job = {
            let mut state = self.lock();
            state.promote_due(Instant::now());
            let id = state.pop_waiting()?;
            let job = state.jobs.get_mut(&id)?;
            job.state = JobState::Active;
            job.attempts += 1;
            let job = job.clone();
            self.persist(&state);
            job
        };

        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&job.job_type)
            .cloned();

        tracing::debug!(
            queue = %self.name,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "Processing job"
        );

        // Jobs nobody can handle fail without retries
        let retryable = handler.is_some();
        let outcome = match handler {
            Some(handler) => handler.handle(&job).await.map_err(|e| e.to_string()),
            None => Err(format!("No handler registered for job type '{}'", job.job_type)),
        };

        let (snapshot, dead) = {
            let mut state = self.lock();
            let Some(record) = state.jobs.get_mut(&job.id) else {
                // Removed while running
                return Some(job);
            };

            let mut dead = None;
            match &outcome {
                Ok(()) => {
                    record.state = JobState::Completed;
                    record.ready_at = None;
                    record.completed_at = Some(Utc::now());
                    record.failed_reason = None;
                    tracing::info!(queue = %self.name, job_id = %record.id, "Job completed");
                }
                Err(reason) if retryable && record.attempts < record.max_attempts => {
                    let delay = record.backoff.delay_for_attempt(record.attempts);
                    record.state = JobState::Delayed;
                    record.ready_at = wall_deadline(delay);
                    record.failed_reason = Some(reason.clone());
                    tracing::warn!(
                        queue = %self.name,
                        job_id = %record.id,
                        attempt = record.attempts,
                        max_attempts = record.max_attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %reason,
                        "Job attempt failed, retrying"
                    );
                    let entry = Reverse((Instant::now() + delay, record.sequence, record.id.clone()));
                    state.delayed.push(entry);
                }
                Err(reason) => {
                    record.state = JobState::Failed;
                    record.ready_at = None;
                    record.failed_at = Some(Utc::now());
                    record.failed_reason = Some(reason.clone());
                    tracing::error!(
                        queue = %self.name,
                        job_id = %record.id,
                        attempts = record.attempts,
                        error = %reason,
                        "Job failed"
                    );
                    dead = Some(DeadLetterJob::new(record.clone(), reason.clone()));
                }
            }

            let snapshot = state.jobs.get(&job.id).cloned();
            state.prune(JobState::Completed, self.config.keep_completed);
            state.prune(JobState::Failed, self.config.keep_failed);
            self.persist(&state);
            (snapshot, dead)
        };

        if outcome.is_err() {
            // A retry may already be due (zero backoff)
            self.notify.notify_one();
        }

        if let (Some(dlq), Some(entry)) = (&self.dlq, dead) {
            if let Err(e) = dlq.handle(entry).await {
                tracing::warn!(queue = %self.name, job_id = %job.id, error = %e, "Dead letter routing failed");
            }
        }

        snapshot.or(Some(job))
    }

    /// Spawn a worker that processes jobs until stopped
    pub fn start(self: &Arc<Self>) -> JobWorker {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let queue = Arc::clone(self);

        let handle = tokio::spawn(async move {
            tracing::info!(queue = %queue.name, "Job worker started");
            loop {
                if *stop_rx.borrow() {
                    break;
                }
                if queue.process_next().await.is_some() {
                    continue;
                }

                let wait = queue
                    .next_due_in()
                    .map_or(IDLE_POLL, |due| due.min(IDLE_POLL));
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = queue.notify.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            tracing::info!(queue = %queue.name, "Job worker stopped");
        });

        JobWorker {
            stop: stop_tx,
            handle,
        }
    }

    // ─── Management ───────────────────────────────────────────────

    /// Requeue a failed job with a fresh attempt budget
    ///
    /// Returns false if the job exists but is not in the failed state.
    pub fn retry(&self, job_id: &str) -> Result<bool> {
        {
            let mut state = self.lock();
            let Some(job) = state.jobs.get_mut(job_id) else {
                return Err(StreamError::NotFound(format!("job {}", job_id)));
            };
            if job.state != JobState::Failed {
                return Ok(false);
            }
            let previous = job.clone();
            job.state = JobState::Waiting;
            job.attempts = 0;
            job.failed_at = None;
            job.failed_reason = None;
            let job = job.clone();
            if let Err(e) = self.store.save(&state.jobs) {
                state.restore([previous]);
                return Err(e);
            }
            state.push_waiting(&job);
        }
        self.notify.notify_one();
        tracing::info!(queue = %self.name, job_id, "Job retried");
        Ok(true)
    }

    /// Delete a job in any state; returns false if it did not exist
    pub fn remove(&self, job_id: &str) -> Result<bool> {
        let mut state = self.lock();
        let Some(previous) = state.jobs.remove(job_id) else {
            return Ok(false);
        };
        if let Err(e) = self.store.save(&state.jobs) {
            state.restore([previous]);
            return Err(e);
        }
        tracing::info!(queue = %self.name, job_id, "Job removed");
        Ok(true)
    }

    /// Stop dequeuing; queued jobs are kept
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
        tracing::info!(queue = %self.name, "Job queue paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
        self.notify.notify_one();
        tracing::info!(queue = %self.name, "Job queue resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Keep only the newest `keep` completed jobs; returns how many were removed
    pub fn clean_completed(&self, keep: usize) -> Result<usize> {
        self.clean(JobState::Completed, keep)
    }

    /// Keep only the newest `keep` failed jobs; returns how many were removed
    pub fn clean_failed(&self, keep: usize) -> Result<usize> {
        self.clean(JobState::Failed, keep)
    }

    fn clean(&self, target: JobState, keep: usize) -> Result<usize> {
        let mut state = self.lock();
        let pruned = state.prune(target, keep);
        let removed = pruned.len();
        if removed > 0 {
            if let Err(e) = self.store.save(&state.jobs) {
                state.restore(pruned);
                return Err(e);
            }
            tracing::info!(queue = %self.name, state = ?target, removed, "Jobs cleaned");
        }
        Ok(removed)
    }

    // ─── Queries ──────────────────────────────────────────────────

    pub fn get_stats(&self) -> JobStats {
        self.lock().stats(self.is_paused())
    }

    pub fn get_job(&self, job_id: &str) -> Option<Job> {
        self.lock().jobs.get(job_id).cloned()
    }

    /// Most recently enqueued jobs, newest first
    pub fn recent_jobs(&self, limit: usize) -> Vec<Job> {
        let state = self.lock();
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        jobs.truncate(limit);
        jobs
    }

    /// Health summary with the reasons the queue is unhealthy, if any
    pub fn health(&self) -> QueueHealth {
        let stats = self.get_stats();
        let mut issues = Vec::new();
        if stats.failed > MAX_HEALTHY_FAILED {
            issues.push(format!("High number of failed jobs: {}", stats.failed));
        }
        if stats.waiting > MAX_HEALTHY_WAITING {
            issues.push(format!("High number of waiting jobs: {}", stats.waiting));
        }
        if stats.paused {
            issues.push("Queue is paused".to_string());
        }
        QueueHealth {
            healthy: issues.is_empty(),
            issues,
            stats,
        }
    }

    fn next_due_in(&self) -> Option<Duration> {
        let due = self.lock().next_due()?;
        Some(due.saturating_duration_since(Instant::now()))
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, state: &QueueState) {
        if let Err(e) = self.store.save(&state.jobs) {
            tracing::warn!(queue = %self.name, error = %e, "Failed to persist job table");
        }
    }
}

/// Wall-clock time `delay` from now
fn wall_deadline(delay: Duration) -> Option<DateTime<Utc>> {
    let delay = chrono::Duration::from_std(delay).ok()?;
    Utc::now().checked_add_signed(delay)
}

/// Handle to a running queue worker
pub struct JobWorker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl JobWorker {
    /// Signal the worker and wait for the job in progress to finish
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(error = %e, "Job worker terminated abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
