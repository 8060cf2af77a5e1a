//! Graceful shutdown: ordered, individually time-boxed steps
//!
//! Steps run one at a time in ascending priority (ties keep registration
//! order). Each step runs on its own task under a timeout; a step that
//! fails, panics, or times out is logged and the remaining steps still run.
//!
//! [`steps`] provides the built-in steps for the streaming core: stop
//! accepting streams, drain active sessions, stop the job worker, close
//! connections, and reset circuit breakers.

use crate::config::ShutdownConfig;
use crate::error::{Result, StreamError};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Priority given to steps that do not set one
pub const DEFAULT_PRIORITY: u32 = 50;

type StepAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// One named unit of shutdown work
pub struct ShutdownStep {
    name: String,
    priority: u32,
    timeout: Option<Duration>,
    action: StepAction,
}

impl ShutdownStep {
    /// Create a step with the default priority and timeout
    pub fn new<F, Fut>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            priority: DEFAULT_PRIORITY,
            timeout: None,
            action: Box::new(move || Box::pin(action())),
        }
    }

    /// Lower runs first
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }
}

impl std::fmt::Debug for ShutdownStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownStep")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// How a step ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "error", rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Failed(String),
    TimedOut,
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepReport {
    pub name: String,
    pub priority: u32,
    pub outcome: StepOutcome,
    pub elapsed_ms: u64,
}

/// Result of a full shutdown run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub reason: String,
    pub steps: Vec<StepReport>,
    pub elapsed_ms: u64,
}

impl ShutdownReport {
    /// True if every step completed
    pub fn is_clean(&self) -> bool {
        self.steps
            .iter()
            .all(|s| s.outcome == StepOutcome::Completed)
    }

    pub fn step(&self, name: &str) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Snapshot for health endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownStatus {
    pub is_shutting_down: bool,
    pub registered_steps: Vec<String>,
    pub completed_steps: Vec<String>,
}

/// Runs registered shutdown steps once
pub struct ShutdownCoordinator {
    config: ShutdownConfig,
    steps: Mutex<Vec<ShutdownStep>>,
    registered: Mutex<Vec<String>>,
    completed: Mutex<Vec<String>>,
    shutting_down: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(config: ShutdownConfig) -> Self {
        Self {
            config,
            steps: Mutex::new(Vec::new()),
            registered: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ShutdownConfig {
        &self.config
    }

    /// Add a step; rejected once shutdown has begun
    pub fn register(&self, step: ShutdownStep) -> Result<()> {
        if self.is_shutting_down() {
            tracing::warn!(step = %step.name, "Shutdown in progress, step not registered");
            return Err(StreamError::ShutdownInProgress);
        }

        let mut steps = lock(&self.steps);
        let index = steps.partition_point(|s| s.priority <= step.priority);
        tracing::debug!(step = %step.name, priority = step.priority, "Shutdown step registered");
        lock(&self.registered).insert(index, step.name.clone());
        steps.insert(index, step);
        Ok(())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Healthy until shutdown begins
    pub fn is_healthy(&self) -> bool {
        !self.is_shutting_down()
    }

    pub fn status(&self) -> ShutdownStatus {
        ShutdownStatus {
            is_shutting_down: self.is_shutting_down(),
            registered_steps: lock(&self.registered).clone(),
            completed_steps: lock(&self.completed).clone(),
        }
    }

    /// Run every registered step in priority order
    ///
    /// Only the first call runs the steps; later calls get
    /// `ShutdownInProgress`.
    pub async fn shutdown(&self, reason: &str) -> Result<ShutdownReport> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            tracing::warn!(reason, "Shutdown already in progress, ignoring");
            return Err(StreamError::ShutdownInProgress);
        }

        let steps = std::mem::take(&mut *lock(&self.steps));
        tracing::info!(reason, steps = steps.len(), "Graceful shutdown started");

        let started = Instant::now();
        let mut reports = Vec::with_capacity(steps.len());
        for step in steps {
            let report = self.run_step(step).await;
            if report.outcome == StepOutcome::Completed {
                lock(&self.completed).push(report.name.clone());
            }
            reports.push(report);
        }

        let report = ShutdownReport {
            reason: reason.to_string(),
            steps: reports,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            reason,
            elapsed_ms = report.elapsed_ms,
            clean = report.is_clean(),
            "Graceful shutdown finished"
        );
        Ok(report)
    }

    /// Wait for SIGINT/SIGTERM, then run `shutdown`
    pub fn listen(self: &Arc<Self>) -> JoinHandle<Result<ShutdownReport>> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let signal = wait_for_signal().await?;
            coordinator.shutdown(signal).await
        })
    }

    async fn run_step(&self, step: ShutdownStep) -> StepReport {
        let ShutdownStep {
            name,
            priority,
            timeout,
            action,
        } = step;
        let timeout = timeout.unwrap_or_else(|| self.config.default_step_timeout());

        tracing::info!(step = %name, priority, timeout_ms = timeout.as_millis() as u64, "Running shutdown step");
        let started = Instant::now();
        let mut task = tokio::spawn(action());

        let outcome = match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(Ok(()))) => StepOutcome::Completed,
            Ok(Ok(Err(e))) => StepOutcome::Failed(e.to_string()),
            Ok(Err(join_error)) => StepOutcome::Failed(join_error.to_string()),
            Err(_) => {
                task.abort();
                StepOutcome::TimedOut
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            StepOutcome::Completed => {
                tracing::info!(step = %name, elapsed_ms, "Shutdown step completed")
            }
            StepOutcome::Failed(error) => {
                tracing::error!(step = %name, elapsed_ms, error = %error, "Shutdown step failed")
            }
            StepOutcome::TimedOut => {
                tracing::warn!(step = %name, elapsed_ms, "Shutdown step timed out, skipping")
            }
        }

        StepReport {
            name,
            priority,
            outcome,
            elapsed_ms,
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(ShutdownConfig::default())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Resolve on Ctrl-C, or SIGTERM on Unix; returns the signal name
pub async fn wait_for_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())
            .map_err(|e| StreamError::Config(format!("Failed to install SIGTERM handler: {}", e)))?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.map_err(|e| StreamError::Config(format!("Failed to listen for Ctrl-C: {}", e)))?;
                Ok("SIGINT")
            }
            _ = term.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| StreamError::Config(format!("Failed to listen for Ctrl-C: {}", e)))?;
        Ok("SIGINT")
    }
}

/// Built-in steps for the streaming core
pub mod steps {
    use super::ShutdownStep;
    use crate::breaker::BreakerRegistry;
    use crate::broker::ConnectionBroker;
    use crate::queue::{JobQueue, JobWorker};
    use crate::session::SessionRegistry;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    /// Refuse new streams (priority 1)
    pub fn stop_new_streams(registry: Arc<SessionRegistry>) -> ShutdownStep {
        ShutdownStep::new("stop-new-streams", move || async move {
            registry.stop_accepting();
            Ok(())
        })
        .with_priority(1)
        .with_timeout(Duration::from_secs(5))
    }

    /// Wait for active sessions to finish, then cancel the rest (priority 10)
    pub fn drain_sessions(
        registry: Arc<SessionRegistry>,
        max_wait: Duration,
        poll: Duration,
    ) -> ShutdownStep {
        ShutdownStep::new("drain-sessions", move || async move {
            let deadline = Instant::now() + max_wait;
            loop {
                let active = registry.get_active_sessions().await;
                if active.is_empty() {
                    tracing::info!("All streaming sessions finished");
                    return Ok(());
                }
                if Instant::now() >= deadline {
                    break;
                }
                tracing::info!(active = active.len(), "Waiting for streaming sessions to finish");
                tokio::time::sleep(poll.min(deadline.saturating_duration_since(Instant::now()))).await;
            }

            let remaining = registry.get_active_sessions().await;
            tracing::warn!(count = remaining.len(), "Cancelling sessions still active after drain timeout");
            for session_id in &remaining {
                registry.cancel_stream(session_id).await;
            }
            Ok(())
        })
        .with_priority(10)
        .with_timeout(max_wait + Duration::from_secs(15))
    }

    /// Pause the queue and wait for the worker's current job (priority 15)
    pub fn stop_job_worker(queue: Arc<JobQueue>, worker: JobWorker) -> ShutdownStep {
        ShutdownStep::new("stop-job-worker", move || async move {
            queue.pause();
            worker.stop().await;
            Ok(())
        })
        .with_priority(15)
    }

    /// Close every client connection and detach from the broker (priority 20)
    pub fn close_connections(broker: Arc<ConnectionBroker>) -> ShutdownStep {
        ShutdownStep::new("close-connections", move || async move {
            broker.cleanup().await;
            Ok(())
        })
        .with_priority(20)
        .with_timeout(Duration::from_secs(10))
    }

    /// Reset every circuit breaker (priority 30)
    pub fn reset_breakers(registry: &'static BreakerRegistry) -> ShutdownStep {
        ShutdownStep::new("reset-circuit-breakers", move || async move {
            registry.reset_all();
            Ok(())
        })
        .with_priority(30)
        .with_timeout(Duration::from_secs(5))
    }
}
