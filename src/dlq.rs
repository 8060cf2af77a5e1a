//! Dead Letter Queue: jobs that exhausted their attempts
//!
//! Provides a `DlqHandler` trait for routing permanently failed jobs. The
//! job queue keeps its own bounded failed list for inspection; a DLQ handler
//! receives every exhausted job so it can be stored, forwarded, or alerted
//! on outside the queue's retention window.

use crate::error::Result;
use crate::queue::Job;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A failed job with context about why it ended up in the DLQ
#[derive(Debug, Clone)]
pub struct DeadLetterJob {
    /// Snapshot of the job at the time it failed for good
    pub job: Job,

    /// Reason the job was sent to DLQ
    pub reason: String,

    /// When the job was dead-lettered
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterJob {
    /// Create a new dead letter entry
    pub fn new(job: Job, reason: impl Into<String>) -> Self {
        Self {
            job,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Trait for dead letter queue handlers
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Handle a dead-lettered job
    async fn handle(&self, entry: DeadLetterJob) -> Result<()>;

    /// Get the number of jobs currently in the DLQ
    async fn count(&self) -> Result<usize>;

    /// List recent dead-lettered jobs, most recent first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterJob>>;
}

/// In-memory DLQ handler for development and testing
///
/// Stores dead-lettered jobs in a `Vec` with configurable max capacity.
pub struct MemoryDlqHandler {
    entries: Arc<RwLock<Vec<DeadLetterJob>>>,
    max_entries: usize,
}

impl MemoryDlqHandler {
    /// Create a new in-memory DLQ handler
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            max_entries,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, entry: DeadLetterJob) -> Result<()> {
        tracing::warn!(
            job_id = %entry.job.id,
            job_type = %entry.job.job_type,
            attempts = entry.job.attempts,
            reason = %entry.reason,
            "Job dead-lettered"
        );

        let mut entries = self.entries.write().await;
        entries.push(entry);

        // Enforce max capacity
        if self.max_entries > 0 && entries.len() > self.max_entries {
            let drain_count = entries.len() - self.max_entries;
            entries.drain(..drain_count);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetterJob>> {
        let entries = self.entries.read().await;
        Ok(entries.iter().rev().take(limit).cloned().collect())
    }
}
