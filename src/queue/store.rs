//! Durable job store
//!
//! The queue writes a full snapshot of its job table after every change and
//! reloads it on start. `FileJobStore` keeps the snapshot as JSON on disk
//! using an atomic temp-file + rename write.

use super::Job;
use crate::error::{Result, StreamError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Trait for persisting the job table
pub trait JobStore: Send + Sync {
    /// Save every job
    fn save(&self, jobs: &HashMap<String, Job>) -> Result<()>;

    /// Load every job
    fn load(&self) -> Result<HashMap<String, Job>>;
}

/// JSON file-based job store
///
/// Atomic writes via temp file + rename to prevent corruption.
pub struct FileJobStore {
    path: PathBuf,
}

impl FileJobStore {
    /// Create a new file job store at the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JobStore for FileJobStore {
    fn save(&self, jobs: &HashMap<String, Job>) -> Result<()> {
        let json = serde_json::to_string_pretty(jobs)?;

        // Atomic write: write to temp file, then rename
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StreamError::Store(format!(
                    "Failed to create job store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        std::fs::write(&tmp_path, json).map_err(|e| {
            StreamError::Store(format!(
                "Failed to write job store {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            StreamError::Store(format!(
                "Failed to rename job store {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %self.path.display(), jobs = jobs.len(), "Job snapshot saved");
        Ok(())
    }

    fn load(&self) -> Result<HashMap<String, Job>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let json = std::fs::read_to_string(&self.path).map_err(|e| {
            StreamError::Store(format!(
                "Failed to read job store {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let jobs: HashMap<String, Job> = serde_json::from_str(&json).map_err(|e| {
            StreamError::Store(format!(
                "Failed to parse job store {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %self.path.display(), count = jobs.len(), "Job snapshot loaded");
        Ok(jobs)
    }
}

/// In-memory job store
///
/// Lost on drop; the default for queues that do not need durability.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: std::sync::RwLock<HashMap<String, Job>>,
}

impl JobStore for MemoryJobStore {
    fn save(&self, jobs: &HashMap<String, Job>) -> Result<()> {
        let mut state = self
            .jobs
            .write()
            .map_err(|e| StreamError::Store(format!("Lock poisoned: {}", e)))?;
        *state = jobs.clone();
        Ok(())
    }

    fn load(&self) -> Result<HashMap<String, Job>> {
        let state = self
            .jobs
            .read()
            .map_err(|e| StreamError::Store(format!("Lock poisoned: {}", e)))?;
        Ok(state.clone())
    }
}
