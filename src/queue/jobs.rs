//! Typed background job payloads
//!
//! Producers in the chat and document pipelines enqueue these through
//! [`JobQueue::enqueue_background`](super::JobQueue::enqueue_background);
//! handlers decode them back with [`BackgroundJob::from_job`].

use super::Job;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What a usage event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageAction {
    Chat,
    DocumentUpload,
    Search,
    AgentExecution,
}

/// What a cleanup job removes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupTarget {
    OldChats,
    UnusedEmbeddings,
    TempFiles,
}

/// Delivery channel of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Websocket,
    Push,
}

/// Every kind of background work the platform schedules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum BackgroundJob {
    DocumentProcessing {
        collection_id: String,
        document_id: String,
        filename: String,
        user_id: String,
    },
    Embedding {
        texts: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        batch_size: Option<usize>,
    },
    UsageStats {
        user_id: String,
        action: UsageAction,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        metadata: HashMap<String, serde_json::Value>,
        timestamp: DateTime<Utc>,
    },
    Training {
        model_type: String,
        training_data: Vec<serde_json::Value>,
        configuration: serde_json::Value,
        user_id: String,
    },
    Cleanup {
        cleanup_type: CleanupTarget,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        older_than: Option<DateTime<Utc>>,
        #[serde(default)]
        dry_run: bool,
    },
    Notification {
        user_id: String,
        channel: NotificationChannel,
        title: String,
        message: String,
    },
}

impl BackgroundJob {
    /// Job type name used for handler registration
    pub fn job_type(&self) -> &'static str {
        match self {
            Self::DocumentProcessing { .. } => "document_processing",
            Self::Embedding { .. } => "embedding",
            Self::UsageStats { .. } => "usage_stats",
            Self::Training { .. } => "training",
            Self::Cleanup { .. } => "cleanup",
            Self::Notification { .. } => "notification",
        }
    }

    /// Priority used when the producer does not pick one
    pub fn default_priority(&self) -> i32 {
        match self {
            Self::Training { .. } => 15,
            Self::DocumentProcessing { .. } => 10,
            Self::Notification { .. } => 8,
            Self::Embedding { .. } => 5,
            Self::UsageStats { .. } | Self::Cleanup { .. } => 1,
        }
    }

    /// Serialize to a job payload
    pub fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode the payload of a job created from a `BackgroundJob`
    pub fn from_job(job: &Job) -> Result<Self> {
        Ok(serde_json::from_value(job.payload.clone())?)
    }
}
