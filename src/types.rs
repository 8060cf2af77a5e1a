//! Core streaming types for the a3s-stream system
//!
//! All wire types use camelCase JSON serialization for client compatibility.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a streaming session
///
/// `Idle → Active → {Completed, Errored}`. Only `Active` accepts
/// chunk and tool events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Stub created before the stream started
    Idle,
    /// Stream in progress
    Active,
    /// Stream finished normally
    Completed,
    /// Stream failed or was cancelled
    Errored,
}

/// Token counters accumulated over a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Input (prompt) tokens
    pub input: u64,
    /// Output (completion) tokens
    pub output: u64,
}

impl TokenUsage {
    /// Add a per-chunk delta to the running totals
    pub fn add(&mut self, delta: &TokenDelta) {
        self.input += delta.input.unwrap_or(0);
        self.output += delta.output.unwrap_or(0);
    }
}

/// Token counts reported alongside a single chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<u64>,
}

impl TokenDelta {
    /// Delta carrying only output tokens
    pub fn output(tokens: u64) -> Self {
        Self {
            input: None,
            output: Some(tokens),
        }
    }
}

/// Snapshot of one agent invocation tracked by the session registry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSession {
    pub session_id: String,
    pub execution_id: String,
    pub agent_id: String,
    pub user_id: String,

    /// Wall-clock start time
    pub start_time: DateTime<Utc>,

    /// True only while the session is `Active`
    pub is_active: bool,

    /// Current lifecycle state
    pub state: SessionState,

    /// Concatenation of every chunk emitted so far
    pub accumulated_response: String,

    /// Distinct tool names with a successful result, in order of first use
    pub tools_used: Vec<String>,

    pub token_usage: TokenUsage,
}

/// An immutable message describing one state change of a session
///
/// Wire shape: `{ sessionId, executionId, timestamp, type, data }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub session_id: String,
    pub execution_id: String,
    pub timestamp: DateTime<Utc>,

    /// Event type and its type-specific payload
    #[serde(flatten)]
    pub kind: StreamEventKind,
}

/// Type-specific payload of a [`StreamEvent`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum StreamEventKind {
    #[serde(rename = "stream_start")]
    Start {
        agent_id: String,
        user_id: String,
        message: String,
    },

    #[serde(rename = "stream_chunk")]
    Chunk {
        chunk: String,
        /// Full response so far, so a client that missed chunks can resync
        accumulated: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<TokenDelta>,
    },

    #[serde(rename = "stream_tool_call")]
    ToolCall {
        tool_name: String,
        tool_params: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
    },

    #[serde(rename = "stream_tool_result")]
    ToolResult {
        tool_name: String,
        result: serde_json::Value,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    #[serde(rename = "stream_complete")]
    Complete {
        final_response: String,
        tools_used: Vec<String>,
        token_usage: TokenUsage,
        /// Elapsed milliseconds between start and completion
        execution_time: u64,
    },

    #[serde(rename = "stream_error")]
    Error {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

impl StreamEventKind {
    /// Wire name of this event type (e.g. `stream_chunk`)
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "stream_start",
            Self::Chunk { .. } => "stream_chunk",
            Self::ToolCall { .. } => "stream_tool_call",
            Self::ToolResult { .. } => "stream_tool_result",
            Self::Complete { .. } => "stream_complete",
            Self::Error { .. } => "stream_error",
        }
    }

    /// Whether this event ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

impl StreamEvent {
    /// Create a new event stamped with the current time
    pub fn new(
        session_id: impl Into<String>,
        execution_id: impl Into<String>,
        kind: StreamEventKind,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            execution_id: execution_id.into(),
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Wire name of this event's type
    pub fn event_type(&self) -> &'static str {
        self.kind.type_name()
    }

    /// Serialize to the JSON bytes delivered to connections and the broker
    pub fn to_bytes(&self) -> crate::Result<bytes::Bytes> {
        Ok(bytes::Bytes::from(serde_json::to_vec(self)?))
    }
}
