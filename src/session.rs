//! Session registry: per-session streaming state machine
//!
//! Each session moves `Idle → Active → {Completed, Errored}`. Every mutating
//! operation builds a `StreamEvent` and hands it to the `EventSink` before
//! returning, while still holding that session's record lock. Events of one
//! session therefore reach the sink in the order they were produced.
//!
//! Finished sessions stay queryable for a grace period and are then removed
//! by a cancellable timer. Restarting the same session id replaces the
//! record and cancels the pending removal.

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::config::SessionConfig;
use crate::error::{Result, StreamError};
use crate::types::{
    SessionState, StreamEvent, StreamEventKind, StreamSession, TokenDelta, TokenUsage,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Error code sent when a stream is cancelled
pub const CODE_CANCELLED: &str = "CANCELLED";

/// Error code sent when a circuit breaker rejected a downstream call
pub const CODE_CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";

/// Error code sent when a guarded downstream call failed
pub const CODE_DEPENDENCY_FAILURE: &str = "DEPENDENCY_FAILURE";

/// Receiver of every event the registry produces
///
/// `dispatch` is awaited before the producing operation returns. Delivery
/// failures are the sink's own concern and are never reported back.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn dispatch(&self, event: &StreamEvent);
}

/// Sink that records events in memory
#[derive(Default)]
pub struct MemoryEventSink {
    events: std::sync::Mutex<Vec<StreamEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far, in order
    pub fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Events for one session, in order
    pub fn session_events(&self, session_id: &str) -> Vec<StreamEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn dispatch(&self, event: &StreamEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

struct SessionRecord {
    session: StreamSession,
    started_at: Instant,
    cleanup: Option<JoinHandle<()>>,
}

impl SessionRecord {
    fn new(
        session_id: &str,
        execution_id: &str,
        agent_id: &str,
        user_id: &str,
        state: SessionState,
    ) -> Self {
        Self {
            session: StreamSession {
                session_id: session_id.to_string(),
                execution_id: execution_id.to_string(),
                agent_id: agent_id.to_string(),
                user_id: user_id.to_string(),
                start_time: Utc::now(),
                is_active: state == SessionState::Active,
                state,
                accumulated_response: String::new(),
                tools_used: Vec::new(),
                token_usage: TokenUsage::default(),
            },
            started_at: Instant::now(),
            cleanup: None,
        }
    }

    fn event(&self, kind: StreamEventKind) -> StreamEvent {
        StreamEvent::new(
            self.session.session_id.clone(),
            self.session.execution_id.clone(),
            kind,
        )
    }

    fn cancel_cleanup(&mut self) {
        if let Some(handle) = self.cleanup.take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
struct SessionSlot {
    generation: u64,
    active: Arc<AtomicBool>,
    record: Arc<Mutex<SessionRecord>>,
}

type SessionMap = HashMap<String, SessionSlot>;

/// Registry of streaming sessions
pub struct SessionRegistry {
    sessions: Arc<Mutex<SessionMap>>,
    sink: Arc<dyn EventSink>,
    config: SessionConfig,
    generation: AtomicU64,
    accepting: AtomicBool,
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

impl SessionRegistry {
    /// Create a registry delivering events to `sink`
    pub fn new(sink: Arc<dyn EventSink>, config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            sink,
            config,
            generation: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create an `Idle` stub so failures before `start_stream` can be reported
    ///
    /// No-op if a record already exists, unless that record has finished.
    pub async fn prepare_stream(
        &self,
        session_id: &str,
        execution_id: &str,
        agent_id: &str,
        user_id: &str,
    ) -> Result<()> {
        loop {
            let current = self.lock_current(session_id).await;
            let expected = match &current {
                Some((slot, record)) => match record.session.state {
                    SessionState::Idle => return Ok(()),
                    SessionState::Active => {
                        return Err(StreamError::SessionAlreadyActive(session_id.to_string()))
                    }
                    SessionState::Completed | SessionState::Errored => Some(slot.generation),
                },
                None => None,
            };

            let (slot, _stub) = self
                .new_slot(session_id, execution_id, agent_id, user_id, SessionState::Idle)
                .await;
            if self.install(session_id, expected, slot).await {
                if let Some((_, mut record)) = current {
                    record.cancel_cleanup();
                }
                tracing::debug!(session_id, "Session stub created");
                return Ok(());
            }
        }
    }

    /// Start streaming for a session and emit `stream_start`
    ///
    /// Fails with `SessionAlreadyActive` if the id is currently streaming.
    /// An `Idle` stub is activated in place; a finished record still in its
    /// grace period is replaced.
    pub async fn start_stream(
        &self,
        session_id: &str,
        execution_id: &str,
        agent_id: &str,
        user_id: &str,
        initial_message: &str,
    ) -> Result<()> {
        if !self.is_accepting() {
            return Err(StreamError::ShutdownInProgress);
        }

        let record = loop {
            let current = self.lock_current(session_id).await;
            let expected = match current {
                Some((slot, mut record)) => {
                    let state = record.session.state;
                    match state {
                        SessionState::Active => {
                            tracing::warn!(session_id, "Duplicate start rejected, session is active");
                            return Err(StreamError::SessionAlreadyActive(session_id.to_string()));
                        }
                        SessionState::Idle => {
                            *record = SessionRecord::new(
                                session_id,
                                execution_id,
                                agent_id,
                                user_id,
                                SessionState::Active,
                            );
                            slot.active.store(true, Ordering::Release);
                            break record;
                        }
                        SessionState::Completed | SessionState::Errored => {
                            Some((slot.generation, record))
                        }
                    }
                }
                None => None,
            };

            let (slot, record) = self
                .new_slot(session_id, execution_id, agent_id, user_id, SessionState::Active)
                .await;
            match expected {
                Some((generation, mut finished)) => {
                    if self.install(session_id, Some(generation), slot).await {
                        finished.cancel_cleanup();
                        tracing::debug!(session_id, "Finished session replaced by restart");
                        break record;
                    }
                }
                None => {
                    if self.install(session_id, None, slot).await {
                        break record;
                    }
                }
            }
        };

        let event = record.event(StreamEventKind::Start {
            agent_id: agent_id.to_string(),
            user_id: user_id.to_string(),
            message: initial_message.to_string(),
        });
        self.sink.dispatch(&event).await;

        tracing::info!(session_id, execution_id, agent_id, user_id, "Stream started");
        Ok(())
    }

    /// Append a text delta and emit `stream_chunk`
    ///
    /// Returns false (and emits nothing) unless the session is active.
    pub async fn emit_chunk(
        &self,
        session_id: &str,
        chunk: &str,
        tokens: Option<TokenDelta>,
    ) -> bool {
        let Some(slot) = self.slot(session_id).await else {
            tracing::warn!(session_id, "Chunk for unknown session dropped");
            return false;
        };
        let mut record = slot.record.lock().await;
        if record.session.state != SessionState::Active {
            tracing::warn!(session_id, state = ?record.session.state, "Chunk for inactive session dropped");
            return false;
        }

        record.session.accumulated_response.push_str(chunk);
        if let Some(delta) = &tokens {
            record.session.token_usage.add(delta);
        }

        let event = record.event(StreamEventKind::Chunk {
            chunk: chunk.to_string(),
            accumulated: record.session.accumulated_response.clone(),
            tokens,
        });
        self.sink.dispatch(&event).await;
        true
    }

    /// Emit `stream_tool_call`
    pub async fn emit_tool_call(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_params: serde_json::Value,
        reasoning: Option<String>,
    ) -> bool {
        let Some(slot) = self.slot(session_id).await else {
            tracing::warn!(session_id, tool_name, "Tool call for unknown session dropped");
            return false;
        };
        let record = slot.record.lock().await;
        if record.session.state != SessionState::Active {
            tracing::warn!(session_id, tool_name, "Tool call for inactive session dropped");
            return false;
        }

        let event = record.event(StreamEventKind::ToolCall {
            tool_name: tool_name.to_string(),
            tool_params,
            reasoning,
        });
        self.sink.dispatch(&event).await;
        tracing::debug!(session_id, tool_name, "Tool call emitted");
        true
    }

    /// Emit `stream_tool_result`; a successful result records the tool as used
    pub async fn emit_tool_result(
        &self,
        session_id: &str,
        tool_name: &str,
        result: serde_json::Value,
        success: bool,
        error: Option<String>,
    ) -> bool {
        let Some(slot) = self.slot(session_id).await else {
            tracing::warn!(session_id, tool_name, "Tool result for unknown session dropped");
            return false;
        };
        let mut record = slot.record.lock().await;
        if record.session.state != SessionState::Active {
            tracing::warn!(session_id, tool_name, "Tool result for inactive session dropped");
            return false;
        }

        if success && !record.session.tools_used.iter().any(|t| t == tool_name) {
            record.session.tools_used.push(tool_name.to_string());
        }

        let event = record.event(StreamEventKind::ToolResult {
            tool_name: tool_name.to_string(),
            result,
            success,
            error,
        });
        self.sink.dispatch(&event).await;
        true
    }

    /// Finish the session and emit `stream_complete`
    ///
    /// `final_response` overrides the accumulated text when given.
    pub async fn complete_stream(&self, session_id: &str, final_response: Option<String>) -> bool {
        let Some(slot) = self.slot(session_id).await else {
            tracing::warn!(session_id, "Complete for unknown session dropped");
            return false;
        };
        let mut record = slot.record.lock().await;
        if record.session.state != SessionState::Active {
            tracing::warn!(session_id, state = ?record.session.state, "Complete for inactive session dropped");
            return false;
        }

        record.session.state = SessionState::Completed;
        record.session.is_active = false;
        slot.active.store(false, Ordering::Release);

        let execution_time = record.started_at.elapsed().as_millis() as u64;
        let event = record.event(StreamEventKind::Complete {
            final_response: final_response
                .unwrap_or_else(|| record.session.accumulated_response.clone()),
            tools_used: record.session.tools_used.clone(),
            token_usage: record.session.token_usage,
            execution_time,
        });

        record.cancel_cleanup();
        record.cleanup = Some(self.schedule_removal(
            session_id,
            slot.generation,
            self.config.complete_grace(),
        ));

        self.sink.dispatch(&event).await;
        tracing::info!(
            session_id,
            execution_time_ms = execution_time,
            tools = record.session.tools_used.len(),
            "Stream completed"
        );
        true
    }

    /// Fail the session and emit `stream_error`
    ///
    /// Applies to a session in any state, including an `Idle` stub.
    pub async fn emit_error(
        &self,
        session_id: &str,
        message: &str,
        code: Option<&str>,
        details: Option<serde_json::Value>,
    ) -> bool {
        let Some(slot) = self.slot(session_id).await else {
            tracing::warn!(session_id, error = message, "Error for unknown session dropped");
            return false;
        };
        let record = slot.record.lock().await;
        self.fail(&slot, record, message, code, details).await;
        true
    }

    /// Cancel an active stream with code `CANCELLED`
    ///
    /// Returns false if the session is not currently active.
    pub async fn cancel_stream(&self, session_id: &str) -> bool {
        let Some(slot) = self.slot(session_id).await else {
            return false;
        };
        let record = slot.record.lock().await;
        if record.session.state != SessionState::Active {
            tracing::debug!(session_id, "Cancel ignored, session not active");
            return false;
        }
        self.fail(
            &slot,
            record,
            "Stream cancelled by user",
            Some(CODE_CANCELLED),
            None,
        )
        .await;
        true
    }

    /// Run a downstream call through `breaker`, failing the session on error
    ///
    /// An open breaker emits `stream_error` with code `CIRCUIT_OPEN`; any
    /// other failure emits `DEPENDENCY_FAILURE`. The breaker's result is
    /// returned either way so the caller can fall back.
    pub async fn run_guarded<F, Fut, T, E>(
        &self,
        session_id: &str,
        breaker: &CircuitBreaker,
        operation: F,
    ) -> std::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: fmt::Debug + fmt::Display,
    {
        let result = breaker.execute(operation).await;
        if let Err(err) = &result {
            let (code, details) = match err {
                BreakerError::Open { name, retry_in } => (
                    CODE_CIRCUIT_OPEN,
                    serde_json::json!({
                        "breaker": name,
                        "retryInMs": retry_in.as_millis() as u64,
                    }),
                ),
                BreakerError::Inner(_) => (
                    CODE_DEPENDENCY_FAILURE,
                    serde_json::json!({ "breaker": breaker.name() }),
                ),
            };
            self.emit_error(session_id, &err.to_string(), Some(code), Some(details))
                .await;
        }
        result
    }

    /// Whether the session is currently streaming
    pub async fn is_session_active(&self, session_id: &str) -> bool {
        let sessions = self.sessions.lock().await;
        sessions
            .get(session_id)
            .is_some_and(|slot| slot.active.load(Ordering::Acquire))
    }

    /// Ids of every active session, sorted
    pub async fn get_active_sessions(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        let mut ids: Vec<String> = sessions
            .iter()
            .filter(|(_, slot)| slot.active.load(Ordering::Acquire))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Snapshot of a session record, including finished ones still in grace
    pub async fn get_session(&self, session_id: &str) -> Option<StreamSession> {
        let slot = self.slot(session_id).await?;
        let record = slot.record.lock().await;
        Some(record.session.clone())
    }

    /// Number of records held, in any state
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Refuse new `start_stream` calls from now on
    pub fn stop_accepting(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            tracing::info!("Session registry no longer accepting new streams");
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    async fn slot(&self, session_id: &str) -> Option<SessionSlot> {
        self.sessions.lock().await.get(session_id).cloned()
    }

    /// Lock the record currently registered under `session_id`
    ///
    /// The map lock is never held while waiting for a record. If the entry
    /// was replaced in the meantime the lookup starts over.
    async fn lock_current(
        &self,
        session_id: &str,
    ) -> Option<(SessionSlot, OwnedMutexGuard<SessionRecord>)> {
        loop {
            let slot = self.slot(session_id).await?;
            let record = slot.record.clone().lock_owned().await;
            let current = self
                .sessions
                .lock()
                .await
                .get(session_id)
                .map(|current| current.generation);
            match current {
                Some(generation) if generation == slot.generation => return Some((slot, record)),
                Some(_) => continue,
                None => return None,
            }
        }
    }

    /// Insert `slot` if the entry for `session_id` is still `expected`
    ///
    /// An entry removed since it was read counts as a match. Returns false
    /// when another slot took its place.
    async fn install(&self, session_id: &str, expected: Option<u64>, slot: SessionSlot) -> bool {
        let mut sessions = self.sessions.lock().await;
        let current = sessions.get(session_id).map(|current| current.generation);
        if current.is_some() && current != expected {
            return false;
        }
        sessions.insert(session_id.to_string(), slot);
        true
    }

    async fn new_slot(
        &self,
        session_id: &str,
        execution_id: &str,
        agent_id: &str,
        user_id: &str,
        state: SessionState,
    ) -> (SessionSlot, OwnedMutexGuard<SessionRecord>) {
        let record = Arc::new(Mutex::new(SessionRecord::new(
            session_id,
            execution_id,
            agent_id,
            user_id,
            state,
        )));
        let slot = SessionSlot {
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
            active: Arc::new(AtomicBool::new(state == SessionState::Active)),
            record: record.clone(),
        };
        (slot, record.lock_owned().await)
    }

    async fn fail(
        &self,
        slot: &SessionSlot,
        mut record: MutexGuard<'_, SessionRecord>,
        message: &str,
        code: Option<&str>,
        details: Option<serde_json::Value>,
    ) {
        record.session.state = SessionState::Errored;
        record.session.is_active = false;
        slot.active.store(false, Ordering::Release);

        let event = record.event(StreamEventKind::Error {
            error: message.to_string(),
            code: code.map(str::to_string),
            details,
        });

        let session_id = record.session.session_id.clone();
        record.cancel_cleanup();
        record.cleanup = Some(self.schedule_removal(
            &session_id,
            slot.generation,
            self.config.error_grace(),
        ));

        self.sink.dispatch(&event).await;
        tracing::error!(
            session_id = %session_id,
            code = code.unwrap_or(""),
            error = message,
            "Stream error"
        );
    }

    fn schedule_removal(&self, session_id: &str, generation: u64, grace: Duration) -> JoinHandle<()> {
        let sessions: Weak<Mutex<SessionMap>> = Arc::downgrade(&self.sessions);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(sessions) = sessions.upgrade() else {
                return;
            };
            let mut sessions = sessions.lock().await;
            if sessions
                .get(&session_id)
                .is_some_and(|slot| slot.generation == generation)
            {
                sessions.remove(&session_id);
                tracing::debug!(session_id = %session_id, "Session removed after grace period");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io;

    fn registry() -> (SessionRegistry, Arc<MemoryEventSink>) {
        let sink = Arc::new(MemoryEventSink::new());
        let registry = SessionRegistry::new(sink.clone(), SessionConfig::default());
        (registry, sink)
    }

    fn types(sink: &MemoryEventSink) -> Vec<&'static str> {
        sink.events().iter().map(|e| e.event_type()).collect()
    }

    #[tokio::test]
    async fn test_full_stream_lifecycle() {
        let (registry, sink) = registry();
        registry
            .start_stream("s1", "exec-1", "agent-1", "user-1", "hi")
            .await
            .unwrap();
        assert!(registry.emit_chunk("s1", "Hel", None).await);
        assert!(registry.emit_chunk("s1", "lo", Some(TokenDelta::output(2))).await);
        assert!(registry.complete_stream("s1", None).await);

        assert_eq!(
            types(&sink),
            vec!["stream_start", "stream_chunk", "stream_chunk", "stream_complete"]
        );
        let events = sink.events();
        match &events[2].kind {
            StreamEventKind::Chunk { accumulated, .. } => assert_eq!(accumulated, "Hello"),
            other => panic!("unexpected {:?}", other),
        }
        match &events[3].kind {
            StreamEventKind::Complete {
                final_response,
                token_usage,
                ..
            } => {
                assert_eq!(final_response, "Hello");
                assert_eq!(token_usage.output, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(events.iter().all(|e| e.execution_id == "exec-1"));
        assert!(!registry.is_session_active("s1").await);
    }

    #[tokio::test]
    async fn test_final_response_override() {
        let (registry, sink) = registry();
        registry.start_stream("s1", "e", "a", "u", "m").await.unwrap();
        registry.emit_chunk("s1", "draft", None).await;
        registry
            .complete_stream("s1", Some("final".to_string()))
            .await;

        match &sink.events().last().unwrap().kind {
            StreamEventKind::Complete { final_response, .. } => assert_eq!(final_response, "final"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_emits_on_non_active_sessions_are_noops() {
        let (registry, sink) = registry();

        assert!(!registry.emit_chunk("missing", "x", None).await);
        assert!(!registry.emit_tool_call("missing", "t", json!({}), None).await);
        assert!(!registry.complete_stream("missing", None).await);
        assert_eq!(registry.session_count().await, 0);

        registry.prepare_stream("idle", "e", "a", "u").await.unwrap();
        assert!(!registry.emit_chunk("idle", "x", None).await);
        assert!(!registry.emit_tool_result("idle", "t", json!(1), true, None).await);

        registry.start_stream("done", "e", "a", "u", "m").await.unwrap();
        registry.complete_stream("done", None).await;
        sink.clear();
        assert!(!registry.emit_chunk("done", "late", None).await);
        assert!(!registry.complete_stream("done", None).await);

        assert!(sink.is_empty());
        assert_eq!(registry.session_count().await, 2);
    }

    #[tokio::test]
    async fn test_tools_used_is_a_set_of_successes() {
        let (registry, sink) = registry();
        registry.start_stream("s1", "e", "a", "u", "m").await.unwrap();

        registry.emit_tool_call("s1", "search", json!({"q": "x"}), Some("need data".into())).await;
        registry.emit_tool_result("s1", "search", json!(["r"]), true, None).await;
        registry.emit_tool_result("s1", "fetch", json!(null), false, Some("404".into())).await;
        registry.emit_tool_result("s1", "search", json!(["r2"]), true, None).await;
        registry.emit_tool_result("s1", "calc", json!(4), true, None).await;
        registry.complete_stream("s1", None).await;

        match &sink.events().last().unwrap().kind {
            StreamEventKind::Complete { tools_used, .. } => {
                assert_eq!(tools_used, &vec!["search".to_string(), "calc".to_string()]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected_while_active() {
        let (registry, sink) = registry();
        registry.start_stream("s1", "e1", "a", "u", "m").await.unwrap();

        let result = registry.start_stream("s1", "e2", "a", "u", "m").await;
        assert!(matches!(result, Err(StreamError::SessionAlreadyActive(id)) if id == "s1"));
        assert_eq!(sink.len(), 1);
        assert_eq!(registry.get_session("s1").await.unwrap().execution_id, "e1");
    }

    /// Sink that parks dispatches while `hold` is set, until the gate opens
    #[derive(Default)]
    struct GatedSink {
        hold: AtomicBool,
        gate: tokio::sync::Notify,
        inner: MemoryEventSink,
    }

    #[async_trait]
    impl EventSink for GatedSink {
        async fn dispatch(&self, event: &StreamEvent) {
            if self.hold.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            self.inner.dispatch(event).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_dispatch_does_not_block_other_sessions() {
        let sink = Arc::new(GatedSink::default());
        let registry = SessionRegistry::new(sink.clone(), SessionConfig::default());
        registry.start_stream("s1", "e1", "a", "u", "m").await.unwrap();
        registry.start_stream("s2", "e2", "a", "u", "m").await.unwrap();

        sink.hold.store(true, Ordering::SeqCst);
        let mut chunk = tokio_test::task::spawn(registry.emit_chunk("s1", "slow", None));
        tokio_test::assert_pending!(chunk.poll());
        sink.hold.store(false, Ordering::SeqCst);

        // Both wait on the s1 record held by the parked dispatch
        let mut duplicate = tokio_test::task::spawn(registry.start_stream("s1", "e9", "a", "u", "m"));
        tokio_test::assert_pending!(duplicate.poll());
        let mut stub = tokio_test::task::spawn(registry.prepare_stream("s1", "e9", "a", "u"));
        tokio_test::assert_pending!(stub.poll());

        let active = tokio::time::timeout(Duration::from_secs(1), registry.get_active_sessions())
            .await
            .unwrap();
        assert_eq!(active, vec!["s1", "s2"]);
        assert!(registry.emit_chunk("s2", "fast", None).await);
        assert_eq!(registry.session_count().await, 2);

        sink.gate.notify_one();
        assert!(tokio_test::assert_ready!(chunk.poll()));
        let result = tokio_test::assert_ready!(duplicate.poll());
        assert!(matches!(result, Err(StreamError::SessionAlreadyActive(id)) if id == "s1"));
        let result = tokio_test::assert_ready!(stub.poll());
        assert!(matches!(result, Err(StreamError::SessionAlreadyActive(_))));

        assert_eq!(registry.get_session("s1").await.unwrap().execution_id, "e1");
        let s1: Vec<_> = sink
            .inner
            .session_events("s1")
            .iter()
            .map(|e| e.event_type())
            .collect();
        assert_eq!(s1, vec!["stream_start", "stream_chunk"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepare_replaces_finished_record() {
        let (registry, _sink) = registry();
        registry.start_stream("s1", "e1", "a", "u", "m").await.unwrap();
        registry.complete_stream("s1", None).await;

        registry.prepare_stream("s1", "e2", "a", "u").await.unwrap();
        tokio::time::sleep(Duration::from_millis(6_000)).await;

        let session = registry.get_session("s1").await.unwrap();
        assert_eq!(session.execution_id, "e2");
        assert_eq!(session.state, SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_in_grace_replaces_and_cancels_removal() {
        let (registry, _sink) = registry();
        registry.start_stream("s1", "e1", "a", "u", "m").await.unwrap();
        registry.complete_stream("s1", None).await;

        tokio::time::sleep(Duration::from_millis(4_000)).await;
        registry.start_stream("s1", "e2", "a", "u", "m").await.unwrap();

        // Past the first grace deadline; the new record must survive it
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        let session = registry.get_session("s1").await.unwrap();
        assert_eq!(session.execution_id, "e2");
        assert!(session.is_active);
        assert!(session.accumulated_response.is_empty());
    }

    #[tokio::test]
    async fn test_error_on_idle_stub() {
        let (registry, sink) = registry();
        registry.prepare_stream("s1", "e", "a", "u").await.unwrap();
        assert!(!registry.is_session_active("s1").await);

        assert!(
            registry
                .emit_error("s1", "model unavailable", Some("MODEL_DOWN"), None)
                .await
        );
        let events = sink.events();
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            StreamEventKind::Error { error, code, .. } => {
                assert_eq!(error, "model unavailable");
                assert_eq!(code.as_deref(), Some("MODEL_DOWN"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            registry.get_session("s1").await.unwrap().state,
            SessionState::Errored
        );
    }

    #[tokio::test]
    async fn test_error_on_unknown_session_is_noop() {
        let (registry, sink) = registry();
        assert!(!registry.emit_error("nope", "boom", None, None).await);
        assert!(sink.is_empty());
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_prepare_then_start_activates_stub() {
        let (registry, sink) = registry();
        registry.prepare_stream("s1", "e", "a", "u").await.unwrap();
        registry.start_stream("s1", "e", "a", "u", "go").await.unwrap();
        assert!(registry.is_session_active("s1").await);
        assert_eq!(types(&sink), vec!["stream_start"]);

        let result = registry.prepare_stream("s1", "e", "a", "u").await;
        assert!(matches!(result, Err(StreamError::SessionAlreadyActive(_))));
    }

    #[tokio::test]
    async fn test_cancel_only_affects_active() {
        let (registry, sink) = registry();
        assert!(!registry.cancel_stream("s1").await);

        registry.start_stream("s1", "e", "a", "u", "m").await.unwrap();
        assert!(registry.cancel_stream("s1").await);
        assert!(!registry.cancel_stream("s1").await);

        match &sink.events().last().unwrap().kind {
            StreamEventKind::Error { error, code, .. } => {
                assert_eq!(error, "Stream cancelled by user");
                assert_eq!(code.as_deref(), Some(CODE_CANCELLED));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_removal() {
        let (registry, _sink) = registry();
        registry.start_stream("ok", "e", "a", "u", "m").await.unwrap();
        registry.start_stream("bad", "e", "a", "u", "m").await.unwrap();
        assert_eq!(registry.get_active_sessions().await, vec!["bad", "ok"]);

        registry.complete_stream("ok", None).await;
        registry.emit_error("bad", "boom", None, None).await;
        assert!(registry.get_active_sessions().await.is_empty());
        assert_eq!(registry.session_count().await, 2);

        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert!(registry.get_session("bad").await.is_none());
        assert!(registry.get_session("ok").await.is_some());

        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert!(registry.get_session("ok").await.is_none());
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_stop_accepting() {
        let (registry, _sink) = registry();
        registry.stop_accepting();
        let result = registry.start_stream("s1", "e", "a", "u", "m").await;
        assert!(matches!(result, Err(StreamError::ShutdownInProgress)));
    }

    #[tokio::test]
    async fn test_run_guarded_open_breaker_emits_code() {
        let (registry, sink) = registry();
        let breaker = CircuitBreaker::with_defaults("llm");
        breaker.force_open();
        registry.start_stream("s1", "e", "a", "u", "m").await.unwrap();

        let result = registry
            .run_guarded("s1", &breaker, || async { Ok::<_, io::Error>("never") })
            .await;
        assert!(result.unwrap_err().is_open());

        match &sink.events().last().unwrap().kind {
            StreamEventKind::Error { code, details, .. } => {
                assert_eq!(code.as_deref(), Some(CODE_CIRCUIT_OPEN));
                assert_eq!(details.as_ref().unwrap()["breaker"], "llm");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!registry.is_session_active("s1").await);
    }

    #[tokio::test]
    async fn test_run_guarded_failure_and_success() {
        let (registry, sink) = registry();
        let breaker = CircuitBreaker::with_defaults("llm");
        registry.start_stream("s1", "e", "a", "u", "m").await.unwrap();

        let value = registry
            .run_guarded("s1", &breaker, || async { Ok::<_, io::Error>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(sink.len(), 1);

        let result = registry
            .run_guarded("s1", &breaker, || async {
                Err::<(), _>(io::Error::new(io::ErrorKind::TimedOut, "upstream slow"))
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
        match &sink.events().last().unwrap().kind {
            StreamEventKind::Error { code, error, .. } => {
                assert_eq!(code.as_deref(), Some(CODE_DEPENDENCY_FAILURE));
                assert_eq!(error, "upstream slow");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
