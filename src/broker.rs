//! Connection broker: live connections, session binding, and fan-out
//!
//! Keeps two indexes: connection id → connection, and session id → set of
//! connection ids. Session events are delivered to every locally bound
//! connection and published once to the shared pub/sub provider so other
//! processes can deliver them to their own connections.
//!
//! The provider is optional. Until one is attached (or after it drops),
//! publishing is skipped with a warning and delivery stays local.

use crate::config::BrokerConfig;
use crate::error::{Result, StreamError};
use crate::provider::{BrokerMessage, PubSubProvider, Subscription};
use crate::session::EventSink;
use crate::transport::Transport;
use crate::types::StreamEvent;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

struct ConnectionEntry {
    user_id: String,
    session_id: Option<String>,
    alive: Arc<AtomicBool>,
    transport: Arc<dyn Transport>,
}

#[derive(Default)]
struct BrokerState {
    connections: HashMap<String, ConnectionEntry>,
    sessions: HashMap<String, HashSet<String>>,
}

impl BrokerState {
    fn unbind(&mut self, connection_id: &str, session_id: &str) {
        if let Some(members) = self.sessions.get_mut(session_id) {
            members.remove(connection_id);
            if members.is_empty() {
                self.sessions.remove(session_id);
            }
        }
    }

    fn remove(&mut self, connection_id: &str) -> Option<ConnectionEntry> {
        let entry = self.connections.remove(connection_id)?;
        if let Some(session_id) = &entry.session_id {
            self.unbind(connection_id, session_id);
        }
        Some(entry)
    }

    /// Remove `connection_id` only if it still holds `transport`
    ///
    /// A connection re-registered under the same id while a send was in
    /// flight keeps its new entry.
    fn remove_if_same(
        &mut self,
        connection_id: &str,
        transport: &Arc<dyn Transport>,
    ) -> Option<ConnectionEntry> {
        let current = self.connections.get(connection_id)?;
        if !std::ptr::addr_eq(Arc::as_ptr(&current.transport), Arc::as_ptr(transport)) {
            return None;
        }
        self.remove(connection_id)
    }
}

/// Point-in-time view of one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub is_alive: bool,
}

/// Registry of live connections with local and cross-process broadcast
pub struct ConnectionBroker {
    config: BrokerConfig,
    state: RwLock<BrokerState>,
    provider: RwLock<Option<Arc<dyn PubSubProvider>>>,
    connected: AtomicBool,
    relay: std::sync::Mutex<Option<JoinHandle<()>>>,
    heartbeat: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionBroker {
    /// Create a broker with no pub/sub provider (local delivery only)
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(BrokerState::default()),
            provider: RwLock::new(None),
            connected: AtomicBool::new(false),
            relay: std::sync::Mutex::new(None),
            heartbeat: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Identifier this process publishes under
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    // ─── Provider ─────────────────────────────────────────────────

    /// Attach a pub/sub provider without blocking the caller
    ///
    /// Local delivery works immediately; cross-process fan-out starts once
    /// the subscription is established.
    pub fn connect_in_background(self: &Arc<Self>, provider: Arc<dyn PubSubProvider>) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = broker.attach(provider).await {
                tracing::warn!(error = %e, "Broker unavailable, continuing with local delivery");
            }
        })
    }

    /// Subscribe to every session channel on `provider` and start relaying
    pub async fn attach(self: &Arc<Self>, provider: Arc<dyn PubSubProvider>) -> Result<()> {
        let pattern = self.config.session_pattern();
        let subscription = provider.subscribe(&pattern).await.map_err(|e| {
            StreamError::BrokerUnavailable(format!("{} subscribe failed: {}", provider.name(), e))
        })?;

        let provider_name = provider.name().to_string();
        *self.provider.write().await = Some(provider);

        let handle = tokio::spawn(relay(Arc::downgrade(self), subscription));
        if let Some(old) = self.lock_task(&self.relay).replace(handle) {
            old.abort();
        }
        self.connected.store(true, Ordering::Release);

        tracing::info!(
            provider = %provider_name,
            pattern = %pattern,
            node_id = %self.config.node_id,
            "Connection broker attached to pub/sub provider"
        );
        Ok(())
    }

    /// Whether cross-process fan-out is currently available
    pub fn is_broker_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Publish a payload to the shared broker
    ///
    /// Returns `BrokerUnavailable` when no provider is connected; callers on
    /// the delivery path ignore it since local delivery already happened.
    pub async fn publish_to_broker(&self, channel: &str, payload: Bytes) -> Result<()> {
        if !self.is_broker_connected() {
            tracing::warn!(channel, "Broker not connected, skipping cross-process publish");
            return Err(StreamError::BrokerUnavailable(
                "no connected pub/sub provider".to_string(),
            ));
        }
        let provider = self.provider.read().await.clone();
        let Some(provider) = provider else {
            return Err(StreamError::BrokerUnavailable(
                "no pub/sub provider attached".to_string(),
            ));
        };

        let message = BrokerMessage::new(channel, self.config.node_id.clone(), payload);
        provider.publish(&message).await.map_err(|e| {
            tracing::warn!(channel, error = %e, "Cross-process publish failed");
            e
        })
    }

    // ─── Connections ──────────────────────────────────────────────

    /// Register a connection; an existing entry with the same id is replaced
    pub async fn add_connection(
        &self,
        connection_id: &str,
        transport: Arc<dyn Transport>,
        user_id: &str,
    ) {
        let replaced = {
            let mut state = self.state.write().await;
            let replaced = state.remove(connection_id);
            state.connections.insert(
                connection_id.to_string(),
                ConnectionEntry {
                    user_id: user_id.to_string(),
                    session_id: None,
                    alive: Arc::new(AtomicBool::new(true)),
                    transport,
                },
            );
            replaced
        };
        if let Some(old) = replaced {
            old.transport.close().await;
        }
        tracing::info!(connection_id, user_id, "Connection added");
    }

    /// Remove a connection and close its transport
    pub async fn remove_connection(&self, connection_id: &str) -> bool {
        let removed = self.state.write().await.remove(connection_id);
        match removed {
            Some(entry) => {
                entry.transport.close().await;
                tracing::info!(
                    connection_id,
                    session_id = entry.session_id.as_deref().unwrap_or(""),
                    "Connection removed"
                );
                true
            }
            None => false,
        }
    }

    /// Bind a connection to a session, leaving any previous one
    pub async fn join_session(&self, connection_id: &str, session_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let previous = match state.connections.get_mut(connection_id) {
            Some(entry) => entry.session_id.replace(session_id.to_string()),
            None => return Err(StreamError::NotFound(format!("connection {}", connection_id))),
        };
        if let Some(previous) = previous.as_deref() {
            state.unbind(connection_id, previous);
        }
        state
            .sessions
            .entry(session_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        drop(state);

        tracing::info!(
            connection_id,
            session_id,
            previous = previous.as_deref().unwrap_or(""),
            "Connection joined session"
        );
        Ok(())
    }

    /// Unbind a connection from its session; returns false if it had none
    pub async fn leave_session(&self, connection_id: &str) -> bool {
        let mut state = self.state.write().await;
        let previous = state
            .connections
            .get_mut(connection_id)
            .and_then(|entry| entry.session_id.take());
        match previous {
            Some(session_id) => {
                state.unbind(connection_id, &session_id);
                tracing::debug!(connection_id, session_id = %session_id, "Connection left session");
                true
            }
            None => false,
        }
    }

    // ─── Delivery ─────────────────────────────────────────────────

    /// Deliver to every local connection bound to `session_id`
    ///
    /// Connections whose send fails are removed. Returns the number of
    /// successful deliveries.
    pub async fn broadcast_to_session(&self, session_id: &str, payload: Bytes) -> usize {
        let targets: Vec<(String, Arc<dyn Transport>)> = {
            let state = self.state.read().await;
            match state.sessions.get(session_id) {
                Some(members) => members
                    .iter()
                    .filter_map(|id| {
                        state
                            .connections
                            .get(id)
                            .map(|entry| (id.clone(), entry.transport.clone()))
                    })
                    .collect(),
                None => Vec::new(),
            }
        };
        self.deliver(targets, payload, session_id).await
    }

    /// Deliver to every local connection owned by `user_id`
    pub async fn broadcast_to_user(&self, user_id: &str, payload: Bytes) -> usize {
        let targets: Vec<(String, Arc<dyn Transport>)> = {
            let state = self.state.read().await;
            state
                .connections
                .iter()
                .filter(|(_, entry)| entry.user_id == user_id)
                .map(|(id, entry)| (id.clone(), entry.transport.clone()))
                .collect()
        };
        self.deliver(targets, payload, user_id).await
    }

    /// Send to a single connection, removing it if the send fails
    pub async fn send_to_connection(&self, connection_id: &str, payload: Bytes) -> Result<()> {
        let transport = {
            let state = self.state.read().await;
            state
                .connections
                .get(connection_id)
                .map(|entry| entry.transport.clone())
        };
        let Some(transport) = transport else {
            return Err(StreamError::NotFound(format!("connection {}", connection_id)));
        };

        if let Err(e) = transport.send(payload).await {
            self.remove_stale(connection_id, &transport).await;
            return Err(StreamError::Transport {
                connection_id: connection_id.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    /// Serialize a session event, deliver locally, and publish it
    pub async fn publish_session_event(&self, event: &StreamEvent) -> Result<usize> {
        let payload = event.to_bytes()?;
        let delivered = self
            .broadcast_to_session(&event.session_id, payload.clone())
            .await;

        let channel = self.config.session_channel(&event.session_id);
        // Local delivery already happened; a broker failure only loses fan-out
        let _ = self.publish_to_broker(&channel, payload).await;

        tracing::debug!(
            session_id = %event.session_id,
            event_type = event.event_type(),
            delivered,
            "Session event dispatched"
        );
        Ok(delivered)
    }

    async fn deliver(
        &self,
        targets: Vec<(String, Arc<dyn Transport>)>,
        payload: Bytes,
        label: &str,
    ) -> usize {
        if targets.is_empty() {
            return 0;
        }

        let sends = targets.iter().map(|(_, transport)| {
            let payload = payload.clone();
            async move { transport.send(payload).await }
        });
        let results = futures::future::join_all(sends).await;

        let mut delivered = 0;
        let mut dead = Vec::new();
        for ((id, transport), result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(connection_id = %id, label, error = %e, "Send failed, dropping connection");
                    dead.push((id, transport));
                }
            }
        }

        for (id, transport) in dead {
            self.remove_stale(id, transport).await;
        }
        delivered
    }

    /// Remove and close a connection unless it was replaced since
    /// `transport` was read from the index
    async fn remove_stale(&self, connection_id: &str, transport: &Arc<dyn Transport>) -> bool {
        let removed = self
            .state
            .write()
            .await
            .remove_if_same(connection_id, transport);
        match removed {
            Some(entry) => {
                entry.transport.close().await;
                tracing::info!(
                    connection_id,
                    session_id = entry.session_id.as_deref().unwrap_or(""),
                    "Connection removed"
                );
                true
            }
            None => {
                tracing::debug!(connection_id, "Connection already replaced, keeping new entry");
                false
            }
        }
    }

    // ─── Liveness ─────────────────────────────────────────────────

    /// Record a pong (or any inbound traffic) from a connection
    pub async fn mark_alive(&self, connection_id: &str) {
        let state = self.state.read().await;
        if let Some(entry) = state.connections.get(connection_id) {
            entry.alive.store(true, Ordering::Release);
        }
    }

    /// One heartbeat sweep
    ///
    /// Removes every connection that has not confirmed liveness since the
    /// previous sweep, then marks the rest unconfirmed and pings them.
    /// Returns the number of connections removed.
    pub async fn ping_connections(&self) -> usize {
        let mut dead = Vec::new();
        let mut to_ping = Vec::new();
        {
            let state = self.state.read().await;
            for (id, entry) in &state.connections {
                let target = (id.clone(), entry.transport.clone());
                if entry.alive.swap(false, Ordering::AcqRel) {
                    to_ping.push(target);
                } else {
                    dead.push(target);
                }
            }
        }

        for (id, transport) in to_ping {
            if let Err(e) = transport.ping().await {
                tracing::debug!(connection_id = %id, error = %e, "Ping failed");
                dead.push((id, transport));
            }
        }

        let mut removed = 0;
        for (id, transport) in &dead {
            tracing::warn!(connection_id = %id, "Connection failed liveness check");
            if self.remove_stale(id, transport).await {
                removed += 1;
            }
        }
        removed
    }

    /// Run `ping_connections` on a fixed interval until `cleanup`
    pub fn start_heartbeat(self: &Arc<Self>, interval: Duration) {
        let broker = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(broker) = broker.upgrade() else {
                    break;
                };
                let removed = broker.ping_connections().await;
                if removed > 0 {
                    tracing::info!(removed, "Heartbeat removed dead connections");
                }
            }
        });
        if let Some(old) = self.lock_task(&self.heartbeat).replace(handle) {
            old.abort();
        }
        tracing::debug!(interval_ms = interval.as_millis() as u64, "Heartbeat started");
    }

    // ─── Observability ────────────────────────────────────────────

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn session_connection_count(&self, session_id: &str) -> usize {
        self.state
            .read()
            .await
            .sessions
            .get(session_id)
            .map_or(0, HashSet::len)
    }

    pub async fn get_connection_info(&self, connection_id: &str) -> Option<ConnectionInfo> {
        let state = self.state.read().await;
        state.connections.get(connection_id).map(|entry| ConnectionInfo {
            connection_id: connection_id.to_string(),
            user_id: entry.user_id.clone(),
            session_id: entry.session_id.clone(),
            is_alive: entry.alive.load(Ordering::Acquire),
        })
    }

    /// Stop background tasks, close every transport, and drop all state
    pub async fn cleanup(&self) {
        if let Some(handle) = self.lock_task(&self.heartbeat).take() {
            handle.abort();
        }
        if let Some(handle) = self.lock_task(&self.relay).take() {
            handle.abort();
        }
        self.connected.store(false, Ordering::Release);
        *self.provider.write().await = None;

        let entries: Vec<ConnectionEntry> = {
            let mut state = self.state.write().await;
            state.sessions.clear();
            state.connections.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        futures::future::join_all(entries.iter().map(|entry| entry.transport.close())).await;

        tracing::info!(closed = count, "Connection broker cleaned up");
    }

    fn lock_task<'a>(
        &self,
        slot: &'a std::sync::Mutex<Option<JoinHandle<()>>>,
    ) -> std::sync::MutexGuard<'a, Option<JoinHandle<()>>> {
        slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ConnectionBroker {
    fn drop(&mut self) {
        for slot in [&self.relay, &self.heartbeat] {
            if let Some(handle) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl EventSink for ConnectionBroker {
    async fn dispatch(&self, event: &StreamEvent) {
        if let Err(e) = self.publish_session_event(event).await {
            tracing::warn!(
                session_id = %event.session_id,
                error = %e,
                "Failed to dispatch session event"
            );
        }
    }
}

/// Deliver messages published by other nodes to local connections
async fn relay(broker: Weak<ConnectionBroker>, mut subscription: Box<dyn Subscription>) {
    loop {
        let next = subscription.next().await;
        let Some(broker) = broker.upgrade() else {
            break;
        };
        match next {
            Ok(Some(message)) => {
                if message.origin == broker.config.node_id {
                    continue;
                }
                let Some(session_id) = broker.config.session_from_channel(&message.channel) else {
                    tracing::debug!(channel = %message.channel, "Ignoring message on non-session channel");
                    continue;
                };
                let delivered = broker
                    .broadcast_to_session(session_id, message.payload)
                    .await;
                tracing::debug!(
                    session_id,
                    origin = %message.origin,
                    delivered,
                    "Relayed remote session event"
                );
            }
            Ok(None) => {
                broker.connected.store(false, Ordering::Release);
                tracing::warn!("Broker subscription ended, falling back to local delivery");
                break;
            }
            Err(e) => {
                broker.connected.store(false, Ordering::Release);
                tracing::warn!(error = %e, "Broker subscription failed, falling back to local delivery");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::memory::MemoryProvider;
    use crate::transport::{ChannelTransport, Outbound, TransportError};
    use tokio::sync::mpsc;

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn send(&self, _payload: Bytes) -> std::result::Result<(), TransportError> {
            Err(TransportError::Send("socket reset".to_string()))
        }

        async fn ping(&self) -> std::result::Result<(), TransportError> {
            Err(TransportError::Closed)
        }

        async fn close(&self) {}
    }

    /// Holds every send and ping until the gate opens, then fails it
    struct GatedTransport {
        gate: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn send(&self, _payload: Bytes) -> std::result::Result<(), TransportError> {
            self.gate.notified().await;
            Err(TransportError::Closed)
        }

        async fn ping(&self) -> std::result::Result<(), TransportError> {
            self.gate.notified().await;
            Err(TransportError::Closed)
        }

        async fn close(&self) {}
    }

    fn channel() -> (Arc<dyn Transport>, mpsc::Receiver<Outbound>) {
        let (transport, rx) = ChannelTransport::new(64);
        (Arc::new(transport), rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn config(node: &str) -> BrokerConfig {
        BrokerConfig {
            node_id: node.to_string(),
            ..BrokerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_join_and_broadcast_to_session() {
        let broker = ConnectionBroker::new(config("n1"));
        let (a, mut rx_a) = channel();
        let (b, mut rx_b) = channel();
        broker.add_connection("a", a, "u1").await;
        broker.add_connection("b", b, "u2").await;
        broker.join_session("a", "s1").await.unwrap();
        broker.join_session("b", "s2").await.unwrap();

        let delivered = broker
            .broadcast_to_session("s1", Bytes::from_static(b"hello"))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut rx_a), vec![Outbound::Message(Bytes::from_static(b"hello"))]);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_join_new_session_leaves_previous() {
        let broker = ConnectionBroker::new(config("n1"));
        let (a, _rx) = channel();
        broker.add_connection("a", a, "u1").await;

        broker.join_session("a", "s1").await.unwrap();
        broker.join_session("a", "s2").await.unwrap();
        assert_eq!(broker.session_connection_count("s1").await, 0);
        assert_eq!(broker.session_connection_count("s2").await, 1);

        assert!(broker.leave_session("a").await);
        assert!(!broker.leave_session("a").await);
        assert_eq!(broker.session_connection_count("s2").await, 0);
        assert_eq!(broker.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_join_unknown_connection_fails() {
        let broker = ConnectionBroker::new(config("n1"));
        let result = broker.join_session("ghost", "s1").await;
        assert!(matches!(result, Err(StreamError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_send_removes_connection() {
        let broker = ConnectionBroker::new(config("n1"));
        let (b, mut rx_b) = channel();
        broker.add_connection("a", Arc::new(FailingTransport), "u1").await;
        broker.add_connection("b", b, "u1").await;
        broker.join_session("a", "s1").await.unwrap();
        broker.join_session("b", "s1").await.unwrap();

        let delivered = broker
            .broadcast_to_session("s1", Bytes::from_static(b"x"))
            .await;

        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert!(broker.get_connection_info("a").await.is_none());
        assert_eq!(broker.session_connection_count("s1").await, 1);
    }

    #[tokio::test]
    async fn test_failed_send_keeps_reconnected_connection() {
        let broker = ConnectionBroker::new(config("n1"));
        let gate = Arc::new(tokio::sync::Notify::new());
        let stale: Arc<dyn Transport> = Arc::new(GatedTransport { gate: gate.clone() });
        broker.add_connection("a", stale, "u1").await;
        broker.join_session("a", "s1").await.unwrap();

        let mut broadcast =
            tokio_test::task::spawn(broker.broadcast_to_session("s1", Bytes::from_static(b"x")));
        tokio_test::assert_pending!(broadcast.poll());

        // Client reconnects under the same id while the old send hangs
        let (fresh, mut rx_fresh) = channel();
        broker.add_connection("a", fresh, "u1").await;
        broker.join_session("a", "s1").await.unwrap();

        gate.notify_one();
        assert_eq!(tokio_test::assert_ready!(broadcast.poll()), 0);
        drop(broadcast);

        let info = broker.get_connection_info("a").await.unwrap();
        assert_eq!(info.session_id.as_deref(), Some("s1"));
        assert!(drain(&mut rx_fresh).is_empty());

        let delivered = broker
            .broadcast_to_session("s1", Bytes::from_static(b"y"))
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(drain(&mut rx_fresh), vec![Outbound::Message(Bytes::from_static(b"y"))]);
    }

    #[tokio::test]
    async fn test_failed_ping_keeps_reconnected_connection() {
        let broker = ConnectionBroker::new(config("n1"));
        let gate = Arc::new(tokio::sync::Notify::new());
        let stale: Arc<dyn Transport> = Arc::new(GatedTransport { gate: gate.clone() });
        broker.add_connection("a", stale, "u1").await;

        let mut sweep = tokio_test::task::spawn(broker.ping_connections());
        tokio_test::assert_pending!(sweep.poll());

        let (fresh, mut rx_fresh) = channel();
        broker.add_connection("a", fresh, "u1").await;

        gate.notify_one();
        assert_eq!(tokio_test::assert_ready!(sweep.poll()), 0);
        drop(sweep);

        assert!(broker.get_connection_info("a").await.unwrap().is_alive);
        assert!(drain(&mut rx_fresh).is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_to_user_ignores_sessions() {
        let broker = ConnectionBroker::new(config("n1"));
        let (a, mut rx_a) = channel();
        let (b, mut rx_b) = channel();
        let (c, mut rx_c) = channel();
        broker.add_connection("a", a, "alice").await;
        broker.add_connection("b", b, "alice").await;
        broker.add_connection("c", c, "bob").await;
        broker.join_session("a", "s1").await.unwrap();

        let delivered = broker
            .broadcast_to_user("alice", Bytes::from_static(b"notice"))
            .await;
        assert_eq!(delivered, 2);
        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn test_send_to_connection() {
        let broker = ConnectionBroker::new(config("n1"));
        let (a, mut rx_a) = channel();
        broker.add_connection("a", a, "u1").await;
        broker.add_connection("bad", Arc::new(FailingTransport), "u1").await;

        broker
            .send_to_connection("a", Bytes::from_static(b"direct"))
            .await
            .unwrap();
        assert_eq!(drain(&mut rx_a).len(), 1);

        let result = broker.send_to_connection("bad", Bytes::new()).await;
        assert!(matches!(result, Err(StreamError::Transport { .. })));
        assert!(broker.get_connection_info("bad").await.is_none());

        let result = broker.send_to_connection("ghost", Bytes::new()).await;
        assert!(matches!(result, Err(StreamError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_ping_double_sweep() {
        let broker = ConnectionBroker::new(config("n1"));
        let (a, mut rx_a) = channel();
        let (b, _rx_b) = channel();
        broker.add_connection("a", a, "u1").await;
        broker.add_connection("b", b, "u1").await;

        // First sweep: everyone was alive, all get pinged
        assert_eq!(broker.ping_connections().await, 0);
        assert_eq!(drain(&mut rx_a), vec![Outbound::Ping]);
        assert!(!broker.get_connection_info("a").await.unwrap().is_alive);

        // Only "a" answers
        broker.mark_alive("a").await;

        assert_eq!(broker.ping_connections().await, 1);
        assert!(broker.get_connection_info("a").await.is_some());
        assert!(broker.get_connection_info("b").await.is_none());
    }

    #[tokio::test]
    async fn test_ping_failure_removes_immediately() {
        let broker = ConnectionBroker::new(config("n1"));
        broker.add_connection("bad", Arc::new(FailingTransport), "u1").await;
        assert_eq!(broker.ping_connections().await, 1);
        assert_eq!(broker.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_replacing_connection_closes_old_transport() {
        let broker = ConnectionBroker::new(config("n1"));
        let (old, mut rx_old) = channel();
        let (new, _rx_new) = channel();
        broker.add_connection("a", old, "u1").await;
        broker.join_session("a", "s1").await.unwrap();
        broker.add_connection("a", new, "u1").await;

        assert_eq!(drain(&mut rx_old), vec![Outbound::Close]);
        assert_eq!(broker.session_connection_count("s1").await, 0);
        assert_eq!(broker.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_publish_without_provider_is_local_only() {
        let broker = ConnectionBroker::new(config("n1"));
        let (a, mut rx_a) = channel();
        broker.add_connection("a", a, "u1").await;
        broker.join_session("a", "s1").await.unwrap();

        assert!(!broker.is_broker_connected());
        let event = StreamEvent::new(
            "s1",
            "e1",
            crate::types::StreamEventKind::Chunk {
                chunk: "hi".into(),
                accumulated: "hi".into(),
                tokens: None,
            },
        );
        broker.dispatch(&event).await;

        let frames = drain(&mut rx_a);
        assert_eq!(frames.len(), 1);
        let Outbound::Message(payload) = &frames[0] else {
            panic!("expected message frame");
        };
        let received: StreamEvent = serde_json::from_slice(payload).unwrap();
        assert_eq!(received, event);

        let result = broker.publish_to_broker("session.s1", Bytes::new()).await;
        assert!(matches!(result, Err(StreamError::BrokerUnavailable(_))));
    }

    #[tokio::test]
    async fn test_relay_skips_own_messages() {
        let provider = MemoryProvider::default();
        let broker = Arc::new(ConnectionBroker::new(config("n1")));
        broker.attach(Arc::new(provider.clone())).await.unwrap();
        assert!(broker.is_broker_connected());

        let (a, mut rx_a) = channel();
        broker.add_connection("a", a, "u1").await;
        broker.join_session("a", "s1").await.unwrap();

        broker
            .publish_to_broker("session.s1", Bytes::from_static(b"mine"))
            .await
            .unwrap();
        provider
            .publish(&BrokerMessage::new("session.s1", "n2", Bytes::from_static(b"remote")))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Outbound::Message(Bytes::from_static(b"remote")));
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_attach_failure_keeps_local_delivery() {
        struct Unreachable;

        #[async_trait]
        impl PubSubProvider for Unreachable {
            async fn publish(&self, _message: &BrokerMessage) -> Result<()> {
                Err(StreamError::Connection("down".into()))
            }

            async fn subscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>> {
                Err(StreamError::Subscribe {
                    pattern: pattern.to_string(),
                    reason: "down".into(),
                })
            }

            fn name(&self) -> &str {
                "unreachable"
            }
        }

        let broker = Arc::new(ConnectionBroker::new(config("n1")));
        broker
            .connect_in_background(Arc::new(Unreachable))
            .await
            .unwrap();
        assert!(!broker.is_broker_connected());

        let (a, mut rx_a) = channel();
        broker.add_connection("a", a, "u1").await;
        broker.join_session("a", "s1").await.unwrap();
        assert_eq!(
            broker.broadcast_to_session("s1", Bytes::from_static(b"x")).await,
            1
        );
        assert_eq!(drain(&mut rx_a).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_removes_silent_connections() {
        let broker = Arc::new(ConnectionBroker::new(config("n1")));
        let (a, _rx_a) = channel();
        broker.add_connection("a", a, "u1").await;
        broker.start_heartbeat(Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(broker.connection_count().await, 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(broker.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_closes_everything() {
        let broker = Arc::new(ConnectionBroker::new(config("n1")));
        broker
            .attach(Arc::new(MemoryProvider::default()))
            .await
            .unwrap();
        let (a, mut rx_a) = channel();
        broker.add_connection("a", a, "u1").await;
        broker.join_session("a", "s1").await.unwrap();

        broker.cleanup().await;

        assert_eq!(drain(&mut rx_a), vec![Outbound::Close]);
        assert_eq!(broker.connection_count().await, 0);
        assert_eq!(broker.session_connection_count("s1").await, 0);
        assert!(!broker.is_broker_connected());
    }

    #[test]
    fn test_connection_info_serialization() {
        let info = ConnectionInfo {
            connection_id: "c1".into(),
            user_id: "u1".into(),
            session_id: None,
            is_alive: true,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(json, r#"{"connectionId":"c1","userId":"u1","isAlive":true}"#);
    }
}
