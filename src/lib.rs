//! # a3s-stream
//!
//! Streaming session delivery and resilience primitives for the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-stream` carries agent output to clients while it is being produced.
//! A `SessionRegistry` turns agent activity into ordered stream events, a
//! `ConnectionBroker` fans those events out to every client connection bound
//! to the session (across processes, through a pluggable pub/sub provider),
//! and a set of resilience tools keeps the service well-behaved under load
//! and during restarts.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_stream::{BrokerConfig, ChannelTransport, ConnectionBroker, SessionConfig, SessionRegistry};
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_stream::Result<()> {
//! let broker = Arc::new(ConnectionBroker::new(BrokerConfig::default()));
//! let registry = SessionRegistry::new(broker.clone(), SessionConfig::default());
//!
//! // A client connection watching session "s1"
//! let (transport, mut outbound) = ChannelTransport::new(64);
//! broker.add_connection("conn-1", Arc::new(transport), "user-1").await;
//! broker.join_session("conn-1", "s1").await?;
//!
//! registry.start_stream("s1", "exec-1", "agent-1", "user-1", "hi").await?;
//! registry.emit_chunk("s1", "Hello", None).await;
//! registry.complete_stream("s1", None).await;
//!
//! while let Ok(frame) = outbound.try_recv() {
//!     println!("{:?}", frame);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! - **memory**: In-memory pub/sub for testing and single-process use
//! - **nats**: NATS core pub/sub for multi-process fan-out
//!
//! ## Architecture
//!
//! - **SessionRegistry**: per-session lifecycle and ordered event emission
//! - **ConnectionBroker**: connection tracking and session/user fan-out
//! - **PubSubProvider** trait: cross-process relay backend
//! - **CircuitBreaker**: fail fast on a struggling dependency
//! - **JobQueue**: prioritized background jobs with retries and a DLQ
//! - **ShutdownCoordinator**: ordered, time-boxed graceful shutdown

pub mod breaker;
pub mod broker;
pub mod config;
pub mod dlq;
pub mod error;
pub mod provider;
pub mod queue;
pub mod session;
pub mod shutdown;
pub mod transport;
pub mod types;

// Re-export core types
pub use breaker::{BreakerError, BreakerHealth, BreakerRegistry, BreakerStats, CircuitBreaker, CircuitState};
pub use broker::{ConnectionBroker, ConnectionInfo};
pub use config::{
    BreakerConfig, BrokerConfig, QueueConfig, SessionConfig, ShutdownConfig, StreamConfig,
};
pub use dlq::{DeadLetterJob, DlqHandler, MemoryDlqHandler};
pub use error::{BoxError, Result, StreamError};
pub use provider::{BrokerMessage, PubSubProvider, Subscription};
pub use queue::{
    BackgroundJob, BackoffPolicy, FileJobStore, Job, JobHandler, JobOptions, JobQueue, JobState,
    JobStats, JobStore, JobWorker, MemoryJobStore, QueueHealth,
};
pub use session::{EventSink, MemoryEventSink, SessionRegistry};
pub use shutdown::{ShutdownCoordinator, ShutdownReport, ShutdownStep, StepOutcome};
pub use transport::{ChannelTransport, Outbound, Transport, TransportError};
pub use types::{
    SessionState, StreamEvent, StreamEventKind, StreamSession, TokenDelta, TokenUsage,
};

// Re-export providers for convenience
pub use provider::memory::{MemoryConfig, MemoryProvider};
pub use provider::nats::{NatsClient, NatsConfig, NatsProvider, NatsSubscription};
