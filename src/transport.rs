//! Transport abstraction: one physical client connection
//!
//! The connection broker only needs three things from a connection: write
//! a payload, probe liveness, and close. WebSocket, SSE, or test doubles
//! implement `Transport`; `ChannelTransport` is an mpsc-backed version that
//! lets a writer task own the real socket.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors raised by a single transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection was closed by either side
    #[error("transport closed")]
    Closed,

    /// The outbound buffer is full; the client is not keeping up
    #[error("outbound buffer full")]
    Full,

    /// Any other write failure
    #[error("send failed: {0}")]
    Send(String),
}

/// A client connection that can receive serialized events
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one payload to the client
    async fn send(&self, payload: Bytes) -> std::result::Result<(), TransportError>;

    /// Send a liveness probe; the pong is reported via `ConnectionBroker::mark_alive`
    async fn ping(&self) -> std::result::Result<(), TransportError>;

    /// Close the connection. Must be idempotent.
    async fn close(&self);
}

/// Frame handed to the writer task of a `ChannelTransport`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(Bytes),
    Ping,
    Close,
}

/// Transport that forwards frames into a bounded mpsc channel
///
/// The receiving half is drained by whatever owns the socket. Sends never
/// wait: a full buffer is reported as `TransportError::Full` so one slow
/// client cannot stall a broadcast.
pub struct ChannelTransport {
    tx: mpsc::Sender<Outbound>,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Create a transport and the receiver its writer task drains
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Whether `close` has been called or the receiver was dropped
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    fn push(&self, frame: Outbound) -> std::result::Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, payload: Bytes) -> std::result::Result<(), TransportError> {
        self.push(Outbound::Message(payload))
    }

    async fn ping(&self) -> std::result::Result<(), TransportError> {
        self.push(Outbound::Ping)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            // Best effort; the writer may already be gone
            let _ = self.tx.try_send(Outbound::Close);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_forwards_frames_in_order() {
        let (transport, mut rx) = ChannelTransport::new(8);
        transport.send(Bytes::from_static(b"a")).await.unwrap();
        transport.ping().await.unwrap();
        transport.send(Bytes::from_static(b"b")).await.unwrap();

        assert_eq!(rx.recv().await, Some(Outbound::Message(Bytes::from_static(b"a"))));
        assert_eq!(rx.recv().await, Some(Outbound::Ping));
        assert_eq!(rx.recv().await, Some(Outbound::Message(Bytes::from_static(b"b"))));
    }

    #[tokio::test]
    async fn test_send_after_receiver_dropped_fails() {
        let (transport, rx) = ChannelTransport::new(8);
        drop(rx);
        assert!(transport.is_closed());
        let result = transport.send(Bytes::from_static(b"x")).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_full_buffer_reported() {
        let (transport, _rx) = ChannelTransport::new(1);
        transport.send(Bytes::from_static(b"1")).await.unwrap();
        let result = transport.send(Bytes::from_static(b"2")).await;
        assert!(matches!(result, Err(TransportError::Full)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (transport, mut rx) = ChannelTransport::new(8);
        transport.close().await;
        transport.close().await;

        assert_eq!(rx.recv().await, Some(Outbound::Close));
        assert!(transport.is_closed());
        assert!(matches!(
            transport.ping().await,
            Err(TransportError::Closed)
        ));
    }
}
