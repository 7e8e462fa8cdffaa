//! Interfaces implemented by connector front ends.
//!
//! The core never speaks a backend protocol itself. A connector supplies:
//! - an [`AdapterFactory`] that establishes connections
//! - an [`Adapter`] exposing the transport primitives
//! - a [`Consumer`] per subscription
//! - a [`MessageSink`] doing the per-message business processing

use crate::message::{Destination, Message};
use crate::pool::ResourceKey;
use crate::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Channel through which an adapter reports asynchronous provider errors
pub type ExceptionSender = mpsc::UnboundedSender<ConnectorError>;

/// Acknowledgement contract for consumed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Acknowledge on receipt, before the sink sees the message
    AtMostOnce,
    /// Acknowledge only after the sink succeeds
    #[default]
    AtLeastOnce,
}

/// Session acknowledgement mode requested from the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// The transport may consider a message consumed once it is handed out
    Auto,
    /// Messages stay unacknowledged until [`Consumer::ack`] is called
    Client,
}

impl DeliveryPolicy {
    pub fn ack_mode(&self) -> AckMode {
        match self {
            DeliveryPolicy::AtMostOnce => AckMode::Auto,
            DeliveryPolicy::AtLeastOnce => AckMode::Client,
        }
    }
}

/// Establishes connections for an [`AdapterPool`](crate::AdapterPool)
#[async_trait]
pub trait AdapterFactory: Send + Sync + 'static {
    type Adapter: Adapter;

    /// Open a new connection for `key`. Transient failures should be
    /// reported as retryable errors so the pool can retry them.
    async fn create(&self, key: &ResourceKey) -> ConnectorResult<Self::Adapter>;
}

/// A live transport connection owned by the pool.
///
/// Adapters may be borrowed by several callers at once, so every method
/// takes `&self`.
#[async_trait]
pub trait Adapter: Send + Sync + 'static {
    type Consumer: Consumer;

    /// Create a consumer on `destination`
    async fn subscribe(
        &self,
        destination: &Destination,
        ack_mode: AckMode,
    ) -> ConnectorResult<Self::Consumer>;

    /// Upper bound on concurrent consumers for this destination, if the
    /// transport has one (e.g. a topic under an older protocol version).
    fn max_consumers(&self, _destination: &Destination) -> Option<usize> {
        None
    }

    /// Route asynchronous provider errors into `sender`
    fn set_exception_listener(&self, _sender: ExceptionSender) {}

    /// Start a transaction; sends are staged until `commit` or `rollback`
    async fn begin(&self) -> ConnectorResult<()> {
        Err(ConnectorError::config("transport does not support transactions"))
    }

    /// Send a message. Inside a transaction it becomes visible on commit.
    async fn send(&self, destination: &Destination, message: &Message) -> ConnectorResult<()>;

    async fn commit(&self) -> ConnectorResult<()> {
        Ok(())
    }

    async fn rollback(&self) -> ConnectorResult<()> {
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        false
    }

    /// Release the underlying connection. Only the pool calls this.
    async fn close(&self) -> ConnectorResult<()>;
}

/// One subscription on a destination
#[async_trait]
pub trait Consumer: Send + 'static {
    /// Wait for the next message. `Ok(None)` means the subscription ended.
    ///
    /// Must be cancel-safe: the runtime drops the future on shutdown.
    async fn receive(&mut self) -> ConnectorResult<Option<Message>>;

    async fn ack(&mut self, message: &Message) -> ConnectorResult<()>;

    /// Hand an unacknowledged message back for redelivery
    async fn reject(&mut self, _message: &Message) -> ConnectorResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> ConnectorResult<()>;
}

/// Per-message business processing for a listener
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> ConnectorResult<()>;

    /// Error channel for failures that are not tied to a successful
    /// handle call: transport exceptions, poison messages, dropped messages.
    async fn on_error(&self, error: ConnectorError) {
        tracing::warn!(error = %error, "unhandled listener error");
    }
}

/// Answers whether this process currently holds a singleton listener's
/// cluster-wide lease. Election itself lives outside the core.
#[cfg_attr(test, mockall::automock)]
pub trait SingletonGate: Send + Sync {
    fn holds_lease(&self, listener: &str) -> bool;
}

impl SingletonGate for std::sync::atomic::AtomicBool {
    fn holds_lease(&self, _listener: &str) -> bool {
        self.load(std::sync::atomic::Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_delivery_policy_ack_modes() {
        assert_eq!(DeliveryPolicy::AtMostOnce.ack_mode(), AckMode::Auto);
        assert_eq!(DeliveryPolicy::AtLeastOnce.ack_mode(), AckMode::Client);
        assert_eq!(DeliveryPolicy::default(), DeliveryPolicy::AtLeastOnce);
    }

    #[test]
    fn test_atomic_bool_gate() {
        let gate = AtomicBool::new(false);
        assert!(!gate.holds_lease("orders"));
        gate.store(true, std::sync::atomic::Ordering::Release);
        assert!(gate.holds_lease("orders"));
    }
}
