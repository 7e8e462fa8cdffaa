//! # Relay Connect Core
//!
//! Client-side resilience core for integration connectors.
//!
//! This library provides the pieces every outbound connector needs but none
//! should reimplement: a keyed pool of transport adapters, retry budgets,
//! a supervised listener runtime with configurable delivery semantics and a
//! batching, transactional send runtime. Connector front ends only supply
//! the transport (through [`AdapterFactory`], [`Adapter`] and [`Consumer`])
//! and the per-message business logic (through [`MessageSink`]).
//!
//! ## Overview
//!
//! - **Retry**: [`RetryBudget`] variants decide whether and when to retry;
//!   [`StatusRetryPolicy`] adds transport status awareness with a single
//!   forced retry on stale credentials
//! - **Pool**: [`AdapterPool`] caches one adapter per [`ResourceKey`] and
//!   builds it at most once at a time
//! - **Listener**: [`ListenerRuntime`] runs up to `max_concurrency`
//!   consumers, acknowledging before or after the sink per [`DeliveryPolicy`]
//! - **Send**: [`SendRuntime`] reports a [`MessageStatus`] per message and
//!   commits transactional batches
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use relay_connect_core::memory::MemoryBroker;
//! use relay_connect_core::{
//!     AdapterPool, ConnectorConfig, ConnectorResult, Destination, DestinationSpec,
//!     ExecutionContext, ListenerRuntime, Message, MessageSink,
//! };
//! use async_trait::async_trait;
//! use std::sync::Arc;
//!
//! struct PrintSink;
//!
//! #[async_trait]
//! impl MessageSink for PrintSink {
//!     async fn handle(&self, message: &Message) -> ConnectorResult<()> {
//!         println!("Got message: {}", message.payload_str()?);
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> ConnectorResult<()> {
//! let config = ConnectorConfig::new("orders-listener");
//! let broker = MemoryBroker::new();
//! let pool = Arc::new(AdapterPool::from_settings(broker.factory(), &config.pool));
//!
//! let listener = ListenerRuntime::from_config(
//!     &config,
//!     pool.clone(),
//!     DestinationSpec::Static(Destination::queue("orders")),
//!     ExecutionContext::new(),
//! );
//! listener.start(Arc::new(PrintSink)).await?;
//! // ...
//! listener.stop().await?;
//! pool.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod message;
mod metrics;
mod pool;
mod retry;
mod runtime;
mod traits;

pub mod memory;

// Re-export public API
pub use crate::config::{
    ConnectorConfig, ListenerSettings, PoolSettings, ProcessingSettings, RetrySettings,
    RetryStrategyKind, SendSettings,
};
pub use error::{ConnectorError, ConnectorResult};
pub use message::{Destination, DestinationKind, DestinationSpec, ExecutionContext, Message};
pub use crate::metrics::ConnectorMetrics;
pub use pool::{AdapterPool, Lease, PropertyValue, ResourceKey};
pub use retry::{
    retry, Attempt, Backoff, DurationBudget, Outcome, PhasedBudget, RetryBudget, RetryDecision,
    RetryPolicy, StatusRetryPolicy, TimeoutBudget, DEFAULT_RETRYABLE_STATUSES,
};
pub use runtime::{
    init_tracing, ListenerRuntime, ListenerState, MessageStatus, SendReport, SendRuntime,
};
pub use traits::{
    AckMode, Adapter, AdapterFactory, Consumer, DeliveryPolicy, ExceptionSender, MessageSink,
    SingletonGate,
};

// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
