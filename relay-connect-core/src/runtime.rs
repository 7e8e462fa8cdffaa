//! Runtimes driving pooled adapters.
//!
//! - [`ListenerRuntime`] supervises concurrent consumers on one destination
//! - [`SendRuntime`] delivers outbound messages, optionally in transactions

mod listener;
mod send;

pub use listener::{ListenerRuntime, ListenerState};
pub use send::{MessageStatus, SendReport, SendRuntime};

use crate::traits::{Adapter, AdapterFactory};
use crate::ConnectorConfig;

pub(crate) type ConsumerOf<F> = <<F as AdapterFactory>::Adapter as Adapter>::Consumer;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured log level. Calling this more than
/// once keeps the first subscriber.
pub fn init_tracing(config: &ConnectorConfig) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.processing.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();
}
