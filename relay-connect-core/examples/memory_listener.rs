//! Listener example over the in-process transport
//!
//! Starts a listener with a few concurrent consumers, publishes messages,
//! lets one of them fail once to show redelivery, then stops.
//!
//! Usage:
//!   CONNECTOR_NAME=memory-listener \
//!   MAX_CONCURRENCY=2 \
//!   cargo run --example memory_listener

use async_trait::async_trait;
use relay_connect_core::memory::MemoryBroker;
use relay_connect_core::{
    init_tracing, AdapterPool, ConnectorConfig, ConnectorError, ConnectorResult, Destination,
    DestinationSpec, ExecutionContext, ListenerRuntime, Message, MessageSink,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Prints messages, refusing the first "flaky" one
struct PrintingSink {
    message_count: AtomicU64,
    refused: AtomicBool,
}

#[async_trait]
impl MessageSink for PrintingSink {
    async fn handle(&self, message: &Message) -> ConnectorResult<()> {
        let text = message.payload_str()?;
        if text == "flaky" && !self.refused.swap(true, Ordering::SeqCst) {
            return Err(ConnectorError::fatal("refusing flaky message once"));
        }

        let n = self.message_count.fetch_add(1, Ordering::SeqCst) + 1;
        println!(
            "=== Message #{} === {} (redelivery {})",
            n, text, message.redelivery_count
        );
        Ok(())
    }

    async fn on_error(&self, error: ConnectorError) {
        println!("Listener error: {}", error);
    }
}

#[tokio::main]
async fn main() -> ConnectorResult<()> {
    let config = match ConnectorConfig::from_env() {
        Ok(config) => config,
        Err(_) => ConnectorConfig::new("memory-listener"),
    };
    config.validate()?;
    init_tracing(&config);

    let broker = MemoryBroker::new();
    let pool = Arc::new(AdapterPool::from_settings(broker.factory(), &config.pool));
    let queue = Destination::queue("orders");

    let listener = ListenerRuntime::from_config(
        &config,
        pool.clone(),
        DestinationSpec::Static(queue.clone()),
        ExecutionContext::new(),
    );
    let sink = Arc::new(PrintingSink {
        message_count: AtomicU64::new(0),
        refused: AtomicBool::new(false),
    });
    listener.start(sink.clone()).await?;
    println!("Listener state: {}", listener.state());

    for payload in ["first", "flaky", "second", "third"] {
        broker.publish(&queue, Message::from_string(payload));
    }
    broker.raise_exception("simulated provider warning");

    tokio::time::sleep(Duration::from_millis(200)).await;

    listener.stop().await?;
    pool.shutdown().await?;

    println!("Listener state: {}", listener.state());
    println!(
        "Total messages processed: {}",
        sink.message_count.load(Ordering::SeqCst)
    );
    println!("Broker stats: {:?}", broker.stats());
    Ok(())
}
