//! Transactional send example over the in-process transport
//!
//! Sends ten messages in batches of four with the second commit forced to
//! fail, then prints the per-message report.
//!
//! Usage:
//!   CONNECTOR_NAME=tx-sender \
//!   BATCH_SIZE=4 \
//!   cargo run --example transactional_send

use relay_connect_core::memory::MemoryBroker;
use relay_connect_core::{
    init_tracing, AdapterPool, ConnectorConfig, ConnectorResult, Destination, DestinationKind,
    DestinationSpec, ExecutionContext, Message, MessageStatus, SendRuntime,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> ConnectorResult<()> {
    let mut config = match ConnectorConfig::from_env() {
        Ok(config) => config,
        Err(_) => {
            let mut config = ConnectorConfig::new("tx-sender");
            config.send.batch_size = 4;
            config
        }
    };
    config.send.transactional = true;
    config.validate()?;
    init_tracing(&config);

    let broker = MemoryBroker::new();
    broker.fail_commit(2);
    let pool = Arc::new(AdapterPool::from_settings(broker.factory(), &config.pool));

    // the target queue comes from the execution context
    let sender = SendRuntime::from_config(
        &config,
        pool.clone(),
        DestinationSpec::Dynamic {
            kind: DestinationKind::Queue,
            property: "target_queue".into(),
        },
    );
    let context = ExecutionContext::new().with_property("target_queue", "invoices");

    let messages: Vec<Message> = (1..=10)
        .map(|n| Message::from_string(format!("invoice-{}", n)).with_attribute("seq", n.to_string()))
        .collect();
    let report = sender.send(&context, messages).await?;

    for (index, status) in report.statuses().iter().enumerate() {
        match status {
            MessageStatus::Delivered => println!("#{:<2} delivered", index + 1),
            MessageStatus::Failed(e) => println!("#{:<2} failed: {}", index + 1, e),
            MessageStatus::Rejected(e) => println!("#{:<2} rejected: {}", index + 1, e),
        }
    }
    println!(
        "Committed batches: {}, failed batches: {}",
        report.batches(),
        report.failed_batches()
    );
    println!(
        "Delivered to queue: {}",
        broker
            .published_payloads(&Destination::queue("invoices"))
            .len()
    );

    sender.end_execution(&context).await?;
    pool.shutdown().await?;
    Ok(())
}
