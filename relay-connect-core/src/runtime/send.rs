//! Send runtime: outbound delivery with optional transactional batching.
//!
//! Non-transactional sends treat every message as its own unit. In
//! transactional mode messages are staged inside an adapter transaction
//! and committed every `batch_size` messages and once more when the input
//! runs out; a failed commit fails exactly the messages of that batch.

use crate::config::{RetrySettings, SendSettings};
use crate::message::{Destination, DestinationSpec, ExecutionContext, Message};
use crate::pool::{AdapterPool, Lease, ResourceKey};
use crate::retry;
use crate::traits::{Adapter, AdapterFactory};
use crate::{ConnectorConfig, ConnectorError, ConnectorMetrics, ConnectorResult};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one message in a send call
#[derive(Debug, Clone)]
pub enum MessageStatus {
    Delivered,
    /// Handed to the transport but not delivered
    Failed(Arc<ConnectorError>),
    /// Refused before any transport call
    Rejected(Arc<ConnectorError>),
}

impl MessageStatus {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }

    pub fn error(&self) -> Option<&ConnectorError> {
        match self {
            Self::Delivered => None,
            Self::Failed(e) | Self::Rejected(e) => Some(e),
        }
    }
}

/// Per-message results of a send call, in input order
#[derive(Debug, Clone, Default)]
pub struct SendReport {
    statuses: Vec<MessageStatus>,
    batches: usize,
    failed_batches: usize,
    refreshes: usize,
}

impl SendReport {
    pub fn statuses(&self) -> &[MessageStatus] {
        &self.statuses
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    pub fn delivered(&self) -> usize {
        self.statuses.iter().filter(|s| s.is_delivered()).count()
    }

    pub fn failed(&self) -> usize {
        self.statuses.iter().filter(|s| s.is_failed()).count()
    }

    pub fn rejected(&self) -> usize {
        self.statuses.iter().filter(|s| s.is_rejected()).count()
    }

    /// Committed transactional batches
    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn failed_batches(&self) -> usize {
        self.failed_batches
    }

    /// Times a broken adapter was replaced during the call
    pub fn refreshes(&self) -> usize {
        self.refreshes
    }

    pub fn all_delivered(&self) -> bool {
        self.statuses.iter().all(MessageStatus::is_delivered)
    }
}

/// Sends messages through pooled adapters
pub struct SendRuntime<F: AdapterFactory> {
    name: String,
    pool: Arc<AdapterPool<F>>,
    connection_id: String,
    destination: DestinationSpec,
    settings: SendSettings,
    retry: RetrySettings,
    cancel: CancellationToken,
}

impl<F: AdapterFactory> SendRuntime<F> {
    pub fn new(
        name: impl Into<String>,
        pool: Arc<AdapterPool<F>>,
        connection_id: impl Into<String>,
        destination: DestinationSpec,
        settings: SendSettings,
        retry: RetrySettings,
    ) -> Self {
        Self {
            name: name.into(),
            pool,
            connection_id: connection_id.into(),
            destination,
            settings,
            retry,
            cancel: CancellationToken::new(),
        }
    }

    pub fn from_config(
        config: &ConnectorConfig,
        pool: Arc<AdapterPool<F>>,
        destination: DestinationSpec,
    ) -> Self {
        Self::new(
            config.connector_name.clone(),
            pool,
            config.connection_id(),
            destination,
            config.send.clone(),
            config.retry.clone(),
        )
    }

    pub fn settings(&self) -> &SendSettings {
        &self.settings
    }

    /// Abort in-flight retries. Messages not yet delivered, now or in later
    /// calls, fail with [`ConnectorError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Key of the adapter shared by non-transactional sends
    pub fn resource_key(&self, context: &ExecutionContext) -> ResourceKey {
        context.resource_key(&self.connection_id)
    }

    /// Key of the adapter dedicated to one execution's transactions
    pub fn transaction_key(&self, context: &ExecutionContext) -> ResourceKey {
        self.resource_key(context)
            .scoped(&format!("tx:{}", context.execution_id()))
    }

    /// Send using the configured transaction mode
    pub async fn send<I>(&self, context: &ExecutionContext, messages: I) -> ConnectorResult<SendReport>
    where
        I: IntoIterator<Item = Message>,
    {
        self.send_with(context, messages, self.settings.transactional)
            .await
    }

    /// Send every message and report each outcome.
    ///
    /// Only an unresolvable destination fails the call itself; every other
    /// failure is recorded against the messages it affected.
    pub async fn send_with<I>(
        &self,
        context: &ExecutionContext,
        messages: I,
        transactional: bool,
    ) -> ConnectorResult<SendReport>
    where
        I: IntoIterator<Item = Message>,
    {
        let destination = self.destination.resolve(context)?;
        let key = if transactional {
            self.transaction_key(context)
        } else {
            self.resource_key(context)
        };
        debug!(
            sender = %self.name,
            destination = %destination,
            key = %key,
            transactional,
            "send started"
        );

        let mut run = Run {
            runtime: self,
            metrics: ConnectorMetrics::new(&self.name, &destination.to_string()),
            destination,
            key,
            transactional,
            lease: None,
            in_transaction: false,
            pending: Vec::new(),
            refreshed: false,
            broken: None,
            report: SendReport::default(),
        };
        for message in messages {
            run.push(message).await;
        }
        Ok(run.finish().await)
    }

    /// Drop the transactional adapter cached for this execution
    pub async fn end_execution(&self, context: &ExecutionContext) -> ConnectorResult<()> {
        let key = self.transaction_key(context);
        info!(sender = %self.name, key = %key, "ending execution");
        self.pool.invalidate(&key).await
    }
}

async fn send_one<A: Adapter>(
    adapter: &A,
    destination: &Destination,
    message: &Message,
    settings: &RetrySettings,
    cancel: &CancellationToken,
) -> ConnectorResult<()> {
    let mut policy = settings.budget();
    retry::retry(&mut policy, &settings.backoff(), cancel, move |attempt| {
        if attempt.number > 1 {
            debug!(attempt = attempt.number, "resending message");
        }
        adapter.send(destination, message)
    })
    .await
}

/// State of one send call
struct Run<'a, F: AdapterFactory> {
    runtime: &'a SendRuntime<F>,
    metrics: ConnectorMetrics,
    destination: Destination,
    key: ResourceKey,
    transactional: bool,
    lease: Option<Lease<F::Adapter>>,
    in_transaction: bool,
    /// Indices of staged messages in the open transaction
    pending: Vec<usize>,
    refreshed: bool,
    /// Set once the call can no longer deliver anything
    broken: Option<Arc<ConnectorError>>,
    report: SendReport,
}

impl<F: AdapterFactory> Run<'_, F> {
    async fn push(&mut self, message: Message) {
        let index = self.report.statuses.len();

        if let Some(error) = &self.broken {
            self.report.statuses.push(MessageStatus::Failed(error.clone()));
            return;
        }

        let limit = self.runtime.settings.size_threshold_bytes;
        let size = message.size();
        if size as u64 > limit {
            warn!(index, size, limit, "message exceeds size threshold, rejecting");
            self.metrics.record_rejected();
            self.report
                .statuses
                .push(MessageStatus::Rejected(Arc::new(
                    ConnectorError::MessageTooLarge { size, limit },
                )));
            return;
        }

        if let Err(e) = self.ensure_lease().await {
            let error = Arc::new(e);
            self.broken = Some(error.clone());
            self.report.statuses.push(MessageStatus::Failed(error));
            return;
        }

        if self.transactional {
            self.push_staged(index, message).await;
        } else {
            self.push_single(message).await;
        }
    }

    async fn ensure_lease(&mut self) -> ConnectorResult<()> {
        if self.lease.is_some() {
            return Ok(());
        }

        let lease = self.runtime.pool.acquire(&self.key).await?;
        if self.transactional && !lease.supports_transactions() {
            self.runtime.pool.release(lease).await.ok();
            return Err(ConnectorError::config(format!(
                "adapter for {} does not support transactions",
                self.key
            )));
        }
        self.lease = Some(lease);
        Ok(())
    }

    fn adapter(&self) -> ConnectorResult<&Lease<F::Adapter>> {
        self.lease
            .as_ref()
            .ok_or_else(|| ConnectorError::invalid_state("no adapter acquired"))
    }

    async fn deliver(&self, message: &Message) -> ConnectorResult<()> {
        let adapter = self.adapter()?;
        send_one(
            &**adapter,
            &self.destination,
            message,
            &self.runtime.retry,
            &self.runtime.cancel,
        )
        .await
    }

    async fn push_single(&mut self, message: Message) {
        let mut result = self.deliver(&message).await;

        if matches!(&result, Err(e) if e.is_resource_invalid()) && self.refresh().await {
            result = match self.ensure_lease().await {
                Ok(()) => self.deliver(&message).await,
                Err(e) => Err(e),
            };
        }

        let status = match result {
            Ok(()) => {
                self.metrics.record_sent(1);
                MessageStatus::Delivered
            }
            Err(e) => {
                warn!(error = %e, "send failed");
                self.metrics.record_error(e.kind());
                let error = Arc::new(e);
                self.record_failure(&error);
                MessageStatus::Failed(error)
            }
        };
        self.report.statuses.push(status);
    }

    async fn push_staged(&mut self, index: usize, message: Message) {
        match self.stage(&message).await {
            Ok(()) => {
                // settled when the batch commits or fails
                self.report.statuses.push(MessageStatus::Delivered);
                self.pending.push(index);
                if self.pending.len() >= self.runtime.settings.batch_size {
                    self.commit().await;
                }
            }
            Err(e) => {
                warn!(index, error = %e, "staging failed, abandoning batch");
                let error = Arc::new(e);
                self.report.statuses.push(MessageStatus::Failed(error.clone()));
                self.abort(error).await;
            }
        }
    }

    async fn stage(&mut self, message: &Message) -> ConnectorResult<()> {
        if !self.in_transaction {
            self.adapter()?.begin().await?;
            self.in_transaction = true;
            debug!(key = %self.key, "transaction started");
        }
        self.deliver(message).await
    }

    async fn commit(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let result = match self.adapter() {
            Ok(adapter) => adapter.commit().await,
            Err(e) => Err(e),
        };
        self.in_transaction = false;

        match result {
            Ok(()) => {
                let size = self.pending.len();
                self.pending.clear();
                self.report.batches += 1;
                self.metrics.record_committed();
                self.metrics.record_sent(size as u64);
                self.metrics.record_batch_size(size);
                debug!(key = %self.key, size, "batch committed");
            }
            Err(e) => {
                warn!(key = %self.key, size = self.pending.len(), error = %e, "commit failed, failing batch");
                self.abort(Arc::new(e)).await;
            }
        }
    }

    /// Fail the open batch and roll its transaction back
    async fn abort(&mut self, error: Arc<ConnectorError>) {
        for index in self.pending.drain(..) {
            self.report.statuses[index] = MessageStatus::Failed(error.clone());
        }
        self.report.failed_batches += 1;
        self.metrics.record_error(error.kind());

        if let Some(lease) = self.lease.as_ref() {
            match lease.rollback().await {
                Ok(()) => self.metrics.record_rollback(),
                Err(e) => warn!(key = %self.key, error = %e, "rollback failed"),
            }
        }
        self.in_transaction = false;

        if error.is_resource_invalid() && self.refresh().await {
            return;
        }
        self.record_failure(&error);
    }

    /// Replace the adapter after it was found broken. Allowed once per call.
    async fn refresh(&mut self) -> bool {
        if self.refreshed {
            return false;
        }
        self.refreshed = true;
        self.report.refreshes += 1;
        info!(key = %self.key, "adapter invalid, refreshing");

        let pool = &self.runtime.pool;
        if let Err(e) = pool.invalidate(&self.key).await {
            warn!(key = %self.key, error = %e, "failed to invalidate adapter");
        }
        if let Some(lease) = self.lease.take() {
            if let Err(e) = pool.release(lease).await {
                warn!(key = %self.key, error = %e, "failed to release adapter");
            }
        }
        self.in_transaction = false;
        true
    }

    fn record_failure(&mut self, error: &Arc<ConnectorError>) {
        let unrecoverable = error.is_resource_invalid()
            || error.is_cancelled()
            || matches!(**error, ConnectorError::PoolClosed);
        if unrecoverable {
            warn!(key = %self.key, error = %error, "failing remaining messages");
            self.broken = Some(error.clone());
        }
    }

    async fn finish(mut self) -> SendReport {
        self.commit().await;

        if let Some(lease) = self.lease.take() {
            if let Err(e) = self.runtime.pool.release(lease).await {
                warn!(key = %self.key, error = %e, "failed to release adapter");
            }
        }

        info!(
            sender = %self.runtime.name,
            destination = %self.destination,
            delivered = self.report.delivered(),
            failed = self.report.failed(),
            rejected = self.report.rejected(),
            batches = self.report.batches,
            "send finished"
        );
        self.report
    }
}
