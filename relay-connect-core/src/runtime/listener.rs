//! Listener runtime: concurrent consumers on one destination.
//!
//! A started listener is driven by a supervisor task that owns the adapter
//! lease, the consumer tasks and the exception handler. Stopping cancels
//! every consumer, closes each one, and hands the adapter back to the pool.

use super::ConsumerOf;
use crate::config::{ListenerSettings, RetrySettings};
use crate::message::{DestinationSpec, ExecutionContext, Message};
use crate::pool::{AdapterPool, Lease, ResourceKey};
use crate::retry;
use crate::traits::{
    Adapter, AdapterFactory, Consumer, DeliveryPolicy, ExceptionSender, MessageSink, SingletonGate,
};
use crate::{ConnectorConfig, ConnectorError, ConnectorMetrics, ConnectorResult};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`ListenerRuntime`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Start failed, or every consumer ended without a stop request
    Failed,
}

impl ListenerState {
    /// No further transitions happen from this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

fn transition(
    state: &watch::Sender<ListenerState>,
    name: &str,
    from: &[ListenerState],
    to: ListenerState,
) -> bool {
    state.send_if_modified(|current| {
        if from.contains(current) {
            info!(listener = %name, from = %current, to = %to, "listener state changed");
            *current = to;
            true
        } else {
            false
        }
    })
}

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Id of the runtime whose supervisor or worker is running this task
    static OWNER: u64;
}

fn join_error(error: JoinError) -> ConnectorError {
    ConnectorError::Internal(anyhow::anyhow!("listener task failed: {}", error))
}

/// Supervises `max_concurrency` consumers pulling from one destination.
///
/// A runtime runs once: after it has stopped or failed, build a new one to
/// restart.
pub struct ListenerRuntime<F: AdapterFactory> {
    id: u64,
    name: String,
    pool: Arc<AdapterPool<F>>,
    key: ResourceKey,
    destination: DestinationSpec,
    context: ExecutionContext,
    settings: ListenerSettings,
    gate: Option<Arc<dyn SingletonGate>>,
    state: Arc<watch::Sender<ListenerState>>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<ConnectorResult<()>>>>,
}

impl<F: AdapterFactory> ListenerRuntime<F> {
    pub fn new(
        name: impl Into<String>,
        pool: Arc<AdapterPool<F>>,
        key: ResourceKey,
        destination: DestinationSpec,
        context: ExecutionContext,
        settings: ListenerSettings,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Idle);
        Self {
            id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            pool,
            key,
            destination,
            context,
            settings,
            gate: None,
            state: Arc::new(state),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
        }
    }

    /// Listener named after the connector, keyed by the configured
    /// connection id and the context properties
    pub fn from_config(
        config: &ConnectorConfig,
        pool: Arc<AdapterPool<F>>,
        destination: DestinationSpec,
        context: ExecutionContext,
    ) -> Self {
        let key = context.resource_key(config.connection_id());
        Self::new(
            config.connector_name.clone(),
            pool,
            key,
            destination,
            context,
            config.listener.clone(),
        )
    }

    /// Gate consulted before starting a singleton listener
    pub fn with_singleton_gate(mut self, gate: Arc<dyn SingletonGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Subscribe every consumer and begin delivering to `sink`.
    ///
    /// Either all consumers are running when this returns `Ok`, or none
    /// are: a failed start closes whatever was created, releases the
    /// adapter and leaves the runtime `Failed`.
    pub async fn start(&self, sink: Arc<dyn MessageSink>) -> ConnectorResult<()> {
        let mut supervisor = self.supervisor.lock().await;

        if self.settings.singleton {
            let held = self
                .gate
                .as_ref()
                .is_some_and(|gate| gate.holds_lease(&self.name));
            if !held {
                warn!(listener = %self.name, "singleton lease not held, not starting");
                return Err(ConnectorError::SingletonNotHeld(self.name.clone()));
            }
        }

        if !transition(
            &self.state,
            &self.name,
            &[ListenerState::Idle],
            ListenerState::Starting,
        ) {
            return Err(ConnectorError::invalid_state(format!(
                "listener {} cannot start while {}",
                self.name,
                self.state()
            )));
        }

        match self.launch(sink).await {
            Ok(handle) => {
                *supervisor = Some(handle);
                Ok(())
            }
            Err(e) => {
                let end = if e.is_cancelled() {
                    ListenerState::Stopped
                } else {
                    error!(listener = %self.name, error = %e, "listener failed to start");
                    ListenerState::Failed
                };
                transition(
                    &self.state,
                    &self.name,
                    &[ListenerState::Starting],
                    ListenerState::Stopping,
                );
                transition(&self.state, &self.name, &[ListenerState::Stopping], end);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        sink: Arc<dyn MessageSink>,
    ) -> ConnectorResult<JoinHandle<ConnectorResult<()>>> {
        let lease = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ConnectorError::Cancelled),
            lease = self.pool.acquire(&self.key) => lease?,
        };

        let destination = match self.destination.resolve(&self.context) {
            Ok(destination) => destination,
            Err(e) => {
                teardown(&self.pool, lease, Vec::new()).await.ok();
                return Err(e);
            }
        };

        let mut count = self.settings.max_concurrency;
        if let Some(limit) = lease.max_consumers(&destination) {
            if limit < count {
                info!(
                    listener = %self.name,
                    destination = %destination,
                    configured = count,
                    limit,
                    "transport limits consumers on this destination, capping concurrency"
                );
                count = limit.max(1);
            }
        }

        let ack_mode = self.settings.delivery.ack_mode();
        let mut consumers = Vec::with_capacity(count);
        for index in 0..count {
            let subscribed = tokio::select! {
                _ = self.cancel.cancelled() => Err(ConnectorError::Cancelled),
                consumer = lease.subscribe(&destination, ack_mode) => consumer,
            };
            match subscribed {
                Ok(consumer) => {
                    debug!(listener = %self.name, consumer = index, "consumer subscribed");
                    consumers.push(consumer);
                }
                Err(e) => {
                    warn!(
                        listener = %self.name,
                        consumer = index,
                        error = %e,
                        "subscription failed, closing {} consumer(s)",
                        consumers.len()
                    );
                    if let Err(close_error) = teardown(&self.pool, lease, consumers).await {
                        warn!(listener = %self.name, error = %close_error, "cleanup after failed start");
                    }
                    return Err(e);
                }
            }
        }

        if self.cancel.is_cancelled() {
            teardown(&self.pool, lease, consumers).await.ok();
            return Err(ConnectorError::Cancelled);
        }

        let (exceptions_tx, exceptions) = mpsc::unbounded_channel();
        lease.set_exception_listener(exceptions_tx.clone());

        let metrics = Arc::new(ConnectorMetrics::new(&self.name, &destination.to_string()));
        metrics.set_health(true);

        transition(
            &self.state,
            &self.name,
            &[ListenerState::Starting],
            ListenerState::Running,
        );
        info!(
            listener = %self.name,
            destination = %destination,
            consumers = consumers.len(),
            delivery = ?self.settings.delivery,
            "listener running"
        );

        let mut workers = JoinSet::new();
        for (index, consumer) in consumers.into_iter().enumerate() {
            let worker = Worker::<F> {
                consumer,
                handler: Handler {
                    index,
                    delivery: self.settings.delivery,
                    sink: sink.clone(),
                    exceptions: exceptions_tx.clone(),
                    pool: self.pool.clone(),
                    key: self.key.clone(),
                    cancel: self.cancel.clone(),
                    sink_retry: self.settings.sink_retry.clone(),
                    receive_backoff: Duration::from_millis(self.settings.receive_error_backoff_ms),
                    metrics: metrics.clone(),
                },
            };
            workers.spawn(OWNER.scope(self.id, worker.run()));
        }
        drop(exceptions_tx);

        let supervisor = Supervisor::<F> {
            name: self.name.clone(),
            pool: self.pool.clone(),
            lease,
            workers,
            exceptions,
            sink,
            state: self.state.clone(),
            cancel: self.cancel.clone(),
            metrics,
        };
        Ok(tokio::spawn(OWNER.scope(self.id, supervisor.run())))
    }

    /// Stop every consumer and release the adapter.
    ///
    /// Safe to call repeatedly, concurrently with `start`, and from the
    /// sink's error path. Close failures of individual consumers are
    /// collected into one error after all of them have been attempted.
    ///
    /// Called from within the sink (`handle` or `on_error`), this only
    /// requests the stop and returns; the supervisor finishes the teardown
    /// once the sink call is done. Watch [`subscribe_state`] for the end
    /// state.
    ///
    /// [`subscribe_state`]: Self::subscribe_state
    pub async fn stop(&self) -> ConnectorResult<()> {
        self.cancel.cancel();

        if self.on_own_task() {
            debug!(listener = %self.name, "stop requested from the sink");
            return Ok(());
        }

        // waits for an in-flight start to observe the cancellation
        let handle = self.supervisor.lock().await.take();
        match handle {
            Some(handle) => handle.await.map_err(join_error)?,
            None => {
                transition(
                    &self.state,
                    &self.name,
                    &[ListenerState::Idle],
                    ListenerState::Stopped,
                );
                // another stop may still be tearing down
                let mut state = self.state.subscribe();
                state.wait_for(ListenerState::is_terminal).await.ok();
                Ok(())
            }
        }
    }

    fn on_own_task(&self) -> bool {
        OWNER.try_with(|owner| *owner == self.id).unwrap_or(false)
    }
}

impl<F: AdapterFactory> Drop for ListenerRuntime<F> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Close every consumer independently, then hand the adapter back
async fn teardown<F: AdapterFactory>(
    pool: &AdapterPool<F>,
    lease: Lease<F::Adapter>,
    mut consumers: Vec<ConsumerOf<F>>,
) -> ConnectorResult<()> {
    let mut errors: Vec<ConnectorError> =
        futures::future::join_all(consumers.iter_mut().map(|consumer| consumer.close()))
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
    for error in &errors {
        warn!(error = %error, "failed to close consumer");
    }

    if let Err(e) = pool.release(lease).await {
        warn!(error = %e, "failed to release listener adapter");
        errors.push(e);
    }
    ConnectorError::aggregate("listener stop", errors)
}

struct Supervisor<F: AdapterFactory> {
    name: String,
    pool: Arc<AdapterPool<F>>,
    lease: Lease<F::Adapter>,
    workers: JoinSet<ConsumerOf<F>>,
    exceptions: mpsc::UnboundedReceiver<ConnectorError>,
    sink: Arc<dyn MessageSink>,
    state: Arc<watch::Sender<ListenerState>>,
    cancel: CancellationToken,
    metrics: Arc<ConnectorMetrics>,
}

impl<F: AdapterFactory> Supervisor<F> {
    async fn run(mut self) -> ConnectorResult<()> {
        let mut finished = Vec::with_capacity(self.workers.len());
        let mut errors = Vec::new();
        self.metrics.set_active_consumers(self.workers.len());

        let failed = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break false,
                Some(exception) = self.exceptions.recv() => {
                    forward_exception(&self.name, &self.metrics, self.sink.as_ref(), exception).await;
                }
                joined = self.workers.join_next() => match joined {
                    Some(Ok(consumer)) => {
                        finished.push(consumer);
                        self.metrics.set_active_consumers(self.workers.len());
                    }
                    Some(Err(e)) => errors.push(join_error(e)),
                    None => break !self.cancel.is_cancelled(),
                },
            }
        };

        transition(
            &self.state,
            &self.name,
            &[ListenerState::Running],
            ListenerState::Stopping,
        );
        if failed {
            error!(listener = %self.name, "all consumers ended, listener failed");
        }

        self.cancel.cancel();
        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(consumer) => finished.push(consumer),
                Err(e) => errors.push(join_error(e)),
            }
        }
        while let Ok(exception) = self.exceptions.try_recv() {
            forward_exception(&self.name, &self.metrics, self.sink.as_ref(), exception).await;
        }

        let closed = teardown(&self.pool, self.lease, finished).await;
        self.metrics.set_active_consumers(0);
        self.metrics.set_health(false);

        let end = if failed {
            ListenerState::Failed
        } else {
            ListenerState::Stopped
        };
        transition(&self.state, &self.name, &[ListenerState::Stopping], end);

        if let Err(e) = closed {
            errors.push(e);
        }
        ConnectorError::aggregate("listener stop", errors)
    }
}

/// The single exception path: every asynchronous failure reaches the sink here
async fn forward_exception(
    name: &str,
    metrics: &ConnectorMetrics,
    sink: &dyn MessageSink,
    exception: ConnectorError,
) {
    warn!(listener = %name, error = %exception, "transport exception");
    metrics.record_error(exception.kind());
    sink.on_error(exception).await;
}

/// One consumer's receive loop
struct Worker<F: AdapterFactory> {
    consumer: ConsumerOf<F>,
    handler: Handler<F>,
}

/// Everything a worker needs besides its consumer
struct Handler<F: AdapterFactory> {
    index: usize,
    delivery: DeliveryPolicy,
    sink: Arc<dyn MessageSink>,
    exceptions: ExceptionSender,
    pool: Arc<AdapterPool<F>>,
    key: ResourceKey,
    cancel: CancellationToken,
    sink_retry: RetrySettings,
    receive_backoff: Duration,
    metrics: Arc<ConnectorMetrics>,
}

impl<F: AdapterFactory> Worker<F> {
    /// Runs until cancelled or the consumer can no longer receive, then
    /// hands the consumer back for closing.
    async fn run(mut self) -> ConsumerOf<F> {
        let index = self.handler.index;
        loop {
            let received = tokio::select! {
                biased;
                _ = self.handler.cancel.cancelled() => break,
                received = self.consumer.receive() => received,
            };

            match received {
                Ok(Some(message)) => self.deliver(message).await,
                Ok(None) => {
                    info!(consumer = index, "subscription ended");
                    break;
                }
                Err(e) if e.is_retryable() => {
                    warn!(consumer = index, error = %e, "receive failed, backing off");
                    self.handler.exceptions.send(e).ok();
                    let paused = tokio::select! {
                        _ = self.handler.cancel.cancelled() => false,
                        _ = tokio::time::sleep(self.handler.receive_backoff) => true,
                    };
                    if !paused {
                        break;
                    }
                }
                Err(e) => {
                    error!(consumer = index, error = %e, "receive failed, consumer ending");
                    let handler = &self.handler;
                    if let Err(invalidate_error) = handler.pool.invalidate(&handler.key).await {
                        warn!(error = %invalidate_error, "failed to invalidate adapter");
                    }
                    handler.exceptions.send(e).ok();
                    break;
                }
            }
        }
        self.consumer
    }

    async fn deliver(&mut self, message: Message) {
        let handler = &self.handler;
        let consumer = &mut self.consumer;
        handler.metrics.record_received();
        debug!(
            consumer = handler.index,
            tag = message.delivery_tag,
            redelivery = message.redelivery_count,
            "message received"
        );

        match handler.delivery {
            DeliveryPolicy::AtMostOnce => {
                if let Err(e) = consumer.ack(&message).await {
                    // unacknowledged messages may come back; handing this one
                    // to the sink could process it twice
                    warn!(consumer = handler.index, error = %e, "acknowledge failed, skipping message");
                    handler.report(e).await;
                    return;
                }
                handler.metrics.record_acked();

                match handler.process(&message).await {
                    Ok(()) => {}
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => {
                        warn!(consumer = handler.index, error = %e, "sink failed, message dropped");
                        handler.report(e).await;
                    }
                }
            }
            DeliveryPolicy::AtLeastOnce => match handler.process(&message).await {
                Ok(()) => handler.acknowledge(consumer, &message).await,
                // left unacknowledged; closing the consumer hands it back
                Err(e) if e.is_cancelled() => {}
                Err(e) if e.is_invalid_data() => {
                    warn!(consumer = handler.index, error = %e, "poison message, acknowledging");
                    handler.acknowledge(consumer, &message).await;
                    handler.report(e).await;
                }
                Err(e) => {
                    warn!(consumer = handler.index, error = %e, "sink failed, message left for redelivery");
                    if let Err(reject_error) = consumer.reject(&message).await {
                        warn!(consumer = handler.index, error = %reject_error, "reject failed");
                    }
                    handler.report(e).await;
                }
            },
        }
    }
}

impl<F: AdapterFactory> Handler<F> {
    async fn process(&self, message: &Message) -> ConnectorResult<()> {
        let start = Instant::now();
        let mut policy = self.sink_retry.budget();
        let backoff = self.sink_retry.backoff();
        let sink: &dyn MessageSink = self.sink.as_ref();
        let metrics: &ConnectorMetrics = &self.metrics;

        retry::retry(&mut policy, &backoff, &self.cancel, move |attempt| {
            if attempt.number > 1 {
                metrics.record_retry();
            }
            sink.handle(message)
        })
        .await?;

        self.metrics.record_success();
        self.metrics.record_processing_time(start.elapsed());
        Ok(())
    }

    async fn acknowledge(&self, consumer: &mut ConsumerOf<F>, message: &Message) {
        match consumer.ack(message).await {
            Ok(()) => {
                self.metrics.record_acked();
                debug!(consumer = self.index, tag = message.delivery_tag, "message acknowledged");
            }
            Err(e) => {
                error!(consumer = self.index, error = %e, "failed to acknowledge message");
                self.report(e).await;
            }
        }
    }

    async fn report(&self, error: ConnectorError) {
        self.metrics.record_error(error.kind());
        self.sink.on_error(error).await;
    }
}
