//! Keyed pool of transport adapters.
//!
//! The pool owns every adapter it creates. Callers borrow one through a
//! [`Lease`] and hand it back with [`AdapterPool::release`]; they never close
//! an adapter themselves.
//!
//! Construction is serialized per key: concurrent acquires for equal keys
//! share a single factory call, while acquires for different keys proceed
//! in parallel.

mod key;

pub use key::{PropertyValue, ResourceKey};

use crate::config::PoolSettings;
use crate::retry::{self, Backoff, RetryBudget};
use crate::traits::{Adapter, AdapterFactory};
use crate::{ConnectorError, ConnectorResult};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// An adapter together with its pool bookkeeping
pub(crate) struct PooledResource<A> {
    key: ResourceKey,
    handle: A,
    valid: AtomicBool,
    refs: AtomicUsize,
    closed: AtomicBool,
}

impl<A: Adapter> PooledResource<A> {
    fn new(key: ResourceKey, handle: A) -> Self {
        Self {
            key,
            handle,
            valid: AtomicBool::new(true),
            refs: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn borrow(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    async fn close_once(&self) -> ConnectorResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(key = %self.key, "closing adapter");
        self.handle.close().await
    }
}

/// One cache line. The lock serializes construction for its key.
struct Slot<A> {
    current: RwLock<Option<Arc<PooledResource<A>>>>,
}

impl<A> Default for Slot<A> {
    fn default() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }
}

/// State shared between the pool and outstanding leases
struct Shared<A> {
    entries: Mutex<HashMap<ResourceKey, Arc<Slot<A>>>>,
}

impl<A: Adapter> Shared<A> {
    fn slot(&self, key: &ResourceKey) -> Option<Arc<Slot<A>>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn slot_or_insert(&self, key: &ResourceKey) -> Arc<Slot<A>> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Remove an invalid resource from its slot (if still there) and close it.
    async fn discard(&self, resource: &Arc<PooledResource<A>>) -> ConnectorResult<()> {
        if let Some(slot) = self.slot(&resource.key) {
            let mut current = slot.current.write().await;
            if current
                .as_ref()
                .is_some_and(|cached| Arc::ptr_eq(cached, resource))
            {
                *current = None;
            }
            let empty = current.is_none();
            drop(current);

            if empty {
                let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
                // only the map and this function hold the slot: nobody is
                // waiting to build into it
                let unused = entries
                    .get(&resource.key)
                    .is_some_and(|s| Arc::ptr_eq(s, &slot) && Arc::strong_count(&slot) == 2);
                if unused {
                    entries.remove(&resource.key);
                }
            }
        }

        info!(key = %resource.key, "discarding invalid adapter");
        resource.close_once().await
    }

    async fn give_back(&self, resource: Arc<PooledResource<A>>) -> ConnectorResult<()> {
        let previous = resource.refs.fetch_sub(1, Ordering::SeqCst);
        debug!(key = %resource.key, refs = previous - 1, "adapter released");
        if previous == 1 && !resource.is_valid() {
            self.discard(&resource).await
        } else {
            Ok(())
        }
    }
}

/// A borrowed adapter. Dereferences to the adapter itself.
///
/// Return it with [`AdapterPool::release`]. A lease that is dropped instead
/// still decrements the reference count, but closing an invalid adapter
/// then happens on a background task.
pub struct Lease<A: Adapter> {
    resource: Option<Arc<PooledResource<A>>>,
    shared: Arc<Shared<A>>,
}

impl<A: Adapter> Lease<A> {
    fn new(resource: Arc<PooledResource<A>>, shared: Arc<Shared<A>>) -> Self {
        resource.borrow();
        Self {
            resource: Some(resource),
            shared,
        }
    }

    fn resource(&self) -> &Arc<PooledResource<A>> {
        // only `release` takes the resource, and it consumes the lease
        self.resource
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease used after release"))
    }

    pub fn key(&self) -> &ResourceKey {
        &self.resource().key
    }

    pub fn is_valid(&self) -> bool {
        self.resource().is_valid()
    }

    /// Flag the adapter as broken; it is destroyed once every borrower has
    /// released it and the next acquire builds a new one.
    pub fn mark_invalid(&self) {
        self.resource().valid.store(false, Ordering::SeqCst);
    }

    /// True when both leases borrow the same pooled adapter
    pub fn same_adapter(&self, other: &Lease<A>) -> bool {
        Arc::ptr_eq(self.resource(), other.resource())
    }

    async fn release(mut self) -> ConnectorResult<()> {
        match self.resource.take() {
            Some(resource) => self.shared.give_back(resource).await,
            None => Ok(()),
        }
    }
}

impl<A: Adapter> fmt::Debug for Lease<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut lease = f.debug_struct("Lease");
        match &self.resource {
            Some(resource) => lease
                .field("key", &resource.key)
                .field("valid", &resource.is_valid()),
            None => lease.field("released", &true),
        };
        lease.finish()
    }
}

impl<A: Adapter> Deref for Lease<A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.resource().handle
    }
}

impl<A: Adapter> Drop for Lease<A> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        warn!(key = %resource.key, "lease dropped without release");

        let previous = resource.refs.fetch_sub(1, Ordering::SeqCst);
        if previous == 1 && !resource.is_valid() {
            let shared = self.shared.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = shared.discard(&resource).await {
                            warn!(error = %e, "failed to close dropped adapter");
                        }
                    });
                }
                Err(_) => warn!(key = %resource.key, "no runtime to close dropped adapter"),
            }
        }
    }
}

/// Factory-backed adapter cache
pub struct AdapterPool<F: AdapterFactory> {
    factory: F,
    shared: Arc<Shared<F::Adapter>>,
    connect_retry: RetryBudget,
    backoff: Backoff,
    shutdown: CancellationToken,
}

impl<F: AdapterFactory> AdapterPool<F> {
    /// Pool with a small default connect retry budget
    pub fn new(factory: F) -> Self {
        Self::with_connect_retry(
            factory,
            RetryBudget::phased(
                3,
                vec![
                    Duration::from_millis(100),
                    Duration::from_millis(500),
                    Duration::from_secs(1),
                ],
            ),
            Backoff::default(),
        )
    }

    pub fn with_connect_retry(factory: F, connect_retry: RetryBudget, backoff: Backoff) -> Self {
        Self {
            factory,
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
            }),
            connect_retry,
            backoff,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_settings(factory: F, settings: &PoolSettings) -> Self {
        Self::with_connect_retry(
            factory,
            settings.connect_retry.budget(),
            settings.connect_retry.backoff(),
        )
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Borrow the adapter for `key`, creating it on a miss or when the
    /// cached one has been invalidated.
    pub async fn acquire(&self, key: &ResourceKey) -> ConnectorResult<Lease<F::Adapter>> {
        if self.is_shut_down() {
            return Err(ConnectorError::PoolClosed);
        }

        let slot = self.shared.slot_or_insert(key);

        {
            let current = slot.current.read().await;
            if let Some(resource) = current.as_ref().filter(|r| r.is_valid()) {
                debug!(key = %key, "reusing pooled adapter");
                return Ok(Lease::new(resource.clone(), self.shared.clone()));
            }
        }

        let mut current = slot.current.write().await;
        // built by a concurrent acquire while we waited for the lock
        if let Some(resource) = current.as_ref().filter(|r| r.is_valid()) {
            debug!(key = %key, "reusing adapter built concurrently");
            return Ok(Lease::new(resource.clone(), self.shared.clone()));
        }
        if self.is_shut_down() {
            return Err(ConnectorError::PoolClosed);
        }

        let handle = self.connect(key).await?;
        let resource = Arc::new(PooledResource::new(key.clone(), handle));
        *current = Some(resource.clone());
        info!(key = %key, "created pooled adapter");

        Ok(Lease::new(resource, self.shared.clone()))
    }

    async fn connect(&self, key: &ResourceKey) -> ConnectorResult<F::Adapter> {
        let mut policy = self.connect_retry.clone();
        let result = retry::retry(&mut policy, &self.backoff, &self.shutdown, |attempt| {
            if attempt.number > 1 {
                debug!(key = %key, attempt = attempt.number, "retrying adapter creation");
            }
            self.factory.create(key)
        })
        .await;

        match result {
            Err(ConnectorError::Cancelled) => Err(ConnectorError::PoolClosed),
            other => other,
        }
    }

    /// Return a borrowed adapter. The adapter stays cached for reuse unless
    /// it has been invalidated and this was the last borrower.
    pub async fn release(&self, lease: Lease<F::Adapter>) -> ConnectorResult<()> {
        lease.release().await
    }

    /// Mark the cached adapter for `key` broken. It is closed immediately
    /// when nobody borrows it, otherwise on its last release.
    pub async fn invalidate(&self, key: &ResourceKey) -> ConnectorResult<()> {
        let Some(slot) = self.shared.slot(key) else {
            return Ok(());
        };

        let mut current = slot.current.write().await;
        let Some(resource) = current.as_ref() else {
            return Ok(());
        };
        resource.valid.store(false, Ordering::SeqCst);
        info!(key = %key, refs = resource.refs.load(Ordering::SeqCst), "adapter invalidated");

        if resource.refs.load(Ordering::SeqCst) == 0 {
            if let Some(resource) = current.take() {
                drop(current);
                return self.shared.discard(&resource).await;
            }
        }
        Ok(())
    }

    /// Close every cached adapter regardless of outstanding leases. Further
    /// acquires fail with [`ConnectorError::PoolClosed`].
    pub async fn shutdown(&self) -> ConnectorResult<()> {
        self.shutdown.cancel();

        let slots: Vec<_> = self
            .shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, slot)| slot)
            .collect();

        let mut resources = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(resource) = slot.current.write().await.take() {
                resource.valid.store(false, Ordering::SeqCst);
                resources.push(resource);
            }
        }

        info!(adapters = resources.len(), "shutting down adapter pool");
        let errors: Vec<_> = futures::future::join_all(resources.iter().map(|r| r.close_once()))
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect();
        for error in &errors {
            warn!(error = %error, "failed to close adapter during shutdown");
        }
        ConnectorError::aggregate("pool shutdown", errors)
    }

    /// Number of keys with a cached adapter
    pub async fn len(&self) -> usize {
        let slots: Vec<_> = self
            .shared
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut count = 0;
        for slot in slots {
            if slot.current.read().await.is_some() {
                count += 1;
            }
        }
        count
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Whether a valid adapter is cached for `key`
    pub async fn is_cached(&self, key: &ResourceKey) -> bool {
        match self.shared.slot(key) {
            Some(slot) => slot
                .current
                .read()
                .await
                .as_ref()
                .is_some_and(|r| r.is_valid()),
            None => false,
        }
    }

    /// Outstanding leases on the adapter cached for `key`
    pub async fn ref_count(&self, key: &ResourceKey) -> Option<usize> {
        let slot = self.shared.slot(key)?;
        let current = slot.current.read().await;
        current.as_ref().map(|r| r.refs.load(Ordering::SeqCst))
    }
}
