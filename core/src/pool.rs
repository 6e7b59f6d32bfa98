//! Isolation pools
//!
//! Every pool key owns a fixed number of run permits plus an optional wait
//! queue. Admission is fail-fast through a [`Bulkhead`]; admitted work then
//! waits for a run permit and is spawned on the pool's runtime.

use crate::{
    PoolKey,
    bulkhead::{Bulkhead, BulkheadPermit},
    config::PoolConfig,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded worker allotment for one pool key
#[derive(Debug)]
pub struct WorkerPool {
    key: PoolKey,
    admission: Arc<Bulkhead>,
    run_permits: Arc<Semaphore>,
    max_concurrency: usize,
    handle: Handle,
}

impl WorkerPool {
    /// # Panics
    ///
    /// Panics if `config.max_concurrency` is 0.
    pub fn new(key: PoolKey, config: &PoolConfig, default_handle: &Handle) -> Self {
        assert!(
            config.max_concurrency > 0,
            "Pool max_concurrency must be greater than 0"
        );
        Self {
            key,
            admission: Arc::new(Bulkhead::new(config.capacity())),
            run_permits: Arc::new(Semaphore::new(config.max_concurrency)),
            max_concurrency: config.max_concurrency,
            handle: config
                .handle
                .clone()
                .unwrap_or_else(|| default_handle.clone()),
        }
    }

    /// Reserve a running-or-queued slot, failing fast when the pool is full
    pub fn try_admit(&self) -> Option<Admission> {
        self.admission.try_admit().map(|slot| Admission {
            slot,
            run_permits: Arc::clone(&self.run_permits),
        })
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Runtime the pool's work is spawned on
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Total admission slots (running + queued)
    pub fn capacity(&self) -> usize {
        self.admission.capacity()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Executions currently holding a run permit
    pub fn active(&self) -> usize {
        self.max_concurrency - self.run_permits.available_permits()
    }

    /// Executions admitted but still waiting for a run permit
    pub fn queued(&self) -> usize {
        self.admission.admitted().saturating_sub(self.active())
    }

    /// Admission slots still free
    pub fn available(&self) -> usize {
        self.admission.available()
    }
}

/// An admitted execution that has not started running yet
#[derive(Debug)]
pub struct Admission {
    slot: BulkheadPermit,
    run_permits: Arc<Semaphore>,
}

impl Admission {
    /// Wait (queued) for a run permit
    ///
    /// Returns `None` only if the pool was shut down.
    pub async fn ready(self) -> Option<RunSlot> {
        let permit = self.run_permits.acquire_owned().await.ok()?;
        Some(RunSlot {
            _slot: self.slot,
            _permit: permit,
        })
    }
}

/// A running execution's hold on its pool, released on drop
#[derive(Debug)]
pub struct RunSlot {
    _slot: BulkheadPermit,
    _permit: OwnedSemaphorePermit,
}

/// Pools keyed by [`PoolKey`], created on first use
#[derive(Debug)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<PoolKey, Arc<WorkerPool>>>,
    defaults: PoolConfig,
    overrides: HashMap<PoolKey, PoolConfig>,
    handle: Handle,
}

impl PoolRegistry {
    pub fn new(
        defaults: PoolConfig,
        overrides: HashMap<PoolKey, PoolConfig>,
        handle: Handle,
    ) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            defaults,
            overrides,
            handle,
        }
    }

    /// Pool for `key`, created from its override or the defaults
    pub fn pool(&self, key: &PoolKey) -> Arc<WorkerPool> {
        let mut pools = self.pools.lock();
        let pool = pools.entry(key.clone()).or_insert_with(|| {
            let config = self.overrides.get(key).unwrap_or(&self.defaults);
            tracing::debug!(
                pool = %key,
                max_concurrency = config.max_concurrency,
                queue_capacity = config.queue_capacity,
                "creating worker pool"
            );
            Arc::new(WorkerPool::new(key.clone(), config, &self.handle))
        });
        Arc::clone(pool)
    }
}
