//! Command execution engine
//!
//! The executor turns a [`Command`] into a [`PublishedResult`]. When the
//! result is started it asks the command key's circuit for a permit, asks the
//! pool for an admission slot, then runs the command on the pool's runtime
//! under its timeout. Outcomes feed the circuit and the rolling window;
//! failures go through the command's fallback.

use crate::{
    CircuitState, Command, CommandError, CommandKey, CommandKeys, EventKind, ExecutionRecord,
    FallbackContext, PoolKey,
    builder::ExecutorBuilder,
    cache::RequestContext,
    compose,
    config::CommandConfig,
    errors::{BadRequest, Rejection, panic_message},
    pool::{PoolRegistry, WorkerPool},
    publisher::{Outcome, PublishedResult},
    registry::CircuitRegistry,
    storage::HealthCounts,
};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;

pub(crate) struct ExecutorInner {
    pub(crate) circuits: CircuitRegistry,
    pub(crate) pools: PoolRegistry,
    pub(crate) default_command: CommandConfig,
    pub(crate) commands: HashMap<CommandKey, CommandConfig>,
    pub(crate) handle: Handle,
}

/// Runs commands behind circuit breakers and isolation pools
///
/// Cloning is cheap; clones share circuits, pools and statistics.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::new()
    }

    pub(crate) fn from_inner(inner: ExecutorInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Admit and start `command` now
    pub fn submit<C: Command>(&self, command: C) -> PublishedResult<C::Output> {
        let result = self.defer(command);
        result.start();
        result
    }

    /// Wrap `command` without starting it
    ///
    /// Admission and execution happen on the first start or subscription. A
    /// deferred result that is never observed, or is cancelled first, never
    /// runs its command.
    pub fn defer<C: Command>(&self, command: C) -> PublishedResult<C::Output> {
        let handle = self.inner.pools.pool(command.keys().pool()).handle().clone();
        let executor = self.clone();
        PublishedResult::lazy(handle, move || executor.launch(command))
    }

    /// Submit `command` and wait for its outcome
    pub async fn execute<C: Command>(&self, command: C) -> Outcome<C::Output> {
        self.submit(command).await
    }

    /// Submit through a request cache
    ///
    /// A command whose cache key was already submitted within `ctx` under the
    /// same command key gets the earlier result and never runs. Commands
    /// without a cache key are submitted normally.
    pub fn submit_cached<C: Command>(
        &self,
        ctx: &RequestContext,
        command: C,
    ) -> PublishedResult<C::Output> {
        let Some(cache_key) = command.cache_key() else {
            return self.submit(command);
        };
        let keys = command.keys().clone();

        let (result, hit) =
            ctx.get_or_insert_with(keys.command(), cache_key, || self.submit(command));
        if hit {
            tracing::debug!(command = %keys.command(), "response from request cache");
            self.inner
                .circuits
                .record(record(&keys, EventKind::ResponseFromCache, 0.0));
        }
        result
    }

    /// An already-resolved result on the executor's runtime
    pub fn just<T: Clone + Send + Sync + 'static>(&self, value: T) -> PublishedResult<T> {
        PublishedResult::completed(self.inner.handle.clone(), Ok(value))
    }

    /// Collect many results on the executor's runtime; see [`compose::zip_all`]
    pub fn zip_all<T, I>(&self, results: I) -> PublishedResult<Vec<T>>
    where
        T: Clone + Send + Sync + 'static,
        I: IntoIterator<Item = PublishedResult<T>>,
    {
        compose::zip_all(&self.inner.handle, results)
    }

    pub fn circuit_state(&self, command: &CommandKey) -> CircuitState {
        self.inner.circuits.state(command)
    }

    /// Rolling-window health of a command key
    pub fn health(&self, command: &CommandKey) -> HealthCounts {
        self.inner.circuits.health(command)
    }

    /// Most recent execution records of a command key, oldest first
    pub fn executions(&self, command: &CommandKey, limit: usize) -> Vec<ExecutionRecord> {
        self.inner
            .circuits
            .storage()
            .event_log(command.as_str(), limit)
    }

    pub fn reset_circuit(&self, command: &CommandKey) {
        self.inner.circuits.reset(command);
    }

    /// The isolation pool for `pool`, created if it does not exist yet
    pub fn pool(&self, pool: &PoolKey) -> Arc<WorkerPool> {
        self.inner.pools.pool(pool)
    }

    pub fn handle(&self) -> &Handle {
        &self.inner.handle
    }

    fn command_config(&self, command: &CommandKey) -> &CommandConfig {
        self.inner
            .commands
            .get(command)
            .unwrap_or(&self.inner.default_command)
    }

    /// Admission runs here, synchronously; the returned future is the execution
    fn launch<C: Command>(&self, command: C) -> BoxFuture<'static, Outcome<C::Output>> {
        let keys = command.keys().clone();
        let config = self.command_config(keys.command()).clone();

        let permit = match self.inner.circuits.try_acquire(keys.command()) {
            Ok(permit) => permit,
            Err(reason) => {
                tracing::debug!(command = %keys.command(), %reason, "command short-circuited");
                let error = CommandError::Rejected {
                    command: keys.command().clone(),
                    reason,
                };
                self.inner.circuits.record(
                    record(&keys, EventKind::ShortCircuited, 0.0).with_cause(error.clone()),
                );
                return self.recover(command, config, error);
            }
        };

        let pool = self.inner.pools.pool(keys.pool());
        let capacity = pool.capacity();
        let Some(admission) = pool.try_admit() else {
            let error = pool_saturated(&keys, capacity);
            tracing::debug!(
                command = %keys.command(),
                pool = %keys.pool(),
                capacity,
                "pool rejected command"
            );
            permit.settle(record(&keys, EventKind::PoolRejected, 0.0).with_cause(error.clone()));
            return self.recover(command, config, error);
        };

        tracing::trace!(
            command = %keys.command(),
            pool = %keys.pool(),
            trial = permit.is_trial(),
            "command admitted"
        );

        let executor = self.clone();
        Box::pin(async move {
            // The timeout covers time spent queued for a run permit
            let admitted = Instant::now();
            let deadline = config.timeout.map(|limit| (admitted + limit, limit));

            let ready = match deadline {
                Some((at, limit)) => tokio::time::timeout_at(at.into(), admission.ready())
                    .await
                    .map_err(|_| CommandError::Timeout {
                        command: keys.command().clone(),
                        timeout: limit,
                    }),
                None => Ok(admission.ready().await),
            };
            let running = match ready {
                Ok(Some(running)) => running,
                Ok(None) => {
                    let error = pool_saturated(&keys, capacity);
                    permit.settle(
                        record(&keys, EventKind::PoolRejected, 0.0).with_cause(error.clone()),
                    );
                    return executor.fallback(&command, &config, error).await;
                }
                Err(error) => {
                    let waited = admitted.elapsed().as_secs_f64();
                    tracing::debug!(
                        command = %keys.command(),
                        pool = %keys.pool(),
                        waited,
                        "command timed out in the pool queue"
                    );
                    permit.settle(
                        record(&keys, EventKind::Timeout, waited).with_cause(error.clone()),
                    );
                    return executor.fallback(&command, &config, error).await;
                }
            };

            let started = Instant::now();
            let result = run_guarded(&command, deadline).await;
            let duration = started.elapsed().as_secs_f64();
            drop(running);

            match result {
                Ok(value) => {
                    permit.settle(record(&keys, EventKind::Success, duration));
                    tracing::trace!(command = %keys.command(), duration, "command succeeded");
                    Ok(value)
                }
                Err(error) => {
                    let kind = match &error {
                        CommandError::Timeout { .. } => EventKind::Timeout,
                        CommandError::BadRequest { .. } => EventKind::Ignored,
                        _ => EventKind::Failure,
                    };
                    let stored =
                        permit.settle(record(&keys, kind, duration).with_cause(error.clone()));
                    tracing::debug!(
                        command = %keys.command(),
                        kind = ?stored,
                        duration,
                        %error,
                        "command failed"
                    );

                    if error.is_bad_request() {
                        return Err(error);
                    }
                    executor.fallback(&command, &config, error).await
                }
            }
        })
    }

    fn recover<C: Command>(
        &self,
        command: C,
        config: CommandConfig,
        cause: CommandError,
    ) -> BoxFuture<'static, Outcome<C::Output>> {
        let executor = self.clone();
        Box::pin(async move { executor.fallback(&command, &config, cause).await })
    }

    async fn fallback<C: Command>(
        &self,
        command: &C,
        config: &CommandConfig,
        cause: CommandError,
    ) -> Outcome<C::Output> {
        if !config.fallback_enabled {
            return Err(cause);
        }

        let keys = command.keys();
        let ctx = FallbackContext {
            command: keys.command().clone(),
            state: self.circuit_state(keys.command()),
            cause: cause.clone(),
        };

        match command.fallback(&ctx).await {
            None => Err(cause),
            Some(Ok(value)) => {
                tracing::debug!(command = %keys.command(), %cause, "fallback substituted value");
                self.inner
                    .circuits
                    .record(record(keys, EventKind::FallbackSuccess, 0.0));
                Ok(value)
            }
            Some(Err(source)) => {
                let error = CommandError::FallbackFailed {
                    command: keys.command().clone(),
                    cause: Box::new(cause),
                    source: Arc::from(source),
                };
                tracing::warn!(command = %keys.command(), %error, "fallback failed");
                self.inner.circuits.record(
                    record(keys, EventKind::FallbackFailure, 0.0).with_cause(error.clone()),
                );
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("circuits", &self.inner.circuits)
            .field("pools", &self.inner.pools)
            .field("default_command", &self.inner.default_command)
            .finish()
    }
}

fn record(keys: &CommandKeys, kind: EventKind, duration: f64) -> ExecutionRecord {
    ExecutionRecord::new(keys.command().clone(), keys.pool().clone(), kind, duration)
}

fn pool_saturated(keys: &CommandKeys, capacity: usize) -> CommandError {
    CommandError::Rejected {
        command: keys.command().clone(),
        reason: Rejection::PoolSaturated {
            pool: keys.pool().clone(),
            capacity,
        },
    }
}

/// Run the command body until its deadline, turning panics into failures
async fn run_guarded<C: Command>(
    command: &C,
    deadline: Option<(Instant, Duration)>,
) -> Outcome<C::Output> {
    let key = command.keys().command();
    let run = AssertUnwindSafe(command.run()).catch_unwind();

    let result = match deadline {
        Some((at, limit)) => tokio::time::timeout_at(at.into(), run)
            .await
            .map_err(|_| CommandError::Timeout {
                command: key.clone(),
                timeout: limit,
            })?,
        None => run.await,
    };

    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) if error.is::<BadRequest>() => Err(CommandError::BadRequest {
            command: key.clone(),
            source: Arc::from(error),
        }),
        Ok(Err(error)) => Err(CommandError::execution(key, error)),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            tracing::error!(command = %key, %message, "command panicked");
            Err(CommandError::execution(key, message.into()))
        }
    }
}
