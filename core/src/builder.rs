//! Builder API for ergonomic executor configuration

use crate::{
    CommandKey, MemoryStorage, PoolKey, StorageBackend,
    callbacks::Callbacks,
    classifier::FailureClassifier,
    config::{CommandConfig, PoolConfig},
    executor::{Executor, ExecutorInner},
    pool::PoolRegistry,
    registry::CircuitRegistry,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Builder for creating executors with fluent API
///
/// Circuit, timeout and pool setters change the defaults every command and
/// pool key starts from. [`command`](Self::command) and [`pool`](Self::pool)
/// replace the defaults for a single key.
pub struct ExecutorBuilder {
    command: CommandConfig,
    commands: HashMap<CommandKey, CommandConfig>,
    pool: PoolConfig,
    pools: HashMap<PoolKey, PoolConfig>,
    storage: Option<Arc<dyn StorageBackend>>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
    handle: Option<Handle>,
}

impl Default for ExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorBuilder {
    pub fn new() -> Self {
        Self {
            command: CommandConfig::default(),
            commands: HashMap::new(),
            pool: PoolConfig::default(),
            pools: HashMap::new(),
            storage: None,
            failure_classifier: None,
            callbacks: Callbacks::new(),
            handle: None,
        }
    }

    /// Set the absolute failure threshold (number of failures to open circuit)
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.command.circuit.failure_threshold = Some(threshold);
        self
    }

    /// Disable absolute failure threshold (use only rate-based)
    pub fn disable_failure_threshold(mut self) -> Self {
        self.command.circuit.failure_threshold = None;
        self
    }

    /// Set the failure rate threshold (0.0-1.0)
    /// Circuit opens when (failures / total_calls) >= this value
    pub fn failure_rate(mut self, rate: f64) -> Self {
        self.command.circuit.failure_rate_threshold = Some(rate.clamp(0.0, 1.0));
        self
    }

    /// Disable the rate-based threshold (use only the absolute count)
    pub fn disable_failure_rate(mut self) -> Self {
        self.command.circuit.failure_rate_threshold = None;
        self
    }

    /// Set minimum number of calls before rate-based threshold is evaluated
    pub fn minimum_calls(mut self, calls: usize) -> Self {
        self.command.circuit.minimum_calls = calls;
        self
    }

    pub fn failure_window_secs(mut self, seconds: f64) -> Self {
        self.command.circuit.failure_window_secs = seconds;
        self
    }

    /// Time an open circuit waits before admitting a trial
    pub fn half_open_timeout_secs(mut self, seconds: f64) -> Self {
        self.command.circuit.half_open_timeout_secs = seconds;
        self
    }

    /// Set the success threshold (successes needed to close from half-open)
    pub fn success_threshold(mut self, threshold: usize) -> Self {
        self.command.circuit.success_threshold = threshold;
        self
    }

    /// Concurrent trials allowed while half-open
    pub fn half_open_max_calls(mut self, calls: usize) -> Self {
        self.command.circuit.half_open_max_calls = calls;
        self
    }

    /// Set the jitter factor (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.command.circuit.jitter_factor = factor;
        self
    }

    /// Default execution timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.command.timeout = Some(timeout);
        self
    }

    /// Let commands run without a timeout by default
    pub fn disable_timeout(mut self) -> Self {
        self.command.timeout = None;
        self
    }

    pub fn fallback_enabled(mut self, enabled: bool) -> Self {
        self.command.fallback_enabled = enabled;
        self
    }

    /// Replace the defaults for one command key
    pub fn command(mut self, command: impl Into<CommandKey>, config: CommandConfig) -> Self {
        self.commands.insert(command.into(), config);
        self
    }

    /// Default number of concurrent executions per pool
    ///
    /// # Panics
    ///
    /// [`build`](Self::build) panics if `limit` is 0.
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.pool.max_concurrency = limit;
        self
    }

    /// Default number of admitted executions allowed to wait per pool
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.pool.queue_capacity = capacity;
        self
    }

    /// Replace the defaults for one pool key
    pub fn pool(mut self, pool: impl Into<PoolKey>, config: PoolConfig) -> Self {
        self.pools.insert(pool.into(), config);
        self
    }

    /// Set custom storage backend
    pub fn storage(mut self, storage: Arc<dyn StorageBackend>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set a failure classifier to filter which errors should trip circuits
    ///
    /// The classifier determines whether a given error should count toward
    /// opening the circuit. Declined failures are recorded as
    /// [`EventKind::Ignored`](crate::EventKind::Ignored).
    ///
    /// # Examples
    ///
    /// ```rust
    /// use command_machines::{Executor, PredicateClassifier};
    /// use std::sync::Arc;
    ///
    /// # #[tokio::main]
    /// # async fn main() {
    /// let executor = Executor::builder()
    ///     .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
    ///         // Only trip on timeouts and slow errors
    ///         ctx.error.is_timeout() || ctx.duration > 1.0
    ///     })))
    ///     .build();
    /// # }
    /// ```
    pub fn failure_classifier(mut self, classifier: Arc<dyn FailureClassifier>) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Set callback for when a circuit opens
    pub fn on_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&CommandKey) + Send + Sync + 'static,
    {
        self.callbacks.on_open = Some(Arc::new(f));
        self
    }

    /// Set callback for when a circuit closes
    pub fn on_close<F>(mut self, f: F) -> Self
    where
        F: Fn(&CommandKey) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Set callback for when a circuit enters half-open
    pub fn on_half_open<F>(mut self, f: F) -> Self
    where
        F: Fn(&CommandKey) + Send + Sync + 'static,
    {
        self.callbacks.on_half_open = Some(Arc::new(f));
        self
    }

    /// Runtime that pools spawn work on unless their own config names one
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Build the executor
    ///
    /// # Panics
    ///
    /// Panics if no [`handle`](Self::handle) was given and this is called
    /// outside a tokio runtime, or if any pool is configured with
    /// `max_concurrency` 0.
    pub fn build(self) -> Executor {
        assert!(
            self.pool.max_concurrency > 0
                && self.pools.values().all(|pool| pool.max_concurrency > 0),
            "Pool max_concurrency must be greater than 0"
        );

        let handle = self.handle.unwrap_or_else(Handle::current);
        let storage = self
            .storage
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        let overrides = self
            .commands
            .iter()
            .map(|(command, config)| (command.clone(), config.circuit.clone()))
            .collect();
        let circuits = CircuitRegistry::new(
            self.command.circuit.clone(),
            overrides,
            storage,
            self.failure_classifier,
            self.callbacks,
        );
        let pools = PoolRegistry::new(self.pool, self.pools, handle.clone());

        tracing::debug!(
            timeout = ?self.command.timeout,
            command_overrides = self.commands.len(),
            "executor built"
        );

        Executor::from_inner(ExecutorInner {
            circuits,
            pools,
            default_command: self.command,
            commands: self.commands,
            handle,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CircuitState;

    #[tokio::test]
    async fn test_builder_defaults() {
        let executor = ExecutorBuilder::new().build();
        let pool = executor.pool(&PoolKey::new("Foo"));

        assert_eq!(
            executor.circuit_state(&CommandKey::new("Foo")),
            CircuitState::Closed
        );
        assert_eq!(pool.max_concurrency(), 10);
        assert_eq!(pool.capacity(), 10);
    }

    #[tokio::test]
    async fn test_builder_pool_overrides() {
        let executor = Executor::builder()
            .max_concurrency(4)
            .queue_capacity(2)
            .pool(
                "io",
                PoolConfig {
                    max_concurrency: 1,
                    ..Default::default()
                },
            )
            .build();

        assert_eq!(executor.pool(&PoolKey::new("cpu")).capacity(), 6);
        assert_eq!(executor.pool(&PoolKey::new("io")).capacity(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "Pool max_concurrency must be greater than 0")]
    async fn test_zero_concurrency_is_rejected() {
        Executor::builder().max_concurrency(0).build();
    }

    #[test]
    fn test_explicit_handle_outside_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let executor = Executor::builder().handle(runtime.handle().clone()).build();
        let value = runtime.block_on(executor.just(5u8).observe());

        assert_eq!(value.unwrap(), 5);
    }
}
