//! Circuit breaker implementation using state machines
//!
//! One breaker guards one command key. It admits or rejects executions and
//! consumes their outcomes to drive the Closed → Open → HalfOpen lifecycle.

use crate::{
    CommandError, CommandKey, EventKind, ExecutionRecord, StorageBackend,
    classifier::{FailureClassifier, FailureContext},
    errors::Rejection,
    storage::HealthCounts,
};
use state_machines::state_machine;
use std::sync::Arc;

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of failures required to open the circuit (absolute count)
    /// If None, only rate-based threshold is used
    pub failure_threshold: Option<usize>,

    /// Failure rate threshold (0.0-1.0) - percentage of failures to open circuit
    /// If None, only absolute count threshold is used
    pub failure_rate_threshold: Option<f64>,

    /// Minimum number of calls before rate-based threshold is evaluated
    pub minimum_calls: usize,

    /// Rolling window in seconds for counting outcomes
    pub failure_window_secs: f64,

    /// Timeout in seconds before transitioning from Open to HalfOpen
    pub half_open_timeout_secs: f64,

    /// Number of trial successes required in HalfOpen to close the circuit
    pub success_threshold: usize,

    /// Maximum number of concurrent trial executions while HalfOpen
    pub half_open_max_calls: usize,

    /// Jitter factor for half_open_timeout (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: timeout * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,

    /// Reject every call regardless of statistics
    pub force_open: bool,

    /// Admit every call regardless of statistics (outcomes are still recorded)
    pub force_closed: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_threshold: None,
            failure_rate_threshold: Some(0.5),
            minimum_calls: 20,
            failure_window_secs: 10.0,
            half_open_timeout_secs: 5.0,
            success_threshold: 1,
            half_open_max_calls: 1,
            jitter_factor: 0.0,
            force_open: false,
            force_closed: false,
        }
    }
}

/// Context handed to a command's fallback
#[derive(Debug, Clone)]
pub struct FallbackContext {
    /// Command key of the failed execution
    pub command: CommandKey,
    /// Circuit state at the time the fallback was chosen
    pub state: crate::CircuitState,
    /// The failure being replaced
    pub cause: CommandError,
}

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub command: CommandKey,
    pub config: Config,
    pub storage: Arc<dyn StorageBackend>,
    pub failure_classifier: Option<Arc<dyn FailureClassifier>>,
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self {
            command: CommandKey::new(""),
            config: Config::default(),
            storage: Arc::new(crate::MemoryStorage::new()),
            failure_classifier: None,
        }
    }
}

impl std::fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitContext")
            .field("command", &self.command)
            .field("config", &self.config)
            .field("storage", &"<dyn StorageBackend>")
            .field(
                "failure_classifier",
                &self
                    .failure_classifier
                    .as_ref()
                    .map(|_| "<dyn FailureClassifier>"),
            )
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    pub opened_at: f64,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    pub consecutive_successes: usize,
    pub in_flight: usize,
}

state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [timeout_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
    }
}

/// Absolute count or rate-based threshold check over the rolling window
fn threshold_exceeded(ctx: &CircuitContext) -> bool {
    let name = ctx.command.as_str();
    let window = ctx.config.failure_window_secs;
    let failures = ctx.storage.failure_count(name, window);

    if let Some(threshold) = ctx.config.failure_threshold
        && failures >= threshold
    {
        return true;
    }

    if let Some(rate_threshold) = ctx.config.failure_rate_threshold {
        let total = failures + ctx.storage.success_count(name, window);

        // Only evaluate rate if we have minimum calls
        if total >= ctx.config.minimum_calls && total > 0 {
            let failure_rate = failures as f64 / total as f64;
            if failure_rate >= rate_threshold {
                return true;
            }
        }
    }

    false
}

impl Circuit<Closed> {
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        threshold_exceeded(ctx)
    }
}

impl Circuit<HalfOpen> {
    /// A failed trial always re-opens
    fn should_open(&self, _ctx: &CircuitContext) -> bool {
        true
    }

    fn should_close(&self, ctx: &CircuitContext) -> bool {
        let data = self
            .state_data_half_open()
            .expect("HalfOpen state must have data");
        data.consecutive_successes >= ctx.config.success_threshold
    }
}

impl Circuit<Open> {
    fn timeout_elapsed(&self, ctx: &CircuitContext) -> bool {
        let data = self.state_data_open().expect("Open state must have data");
        let elapsed = ctx.storage.monotonic_time() - data.opened_at;

        let timeout_secs = if ctx.config.jitter_factor > 0.0 {
            let policy = chrono_machines::Policy {
                max_attempts: 1,
                base_delay_ms: (ctx.config.half_open_timeout_secs * 1000.0) as u64,
                multiplier: 1.0,
                max_delay_ms: (ctx.config.half_open_timeout_secs * 1000.0) as u64,
            };
            let timeout_ms = policy.calculate_delay(1, ctx.config.jitter_factor);
            (timeout_ms as f64) / 1000.0
        } else {
            ctx.config.half_open_timeout_secs
        };

        elapsed >= timeout_secs
    }
}

/// A state change made by the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened,
    HalfOpened,
    Closed,
}

/// Circuit breaker for one command key
///
/// The breaker never runs user code. Transitions are queued and handed out
/// through [`take_transitions`](Self::take_transitions), so callers can fire
/// callbacks after releasing whatever lock guards the breaker.
pub struct CircuitBreaker {
    machine: DynamicCircuit,
    context: CircuitContext,
    transitions: Vec<Transition>,
}

impl CircuitBreaker {
    /// Create a breaker with in-memory storage
    pub fn new(command: impl Into<CommandKey>, config: Config) -> Self {
        Self::with_context(CircuitContext {
            command: command.into(),
            config,
            storage: Arc::new(crate::MemoryStorage::new()),
            failure_classifier: None,
        })
    }

    pub(crate) fn with_context(context: CircuitContext) -> Self {
        let machine = DynamicCircuit::new(context.clone());

        Self {
            machine,
            context,
            transitions: Vec::new(),
        }
    }

    /// Ask for permission to execute
    ///
    /// Returns `Ok(true)` when the execution is a half-open trial, `Ok(false)`
    /// for a regular admission. A trial must later be settled through
    /// [`record`](Self::record) with `trial = true` or [`release_trial`](Self::release_trial).
    pub fn try_acquire(&mut self) -> Result<bool, Rejection> {
        if self.context.config.force_open {
            return Err(Rejection::CircuitOpen {
                opened_at: self.opened_at(),
            });
        }
        if self.context.config.force_closed {
            return Ok(false);
        }

        // Check for timeout-based Open -> HalfOpen transition
        if self.machine.current_state() == "Open" {
            let _ = self.machine.handle(CircuitEvent::AttemptReset);
            if self.machine.current_state() == "HalfOpen" {
                self.transitions.push(Transition::HalfOpened);
            }
        }

        match self.machine.current_state() {
            "Open" => Err(Rejection::CircuitOpen {
                opened_at: self.opened_at(),
            }),
            "HalfOpen" => {
                let max_calls = self.context.config.half_open_max_calls;
                match self.machine.half_open_data_mut() {
                    Some(data) if data.in_flight < max_calls => {
                        data.in_flight += 1;
                        Ok(true)
                    }
                    _ => Err(Rejection::HalfOpenLimitReached),
                }
            }
            _ => Ok(false),
        }
    }

    /// Store an execution record and drive state transitions from it
    ///
    /// Failures the classifier declines are stored as `Ignored`. Returns the
    /// kind that was actually stored.
    pub fn record(&mut self, mut record: ExecutionRecord, trial: bool) -> EventKind {
        if record.kind.is_failure() && !self.counts_as_failure(&record) {
            record.kind = EventKind::Ignored;
        }
        record.timestamp = self.context.storage.monotonic_time();

        let kind = record.kind;
        self.context.storage.record(record);

        if trial {
            self.release_trial();
        }

        let state = self.machine.current_state();
        if kind == EventKind::Success && trial && state == "HalfOpen" {
            if let Some(data) = self.machine.half_open_data_mut() {
                data.consecutive_successes += 1;
            }
            if self.machine.handle(CircuitEvent::Close).is_ok() {
                // A closed circuit starts from a fresh window
                self.context.storage.clear(self.context.command.as_str());
                self.transitions.push(Transition::Closed);
            }
        } else if kind.is_failure()
            && (state == "Closed" || (trial && state == "HalfOpen"))
            && self.machine.handle(CircuitEvent::Trip).is_ok()
        {
            self.mark_open();
        }

        kind
    }

    /// Transitions made since the last call, oldest first
    pub fn take_transitions(&mut self) -> Vec<Transition> {
        std::mem::take(&mut self.transitions)
    }

    /// Give back a half-open trial slot without an outcome
    pub fn release_trial(&mut self) {
        if let Some(data) = self.machine.half_open_data_mut() {
            data.in_flight = data.in_flight.saturating_sub(1);
        }
    }

    fn counts_as_failure(&self, record: &ExecutionRecord) -> bool {
        match (&self.context.failure_classifier, &record.cause) {
            (Some(classifier), Some(error)) => classifier.should_trip(&FailureContext {
                command: &self.context.command,
                error,
                duration: record.duration,
            }),
            _ => true,
        }
    }

    pub fn command(&self) -> &CommandKey {
        &self.context.command
    }

    pub fn config(&self) -> &Config {
        &self.context.config
    }

    pub fn is_open(&self) -> bool {
        self.machine.current_state() == "Open"
    }

    pub fn is_closed(&self) -> bool {
        self.machine.current_state() == "Closed"
    }

    pub fn is_half_open(&self) -> bool {
        self.machine.current_state() == "HalfOpen"
    }

    pub fn state(&self) -> crate::CircuitState {
        crate::CircuitState::from_name(self.machine.current_state())
    }

    /// Get current state name
    pub fn state_name(&self) -> &'static str {
        self.machine.current_state()
    }

    /// Health over the configured rolling window
    pub fn health(&self) -> HealthCounts {
        self.context.storage.health_counts(
            self.context.command.as_str(),
            self.context.config.failure_window_secs,
        )
    }

    /// Clear all records and reset circuit to Closed state
    pub fn reset(&mut self) {
        self.context.storage.clear(self.context.command.as_str());
        self.machine = DynamicCircuit::new(self.context.clone());
    }

    fn opened_at(&self) -> f64 {
        self.machine.open_data().map(|d| d.opened_at).unwrap_or(0.0)
    }

    /// Apply Open-state bookkeeping (timestamp + queued transition)
    fn mark_open(&mut self) {
        if let Some(data) = self.machine.open_data_mut() {
            data.opened_at = self.context.storage.monotonic_time();
        }
        self.transitions.push(Transition::Opened);
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.machine.current_state())
            .field("context", &self.context)
            .field("pending_transitions", &self.transitions)
            .finish()
    }
}
