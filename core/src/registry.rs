//! Circuit breakers keyed by command key

use crate::{
    CircuitState, CommandKey, EventKind, ExecutionRecord, StorageBackend,
    callbacks::Callbacks,
    circuit::{CircuitBreaker, CircuitContext, Config},
    classifier::FailureClassifier,
    errors::Rejection,
    storage::HealthCounts,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

type SharedCircuit = Arc<Mutex<CircuitBreaker>>;

/// Lazily created breakers sharing one storage backend, classifier and callback set
#[derive(Debug)]
pub struct CircuitRegistry {
    circuits: Mutex<HashMap<CommandKey, SharedCircuit>>,
    defaults: Config,
    overrides: HashMap<CommandKey, Config>,
    storage: Arc<dyn StorageBackend>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Arc<Callbacks>,
}

impl CircuitRegistry {
    pub fn new(
        defaults: Config,
        overrides: HashMap<CommandKey, Config>,
        storage: Arc<dyn StorageBackend>,
        failure_classifier: Option<Arc<dyn FailureClassifier>>,
        callbacks: Callbacks,
    ) -> Self {
        Self {
            circuits: Mutex::new(HashMap::new()),
            defaults,
            overrides,
            storage,
            failure_classifier,
            callbacks: Arc::new(callbacks),
        }
    }

    /// Breaker for `command`, created on first use
    pub fn circuit(&self, command: &CommandKey) -> SharedCircuit {
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(command.clone()).or_insert_with(|| {
            let config = self
                .overrides
                .get(command)
                .unwrap_or(&self.defaults)
                .clone();
            let context = CircuitContext {
                command: command.clone(),
                config,
                storage: Arc::clone(&self.storage),
                failure_classifier: self.failure_classifier.clone(),
            };
            Arc::new(Mutex::new(CircuitBreaker::with_context(context)))
        });
        Arc::clone(circuit)
    }

    /// Ask `command`'s breaker for permission to execute
    pub fn try_acquire(&self, command: &CommandKey) -> Result<CircuitPermit, Rejection> {
        let circuit = self.circuit(command);
        let trial = with_breaker(&circuit, &self.callbacks, |breaker| breaker.try_acquire())?;
        Ok(CircuitPermit {
            circuit,
            callbacks: Arc::clone(&self.callbacks),
            trial,
            settled: false,
        })
    }

    /// Record an outcome that holds no permit (rejections, fallback results, cache hits)
    pub fn record(&self, record: ExecutionRecord) -> EventKind {
        let circuit = self.circuit(&record.command);
        with_breaker(&circuit, &self.callbacks, |breaker| {
            breaker.record(record, false)
        })
    }

    /// Current state; a command that never ran is Closed
    pub fn state(&self, command: &CommandKey) -> CircuitState {
        // Never hold the map lock while locking a breaker
        let circuit = self.circuits.lock().get(command).cloned();
        circuit
            .map(|circuit| circuit.lock().state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn health(&self, command: &CommandKey) -> HealthCounts {
        self.circuit(command).lock().health()
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    /// Force `command`'s breaker back to Closed with an empty window
    pub fn reset(&self, command: &CommandKey) {
        self.circuit(command).lock().reset();
    }
}

/// Admission granted by a breaker
///
/// A half-open trial that is dropped without being settled gives its trial
/// slot back, so a cancelled trial never wedges the circuit.
#[derive(Debug)]
pub struct CircuitPermit {
    circuit: SharedCircuit,
    callbacks: Arc<Callbacks>,
    trial: bool,
    settled: bool,
}

impl CircuitPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Report the execution's outcome; returns the kind actually stored
    pub fn settle(mut self, record: ExecutionRecord) -> EventKind {
        self.settled = true;
        let trial = self.trial;
        with_breaker(&self.circuit, &self.callbacks, |breaker| {
            breaker.record(record, trial)
        })
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.circuit.lock().release_trial();
        }
    }
}

/// Run `f` on the locked breaker, then fire its transitions once the lock is released
fn with_breaker<R>(
    circuit: &SharedCircuit,
    callbacks: &Callbacks,
    f: impl FnOnce(&mut CircuitBreaker) -> R,
) -> R {
    let (result, command, transitions) = {
        let mut breaker = circuit.lock();
        let result = f(&mut breaker);
        let transitions = breaker.take_transitions();
        (result, breaker.command().clone(), transitions)
    };

    for transition in transitions {
        callbacks.trigger(&command, transition);
    }
    result
}
