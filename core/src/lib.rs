//! CommandMachines - Command isolation with circuit breakers and replaying results
//!
//! This crate wraps calls to remote or unreliable dependencies in commands:
//! - Every command key gets its own circuit breaker (Closed → Open → HalfOpen)
//! - Every pool key gets a bounded number of run permits with fail-fast admission
//! - Executions are bounded by a timeout and may fall back to a substitute value
//! - Results are published through replaying cells that execute at most once,
//!   no matter how many subscribers or composition branches observe them
//!
//! # Example
//!
//! ```rust
//! use command_machines::{BoxError, Command, CommandKeys, Executor, async_trait};
//!
//! struct Greet {
//!     keys: CommandKeys,
//!     name: String,
//! }
//!
//! #[async_trait]
//! impl Command for Greet {
//!     type Output = String;
//!
//!     fn keys(&self) -> &CommandKeys {
//!         &self.keys
//!     }
//!
//!     async fn run(&self) -> Result<String, BoxError> {
//!         Ok(format!("Hello, {}", self.name))
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let executor = Executor::builder().failure_threshold(5).build();
//!
//! let greeting = executor.submit(Greet {
//!     keys: CommandKeys::with_group("Greetings"),
//!     name: "world".into(),
//! });
//! let shouted = greeting.map(|s| s.to_uppercase());
//!
//! assert_eq!(greeting.await.unwrap(), "Hello, world");
//! assert_eq!(shouted.await.unwrap(), "HELLO, WORLD");
//! # }
//! ```

pub mod builder;
pub mod bulkhead;
pub mod cache;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod command;
pub mod compose;
pub mod config;
pub mod errors;
pub mod executor;
pub mod keys;
pub mod pool;
pub mod publisher;
pub mod registry;
pub mod storage;

pub use async_trait::async_trait;
pub use builder::ExecutorBuilder;
pub use bulkhead::{Bulkhead, BulkheadPermit};
pub use cache::RequestContext;
pub use callbacks::Callbacks;
pub use circuit::{CircuitBreaker, Config, FallbackContext, Transition};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use command::Command;
pub use compose::zip_all;
pub use config::{CommandConfig, PoolConfig};
pub use errors::{BadRequest, BoxError, CommandError, Rejection, SharedError};
pub use executor::Executor;
pub use keys::{CommandKey, CommandKeys, GroupKey, PoolKey};
pub use pool::WorkerPool;
pub use publisher::{Outcome, PublishedResult};
pub use storage::{HealthCounts, MemoryStorage, NullStorage, StorageBackend};

/// Outcome kind of one execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Success,
    Failure,
    Timeout,
    /// Failure the classifier declined, or a bad request
    Ignored,
    ShortCircuited,
    PoolRejected,
    FallbackSuccess,
    FallbackFailure,
    ResponseFromCache,
}

impl EventKind {
    /// Kinds that count against the circuit's health
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            EventKind::Failure | EventKind::Timeout | EventKind::PoolRejected
        )
    }
}

/// A single execution record kept by the storage backend
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub command: CommandKey,
    pub pool: PoolKey,
    pub kind: EventKind,
    /// Monotonic seconds, stamped when the record is stored
    pub timestamp: f64,
    /// Execution duration in seconds
    pub duration: f64,
    pub cause: Option<CommandError>,
}

impl ExecutionRecord {
    pub fn new(command: CommandKey, pool: PoolKey, kind: EventKind, duration: f64) -> Self {
        Self {
            command,
            pool,
            kind,
            timestamp: 0.0,
            duration,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: CommandError) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// Circuit state as seen from outside the breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub(crate) fn from_name(name: &str) -> Self {
        match name {
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}
