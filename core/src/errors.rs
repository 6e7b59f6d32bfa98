//! Error types for command execution

use crate::keys::{CommandKey, PoolKey};
use std::any::Any;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

/// Boxed error returned by command bodies and fallbacks
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Shared error cause, cloneable so every subscriber sees the same failure
pub type SharedError = Arc<dyn Error + Send + Sync>;

/// Errors that can resolve a published command result
#[derive(Debug, Clone, thiserror::Error)]
pub enum CommandError {
    /// The command body returned an error (or panicked)
    #[error("command '{command}' failed: {source}")]
    Execution {
        command: CommandKey,
        source: SharedError,
    },
    /// The command body rejected its input; does not trip the circuit or run the fallback
    #[error("command '{command}' rejected its input: {source}")]
    BadRequest {
        command: CommandKey,
        source: SharedError,
    },
    /// The command did not finish within its configured timeout
    #[error("command '{command}' timed out after {timeout:?}")]
    Timeout {
        command: CommandKey,
        timeout: Duration,
    },
    /// The command was refused before running
    #[error("command '{command}' was rejected: {reason}")]
    Rejected {
        command: CommandKey,
        reason: Rejection,
    },
    /// The command failed and its fallback failed too
    #[error("command '{command}' fallback failed: {source} (after: {cause})")]
    FallbackFailed {
        command: CommandKey,
        cause: Box<CommandError>,
        source: SharedError,
    },
    /// Every interested party withdrew before the result was produced
    #[error("command execution was cancelled")]
    Cancelled,
    /// A composition continuation panicked before producing an outcome
    #[error("continuation panicked: {message}")]
    Panicked { message: String },
}

impl CommandError {
    /// Build an execution failure from a boxed error
    pub fn execution(command: &CommandKey, error: BoxError) -> Self {
        CommandError::Execution {
            command: command.clone(),
            source: Arc::from(error),
        }
    }

    /// Command key of the failing command, if the error is tied to one
    pub fn command(&self) -> Option<&CommandKey> {
        match self {
            CommandError::Execution { command, .. }
            | CommandError::BadRequest { command, .. }
            | CommandError::Timeout { command, .. }
            | CommandError::Rejected { command, .. }
            | CommandError::FallbackFailed { command, .. } => Some(command),
            CommandError::Cancelled | CommandError::Panicked { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CommandError::Timeout { .. })
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, CommandError::Rejected { .. })
    }

    pub fn is_bad_request(&self) -> bool {
        matches!(self, CommandError::BadRequest { .. })
    }

    /// True when the circuit refused the call (open or half-open trial limit)
    pub fn is_circuit_open(&self) -> bool {
        matches!(
            self,
            CommandError::Rejected {
                reason: Rejection::CircuitOpen { .. } | Rejection::HalfOpenLimitReached,
                ..
            }
        )
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Why a command was refused before running
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Rejection {
    /// Circuit is open, calls are being short-circuited
    #[error("circuit is open (opened at {opened_at:.3}s)")]
    CircuitOpen { opened_at: f64 },
    /// Half-open trial budget is already in use
    #[error("half-open trial limit reached")]
    HalfOpenLimitReached,
    /// Every run permit and queue slot of the pool is taken
    #[error("pool '{pool}' is saturated (capacity: {capacity})")]
    PoolSaturated { pool: PoolKey, capacity: usize },
}

/// Error a command body returns to signal a caller fault rather than a
/// service failure
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct BadRequest {
    message: String,
}

impl BadRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_command() {
        let err = CommandError::Timeout {
            command: CommandKey::new("Foo"),
            timeout: Duration::from_millis(50),
        };
        assert_eq!(err.to_string(), "command 'Foo' timed out after 50ms");
        assert!(err.is_timeout());
        assert_eq!(err.command().map(|k| k.as_str()), Some("Foo"));
    }

    #[test]
    fn test_rejection_helpers() {
        let open = CommandError::Rejected {
            command: CommandKey::new("Foo"),
            reason: Rejection::CircuitOpen { opened_at: 1.5 },
        };
        let saturated = CommandError::Rejected {
            command: CommandKey::new("Foo"),
            reason: Rejection::PoolSaturated {
                pool: PoolKey::new("io"),
                capacity: 4,
            },
        };

        assert!(open.is_circuit_open());
        assert!(saturated.is_rejected());
        assert!(!saturated.is_circuit_open());
        assert!(saturated.to_string().contains("pool 'io' is saturated"));
    }

    #[test]
    fn test_panic_message_from_payload() {
        let payload = std::panic::catch_unwind(|| panic!("kaboom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "kaboom");

        let payload = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");
    }

    #[test]
    fn test_execution_source_is_preserved() {
        let err =
            CommandError::execution(&CommandKey::new("Foo"), Box::new(BadRequest::new("no")));

        let source = err.source().expect("source should be set");
        assert_eq!(source.to_string(), "no");
        assert_eq!(err.to_string(), "command 'Foo' failed: no");
    }
}
