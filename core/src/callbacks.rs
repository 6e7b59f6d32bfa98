//! Callback system for circuit state transitions

use crate::{CommandKey, circuit::Transition};
use std::sync::Arc;

type TransitionFn = Arc<dyn Fn(&CommandKey) + Send + Sync>;

/// Callbacks fired when a command's circuit changes state
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<TransitionFn>,
    pub on_close: Option<TransitionFn>,
    pub on_half_open: Option<TransitionFn>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the callback matching `transition`
    ///
    /// Callers must not hold the breaker's lock: callbacks may read or reset
    /// the same circuit.
    pub fn trigger(&self, command: &CommandKey, transition: Transition) {
        match transition {
            Transition::Opened => self.trigger_open(command),
            Transition::HalfOpened => self.trigger_half_open(command),
            Transition::Closed => self.trigger_close(command),
        }
    }

    pub fn trigger_open(&self, command: &CommandKey) {
        tracing::warn!(command = %command, "circuit opened");
        if let Some(ref callback) = self.on_open {
            callback(command);
        }
    }

    pub fn trigger_close(&self, command: &CommandKey) {
        tracing::info!(command = %command, "circuit closed");
        if let Some(ref callback) = self.on_close {
            callback(command);
        }
    }

    pub fn trigger_half_open(&self, command: &CommandKey) {
        tracing::info!(command = %command, "circuit half-open, admitting trial");
        if let Some(ref callback) = self.on_half_open {
            callback(command);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}
