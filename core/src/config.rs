//! Per-command and per-pool configuration

use crate::circuit::Config;
use std::time::Duration;
use tokio::runtime::Handle;

/// Execution settings for one command key
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Execution timeout, counted from pool admission so time spent queued
    /// for a run permit is included; `None` lets the command run unbounded
    pub timeout: Option<Duration>,
    /// Circuit breaker settings for this command key
    pub circuit: Config,
    /// Whether the command's fallback is consulted on failure
    pub fallback_enabled: bool,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(1)),
            circuit: Config::default(),
            fallback_enabled: true,
        }
    }
}

/// Sizing and placement of one isolation pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Executions allowed to run at the same time
    pub max_concurrency: usize,
    /// Admitted executions allowed to wait for a run permit; 0 rejects as soon
    /// as every permit is busy. Queued executions still time out.
    pub queue_capacity: usize,
    /// Runtime the pool's work is spawned on (the executor's runtime if unset)
    pub handle: Option<Handle>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            queue_capacity: 0,
            handle: None,
        }
    }
}

impl PoolConfig {
    /// Total admission slots (running + queued)
    pub fn capacity(&self) -> usize {
        self.max_concurrency + self.queue_capacity
    }
}
