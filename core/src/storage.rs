//! Rolling execution statistics
//!
//! This module provides different storage implementations:
//! - `MemoryStorage`: Thread-safe in-memory storage with sliding window
//! - `NullStorage`: No-op storage for testing and benchmarking

use crate::{EventKind, ExecutionRecord};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Instant;

/// Snapshot of a command's health over a rolling window
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HealthCounts {
    /// Outcomes that count toward the error rate (successes + failures)
    pub total: usize,
    /// Failures, timeouts and pool rejections
    pub errors: usize,
}

impl HealthCounts {
    /// Error rate in percent (0 when nothing was recorded)
    pub fn error_percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.errors as f64 * 100.0 / self.total as f64
        }
    }
}

/// Abstract storage backend for execution records
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Append one execution record
    fn record(&self, record: ExecutionRecord);

    /// Count records of one kind within a time window
    fn count(&self, command: &str, kind: EventKind, window_seconds: f64) -> usize;

    /// Count failures (as seen by the circuit breaker) within a time window
    fn failure_count(&self, command: &str, window_seconds: f64) -> usize;

    /// Count successful executions within a time window
    fn success_count(&self, command: &str, window_seconds: f64) -> usize {
        self.count(command, EventKind::Success, window_seconds)
    }

    /// Health snapshot within a time window
    fn health_counts(&self, command: &str, window_seconds: f64) -> HealthCounts {
        let errors = self.failure_count(command, window_seconds);
        HealthCounts {
            total: errors + self.success_count(command, window_seconds),
            errors,
        }
    }

    /// Clear all records for a command
    fn clear(&self, command: &str);

    /// Clear all records for all commands
    fn clear_all(&self);

    /// Get the record log for a command (limited to last N records)
    fn event_log(&self, command: &str, limit: usize) -> Vec<ExecutionRecord>;

    /// Get monotonic time in seconds (relative to storage creation)
    fn monotonic_time(&self) -> f64;
}

/// Thread-safe in-memory storage for execution records
#[derive(Debug)]
pub struct MemoryStorage {
    /// Records keyed by command name
    records: RwLock<HashMap<String, Vec<ExecutionRecord>>>,
    /// Maximum records to keep per command
    max_events: usize,
    /// Monotonic time anchor (prevents clock skew issues from NTP)
    start_time: Instant,
}

impl MemoryStorage {
    /// Create a new storage instance
    pub fn new() -> Self {
        Self::with_max_events(1000)
    }

    /// Create storage with custom max records per command
    pub fn with_max_events(max_events: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            max_events: max_events.max(1),
            start_time: Instant::now(),
        }
    }

    fn count_matching(
        &self,
        command: &str,
        window_seconds: f64,
        matches: impl Fn(EventKind) -> bool,
    ) -> usize {
        let records = self.records.read();
        let cutoff = self.monotonic_time() - window_seconds;

        records
            .get(command)
            .map(|log| {
                log.iter()
                    .filter(|r| matches(r.kind) && r.timestamp >= cutoff)
                    .count()
            })
            .unwrap_or(0)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for MemoryStorage {
    fn record(&self, record: ExecutionRecord) {
        let mut records = self.records.write();
        let log = records
            .entry(record.command.as_str().to_string())
            .or_default();
        log.push(record);

        // Remove oldest 10% to avoid cleanup on every record
        if log.len() > self.max_events {
            let remove_count = (self.max_events / 10).max(1);
            log.drain(0..remove_count);
        }
    }

    fn count(&self, command: &str, kind: EventKind, window_seconds: f64) -> usize {
        self.count_matching(command, window_seconds, |k| k == kind)
    }

    fn failure_count(&self, command: &str, window_seconds: f64) -> usize {
        self.count_matching(command, window_seconds, EventKind::is_failure)
    }

    fn clear(&self, command: &str) {
        self.records.write().remove(command);
    }

    fn clear_all(&self) {
        self.records.write().clear();
    }

    fn event_log(&self, command: &str, limit: usize) -> Vec<ExecutionRecord> {
        let records = self.records.read();
        records
            .get(command)
            .map(|log| log[log.len().saturating_sub(limit)..].to_vec())
            .unwrap_or_default()
    }

    fn monotonic_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

/// No-op storage backend for testing and benchmarking
///
/// Discards all records and always reports zero counts, so a circuit
/// backed by it never trips on its own.
///
/// # Example
///
/// ```rust
/// use command_machines::{Executor, NullStorage};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() {
/// let executor = Executor::builder()
///     .storage(Arc::new(NullStorage::new()))
///     .build();
/// # }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct NullStorage {
    start_time: Instant,
}

impl NullStorage {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for NullStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageBackend for NullStorage {
    fn record(&self, _record: ExecutionRecord) {}

    fn count(&self, _command: &str, _kind: EventKind, _window_seconds: f64) -> usize {
        0
    }

    fn failure_count(&self, _command: &str, _window_seconds: f64) -> usize {
        0
    }

    fn clear(&self, _command: &str) {}

    fn clear_all(&self) {}

    fn event_log(&self, _command: &str, _limit: usize) -> Vec<ExecutionRecord> {
        Vec::new()
    }

    fn monotonic_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CommandKey, PoolKey};

    fn record(storage: &dyn StorageBackend, command: &str, kind: EventKind) {
        storage.record(ExecutionRecord {
            command: CommandKey::new(command),
            pool: PoolKey::new("pool"),
            kind,
            timestamp: storage.monotonic_time(),
            duration: 0.01,
            cause: None,
        });
    }

    #[test]
    fn test_memory_storage_record_and_count() {
        let storage = MemoryStorage::new();

        record(&storage, "Foo", EventKind::Success);
        record(&storage, "Foo", EventKind::Success);
        record(&storage, "Foo", EventKind::Failure);
        record(&storage, "Foo", EventKind::Timeout);
        record(&storage, "Foo", EventKind::ShortCircuited);

        assert_eq!(storage.success_count("Foo", 60.0), 2);
        assert_eq!(storage.failure_count("Foo", 60.0), 2);
        assert_eq!(storage.count("Foo", EventKind::ShortCircuited, 60.0), 1);
        assert_eq!(storage.success_count("Bar", 60.0), 0);
    }

    #[test]
    fn test_health_counts_ignore_rejections_and_ignored() {
        let storage = MemoryStorage::new();

        record(&storage, "Foo", EventKind::Success);
        record(&storage, "Foo", EventKind::PoolRejected);
        record(&storage, "Foo", EventKind::Ignored);
        record(&storage, "Foo", EventKind::ShortCircuited);

        let health = storage.health_counts("Foo", 60.0);
        assert_eq!(health.total, 2);
        assert_eq!(health.errors, 1);
        assert_eq!(health.error_percentage(), 50.0);
    }

    #[test]
    fn test_memory_storage_clear() {
        let storage = MemoryStorage::new();

        record(&storage, "Foo", EventKind::Success);
        record(&storage, "Bar", EventKind::Success);
        storage.clear("Foo");

        assert_eq!(storage.success_count("Foo", 60.0), 0);
        assert_eq!(storage.success_count("Bar", 60.0), 1);

        storage.clear_all();
        assert_eq!(storage.success_count("Bar", 60.0), 0);
    }

    #[test]
    fn test_memory_storage_event_log() {
        let storage = MemoryStorage::new();

        record(&storage, "Foo", EventKind::Success);
        record(&storage, "Foo", EventKind::Failure);
        record(&storage, "Foo", EventKind::FallbackSuccess);

        let log = storage.event_log("Foo", 10);
        assert_eq!(log.len(), 3);
        assert_eq!(log[0].kind, EventKind::Success);
        assert_eq!(log[2].kind, EventKind::FallbackSuccess);

        let tail = storage.event_log("Foo", 1);
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].kind, EventKind::FallbackSuccess);
    }

    #[test]
    fn test_memory_storage_small_max_events() {
        let storage = MemoryStorage::with_max_events(5);

        for _ in 0..20 {
            record(&storage, "Foo", EventKind::Success);
        }

        assert!(storage.event_log("Foo", 100).len() <= 5);
    }

    #[test]
    fn test_memory_storage_window_excludes_old_records() {
        let storage = MemoryStorage::new();

        record(&storage, "Foo", EventKind::Failure);
        std::thread::sleep(std::time::Duration::from_millis(30));

        assert_eq!(storage.failure_count("Foo", 0.01), 0);
        assert_eq!(storage.failure_count("Foo", 60.0), 1);
    }

    #[test]
    fn test_null_storage_discards_records() {
        let storage = NullStorage::new();

        record(&storage, "Foo", EventKind::Success);
        record(&storage, "Foo", EventKind::Failure);

        assert_eq!(storage.success_count("Foo", 60.0), 0);
        assert_eq!(storage.failure_count("Foo", 60.0), 0);
        assert!(storage.event_log("Foo", 10).is_empty());
    }

    #[test]
    fn test_null_storage_monotonic_time() {
        let storage = NullStorage::new();

        let time1 = storage.monotonic_time();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let time2 = storage.monotonic_time();

        assert!(time2 > time1);
    }
}
