//! Circuit, pool and request-cache behavior through the executor

use command_machines::{
    BoxError, CircuitState, Command, CommandConfig, CommandError, CommandKey, CommandKeys,
    EventKind, Executor, FallbackContext, PoolConfig, PoolKey, Rejection, RequestContext,
    async_trait, circuit::Config,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;

/// Configurable test command
#[derive(Clone)]
struct Remote {
    keys: CommandKeys,
    runs: Arc<AtomicUsize>,
    healthy: Arc<AtomicBool>,
    gate: Option<Arc<Semaphore>>,
    cache_key: Option<String>,
    fallback: bool,
}

impl Remote {
    fn new(command: &str) -> Self {
        Self {
            keys: CommandKeys::with_group("Remote").and_command_key(command),
            runs: Arc::new(AtomicUsize::new(0)),
            healthy: Arc::new(AtomicBool::new(true)),
            gate: None,
            cache_key: None,
            fallback: false,
        }
    }

    fn in_pool(mut self, pool: &str) -> Self {
        self.keys = self.keys.and_pool_key(pool);
        self
    }

    /// Block `run` until the gate has a permit
    fn gated(mut self, gate: &Arc<Semaphore>) -> Self {
        self.gate = Some(Arc::clone(gate));
        self
    }

    fn cached(mut self, key: &str) -> Self {
        self.cache_key = Some(key.to_string());
        self
    }

    fn with_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Command for Remote {
    type Output = String;

    fn keys(&self) -> &CommandKeys {
        &self.keys
    }

    async fn run(&self) -> Result<String, BoxError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await?;
        }
        if self.healthy.load(Ordering::SeqCst) {
            Ok(format!("{} ok", self.keys.command()))
        } else {
            Err("connection refused".into())
        }
    }

    async fn fallback(&self, ctx: &FallbackContext) -> Option<Result<String, BoxError>> {
        self.fallback
            .then(|| Ok(format!("fallback while {}", ctx.state)))
    }

    fn cache_key(&self) -> Option<String> {
        self.cache_key.clone()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn trips_after(failures: usize) -> Executor {
    Executor::builder()
        .failure_threshold(failures)
        .disable_failure_rate()
        .half_open_timeout_secs(0.05)
        .build()
}

#[tokio::test]
async fn test_open_circuit_rejects_without_running() {
    init_tracing();
    let executor = trips_after(3);
    let remote = Remote::new("Payments");
    remote.healthy.store(false, Ordering::SeqCst);

    for _ in 0..3 {
        let error = executor.execute(remote.clone()).await.unwrap_err();
        assert!(matches!(error, CommandError::Execution { .. }));
    }
    assert_eq!(remote.runs(), 3);

    let key = CommandKey::new("Payments");
    assert_eq!(executor.circuit_state(&key), CircuitState::Open);

    let error = executor.execute(remote.clone()).await.unwrap_err();
    assert!(error.is_circuit_open());
    assert_eq!(remote.runs(), 3, "short-circuited call must not run");

    let last = executor.executions(&key, 1);
    assert_eq!(last[0].kind, EventKind::ShortCircuited);
}

#[tokio::test]
async fn test_circuit_recovers_after_cooldown() {
    init_tracing();
    let opened = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));
    let (on_open, on_close) = (Arc::clone(&opened), Arc::clone(&closed));

    let executor = Executor::builder()
        .failure_threshold(1)
        .disable_failure_rate()
        .half_open_timeout_secs(0.05)
        .on_open(move |_| {
            on_open.fetch_add(1, Ordering::SeqCst);
        })
        .on_close(move |_| {
            on_close.fetch_add(1, Ordering::SeqCst);
        })
        .build();
    let remote = Remote::new("Inventory");
    let key = CommandKey::new("Inventory");

    remote.healthy.store(false, Ordering::SeqCst);
    assert!(executor.execute(remote.clone()).await.is_err());
    assert_eq!(executor.circuit_state(&key), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;
    remote.healthy.store(true, Ordering::SeqCst);

    assert_eq!(executor.execute(remote.clone()).await.unwrap(), "Inventory ok");
    assert_eq!(executor.circuit_state(&key), CircuitState::Closed);
    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transition_callbacks_can_use_the_executor() {
    init_tracing();
    let handle: Arc<OnceLock<Executor>> = Arc::new(OnceLock::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (on_open, log) = (Arc::clone(&handle), Arc::clone(&seen));
    let (on_half_open, half_open_log) = (Arc::clone(&handle), Arc::clone(&seen));

    let executor = Executor::builder()
        .failure_threshold(1)
        .disable_failure_rate()
        .half_open_timeout_secs(0.05)
        .on_open(move |key| {
            if let Some(executor) = on_open.get() {
                log.lock().unwrap().push(executor.circuit_state(key));
                // A different key takes the registry lock too
                executor.circuit_state(&CommandKey::new("Other"));
            }
        })
        .on_half_open(move |key| {
            if let Some(executor) = on_half_open.get() {
                let state = executor.circuit_state(key);
                assert_eq!(executor.health(key).errors, 1);
                half_open_log.lock().unwrap().push(state);
            }
        })
        .build();
    assert!(handle.set(executor.clone()).is_ok());

    let remote = Remote::new("Ledger");
    remote.healthy.store(false, Ordering::SeqCst);
    let error = tokio::time::timeout(Duration::from_secs(2), executor.execute(remote.clone()))
        .await
        .expect("on_open must not deadlock")
        .unwrap_err();
    assert!(matches!(error, CommandError::Execution { .. }));

    tokio::time::sleep(Duration::from_millis(80)).await;
    remote.healthy.store(true, Ordering::SeqCst);
    let value = tokio::time::timeout(Duration::from_secs(2), executor.execute(remote.clone()))
        .await
        .expect("on_half_open must not deadlock");
    assert_eq!(value.unwrap(), "Ledger ok");

    assert_eq!(
        *seen.lock().unwrap(),
        vec![CircuitState::Open, CircuitState::HalfOpen]
    );
}

#[tokio::test]
async fn test_failed_trial_reopens() {
    let executor = trips_after(1);
    let remote = Remote::new("Search");
    let key = CommandKey::new("Search");
    remote.healthy.store(false, Ordering::SeqCst);

    assert!(executor.execute(remote.clone()).await.is_err());
    tokio::time::sleep(Duration::from_millis(80)).await;

    let error = executor.execute(remote.clone()).await.unwrap_err();
    assert!(matches!(error, CommandError::Execution { .. }), "trial ran");
    assert_eq!(executor.circuit_state(&key), CircuitState::Open);
    assert_eq!(remote.runs(), 2);
}

#[tokio::test]
async fn test_fallback_replaces_short_circuit() {
    let executor = trips_after(2);
    let remote = Remote::new("Profile").with_fallback();
    remote.healthy.store(false, Ordering::SeqCst);

    assert_eq!(
        executor.execute(remote.clone()).await.unwrap(),
        "fallback while closed"
    );
    // The second failure trips the circuit before its fallback runs
    assert_eq!(
        executor.execute(remote.clone()).await.unwrap(),
        "fallback while open"
    );
    assert_eq!(
        executor.execute(remote.clone()).await.unwrap(),
        "fallback while open"
    );
    assert_eq!(remote.runs(), 2, "third call was short-circuited");

    let kinds: Vec<_> = executor
        .executions(&CommandKey::new("Profile"), 2)
        .into_iter()
        .map(|r| r.kind)
        .collect();
    assert_eq!(kinds, vec![EventKind::ShortCircuited, EventKind::FallbackSuccess]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_saturated_pool_rejects_fast() {
    let executor = Executor::builder()
        .pool(
            "narrow",
            PoolConfig {
                max_concurrency: 2,
                ..Default::default()
            },
        )
        .build();
    let gate = Arc::new(Semaphore::new(0));
    let remote = Remote::new("Report").in_pool("narrow").gated(&gate);

    let first = executor.submit(remote.clone());
    let second = executor.submit(remote.clone());

    let error = tokio::time::timeout(Duration::from_millis(100), executor.execute(remote.clone()))
        .await
        .expect("rejection must not wait")
        .unwrap_err();
    assert!(matches!(
        error,
        CommandError::Rejected {
            reason: Rejection::PoolSaturated { capacity: 2, .. },
            ..
        }
    ));

    // Other pools are unaffected
    let other = Remote::new("Status").in_pool("wide");
    assert_eq!(executor.execute(other).await.unwrap(), "Status ok");

    gate.add_permits(2);
    assert!(first.await.is_ok());
    assert!(second.await.is_ok());
    assert_eq!(executor.pool(&PoolKey::new("narrow")).available(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_queued_work_waits_for_a_run_permit() {
    let executor = Executor::builder()
        .pool(
            "queued",
            PoolConfig {
                max_concurrency: 1,
                queue_capacity: 1,
                handle: None,
            },
        )
        .disable_timeout()
        .build();
    let gate = Arc::new(Semaphore::new(0));
    let remote = Remote::new("Export").in_pool("queued").gated(&gate);

    let running = executor.submit(remote.clone());
    let queued = executor.submit(remote.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let pool = executor.pool(&PoolKey::new("queued"));
    assert_eq!(pool.active(), 1);
    assert_eq!(pool.queued(), 1);
    assert_eq!(remote.runs(), 1, "queued command has not started");

    let rejected = executor.execute(remote.clone()).await.unwrap_err();
    assert!(rejected.is_rejected());

    gate.add_permits(2);
    assert!(running.await.is_ok());
    assert!(queued.await.is_ok());
    assert_eq!(remote.runs(), 2);
}

#[tokio::test]
async fn test_cancel_releases_pool_slot() {
    let executor = Executor::builder()
        .pool(
            "single",
            PoolConfig {
                max_concurrency: 1,
                ..Default::default()
            },
        )
        .build();
    let gate = Arc::new(Semaphore::new(0));
    let remote = Remote::new("Upload").in_pool("single").gated(&gate);

    let stuck = executor.submit(remote.clone());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(executor.pool(&PoolKey::new("single")).available(), 0);

    assert!(stuck.cancel());
    assert!(matches!(stuck.await, Err(CommandError::Cancelled)));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(executor.pool(&PoolKey::new("single")).available(), 1);
    let unblocked = Remote::new("Upload").in_pool("single");
    assert_eq!(executor.execute(unblocked).await.unwrap(), "Upload ok");
}

#[tokio::test]
async fn test_per_command_timeout_override() {
    let executor = Executor::builder()
        .command(
            "Slow",
            CommandConfig {
                timeout: Some(Duration::from_millis(20)),
                circuit: Config {
                    failure_threshold: Some(1),
                    failure_rate_threshold: None,
                    ..Default::default()
                },
                fallback_enabled: true,
            },
        )
        .build();
    let gate = Arc::new(Semaphore::new(0));
    let slow = Remote::new("Slow").gated(&gate);

    let error = executor.execute(slow).await.unwrap_err();
    assert!(error.is_timeout());
    assert_eq!(
        executor.circuit_state(&CommandKey::new("Slow")),
        CircuitState::Open
    );
    assert_eq!(
        executor.circuit_state(&CommandKey::new("Fast")),
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_request_cache_shares_one_execution() {
    let executor = Executor::builder().build();
    let ctx = RequestContext::new();
    let first = Remote::new("User").cached("42");
    let second = Remote::new("User").cached("42");
    let other = Remote::new("User").cached("7");

    let a = executor.submit_cached(&ctx, first.clone());
    let b = executor.submit_cached(&ctx, second.clone());
    let c = executor.submit_cached(&ctx, other.clone());

    assert!(a.ptr_eq(&b));
    assert!(!a.ptr_eq(&c));
    assert_eq!(a.await.unwrap(), b.await.unwrap());
    assert!(c.await.is_ok());

    assert_eq!(first.runs() + second.runs(), 1);
    assert_eq!(other.runs(), 1);

    let kinds: Vec<_> = executor
        .executions(&CommandKey::new("User"), 10)
        .into_iter()
        .map(|r| r.kind)
        .collect();
    assert_eq!(kinds.iter().filter(|k| **k == EventKind::ResponseFromCache).count(), 1);

    // A fresh request context executes again
    let fresh = RequestContext::new();
    assert!(executor.submit_cached(&fresh, second.clone()).await.is_ok());
    assert_eq!(second.runs(), 1);
}

#[tokio::test]
async fn test_zip_fails_with_first_command_failure() {
    let executor = Executor::builder().build();
    let broken = Remote::new("Broken");
    broken.healthy.store(false, Ordering::SeqCst);
    let working = Remote::new("Working");

    let zipped = executor
        .submit(working.clone())
        .zip(&executor.submit(broken.clone()));

    let error = zipped.await.unwrap_err();
    assert_eq!(error.command().map(|k| k.as_str()), Some("Broken"));
}
