//! Basic executor usage example

use command_machines::{
    BoxError, Command, CommandKeys, Executor, FallbackContext, async_trait,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

struct Charge {
    keys: CommandKeys,
    order: u32,
    healthy: Arc<AtomicBool>,
}

impl Charge {
    fn new(order: u32, healthy: &Arc<AtomicBool>) -> Self {
        Self {
            keys: CommandKeys::with_group("Payments").and_command_key("Charge"),
            order,
            healthy: Arc::clone(healthy),
        }
    }
}

#[async_trait]
impl Command for Charge {
    type Output = String;

    fn keys(&self) -> &CommandKeys {
        &self.keys
    }

    async fn run(&self) -> Result<String, BoxError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        if self.healthy.load(Ordering::SeqCst) {
            Ok(format!("Payment {} accepted", self.order))
        } else {
            Err(format!("Payment {} failed", self.order).into())
        }
    }

    async fn fallback(&self, ctx: &FallbackContext) -> Option<Result<String, BoxError>> {
        ctx.cause
            .is_circuit_open()
            .then(|| Ok(format!("Payment {} queued for retry", self.order)))
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    println!("=== Command Executor Basic Example ===\n");

    let executor = Executor::builder()
        .failure_threshold(3)
        .disable_failure_rate()
        .failure_window_secs(10.0)
        .half_open_timeout_secs(0.5)
        .timeout(Duration::from_millis(200))
        .on_open(|key| println!("🔴 Circuit '{}' opened!", key))
        .on_close(|key| println!("🟢 Circuit '{}' closed!", key))
        .on_half_open(|key| println!("🟡 Circuit '{}' half-open, testing...", key))
        .build();
    let key = "Charge".into();
    let healthy = Arc::new(AtomicBool::new(true));

    println!("Initial state: {}\n", executor.circuit_state(&key));

    println!("--- Successful calls ---");
    for order in 1..=2 {
        match executor.execute(Charge::new(order, &healthy)).await {
            Ok(result) => println!("✓ {}", result),
            Err(e) => println!("✗ Error: {}", e),
        }
    }
    println!("State: {}\n", executor.circuit_state(&key));

    println!("--- Triggering failures ---");
    healthy.store(false, Ordering::SeqCst);
    for order in 3..=5 {
        match executor.execute(Charge::new(order, &healthy)).await {
            Ok(_) => println!("✓ Success"),
            Err(e) => println!("✗ {}", e),
        }
    }
    println!("State: {} (circuit opened)\n", executor.circuit_state(&key));

    println!("--- Calling while open (fallback) ---");
    match executor.execute(Charge::new(6, &healthy)).await {
        Ok(result) => println!("✓ {}", result),
        Err(e) => println!("✗ {}", e),
    }
    println!();

    println!("--- Waiting for cooldown ---");
    healthy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(600)).await;
    match executor.execute(Charge::new(7, &healthy)).await {
        Ok(result) => println!("✓ {}", result),
        Err(e) => println!("✗ {}", e),
    }
    println!("State: {}\n", executor.circuit_state(&key));

    println!("--- Composing results ---");
    let first = executor.submit(Charge::new(8, &healthy));
    let second = executor.submit(Charge::new(9, &healthy));
    let both = first.zip_with(&second, |a, b| format!("{a} / {b}"));
    match both.await {
        Ok(result) => println!("✓ {}", result),
        Err(e) => println!("✗ {}", e),
    }

    let health = executor.health(&key);
    println!(
        "\nHealth: {} calls, {} errors ({:.0}% errors)",
        health.total,
        health.errors,
        health.error_percentage()
    );
}
