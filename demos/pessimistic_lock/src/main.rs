// Demo: pessimistic locking.
// Workers serialize on one mutex, sleeping inside the critical section.

use pessimistic_lock::{run, RunConfig};
use tracing_subscriber::EnvFilter;

fn env_or(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()))
        .init();

    let defaults = RunConfig::default();
    let config = RunConfig {
        workers: env_or("PESSIMISTIC_WORKERS", defaults.workers),
        iterations: env_or("PESSIMISTIC_ITERATIONS", defaults.iterations),
        ..defaults
    };

    let report = run(config).await;

    println!("Final counter value (pessimistic): {}", report.final_value);
}
