// Demo: both locking disciplines back to back with the same worker count.
// Pessimistic workers serialize on the lock; optimistic workers race and
// retry. Both end at the same final value, by different routes.

use std::time::Duration;

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
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let workers = env_or("COMPARISON_WORKERS", 5);

    // Pessimistic: one increment per worker, slow step inside the lock.
    let pessimistic = pessimistic_lock::run(pessimistic_lock::RunConfig {
        workers,
        iterations: 1,
        hold_delay: Duration::from_millis(200),
        pause_between: Duration::ZERO,
    })
    .await;
    println!(
        "Final shared resource value (pessimistic): {}",
        pessimistic.final_value
    );

    // Optimistic: same worker count, compute window outside the lock.
    let optimistic = optimistic_lock::run(optimistic_lock::RunConfig {
        workers,
        work_delay: Duration::from_millis(100),
        policy: optimistic_lock::RetryPolicy::default(),
    })
    .await
    .expect("unbounded workers always commit");
    println!(
        "Final shared resource value (optimistic): {} (version {}, {} conflicts)",
        optimistic.final_value, optimistic.final_version, optimistic.total_conflicts
    );
}
