// Demo: optimistic concurrency control.
// Workers read a versioned value, compute with no lock held, and commit only
// if nobody else committed in between; losers retry.

use optimistic_lock::{run, RunConfig};
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
        workers: env_or("OPTIMISTIC_WORKERS", defaults.workers),
        ..defaults
    };

    // The default policy retries until every worker commits.
    let report = run(config).await.expect("unbounded workers always commit");

    println!(
        "Final resource value (optimistic): {} (version {}, {} conflicts)",
        report.final_value, report.final_version, report.total_conflicts
    );
}
