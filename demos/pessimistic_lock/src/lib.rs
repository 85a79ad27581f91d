//! Pessimistic locking: a shared counter where each worker holds an exclusive
//! lock for the whole read-modify-write cycle, including the slow step.
//!
//! Run the demo with: cargo run -p pessimistic_lock

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::debug;

/// One entry in the counter's access journal, recorded from inside the
/// critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read { worker: usize, value: u64 },
    Update { worker: usize, value: u64 },
}

#[derive(Debug, Default)]
struct CounterState {
    value: u64,
    journal: Vec<Access>,
}

/// A counter protected by a single async mutex. The lock is held across the
/// simulated-work sleep, so it must be a `tokio::sync::Mutex`, not a std one.
#[derive(Debug, Default)]
pub struct PessimisticCounter {
    state: Mutex<CounterState>,
}

impl PessimisticCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// One read-modify-write cycle under the lock.
    ///
    /// The sleep happens while the lock is held, blocking every other worker
    /// until this one finishes. The guard releases the lock on every exit
    /// path, including cancellation at the sleep.
    pub async fn increment(&self, worker: usize, hold_delay: Duration) -> u64 {
        let mut state = self.state.lock().await;

        let current = state.value;
        debug!(worker, value = current, "read under lock");
        state.journal.push(Access::Read { worker, value: current });

        // Simulate a slow operation inside the critical section.
        tokio::time::sleep(hold_delay).await;

        let updated = current + 1;
        state.value = updated;
        state.journal.push(Access::Update {
            worker,
            value: updated,
        });
        debug!(worker, value = updated, "updated under lock");

        updated
    }

    pub async fn value(&self) -> u64 {
        self.state.lock().await.value
    }

    /// Copy of the access journal, in the order the lock was granted.
    pub async fn journal(&self) -> Vec<Access> {
        self.state.lock().await.journal.clone()
    }
}

/// Shape of a demo run: how many workers, how many increments each, and how
/// long the simulated work takes.
#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    pub workers: usize,
    pub iterations: usize,
    /// Time spent inside the critical section per increment.
    pub hold_delay: Duration,
    /// Pause between increments, taken outside the lock.
    pub pause_between: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            iterations: 3,
            hold_delay: Duration::from_millis(500),
            pause_between: Duration::from_millis(100),
        }
    }
}

/// Result of a completed run.
#[derive(Debug)]
pub struct RunReport {
    pub final_value: u64,
    pub journal: Vec<Access>,
}

/// Spawn the worker pool, wait for every worker to finish all its
/// iterations, and report the final counter value.
pub async fn run(config: RunConfig) -> RunReport {
    let counter = Arc::new(PessimisticCounter::new());
    let mut handles = vec![];

    for worker in 1..=config.workers {
        let counter = Arc::clone(&counter);
        handles.push(tokio::spawn(async move {
            for _ in 0..config.iterations {
                counter.increment(worker, config.hold_delay).await;
                // The lock is free here; give other workers a chance.
                tokio::time::sleep(config.pause_between).await;
            }
        }));
    }

    for result in join_all(handles).await {
        result.expect("worker task panicked");
    }

    RunReport {
        final_value: counter.value().await,
        journal: counter.journal().await,
    }
}
