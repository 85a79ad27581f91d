//! Optimistic concurrency control: workers read a versioned value under a
//! brief lock, compute a candidate with no lock held, then commit only if the
//! version is unchanged. A losing worker discards its work and retries.
//!
//! Run the demo with: cargo run -p optimistic_lock

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Copy of `(value, version)` taken under the metadata lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub value: u64,
    pub version: u64,
}

/// What a single commit attempt came back with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { value: u64, version: u64 },
    /// Someone else committed between our read and our commit. Nothing was
    /// written; the caller retries from a fresh snapshot.
    Conflict {
        read_version: u64,
        current_version: u64,
    },
}

/// One successful commit, recorded inside the commit section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRecord {
    pub worker: usize,
    /// The version the winning snapshot was taken at.
    pub read_version: u64,
    pub committed_version: u64,
}

#[derive(Debug, Default)]
struct VersionedState {
    value: u64,
    version: u64,
    history: Vec<CommitRecord>,
}

/// A value plus a version counter behind one mutex. The lock is only ever
/// held for a snapshot or a commit check, never across an await, so a plain
/// `parking_lot::Mutex` is the right tool.
#[derive(Debug, Default)]
pub struct OptimisticResource {
    state: Mutex<VersionedState>,
}

impl OptimisticResource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot the current `(value, version)` under a brief lock.
    pub fn read(&self) -> Snapshot {
        let state = self.state.lock();
        Snapshot {
            value: state.value,
            version: state.version,
        }
    }

    /// Publish `new_value` only if no commit happened since `snapshot` was
    /// taken. The version check and the write happen under one lock hold, so
    /// at most one commit can win any given version.
    pub fn try_commit(&self, worker: usize, snapshot: Snapshot, new_value: u64) -> CommitOutcome {
        let mut state = self.state.lock();

        if state.version != snapshot.version {
            return CommitOutcome::Conflict {
                read_version: snapshot.version,
                current_version: state.version,
            };
        }

        let committed_version = snapshot.version + 1;
        state.value = new_value;
        state.version = committed_version;
        state.history.push(CommitRecord {
            worker,
            read_version: snapshot.version,
            committed_version,
        });

        CommitOutcome::Committed {
            value: new_value,
            version: committed_version,
        }
    }

    pub fn value(&self) -> u64 {
        self.state.lock().value
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Copy of the commit history, in commit order.
    pub fn history(&self) -> Vec<CommitRecord> {
        self.state.lock().history.clone()
    }

    /// One successful increment: read, compute off-lock, commit, retry on
    /// conflict. Unbounded, matching the reference behavior.
    pub async fn increment(&self, worker: usize, work_delay: Duration) -> CommitReceipt {
        match self
            .increment_with_policy(worker, work_delay, RetryPolicy::default())
            .await
        {
            Ok(receipt) => receipt,
            // Unreachable: the default policy has no attempt cap.
            Err(e) => unreachable!("unbounded retry reported exhaustion: {e}"),
        }
    }

    /// Same cycle as [`increment`](Self::increment), honoring an optional
    /// attempt cap and an optional fixed backoff after each conflict.
    pub async fn increment_with_policy(
        &self,
        worker: usize,
        work_delay: Duration,
        policy: RetryPolicy,
    ) -> Result<CommitReceipt, RetriesExhausted> {
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let snapshot = self.read();
            debug!(
                worker,
                value = snapshot.value,
                version = snapshot.version,
                "read snapshot"
            );

            // Compute the candidate with no lock held. Other workers are free
            // to read and commit during this window.
            tokio::time::sleep(work_delay).await;
            let candidate = snapshot.value + 1;

            match self.try_commit(worker, snapshot, candidate) {
                CommitOutcome::Committed { value, version } => {
                    info!(worker, value, version, attempts, "commit succeeded");
                    return Ok(CommitReceipt {
                        worker,
                        attempts,
                        conflicts: attempts - 1,
                        value,
                        version,
                    });
                }
                CommitOutcome::Conflict {
                    read_version,
                    current_version,
                } => {
                    warn!(
                        worker,
                        read_version, current_version, "version changed, retrying"
                    );
                    if let Some(max) = policy.max_attempts {
                        if attempts >= max {
                            return Err(RetriesExhausted { worker, attempts });
                        }
                    }
                    if let Some(backoff) = policy.backoff {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
    }
}

/// How a worker behaves after a conflicting commit. The default retries
/// forever with no backoff.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Give up after this many attempts. `None` means retry forever.
    pub max_attempts: Option<u32>,
    /// Extra wait before re-reading after a conflict.
    pub backoff: Option<Duration>,
}

/// A bounded worker hit its attempt cap without committing. Only reachable
/// when [`RetryPolicy::max_attempts`] is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("worker {worker} gave up after {attempts} conflicting attempts")]
pub struct RetriesExhausted {
    pub worker: usize,
    pub attempts: u32,
}

/// What one successful increment cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    pub worker: usize,
    pub attempts: u32,
    pub conflicts: u32,
    /// Value the resource held right after this worker's commit.
    pub value: u64,
    /// Version this worker's commit produced.
    pub version: u64,
}

/// Shape of a demo run: each worker performs exactly one successful
/// increment.
#[derive(Debug, Clone, Copy)]
pub struct RunConfig {
    pub workers: usize,
    /// Length of the off-lock compute window, during which conflicts arise.
    pub work_delay: Duration,
    pub policy: RetryPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            work_delay: Duration::from_millis(300),
            policy: RetryPolicy::default(),
        }
    }
}

/// Result of a completed run.
#[derive(Debug)]
pub struct RunReport {
    pub final_value: u64,
    pub final_version: u64,
    pub total_conflicts: u32,
    pub receipts: Vec<CommitReceipt>,
}

/// Spawn one task per worker, wait for all of them to commit, and report
/// the final state together with every worker's receipt.
pub async fn run(config: RunConfig) -> Result<RunReport, RetriesExhausted> {
    let resource = Arc::new(OptimisticResource::new());
    let mut handles = vec![];

    for worker in 1..=config.workers {
        let resource = Arc::clone(&resource);
        handles.push(tokio::spawn(async move {
            resource
                .increment_with_policy(worker, config.work_delay, config.policy)
                .await
        }));
    }

    let mut receipts = Vec::with_capacity(config.workers);
    for result in join_all(handles).await {
        receipts.push(result.expect("worker task panicked")?);
    }

    Ok(RunReport {
        final_value: resource.value(),
        final_version: resource.version(),
        total_conflicts: receipts.iter().map(|r| r.conflicts).sum(),
        receipts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST_WORK: Duration = Duration::from_millis(5);

    fn fast_config(workers: usize) -> RunConfig {
        RunConfig {
            workers,
            work_delay: FAST_WORK,
            policy: RetryPolicy::default(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn three_workers_all_commit() {
        let report = run(fast_config(3)).await.unwrap();
        assert_eq!(report.final_value, 3);
        assert_eq!(report.final_version, 3);
        assert_eq!(report.receipts.len(), 3);
        // Every worker got exactly one commit in.
        for worker in 1..=3 {
            assert_eq!(
                report.receipts.iter().filter(|r| r.worker == worker).count(),
                1
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_worker_sees_no_conflicts() {
        let report = run(fast_config(1)).await.unwrap();
        assert_eq!(report.final_value, 1);
        assert_eq!(report.final_version, 1);
        assert_eq!(report.total_conflicts, 0);
        assert_eq!(report.receipts[0].attempts, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn every_worker_count_converges() {
        for workers in 1..=6 {
            let report = run(fast_config(workers)).await.unwrap();
            assert_eq!(report.final_value, workers as u64);
            assert_eq!(report.final_version, workers as u64);
        }
    }

    // The at-most-one-winner-per-version invariant, checked against the
    // instrumented commit history.
    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn history_versions_strictly_increase_without_duplicates() {
        const NUM_WORKERS: usize = 8;

        let resource = Arc::new(OptimisticResource::new());
        let mut handles = vec![];
        for worker in 1..=NUM_WORKERS {
            let resource = Arc::clone(&resource);
            handles.push(tokio::spawn(async move {
                resource.increment(worker, FAST_WORK).await
            }));
        }
        for result in join_all(handles).await {
            result.expect("worker task panicked");
        }

        let history = resource.history();
        assert_eq!(history.len(), NUM_WORKERS);

        for (i, record) in history.iter().enumerate() {
            // Commit i produced version i + 1: strictly increasing, no gaps.
            assert_eq!(record.committed_version, (i + 1) as u64);
            // The winner's snapshot was taken at the preceding version, so
            // no two winners can share a read version.
            assert_eq!(record.read_version, i as u64);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_snapshot_is_rejected() {
        let resource = OptimisticResource::new();

        let stale = resource.read();
        // Another worker commits first.
        let outcome = resource.try_commit(2, resource.read(), 1);
        assert_eq!(outcome, CommitOutcome::Committed { value: 1, version: 1 });

        // The stale snapshot must now lose, without changing anything.
        assert_eq!(
            resource.try_commit(1, stale, 1),
            CommitOutcome::Conflict {
                read_version: 0,
                current_version: 1
            }
        );
        assert_eq!(resource.value(), 1);
        assert_eq!(resource.version(), 1);

        // A fresh read-compute-commit cycle wins.
        let fresh = resource.read();
        assert_eq!(
            resource.try_commit(1, fresh, fresh.value + 1),
            CommitOutcome::Committed { value: 2, version: 2 }
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bounded_policy_gives_up_after_forced_conflict() {
        let resource = Arc::new(OptimisticResource::new());

        // A slow worker with a single-attempt budget.
        let slow = Arc::clone(&resource);
        let handle = tokio::spawn(async move {
            slow.increment_with_policy(
                1,
                Duration::from_millis(500),
                RetryPolicy {
                    max_attempts: Some(1),
                    backoff: None,
                },
            )
            .await
        });

        // Commit while the slow worker is still inside its compute window.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = resource.read();
        assert!(matches!(
            resource.try_commit(2, snapshot, snapshot.value + 1),
            CommitOutcome::Committed { .. }
        ));

        let result = handle.await.expect("worker task panicked");
        assert_eq!(result, Err(RetriesExhausted { worker: 1, attempts: 1 }));

        // The interloper's commit is the only one that landed.
        assert_eq!(resource.value(), 1);
        assert_eq!(resource.version(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn backoff_policy_still_converges() {
        let config = RunConfig {
            workers: 4,
            work_delay: FAST_WORK,
            policy: RetryPolicy {
                max_attempts: Some(1_000),
                backoff: Some(Duration::from_millis(1)),
            },
        };
        let report = run(config).await.unwrap();
        assert_eq!(report.final_value, 4);
        assert_eq!(report.final_version, 4);
    }
}
