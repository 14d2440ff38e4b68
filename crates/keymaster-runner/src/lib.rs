//! The Parallel Runner (spec.md §4.9): the only place in the workspace that spawns worker
//! threads. Deploy, audit, and decommission all fan out through this one type — per spec.md
//! §9's "implement the Parallel Runner once and reuse it" directive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use keymaster_core::error::KeymasterError;
use threadpool::ThreadPool;

/// Implemented by a task's success type so the runner can tell a genuine success from a
/// business-level skip (e.g. Deployer skipping an inactive account) without needing its own
/// variant for every caller's notion of "skipped".
pub trait TaskOutcome {
    fn is_skipped(&self) -> bool {
        false
    }
}

/// One item's result, tagged with its original position so callers can correlate results back
/// to the input list regardless of completion order.
pub struct RunOutcome<R> {
    pub index: usize,
    pub result: Result<R, KeymasterError>,
}

pub struct RunSummary<R> {
    pub ok_count: usize,
    pub fail_count: usize,
    pub skipped_count: usize,
    pub per_item: Vec<RunOutcome<R>>,
}

/// Bounded concurrent fan-out over OS threads. `concurrency` defaults to `num_cpus * 2`, the
/// default spec.md §4.9 specifies; callers doing interactive fleet operations may want a lower
/// cap to avoid saturating a shared jump host.
pub struct ParallelRunner {
    concurrency: usize,
}

impl Default for ParallelRunner {
    fn default() -> Self {
        ParallelRunner::new(None)
    }
}

impl ParallelRunner {
    pub fn new(concurrency: Option<usize>) -> Self {
        let concurrency = concurrency
            .unwrap_or_else(|| num_cpus::get().saturating_mul(2).max(1))
            .min(256);
        ParallelRunner { concurrency }
    }

    /// Run `task` over every item in `items`, up to `self.concurrency` at a time. `cancel` is
    /// checked before each task starts; tasks already in flight are not interrupted but their
    /// result is discarded in favor of `Canceled` once `per_task_timeout` elapses, since the
    /// blocking I/O inside `task` cannot itself be preempted — the runner can only stop waiting
    /// on it, not kill the thread it's running on.
    pub fn run<T, R, F>(
        &self,
        items: Vec<T>,
        cancel: Arc<AtomicBool>,
        per_task_timeout: Duration,
        task: F,
    ) -> RunSummary<R>
    where
        T: Send + 'static,
        R: TaskOutcome + Send + 'static,
        F: Fn(&T) -> Result<R, KeymasterError> + Send + Sync + 'static,
    {
        let total = items.len();
        let pool = ThreadPool::new(self.concurrency);
        let task = Arc::new(task);
        let (tx, rx) = mpsc::channel::<RunOutcome<R>>();

        for (index, item) in items.into_iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                let _ = tx.send(RunOutcome {
                    index,
                    result: Err(KeymasterError::Canceled),
                });
                continue;
            }

            let task = Arc::clone(&task);
            let tx = tx.clone();
            let cancel = Arc::clone(&cancel);

            pool.execute(move || {
                if cancel.load(Ordering::SeqCst) {
                    let _ = tx.send(RunOutcome {
                        index,
                        result: Err(KeymasterError::Canceled),
                    });
                    return;
                }

                let (done_tx, done_rx) = mpsc::channel();
                std::thread::spawn(move || {
                    let result = task(&item);
                    let _ = done_tx.send(result);
                });

                let result = match done_rx.recv_timeout(per_task_timeout) {
                    Ok(result) => result,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        Err(KeymasterError::Timeout(per_task_timeout))
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => Err(KeymasterError::Internal(
                        "task thread dropped its result channel".into(),
                    )),
                };
                let _ = tx.send(RunOutcome { index, result });
            });
        }
        drop(tx);

        let mut per_item: Vec<RunOutcome<R>> = rx.iter().take(total).collect();
        per_item.sort_by_key(|outcome| outcome.index);

        let mut ok_count = 0;
        let mut fail_count = 0;
        let mut skipped_count = 0;
        for outcome in &per_item {
            match &outcome.result {
                Ok(value) if value.is_skipped() => skipped_count += 1,
                Ok(_) => ok_count += 1,
                Err(_) => fail_count += 1,
            }
        }

        RunSummary {
            ok_count,
            fail_count,
            skipped_count,
            per_item,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain(i32);
    impl TaskOutcome for Plain {}

    struct MaybeSkipped {
        skipped: bool,
    }
    impl TaskOutcome for MaybeSkipped {
        fn is_skipped(&self) -> bool {
            self.skipped
        }
    }

    #[test]
    fn runs_every_item_and_preserves_identity() {
        let runner = ParallelRunner::new(Some(4));
        let items: Vec<i32> = (0..20).collect();
        let summary = runner.run(items, Arc::new(AtomicBool::new(false)), Duration::from_secs(5), |n| {
            Ok(Plain(n * 2))
        });

        assert_eq!(summary.ok_count, 20);
        assert_eq!(summary.per_item.len(), 20);
        for outcome in &summary.per_item {
            let Plain(value) = outcome.result.as_ref().unwrap();
            assert_eq!(*value, outcome.index as i32 * 2);
        }
    }

    #[test]
    fn failures_do_not_cancel_siblings() {
        let runner = ParallelRunner::new(Some(4));
        let items: Vec<i32> = (0..10).collect();
        let summary = runner.run(items, Arc::new(AtomicBool::new(false)), Duration::from_secs(5), |n| {
            if n % 2 == 0 {
                Err(KeymasterError::Internal("boom".into()))
            } else {
                Ok(Plain(*n))
            }
        });

        assert_eq!(summary.ok_count, 5);
        assert_eq!(summary.fail_count, 5);
        assert_eq!(summary.per_item.len(), 10);
    }

    #[test]
    fn skipped_items_are_counted_separately() {
        let runner = ParallelRunner::new(Some(4));
        let items: Vec<i32> = (0..4).collect();
        let summary = runner.run(items, Arc::new(AtomicBool::new(false)), Duration::from_secs(5), |n| {
            Ok(MaybeSkipped { skipped: *n == 0 })
        });

        assert_eq!(summary.ok_count, 3);
        assert_eq!(summary.skipped_count, 1);
    }

    #[test]
    fn preset_cancellation_marks_every_item_canceled() {
        let runner = ParallelRunner::new(Some(4));
        let items: Vec<i32> = (0..5).collect();
        let summary = runner.run(items, Arc::new(AtomicBool::new(true)), Duration::from_secs(5), |n| {
            Ok(Plain(*n))
        });

        assert_eq!(summary.fail_count, 5);
        for outcome in &summary.per_item {
            assert!(matches!(outcome.result, Err(KeymasterError::Canceled)));
        }
    }

    #[test]
    fn slow_task_past_timeout_is_reported_as_timeout() {
        let runner = ParallelRunner::new(Some(2));
        let items = vec![1];
        let summary = runner.run(items, Arc::new(AtomicBool::new(false)), Duration::from_millis(20), |_| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(Plain(1))
        });

        assert_eq!(summary.fail_count, 1);
        assert!(matches!(
            summary.per_item[0].result,
            Err(KeymasterError::Timeout(_))
        ));
    }
}
