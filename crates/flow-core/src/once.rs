//! Do-exactly-once tasks with a broadcast result.
//!
//! The first caller runs the future; concurrent callers await its
//! completion and all observe the same memoized outcome, success or
//! failure. Used for the controller's worker-image digest and the
//! once-per-process image upload.

use std::future::Future;

use tokio::sync::OnceCell;

/// A memoized asynchronous computation.
pub struct OnceTask<T> {
    cell: OnceCell<T>,
}

impl<T: Clone> OnceTask<T> {
    pub fn new() -> Self {
        OnceTask {
            cell: OnceCell::new(),
        }
    }

    /// Run `f` if no caller has completed it yet, otherwise return the
    /// memoized value. Concurrent callers block until the first
    /// completes and then observe its result.
    pub async fn get_or_run<F, Fut>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.cell.get_or_init(f).await.clone()
    }

    /// The memoized value, if the task has completed.
    pub fn get(&self) -> Option<&T> {
        self.cell.get()
    }
}

impl<T: Clone> Default for OnceTask<T> {
    fn default() -> Self {
        OnceTask::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_exactly_once() {
        let task = OnceTask::new();
        let runs = AtomicUsize::new(0);

        for _ in 0..5 {
            let v = task
                .get_or_run(|| async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    42
                })
                .await;
            assert_eq!(v, 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_are_memoized_too() {
        let task: OnceTask<Result<u32, String>> = OnceTask::new();
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            let v = task
                .get_or_run(|| async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                })
                .await;
            assert_eq!(v, Err("boom".to_string()));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_callers_observe_same_outcome() {
        let task = Arc::new(OnceTask::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let task = Arc::clone(&task);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                task.get_or_run(|| async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    7u32
                })
                .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap(), 7);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }
}
