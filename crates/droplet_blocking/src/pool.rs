use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::Cancelled;

/// Runs blocking closures on tokio's blocking threads while limiting how many of them run at the
/// same time.
///
/// Awaiting [`BlockingPool::defer`] suspends only the calling task. The scheduler keeps driving
/// other tasks, which matters most on a current-thread runtime where a single blocking call would
/// otherwise stall every other task. The pool is cheap to clone; all clones share the same limit.
///
/// If the awaiting task is dropped (for instance because a deadline elapsed) the closure still
/// runs to completion in the background. Its slot is only returned to the pool when it finishes,
/// so abandoned work never leaks capacity.
#[derive(Debug, Clone)]
pub struct BlockingPool {
    semaphore: Arc<Semaphore>,
    concurrency_limit: usize,
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(std::thread::available_parallelism().map_or(1, std::num::NonZero::get))
    }
}

impl BlockingPool {
    /// Constructs a new pool that runs at most `concurrency_limit` closures at once. A limit of
    /// zero is treated as one.
    pub fn new(concurrency_limit: usize) -> Self {
        let concurrency_limit = concurrency_limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency_limit)),
            concurrency_limit,
        }
    }

    /// Returns the number of closures that can run in parallel.
    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Returns the number of slots that are currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Runs `f` on a blocking thread once a slot is free and resumes the calling task with its
    /// result.
    ///
    /// The value or error returned by `f` is handed back unchanged. A panic inside `f` is resumed
    /// on the calling task. The error type only has to be constructible from [`Cancelled`], which
    /// is returned if the runtime shuts down before `f` completes.
    pub async fn defer<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<Cancelled> + Send + 'static,
    {
        if self.semaphore.available_permits() == 0 {
            tracing::trace!(
                "all {} blocking slots are busy, waiting",
                self.concurrency_limit
            );
        }

        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| E::from(Cancelled))?;

        crate::tokio::run_blocking_task(move || {
            // The slot is held for as long as the closure runs, even if nobody awaits the result.
            let _permit = permit;
            f()
        })
        .await
    }
}
