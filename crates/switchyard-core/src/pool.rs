//! Worker thread pool.
//!
//! A fixed set of OS threads pulling work items from one FIFO queue. The
//! event loop only ever calls [`WorkerPool::submit`], which takes the queue
//! lock briefly and never waits for a worker.
//!
//! # Shutdown
//!
//! [`WorkerPool::shutdown`] sets the stop flag, wakes every worker and joins
//! them. A worker finishes the item it is running but does not pick up new
//! ones once the flag is set. Items still queued afterwards are passed to the
//! cleanup callback exactly once and are never executed.

use std::{
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
};

use parking_lot::{Condvar, Mutex};

use crate::error::{PoolError, SubmitError};

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;
type Cleanup<T> = Box<dyn FnMut(T) + Send>;

struct Queue<T> {
    items: VecDeque<T>,
    stopping: bool,
}

struct Shared<T> {
    queue: Mutex<Queue<T>>,
    input: Condvar,
    capacity: Option<usize>,
}

/// Bounded set of worker threads executing a handler over queued items.
pub struct WorkerPool<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
    cleanup: Option<Cleanup<T>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `threads` workers running `handler` over submitted items.
    ///
    /// `capacity` bounds the queue; `None` leaves it unbounded. `cleanup`
    /// releases items discarded at shutdown.
    ///
    /// # Errors
    ///
    /// - `PoolError::NoThreads` if `threads` is zero
    /// - `PoolError::Spawn` if a thread cannot be spawned; workers started so
    ///   far are stopped and joined first
    pub fn new<H, C>(
        threads: usize,
        capacity: Option<usize>,
        handler: H,
        cleanup: C,
    ) -> Result<Self, PoolError>
    where
        H: Fn(T) + Send + Sync + 'static,
        C: FnMut(T) + Send + 'static,
    {
        if threads == 0 {
            return Err(PoolError::NoThreads);
        }
        if cfg!(panic = "abort") {
            tracing::warn!("built with panic=abort, a panicking handler aborts the process");
        }

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue { items: VecDeque::new(), stopping: false }),
            input: Condvar::new(),
            capacity,
        });
        let handler: Handler<T> = Arc::new(handler);

        let mut pool =
            Self { shared, workers: Vec::with_capacity(threads), cleanup: Some(Box::new(cleanup)) };

        for n in 0..threads {
            let shared = Arc::clone(&pool.shared);
            let handler = Arc::clone(&handler);
            let spawned = thread::Builder::new()
                .name(format!("switchyard-worker-{n}"))
                .spawn(move || worker_loop(&shared, &handler));

            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(PoolError::Spawn(e));
                },
            }
        }

        tracing::debug!(threads, ?capacity, "worker pool started");
        Ok(pool)
    }

    /// Queue an item and wake one idle worker.
    ///
    /// # Errors
    ///
    /// - `SubmitError::Closed` after [`WorkerPool::close`] or shutdown
    /// - `SubmitError::Full` if the queue is at capacity
    pub fn submit(&self, item: T) -> Result<(), SubmitError<T>> {
        let mut queue = self.shared.queue.lock();
        if queue.stopping {
            return Err(SubmitError::Closed(item));
        }
        if self.shared.capacity.is_some_and(|cap| queue.items.len() >= cap) {
            return Err(SubmitError::Full(item));
        }

        queue.items.push_back(item);
        drop(queue);
        self.shared.input.notify_one();
        Ok(())
    }

    /// Stop accepting work and tell workers to exit after their current item.
    ///
    /// Does not wait. Call [`WorkerPool::shutdown`] to join and clean up.
    pub fn close(&self) {
        self.shared.queue.lock().stopping = true;
        self.shared.input.notify_all();
    }

    /// Number of items waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().items.len()
    }

    /// Number of worker threads still attached.
    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Stop, join every worker, then release queued items through the
    /// cleanup callback. Idempotent.
    pub fn shutdown(&mut self) {
        self.close();

        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("worker thread terminated abnormally");
            }
        }

        let leftover: Vec<T> = self.shared.queue.lock().items.drain(..).collect();
        if leftover.is_empty() {
            return;
        }

        tracing::debug!(discarded = leftover.len(), "releasing queued work after shutdown");
        if let Some(cleanup) = self.cleanup.as_mut() {
            for item in leftover {
                cleanup(item);
            }
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<T: Send + 'static> fmt::Debug for WorkerPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.workers.len())
            .field("capacity", &self.shared.capacity)
            .finish_non_exhaustive()
    }
}

fn worker_loop<T>(shared: &Shared<T>, handler: &Handler<T>) {
    loop {
        let item = {
            let mut queue = shared.queue.lock();
            while !queue.stopping && queue.items.is_empty() {
                shared.input.wait(&mut queue);
            }
            if queue.stopping {
                break;
            }
            match queue.items.pop_front() {
                Some(item) => item,
                None => continue,
            }
        };

        // A panicking handler must not take the worker down with it.
        if panic::catch_unwind(AssertUnwindSafe(|| (**handler)(item))).is_err() {
            let current = thread::current();
            tracing::error!(
                worker = current.name().unwrap_or("worker"),
                "work handler panicked; item released"
            );
        }
    }
}
