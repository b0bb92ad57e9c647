//! Executors: the pluggable thread abstraction running node tasks.
//!
//! A scheduler queue never runs a node itself; it hands itself to an
//! [`Executor`] via [`Executor::add_task`], and the executor calls back into
//! [`TaskQueue::run_next_task`] from whatever thread it owns. Executors must
//! not hold locks while running a task: the scheduler is free to re-enter
//! executor methods from inside a node callback.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::thread::JoinHandle;

pub(crate) type Task = Box<dyn FnOnce() + Send>;

/// Something holding prioritized ready tasks, drained by an executor.
pub trait TaskQueue: Send + Sync {
    /// Runs the next ready task on the current thread. Called exactly as
    /// many times as `add_task` was called on the executor.
    fn run_next_task(&self);
}

/// Runs closures on one or more threads.
pub trait Executor: Send + Sync {
    /// Schedules `task` for execution.
    fn schedule(&self, task: Task);

    /// Tells the executor that `queue` has one more ready task.
    fn add_task(&self, queue: Arc<dyn TaskQueue>) {
        self.schedule(Box::new(move || queue.run_next_task()));
    }
}

/// A fixed pool of worker threads draining a shared task channel in FIFO
/// order.
pub struct ThreadPoolExecutor {
    sender: Option<flume::Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPoolExecutor {
    pub fn new(num_threads: usize) -> ThreadPoolExecutor {
        Self::with_name_prefix(num_threads, "worker")
    }

    /// Creates the pool with worker threads named `{name_prefix}-{i}`.
    pub fn with_name_prefix(num_threads: usize, name_prefix: &str) -> ThreadPoolExecutor {
        assert!(num_threads > 0, "a thread pool needs at least one thread");
        let (sender, receiver) = flume::unbounded::<Task>();
        let workers = (0..num_threads)
            .map(|i| {
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("{name_prefix}-{i}"))
                    .spawn(move || {
                        for task in receiver.iter() {
                            // A panicking node must not take the worker down
                            // with it; the graph records the error separately.
                            if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                                error!("a task panicked on a pool worker thread");
                            }
                        }
                    })
                    .unwrap()
            })
            .collect();
        ThreadPoolExecutor {
            sender: Some(sender),
            workers,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }
}

impl Executor for ThreadPoolExecutor {
    fn schedule(&self, task: Task) {
        // Send only fails when the pool is shutting down and the workers are
        // gone; dropping the task is all that is left to do then.
        let _ = self.sender.as_ref().unwrap().send(task);
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        // Closing the channel lets the workers drain what is left and exit.
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Forwards every task to a user-supplied sink.
pub struct DelegatingExecutor {
    callback: Box<dyn Fn(Task) + Send + Sync>,
}

impl DelegatingExecutor {
    pub fn new(callback: impl Fn(Task) + Send + Sync + 'static) -> DelegatingExecutor {
        DelegatingExecutor {
            callback: Box::new(callback),
        }
    }
}

impl Executor for DelegatingExecutor {
    fn schedule(&self, task: Task) {
        (self.callback)(task);
    }
}

thread_local! {
    static INLINE_RUNNING: Cell<bool> = const { Cell::new(false) };
    static INLINE_TASKS: RefCell<VecDeque<Task>> = const { RefCell::new(VecDeque::new()) };
}

/// Runs tasks inline on the calling thread.
///
/// A task scheduled from inside another task is deferred to a thread-local
/// deque instead of being run recursively, so arbitrarily deep scheduling
/// chains use constant stack.
#[derive(Default)]
pub struct CurrentThreadExecutor;

impl Executor for CurrentThreadExecutor {
    fn schedule(&self, task: Task) {
        INLINE_TASKS.with(|tasks| tasks.borrow_mut().push_back(task));
        let already_running = INLINE_RUNNING.with(|flag| flag.replace(true));
        if already_running {
            // The outer invocation's loop will pick the task up.
            return;
        }
        loop {
            let next = INLINE_TASKS.with(|tasks| tasks.borrow_mut().pop_front());
            match next {
                Some(task) => task(),
                None => break,
            }
        }
        INLINE_RUNNING.with(|flag| flag.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn thread_pool_runs_all_tasks() {
        let pool = ThreadPoolExecutor::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.schedule(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn thread_pool_survives_panicking_tasks() {
        let pool = ThreadPoolExecutor::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        pool.schedule(Box::new(|| panic!("boom")));
        let c = counter.clone();
        pool.schedule(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn current_thread_flattens_recursion() {
        let executor = Arc::new(CurrentThreadExecutor);
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let e = executor.clone();
        executor.schedule(Box::new(move || {
            o.lock().push(1);
            let o2 = o.clone();
            e.schedule(Box::new(move || {
                o2.lock().push(3);
            }));
            // The nested task must not run before this one returns.
            o.lock().push(2);
        }));

        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn delegating_executor_forwards() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let executor = DelegatingExecutor::new(move |task| {
            seen.fetch_add(1, Ordering::SeqCst);
            task();
        });
        executor.schedule(Box::new(|| {}));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
