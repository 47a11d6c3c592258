//! Scheduler transfers and the default background thread pool.
//!
//! A [`Schedule`] implementation is anything that can take a [`Waker`] and
//! eventually wake it, exactly once, from one of its own threads. Because a
//! resumed task is polled inline on the thread that wakes it, handing a
//! waker to a scheduler moves the rest of the task onto that scheduler.
//!
//! [`resume_on`] suspends the calling task and resumes it on an explicit
//! scheduler; [`resume_background`] is the shorthand bound to the policy's
//! default background scheduler.

use core::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll, Waker},
};
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, Once, OnceLock},
    thread,
};

use crate::policy::Policy;

/// A sink for resumptions: schedules a [`Waker`] to be woken on one of the
/// scheduler's threads.
pub trait Schedule: Send + Sync {
    /// Schedules `waker` to be woken.
    ///
    /// The implementation must eventually invoke [`Waker::wake`] exactly
    /// once. Waking polls the suspended task inline, so the task resumes on
    /// whichever thread performs the wake.
    fn schedule(&self, waker: Waker);
}

impl<S: Schedule + ?Sized> Schedule for &'static S {
    fn schedule(&self, waker: Waker) {
        (**self).schedule(waker)
    }
}

/// Suspends the calling task and resumes it on `scheduler`.
///
/// # Examples
///
/// ```
/// use cortado::{resume_on, scheduler::ThreadPool, Task};
///
/// let task: Task<()> = Task::spawn(async {
///     resume_on(ThreadPool::global()).await;
///     // now running on a pool thread
/// });
/// task.get();
/// ```
pub fn resume_on<S: Schedule + ?Sized>(scheduler: &S) -> Transfer<'_, S> {
    Transfer {
        scheduler,
        transferred: false,
    }
}

/// Suspends the calling task and resumes it on the policy's default
/// background scheduler.
///
/// # Examples
///
/// ```
/// use cortado::{resume_background, DefaultPolicy, Task};
///
/// let task: Task<()> = Task::spawn(async {
///     resume_background::<DefaultPolicy>().await;
/// });
/// task.get();
/// ```
pub fn resume_background<P: Policy>() -> Transfer<'static, P::Scheduler> {
    resume_on(P::background())
}

/// A [`Future`] that hands its task to a scheduler.
///
/// Returned by [`resume_on`] and [`resume_background`]. Never ready on its
/// first poll; ready on the poll after the scheduler wakes it.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Transfer<'a, S: Schedule + ?Sized> {
    scheduler: &'a S,
    transferred: bool,
}

// === impl Transfer ===

impl<S: Schedule + ?Sized> Future for Transfer<'_, S> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.transferred {
            return Poll::Ready(());
        }
        this.transferred = true;
        this.scheduler.schedule(cx.waker().clone());
        Poll::Pending
    }
}

impl<S: Schedule + ?Sized> Unpin for Transfer<'_, S> {}

impl<S: Schedule + ?Sized> fmt::Debug for Transfer<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("transferred", &self.transferred)
            .finish()
    }
}

/// A background worker pool driving scheduled wakers.
///
/// Worker threads are started lazily on the first [`schedule`] call. Each
/// worker pops wakers from a shared injector queue and wakes them, running
/// the resumed tasks inline until their next suspension.
///
/// The process-wide pool used by [`DefaultPolicy`] is available through
/// [`ThreadPool::global`]; independent pools can be constructed for
/// workloads that must not share workers.
///
/// [`schedule`]: Schedule::schedule
/// [`DefaultPolicy`]: crate::DefaultPolicy
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: usize,
    start: Once,
}

struct Shared {
    queue: Mutex<Injector>,
    cv: Condvar,
}

#[derive(Default)]
struct Injector {
    wakers: VecDeque<Waker>,
    shutdown: bool,
}

// === impl ThreadPool ===

impl ThreadPool {
    /// Returns a new pool with one worker per available CPU (at least two,
    /// so that transfers always have somewhere to go while a worker is
    /// busy).
    #[must_use]
    pub fn new() -> Self {
        let workers = thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(2)
            .max(2);
        Self::with_workers(workers)
    }

    /// Returns a new pool with exactly `workers` worker threads.
    #[must_use]
    pub fn with_workers(workers: usize) -> Self {
        assert!(workers > 0, "a thread pool must have at least one worker");
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Injector::default()),
                cv: Condvar::new(),
            }),
            workers,
            start: Once::new(),
        }
    }

    /// Returns the process-wide shared pool.
    ///
    /// The reference is stable for the lifetime of the program, as the
    /// background-scheduler contract requires.
    #[must_use]
    pub fn global() -> &'static ThreadPool {
        static GLOBAL: OnceLock<ThreadPool> = OnceLock::new();
        GLOBAL.get_or_init(ThreadPool::new)
    }

    fn start_workers(&self) {
        self.start.call_once(|| {
            for n in 0..self.workers {
                let shared = self.shared.clone();
                thread::Builder::new()
                    .name(format!("cortado-worker-{n}"))
                    .spawn(move || shared.run())
                    .expect("failed to spawn a pool worker thread");
            }
        });
    }
}

impl Schedule for ThreadPool {
    fn schedule(&self, waker: Waker) {
        self.start_workers();
        let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.wakers.push_back(waker);
        drop(queue);
        self.shared.cv.notify_one();
    }
}

impl Default for ThreadPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        let mut queue = self.shared.queue.lock().unwrap_or_else(|e| e.into_inner());
        queue.shutdown = true;
        drop(queue);
        self.shared.cv.notify_all();
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("workers", &self.workers)
            .field("started", &self.start.is_completed())
            .finish()
    }
}

// === impl Shared ===

impl Shared {
    fn run(&self) {
        loop {
            let waker = {
                let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
                loop {
                    if let Some(waker) = queue.wakers.pop_front() {
                        break waker;
                    }
                    if queue.shutdown {
                        return;
                    }
                    queue = self.cv.wait(queue).unwrap_or_else(|e| e.into_inner());
                }
            };
            trace!("ThreadPool: waking");
            waker.wake();
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::task::Wake;

    struct NotifyWaker(mpsc::SyncSender<thread::ThreadId>);

    impl Wake for NotifyWaker {
        fn wake(self: Arc<Self>) {
            let _ = self.0.send(thread::current().id());
        }
    }

    #[test]
    fn pool_wakes_on_worker_thread() {
        let _trace = crate::util::test::trace_init();
        let pool = ThreadPool::with_workers(2);
        let (tx, rx) = mpsc::sync_channel(8);

        for _ in 0..4 {
            pool.schedule(Waker::from(Arc::new(NotifyWaker(tx.clone()))));
        }

        let main = thread::current().id();
        for _ in 0..4 {
            let woken_on = rx
                .recv_timeout(core::time::Duration::from_secs(5))
                .expect("scheduled waker was never woken");
            assert_ne!(woken_on, main);
        }
    }

    #[test]
    fn transfer_is_ready_after_wake() {
        let _trace = crate::util::test::trace_init();
        let mut task = tokio_test::task::spawn(resume_on(ThreadPool::global()));
        tokio_test::assert_pending!(task.poll());
        while !task.is_woken() {
            thread::yield_now();
        }
        tokio_test::assert_ready!(task.poll());
    }
}
