//! A one-shot latch with a lock-free waiter stack.
//!
//! See the documentation for the [`AsyncEvent`] type for details.

use crate::{
    loom::sync::atomic::{AtomicUsize, Ordering::*},
    scheduler::Schedule,
    util::{fmt, CachePadded},
    wait::{self, Waiter},
};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use pin_project::{pin_project, pinned_drop};

/// A one-shot latch: once [`set`], it stays set forever, and every waiter
/// past and future observes it.
///
/// The entire event is a single atomic word. `0` means unset with no
/// waiters; [`usize::MAX`] means set; any other value is the head of an
/// intrusive LIFO stack of waiters living inside suspended [`WaitEvent`]
/// futures. Waiting and setting are both lock-free: a waiter pushes itself
/// with a CAS, and [`set`] steals the whole stack with one exchange and
/// resumes every waiter exactly once, inline or on the scheduler a waiter
/// was bound to with [`wait_async_on`].
///
/// Because the event is one-shot, a waiter that attaches after [`set`]
/// completes synchronously without suspending.
///
/// # Cancellation
///
/// Suspended waiters cannot be cancelled. Dropping a [`WaitEvent`] future
/// that is still enqueued unlinks it if it is at the head of the stack;
/// otherwise the dropping thread must spin until the event is set. Do not
/// drop an enqueued waiter of an event that may never be set.
///
/// [`set`]: Self::set
/// [`wait_async_on`]: Self::wait_async_on
///
/// # Examples
///
/// ```
/// use cortado::{AsyncEvent, Task};
/// use std::sync::Arc;
///
/// let event = Arc::new(AsyncEvent::new());
/// let task: Task<u32> = Task::spawn({
///     let event = event.clone();
///     async move {
///         event.wait_async().await;
///         42
///     }
/// });
///
/// assert!(!task.is_ready());
/// event.set();
/// assert_eq!(task.get(), 42);
/// ```
pub struct AsyncEvent {
    /// `UNSET`, `SET`, or a pointer to the head of the waiter stack.
    stack: CachePadded<AtomicUsize>,
}

const UNSET: usize = 0;
const SET: usize = usize::MAX;

// === impl AsyncEvent ===

impl AsyncEvent {
    loom_const_fn! {
        /// Returns a new, unset event.
        #[must_use]
        pub fn new() -> Self {
            Self {
                stack: CachePadded::new(AtomicUsize::new(UNSET)),
            }
        }
    }

    /// Returns `true` if the event has been set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.stack.load(SeqCst) == SET
    }

    /// Sets the event, resuming every waiter.
    ///
    /// The first call steals the entire waiter stack and resumes each
    /// waiter exactly once; subsequent calls are no-ops.
    pub fn set(&self) {
        let prior = self.stack.swap(SET, SeqCst);
        if prior == UNSET || prior == SET {
            return;
        }

        trace!("AsyncEvent::set: waking waiters");
        let mut curr = prior as *const Waiter;
        while !curr.is_null() {
            // Read the link before releasing the node; its owner may
            // reclaim it the instant it is woken.
            let next = unsafe { Waiter::next(curr) };
            unsafe { Waiter::wake(curr) };
            curr = next;
        }
    }

    /// Returns a future that completes when the event is set.
    ///
    /// If the event is already set, the future completes synchronously on
    /// its first poll, without enqueueing.
    pub fn wait_async(&self) -> WaitEvent<'_> {
        WaitEvent {
            event: self,
            schedule: None,
            waiter: Waiter::new(),
        }
    }

    /// Like [`wait_async`](Self::wait_async), but the waiter resumes on
    /// `scheduler` instead of inline on the thread that sets the event.
    pub fn wait_async_on<S: Schedule>(&self, scheduler: &'static S) -> WaitEvent<'_> {
        WaitEvent {
            event: self,
            schedule: Some(scheduler),
            waiter: Waiter::new(),
        }
    }

    /// Blocks the calling thread until the event is set.
    pub fn wait(&self) {
        use std::{sync::Arc, task::Wake, thread};

        struct Parker(thread::Thread);

        impl Wake for Parker {
            fn wake(self: Arc<Self>) {
                self.0.unpark();
            }

            fn wake_by_ref(self: &Arc<Self>) {
                self.0.unpark();
            }
        }

        if self.is_set() {
            return;
        }

        let waker = core::task::Waker::from(Arc::new(Parker(thread::current())));
        let mut cx = Context::from_waker(&waker);
        let mut wait = core::pin::pin!(self.wait_async());
        while wait.as_mut().poll(&mut cx).is_pending() {
            thread::park();
        }
    }

    /// Pushes `waiter` onto the stack. Returns `false` if the event was
    /// observed set instead (the waiter was not enqueued).
    fn enqueue(&self, waiter: *const Waiter) -> bool {
        let mut state = self.stack.load(SeqCst);
        loop {
            if state == SET {
                return false;
            }
            unsafe {
                // Includes null when the stack is empty, since UNSET == 0.
                (*waiter).link(state as *const Waiter);
            }
            match self
                .stack
                .compare_exchange_weak(state, waiter as usize, AcqRel, Acquire)
            {
                Ok(_) => return true,
                Err(actual) => state = actual,
            }
        }
    }
}

impl Default for AsyncEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.stack.load(Relaxed) {
            UNSET => "Unset",
            SET => "Set",
            _ => "Unset (waiters)",
        };
        f.debug_struct("AsyncEvent")
            .field("state", &fmt::display(state))
            .finish()
    }
}

unsafe impl Send for AsyncEvent {}
unsafe impl Sync for AsyncEvent {}

/// A [`Future`] that completes when its [`AsyncEvent`] is set.
///
/// Returned by [`AsyncEvent::wait_async`] and
/// [`AsyncEvent::wait_async_on`]. This future is fused: once it has
/// completed, polling it again immediately returns [`Poll::Ready`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct WaitEvent<'a> {
    event: &'a AsyncEvent,
    schedule: Option<&'static dyn Schedule>,
    #[pin]
    waiter: Waiter,
}

// === impl WaitEvent ===

impl Future for WaitEvent<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        match this.waiter.state() {
            wait::WOKEN => {
                this.waiter.consume();
                Poll::Ready(())
            }
            wait::CONSUMED => Poll::Ready(()),
            // Once enqueued, the setter is committed to waking us; the
            // waker recorded at enqueue time is the one that is woken.
            wait::ENQUEUED => Poll::Pending,
            _ => {
                unsafe {
                    // Safety: the node is unlinked; we are its owner.
                    this.waiter.prepare(cx.waker(), *this.schedule);
                }
                let waiter: *const Waiter = &*this.waiter;
                if this.event.enqueue(waiter) {
                    Poll::Pending
                } else {
                    // The event fired during the enqueue attempt.
                    this.waiter.consume();
                    Poll::Ready(())
                }
            }
        }
    }
}

#[pinned_drop]
impl PinnedDrop for WaitEvent<'_> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if this.waiter.state() != wait::ENQUEUED {
            return;
        }

        // The node is still linked into the stack. If it is at the head,
        // one CAS pops it back off.
        let waiter: *const Waiter = &*this.waiter;
        let next = unsafe { Waiter::next(waiter) };
        if this
            .event
            .stack
            .compare_exchange(waiter as usize, next as usize, AcqRel, Acquire)
            .is_ok()
        {
            return;
        }

        // The node is buried in the stack (or the setter is mid-walk);
        // its storage cannot be reclaimed until the setter releases it.
        test_debug!("WaitEvent::drop: waiting for the setter");
        this.waiter.spin_until_woken();
    }
}

impl fmt::Debug for WaitEvent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitEvent")
            .field("event", self.event)
            .field("waiter", &self.waiter)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn wait_smoke() {
        let _trace = crate::util::test::trace_init();
        let event = Arc::new(AsyncEvent::new());

        let mut waiter = task::spawn({
            let event = event.clone();
            async move { event.wait_async().await }
        });

        assert_pending!(waiter.poll());
        event.set();
        assert!(waiter.is_woken());
        assert_ready!(waiter.poll());
    }

    #[test]
    fn fan_out() {
        let _trace = crate::util::test::trace_init();
        let event = Arc::new(AsyncEvent::new());

        let mut waiters = (0..5)
            .map(|_| {
                task::spawn({
                    let event = event.clone();
                    async move { event.wait_async().await }
                })
            })
            .collect::<Vec<_>>();

        for waiter in &mut waiters {
            assert_pending!(waiter.poll());
        }

        event.set();

        for waiter in &mut waiters {
            assert!(waiter.is_woken());
            assert_ready!(waiter.poll());
        }

        // a waiter attached after the set is ready synchronously
        let mut late = task::spawn({
            let event = event.clone();
            async move { event.wait_async().await }
        });
        assert_ready!(late.poll());
    }

    #[test]
    fn set_is_idempotent() {
        let _trace = crate::util::test::trace_init();
        let event = AsyncEvent::new();
        assert!(!event.is_set());
        event.set();
        event.set();
        assert!(event.is_set());
    }

    #[test]
    fn wait_is_fused() {
        let _trace = crate::util::test::trace_init();
        let event = Arc::new(AsyncEvent::new());
        let mut waiter = task::spawn({
            let event = event.clone();
            async move {
                let mut wait = core::pin::pin!(event.wait_async());
                futures::future::poll_fn(|cx| wait.as_mut().poll(cx)).await;
                futures::future::poll_fn(|cx| wait.as_mut().poll(cx)).await;
            }
        });
        assert_pending!(waiter.poll());
        event.set();
        assert_ready!(waiter.poll());
    }

    #[test]
    fn drop_enqueued_head_waiter() {
        let _trace = crate::util::test::trace_init();
        let event = AsyncEvent::new();
        {
            let mut waiter = task::spawn(event.wait_async());
            assert_pending!(waiter.poll());
            // the waiter is the head of the stack; dropping it unlinks it
        }
        event.set();
    }

    #[test]
    fn blocking_wait() {
        let _trace = crate::util::test::trace_init();
        let event = Arc::new(AsyncEvent::new());
        let setter = std::thread::spawn({
            let event = event.clone();
            move || {
                std::thread::sleep(core::time::Duration::from_millis(50));
                event.set();
            }
        });
        event.wait();
        assert!(event.is_set());
        setter.join().unwrap();
    }

    #[test]
    fn scheduler_bound_waiter_resumes_on_pool() {
        let _trace = crate::util::test::trace_init();
        let event = Arc::new(AsyncEvent::new());
        let pool = crate::scheduler::ThreadPool::global();

        let mut waiter = task::spawn({
            let event = event.clone();
            async move { event.wait_async_on(pool).await }
        });

        assert_pending!(waiter.poll());
        event.set();
        // the wake is asynchronous: it arrives via a pool worker
        while !waiter.is_woken() {
            std::thread::yield_now();
        }
        assert_ready!(waiter.poll());
    }
}
