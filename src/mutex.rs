//! A fair asynchronous [mutual exclusion lock] that never blocks a thread.
//!
//! See the documentation on the [`AsyncMutex`] type for details.
//!
//! [mutual exclusion lock]: https://en.wikipedia.org/wiki/Mutual_exclusion

use crate::{
    loom::sync::atomic::{AtomicUsize, Ordering::*},
    scheduler::Schedule,
    util::{fmt, CachePadded},
    wait::{self, Waiter},
};
use core::{
    future::Future,
    mem::ManuallyDrop,
    pin::Pin,
    ptr,
    task::{Context, Poll},
};
use pin_project::{pin_project, pinned_drop};

/// A fair asynchronous mutex.
///
/// The entire mutex is a single atomic word. [`usize::MAX`] means unlocked;
/// `0` means locked with no waiters; any other value means locked *and* is
/// the head of an intrusive LIFO stack of waiters living inside suspended
/// lock futures. Acquiring, waiting, and unlocking never block a thread and
/// never touch an OS lock.
///
/// # Fairness and ownership transfer
///
/// Waiters push themselves at the head of the stack, so the stack's tail is
/// the earliest waiter. [`unlock`] steals the whole stack with one
/// exchange, detaches the tail, re-publishes the rest, and resumes the
/// detached waiter, which *inherits* the lock directly. The state word
/// never passes through the unlocked sentinel during a handoff, so a
/// concurrent [`try_lock`] cannot barge in between an unlock and the
/// waiter's resumption, and wakeup order under contention is first-in,
/// first-out.
///
/// # Acquisition styles
///
/// - [`try_lock`]: one CAS, no suspension.
/// - [`lock_async`]: suspends until the lock is acquired; the caller is
///   responsible for calling [`unlock`].
/// - [`scoped_lock_async`]: like [`lock_async`], but resolves to a
///   [`MutexGuard`] that unlocks when dropped.
///
/// The `_on` variants resume the waiter on a scheduler instead of inline on
/// the unlocking thread.
///
/// # Cancellation
///
/// Suspended waiters cannot be cancelled: dropping a lock future that is
/// still enqueued spins until the lock would have been granted to it, then
/// releases it. Dropping an enqueued waiter therefore requires the lock to
/// keep changing hands.
///
/// [`unlock`]: Self::unlock
/// [`try_lock`]: Self::try_lock
/// [`lock_async`]: Self::lock_async
/// [`scoped_lock_async`]: Self::scoped_lock_async
///
/// # Examples
///
/// ```
/// use cortado::{AsyncMutex, Task};
/// use std::sync::Arc;
///
/// let mutex = Arc::new(AsyncMutex::new());
/// let task: Task<()> = Task::spawn({
///     let mutex = mutex.clone();
///     async move {
///         let guard = mutex.scoped_lock_async().await;
///         // ...critical section...
///         drop(guard);
///     }
/// });
/// task.get();
/// assert!(mutex.try_lock());
/// mutex.unlock();
/// ```
pub struct AsyncMutex {
    /// `UNLOCKED`, `LOCKED`, or a pointer to the head of the waiter stack
    /// (which also implies locked).
    state: CachePadded<AtomicUsize>,
}

const UNLOCKED: usize = usize::MAX;
const LOCKED: usize = 0;

// === impl AsyncMutex ===

impl AsyncMutex {
    loom_const_fn! {
        /// Returns a new, unlocked mutex.
        #[must_use]
        pub fn new() -> Self {
            Self {
                state: CachePadded::new(AtomicUsize::new(UNLOCKED)),
            }
        }
    }

    /// Attempts to acquire the lock without suspending.
    ///
    /// Returns `true` if the lock was acquired. The caller then owns the
    /// lock and must eventually call [`unlock`](Self::unlock).
    pub fn try_lock(&self) -> bool {
        self.state
            .compare_exchange(UNLOCKED, LOCKED, Acquire, Relaxed)
            .is_ok()
    }

    /// Releases the lock, transferring ownership to the earliest waiter if
    /// one is queued.
    ///
    /// Calling `unlock` without owning the lock is a contract violation.
    pub fn unlock(&self) {
        // Steal the waiter stack, leaving the word "locked, no waiters" so
        // the mutex never appears free while we hold waiters.
        let mut stolen = self.state.swap(LOCKED, AcqRel);
        debug_assert_ne!(stolen, UNLOCKED, "unlocked an AsyncMutex that was not locked");

        while stolen == LOCKED {
            // No waiters were queued; release for real, unless one arrived
            // while we were looking.
            match self
                .state
                .compare_exchange(LOCKED, UNLOCKED, Release, Relaxed)
            {
                Ok(_) => return,
                Err(_) => stolen = self.state.swap(LOCKED, AcqRel),
            }
        }

        // `stolen` is a stack we now exclusively own. The tail is the
        // earliest waiter; hand it the lock.
        let head = stolen as *const Waiter;
        unsafe {
            let mut prev: *const Waiter = ptr::null();
            let mut tail = head;
            while !Waiter::next(tail).is_null() {
                prev = tail;
                tail = Waiter::next(tail);
            }

            if !prev.is_null() {
                // More than one waiter remained: detach the tail and put
                // the rest back.
                Waiter::set_next(prev, ptr::null());
                self.publish(head);
            }

            trace!("AsyncMutex::unlock: handing off");
            // The new owner inherits the lock; the state word stays locked
            // throughout.
            Waiter::wake(tail);
        }
    }

    /// Returns a future that resolves once the lock is acquired.
    ///
    /// On success the caller owns the lock and must eventually call
    /// [`unlock`](Self::unlock); prefer
    /// [`scoped_lock_async`](Self::scoped_lock_async) where a scope-bound
    /// guard fits.
    pub fn lock_async(&self) -> Lock<'_> {
        Lock {
            mutex: self,
            schedule: None,
            waiter: Waiter::new(),
        }
    }

    /// Like [`lock_async`](Self::lock_async), but the waiter resumes on
    /// `scheduler` instead of inline on the unlocking thread.
    pub fn lock_async_on<S: Schedule>(&self, scheduler: &'static S) -> Lock<'_> {
        Lock {
            mutex: self,
            schedule: Some(scheduler),
            waiter: Waiter::new(),
        }
    }

    /// Returns a future that resolves to a [`MutexGuard`] once the lock is
    /// acquired.
    pub fn scoped_lock_async(&self) -> ScopedLock<'_> {
        ScopedLock {
            mutex: self,
            schedule: None,
            done: false,
            waiter: Waiter::new(),
        }
    }

    /// Like [`scoped_lock_async`](Self::scoped_lock_async), but the waiter
    /// resumes on `scheduler` instead of inline on the unlocking thread.
    pub fn scoped_lock_async_on<S: Schedule>(&self, scheduler: &'static S) -> ScopedLock<'_> {
        ScopedLock {
            mutex: self,
            schedule: Some(scheduler),
            done: false,
            waiter: Waiter::new(),
        }
    }

    /// Acquires the lock or pushes `waiter` onto the stack. Returns `true`
    /// if the waiter was enqueued, `false` if the lock was acquired without
    /// queueing.
    fn enqueue_or_acquire(&self, waiter: *const Waiter) -> bool {
        let mut state = self.state.load(SeqCst);
        loop {
            if state == UNLOCKED {
                match self
                    .state
                    .compare_exchange_weak(UNLOCKED, LOCKED, Acquire, Relaxed)
                {
                    Ok(_) => return false,
                    Err(actual) => state = actual,
                }
            } else {
                unsafe {
                    // Includes null when there are no other waiters, since
                    // LOCKED == 0.
                    (*waiter).link(state as *const Waiter);
                }
                match self
                    .state
                    .compare_exchange_weak(state, waiter as usize, AcqRel, Acquire)
                {
                    Ok(_) => return true,
                    Err(actual) => state = actual,
                }
            }
        }
    }

    /// Puts the remaining stolen waiters (headed by `head`) back into the
    /// state word.
    ///
    /// Waiters that enqueued after the steal must not be lost: if the word
    /// is no longer bare-locked, the remaining stack is appended *beneath*
    /// the newly arrived waiters instead, preserving their relative ages.
    ///
    /// # Safety-relevant invariant
    ///
    /// Only the lock owner re-publishes, and the lock is held for the
    /// whole call, so the newly arrived stack can only grow at its head
    /// while we walk it.
    unsafe fn publish(&self, head: *const Waiter) {
        let mut state = self.state.load(Acquire);
        loop {
            if state == LOCKED {
                match self
                    .state
                    .compare_exchange(LOCKED, head as usize, AcqRel, Acquire)
                {
                    Ok(_) => return,
                    Err(actual) => state = actual,
                }
            } else {
                debug_assert_ne!(state, UNLOCKED);
                let mut tail = state as *const Waiter;
                while !Waiter::next(tail).is_null() {
                    tail = Waiter::next(tail);
                }
                Waiter::set_next(tail, head);
                return;
            }
        }
    }
}

impl Default for AsyncMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AsyncMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Relaxed) {
            UNLOCKED => "Unlocked",
            LOCKED => "Locked",
            _ => "Locked (waiters)",
        };
        f.debug_struct("AsyncMutex")
            .field("state", &fmt::display(state))
            .finish()
    }
}

unsafe impl Send for AsyncMutex {}
unsafe impl Sync for AsyncMutex {}

/// Polls one acquisition attempt; shared by both lock futures.
fn poll_acquire(
    mutex: &AsyncMutex,
    waiter: Pin<&Waiter>,
    schedule: Option<&'static dyn Schedule>,
    cx: &mut Context<'_>,
) -> Poll<()> {
    match waiter.state() {
        // The unlocking thread handed us the lock.
        wait::WOKEN => {
            waiter.consume();
            Poll::Ready(())
        }
        wait::CONSUMED => Poll::Ready(()),
        wait::ENQUEUED => Poll::Pending,
        _ => {
            // fast path: acquire without suspending
            if mutex.try_lock() {
                waiter.consume();
                return Poll::Ready(());
            }
            unsafe {
                // Safety: the node is unlinked; we are its owner.
                waiter.prepare(cx.waker(), schedule);
            }
            let waiter_ptr: *const Waiter = &*waiter;
            if mutex.enqueue_or_acquire(waiter_ptr) {
                Poll::Pending
            } else {
                // The lock freed up during the enqueue attempt.
                waiter.consume();
                Poll::Ready(())
            }
        }
    }
}

/// Drops one lock future's waiter; shared by both lock futures.
fn drop_waiter(mutex: &AsyncMutex, waiter: Pin<&Waiter>) {
    match waiter.state() {
        // Enqueued waiters cannot be unlinked from the middle of the
        // stack, and an unlock may already have chosen this node as the
        // next owner. Wait to be granted the lock, then release it.
        wait::ENQUEUED => {
            test_debug!("Lock::drop: waiting for handoff");
            waiter.spin_until_woken();
            mutex.unlock();
        }
        // Granted, but the wakeup was never consumed.
        wait::WOKEN => mutex.unlock(),
        _ => {}
    }
}

/// A [`Future`] that resolves once its [`AsyncMutex`] is acquired.
///
/// Returned by [`AsyncMutex::lock_async`] and
/// [`AsyncMutex::lock_async_on`]. On resolution the caller owns the lock
/// and must eventually call [`AsyncMutex::unlock`].
///
/// This future is fused: once it has resolved, polling it again
/// immediately returns [`Poll::Ready`] without re-acquiring.
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Lock<'a> {
    mutex: &'a AsyncMutex,
    schedule: Option<&'static dyn Schedule>,
    #[pin]
    waiter: Waiter,
}

// === impl Lock ===

impl Future for Lock<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.project();
        poll_acquire(*this.mutex, this.waiter.as_ref(), *this.schedule, cx)
    }
}

#[pinned_drop]
impl PinnedDrop for Lock<'_> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        drop_waiter(*this.mutex, this.waiter.as_ref());
    }
}

impl fmt::Debug for Lock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock").field("waiter", &self.waiter).finish()
    }
}

/// A [`Future`] that resolves to a [`MutexGuard`] once its [`AsyncMutex`]
/// is acquired.
///
/// Returned by [`AsyncMutex::scoped_lock_async`] and
/// [`AsyncMutex::scoped_lock_async_on`].
#[pin_project(PinnedDrop)]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct ScopedLock<'a> {
    mutex: &'a AsyncMutex,
    schedule: Option<&'static dyn Schedule>,
    /// Whether the guard has been minted; the acquisition belongs to it
    /// from then on.
    done: bool,
    #[pin]
    waiter: Waiter,
}

// === impl ScopedLock ===

impl<'a> Future for ScopedLock<'a> {
    type Output = MutexGuard<'a>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<MutexGuard<'a>> {
        let this = self.project();
        assert!(
            !*this.done,
            "ScopedLock polled again after resolving to a guard"
        );
        match poll_acquire(*this.mutex, this.waiter.as_ref(), *this.schedule, cx) {
            Poll::Ready(()) => {
                *this.done = true;
                Poll::Ready(MutexGuard { mutex: *this.mutex })
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[pinned_drop]
impl PinnedDrop for ScopedLock<'_> {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        if *this.done {
            // the guard owns the acquisition now
            return;
        }
        drop_waiter(*this.mutex, this.waiter.as_ref());
    }
}

impl fmt::Debug for ScopedLock<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedLock")
            .field("done", &self.done)
            .field("waiter", &self.waiter)
            .finish()
    }
}

/// An RAII "scoped lock" of an [`AsyncMutex`]. When this structure is
/// dropped (falls out of scope), the lock will be unlocked.
///
/// The guard can be held across `await` points, and may be released early
/// with [`unlock`](Self::unlock).
///
/// This structure is created by the [`scoped_lock_async`] and
/// [`scoped_lock_async_on`] methods on [`AsyncMutex`].
///
/// [`scoped_lock_async`]: AsyncMutex::scoped_lock_async
/// [`scoped_lock_async_on`]: AsyncMutex::scoped_lock_async_on
#[must_use = "if unused, the AsyncMutex will immediately unlock"]
pub struct MutexGuard<'a> {
    mutex: &'a AsyncMutex,
}

// === impl MutexGuard ===

impl MutexGuard<'_> {
    /// Releases the lock now, instead of when the guard is dropped.
    pub fn unlock(self) {
        let this = ManuallyDrop::new(self);
        this.mutex.unlock();
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

impl fmt::Debug for MutexGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexGuard").finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::{resume_background, when_all, DefaultPolicy, Task};
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready, task};

    #[test]
    fn try_lock_and_unlock() {
        let _trace = crate::util::test::trace_init();
        let mutex = AsyncMutex::new();
        assert!(mutex.try_lock());
        assert!(!mutex.try_lock());
        mutex.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn uncontended_lock_is_immediate() {
        let _trace = crate::util::test::trace_init();
        let mutex = AsyncMutex::new();
        let mut lock = task::spawn(mutex.lock_async());
        assert_ready!(lock.poll());
        drop(lock);
        mutex.unlock();
        assert!(mutex.try_lock());
    }

    #[test]
    fn handoff_is_fifo() {
        let _trace = crate::util::test::trace_init();
        let mutex = AsyncMutex::new();
        assert!(mutex.try_lock());

        let mut first = task::spawn(mutex.lock_async());
        let mut second = task::spawn(mutex.lock_async());
        assert_pending!(first.poll());
        assert_pending!(second.poll());

        mutex.unlock();
        assert!(first.is_woken(), "the earliest waiter is woken first");
        assert!(!second.is_woken());
        assert_ready!(first.poll());
        drop(first);

        mutex.unlock();
        assert!(second.is_woken());
        assert_ready!(second.poll());
        drop(second);

        mutex.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn unlock_transfers_ownership() {
        let _trace = crate::util::test::trace_init();
        let mutex = AsyncMutex::new();
        assert!(mutex.try_lock());

        let mut waiter = task::spawn(mutex.lock_async());
        assert_pending!(waiter.poll());

        mutex.unlock();
        // ownership went straight to the waiter; the word never passed
        // through the unlocked state
        assert!(
            !mutex.try_lock(),
            "a non-waiting thread must not squeeze in between unlock and handoff",
        );
        assert_ready!(waiter.poll());
        drop(waiter);
        mutex.unlock();
    }

    #[test]
    fn guard_unlocks_on_drop() {
        let _trace = crate::util::test::trace_init();
        let mutex = AsyncMutex::new();
        {
            let mut lock = task::spawn(mutex.scoped_lock_async());
            let _guard = assert_ready!(lock.poll());
            assert!(!mutex.try_lock());
        }
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn guard_releases_on_unwind() {
        let _trace = crate::util::test::trace_init();
        let mutex = Arc::new(AsyncMutex::new());
        let task = Task::<(), DefaultPolicy>::spawn({
            let mutex = mutex.clone();
            async move {
                let _guard = mutex.scoped_lock_async().await;
                panic!("something went wrong while holding the lock");
            }
        });
        task.wait();

        // the unwind released the lock exactly once
        assert!(mutex.try_lock());
        mutex.unlock();

        // and the failure is still reported at the join
        let joined = std::panic::catch_unwind(core::panic::AssertUnwindSafe(|| task.get()));
        assert!(joined.is_err());
    }

    #[test]
    fn guard_explicit_unlock() {
        let _trace = crate::util::test::trace_init();
        let mutex = AsyncMutex::new();
        let mut lock = task::spawn(mutex.scoped_lock_async());
        let guard = assert_ready!(lock.poll());
        guard.unlock();
        assert!(mutex.try_lock());
        mutex.unlock();
    }

    #[test]
    fn dropped_woken_waiter_releases_the_lock() {
        let _trace = crate::util::test::trace_init();
        let mutex = AsyncMutex::new();
        assert!(mutex.try_lock());

        let mut waiter = task::spawn(mutex.lock_async());
        assert_pending!(waiter.poll());
        mutex.unlock();
        assert!(waiter.is_woken());
        // the waiter now owns the lock, but is dropped without consuming it
        drop(waiter);

        assert!(mutex.try_lock());
        mutex.unlock();
    }

    /// A counter that can only be soundly incremented while holding the
    /// mutex.
    struct Protected(core::cell::UnsafeCell<usize>);
    unsafe impl Sync for Protected {}

    #[test]
    fn stress() {
        const TASKS: usize = 8;
        const ITERATIONS: usize = 2000;

        let _trace = crate::util::test::trace_init();
        let pool = crate::scheduler::ThreadPool::global();
        let mutex = Arc::new(AsyncMutex::new());
        let count = Arc::new(Protected(core::cell::UnsafeCell::new(0)));

        let tasks = (0..TASKS)
            .map(|_| {
                let mutex = mutex.clone();
                let count = count.clone();
                Task::<(), DefaultPolicy>::spawn(async move {
                    resume_background::<DefaultPolicy>().await;
                    for _ in 0..ITERATIONS {
                        // resuming through the pool keeps handoff chains off
                        // the unlocking task's stack
                        let guard = mutex.scoped_lock_async_on(pool).await;
                        unsafe {
                            *count.0.get() += 1;
                        }
                        drop(guard);
                    }
                })
            })
            .collect::<Vec<_>>();

        when_all::<(), DefaultPolicy>(tasks).get();

        assert_eq!(unsafe { *count.0.get() }, TASKS * ITERATIONS);
        assert!(mutex.try_lock());
        mutex.unlock();
    }
}
