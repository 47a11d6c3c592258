//! The intrusive waiter node shared by [`AsyncEvent`] and [`AsyncMutex`].
//!
//! A [`Waiter`] lives inside a wait future, pinned on the suspended task's
//! frame, and is linked into the owning primitive's LIFO stack by a CAS on
//! that primitive's state word. The node itself only defines the handshake
//! between the *owner* (the future, which registers a waker and eventually
//! drops the node) and the *producer* (the `set` or `unlock` path, which
//! steals the stack and resumes each node exactly once).
//!
//! [`AsyncEvent`]: crate::AsyncEvent
//! [`AsyncMutex`]: crate::AsyncMutex

use crate::{
    loom::{
        cell::UnsafeCell,
        sync::atomic::{AtomicUsize, Ordering::*},
    },
    scheduler::Schedule,
    util::Backoff,
};
use core::{fmt, marker::PhantomPinned, ptr, task::Waker};

/// A node in an intrusive waiter stack.
pub(crate) struct Waiter {
    /// The next-older waiter in the stack, or null.
    ///
    /// Written by the owner before the publishing CAS; read by the producer
    /// after stealing the stack, *before* releasing the node.
    next: UnsafeCell<*const Waiter>,

    /// The owner's waker. Written before the publishing CAS, taken by the
    /// producer.
    waker: UnsafeCell<Option<Waker>>,

    /// Resume asymmetrically on this scheduler instead of inline.
    schedule: UnsafeCell<Option<&'static dyn Schedule>>,

    /// The node's lifecycle state; see the constants below.
    state: AtomicUsize,

    _pin: PhantomPinned,
}

/// Not yet part of any stack; the owner may mutate the node freely.
pub(crate) const UNLINKED: usize = 0;
/// Linked into a stack. The node may only be mutated by whoever steals the
/// stack, and must not be dropped.
pub(crate) const ENQUEUED: usize = 1;
/// Released by the producer. The owner may consume the wakeup (for the
/// mutex: the granted lock) and drop the node.
pub(crate) const WOKEN: usize = 2;
/// The owner has consumed the wakeup.
pub(crate) const CONSUMED: usize = 3;

// === impl Waiter ===

impl Waiter {
    loom_const_fn! {
        pub(crate) fn new() -> Self {
            Self {
                next: UnsafeCell::new(ptr::null()),
                waker: UnsafeCell::new(None),
                schedule: UnsafeCell::new(None),
                state: AtomicUsize::new(UNLINKED),
                _pin: PhantomPinned,
            }
        }
    }

    pub(crate) fn state(&self) -> usize {
        self.state.load(Acquire)
    }

    /// Marks the wakeup consumed. Owner-side; only meaningful after
    /// [`WOKEN`] was observed.
    pub(crate) fn consume(&self) {
        self.state.store(CONSUMED, Relaxed);
    }

    /// Records the owner's waker and scheduler binding.
    ///
    /// # Safety
    ///
    /// Owner-side, and only while the node is [`UNLINKED`].
    pub(crate) unsafe fn prepare(&self, waker: &Waker, schedule: Option<&'static dyn Schedule>) {
        self.waker.with_mut(|slot| unsafe {
            match &mut *slot {
                Some(old) if old.will_wake(waker) => {}
                slot => *slot = Some(waker.clone()),
            }
        });
        self.schedule.with_mut(|slot| unsafe { *slot = schedule });
    }

    /// Sets the node's next pointer and marks it enqueued, in preparation
    /// for the publishing CAS.
    ///
    /// The CAS that publishes the node must use release ordering; the steal
    /// that acquires the stack synchronizes with it.
    ///
    /// # Safety
    ///
    /// Owner-side, and only while the node is [`UNLINKED`].
    pub(crate) unsafe fn link(&self, next: *const Waiter) {
        self.next.with_mut(|slot| unsafe { *slot = next });
        self.state.store(ENQUEUED, Relaxed);
    }

    /// Reads the next pointer of a stolen node.
    ///
    /// # Safety
    ///
    /// Producer-side: the caller must have stolen the stack containing this
    /// node and not yet released it.
    pub(crate) unsafe fn next(this: *const Self) -> *const Self {
        (*this).next.with(|next| unsafe { *next })
    }

    /// Rewrites the next pointer of a stolen (or newly observed tail)
    /// node.
    ///
    /// # Safety
    ///
    /// Producer-side; see [`Self::next`].
    pub(crate) unsafe fn set_next(this: *const Self, next: *const Self) {
        (*this).next.with_mut(|slot| unsafe { *slot = next });
    }

    /// Releases a stolen node to its owner and resumes it.
    ///
    /// The waker and scheduler binding are read out *before* the release
    /// store: the owner is free to drop the node the instant it observes
    /// [`WOKEN`], so the node must not be touched afterwards. The resume
    /// itself, whether waking inline or handing the waker to the bound
    /// scheduler, uses only the copied-out values.
    ///
    /// # Safety
    ///
    /// Producer-side, at most once per enqueued node.
    pub(crate) unsafe fn wake(this: *const Self) {
        let waker = (*this).waker.with_mut(|slot| unsafe { (*slot).take() });
        let schedule = (*this).schedule.with(|slot| unsafe { *slot });
        (*this).state.store(WOKEN, Release);
        // `this` is the owner's again; do not touch it past this point.
        match (waker, schedule) {
            (Some(waker), Some(schedule)) => schedule.schedule(waker),
            (Some(waker), None) => waker.wake(),
            (None, _) => debug_assert!(false, "an enqueued waiter always has a waker"),
        }
    }

    /// Owner-side: spins until the producer has released this node.
    ///
    /// Called when a wait future is dropped while still enqueued. The node
    /// cannot be unlinked from the middle of a lock-free LIFO stack, so the
    /// dropping thread must wait for the producer to finish with it before
    /// the node's storage can be reclaimed.
    pub(crate) fn spin_until_woken(&self) {
        let mut backoff = Backoff::new();
        while self.state.load(Acquire) != WOKEN {
            backoff.spin();
            #[cfg(not(loom))]
            std::thread::yield_now();
        }
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state.load(Relaxed) {
            UNLINKED => "Unlinked",
            ENQUEUED => "Enqueued",
            WOKEN => "Woken",
            CONSUMED => "Consumed",
            _ => "Invalid",
        };
        f.debug_struct("Waiter").field("state", &state).finish()
    }
}

unsafe impl Send for Waiter {}
unsafe impl Sync for Waiter {}
