//! The task's promise: the refcounted heap cell backing a [`Task`] handle.
//!
//! A spawned future lives in a single allocation with the layout
//!
//! ```text
//! [ allocator prefix | core | stage ]
//! ```
//!
//! The *allocator prefix* is the allocator instance that produced the
//! allocation; it is moved back out onto the stack at deallocation time and
//! asked to free the block, so the allocator that allocates a frame is
//! always the one that deallocates it. The *core* is everything the handle
//! and the wakers need (state bits and reference count, the F-erasing
//! vtable, the completion event, the continuation rendezvous, and the
//! result cell), laid out independently of the future's type so that a
//! handle can point straight at it. The *stage* holds the future itself and
//! the policy's user storage, and is touched only by the thread currently
//! polling.
//!
//! [`Task`]: crate::Task

use crate::{
    loom::{
        cell::UnsafeCell,
        sync::atomic::{AtomicUsize, Ordering::*},
    },
    policy::{
        AllocError, CompletionEvent, ErrorHandler, Failure, FrameAllocator, Policy, UserStorage,
    },
    util::Backoff,
};

use super::{
    result_cell::ResultCell,
    state::{OrDrop, PollAction, StateCell, WakeAction},
};

use core::{
    alloc::Layout,
    future::Future,
    mem::{offset_of, ManuallyDrop},
    pin::Pin,
    ptr::{self, NonNull},
    task::{Context, Poll, RawWaker, RawWakerVTable, Waker},
    time::Duration,
};

/// The part of a task frame shared between the handle, the wakers, and the
/// polling thread. Type-erased over the future, typed over the output.
#[repr(C)]
pub(crate) struct Core<T: 'static, P: Policy> {
    state: StateCell,
    vtable: &'static Vtable<T, P>,
    event: P::Event,
    rendezvous: Rendezvous,
    result: ResultCell<T, Failure<P>>,
}

struct Vtable<T: 'static, P: Policy> {
    /// Poll the future.
    poll: unsafe fn(NonNull<Core<T, P>>) -> Poll<()>,

    /// Drop the frame and deallocate its memory.
    drop_frame: unsafe fn(NonNull<Core<T, P>>),
}

/// A whole task frame: the allocator prefix, the shared core, and the
/// poller-private stage.
#[repr(C)]
pub(crate) struct Frame<F: Future, P: Policy>
where
    F::Output: 'static,
{
    /// This must be the first field: the deallocation path recovers the
    /// allocator from the front of the block before freeing it.
    allocator: P::Allocator,
    core: Core<F::Output, P>,
    stage: UnsafeCell<Stage<F, P::Storage>>,
}

struct Stage<F, S> {
    /// The future, or `None` once it has completed and been dropped.
    future: Option<F>,
    storage: S,
    /// Whether the future has been polled before; the first entry does not
    /// run the `before_resume` hook.
    polled: bool,
}

// === impl Core ===

impl<T: 'static, P: Policy> Core<T, P> {
    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::clone_waker,
        Self::wake_by_val,
        Self::wake_by_ref,
        Self::drop_waker,
    );

    fn raw_waker(this: NonNull<Self>) -> RawWaker {
        RawWaker::new(this.as_ptr() as *const (), &Self::WAKER_VTABLE)
    }

    unsafe fn clone_waker(ptr: *const ()) -> RawWaker {
        let this = NonNull::new_unchecked(ptr as *mut Self);
        this.as_ref().state.clone_ref();
        Self::raw_waker(this)
    }

    unsafe fn drop_waker(ptr: *const ()) {
        Self::drop_ref(NonNull::new_unchecked(ptr as *mut Self));
    }

    unsafe fn wake_by_val(ptr: *const ()) {
        let this = NonNull::new_unchecked(ptr as *mut Self);
        match test_dbg!(this.as_ref().state.wake_by_val()) {
            OrDrop::Drop => (this.as_ref().vtable.drop_frame)(this),
            OrDrop::Action(WakeAction::Poll) => {
                // The waker's reference keeps the frame alive across the
                // poll; release it afterwards.
                let _ = Self::poll(this);
                Self::drop_ref(this);
            }
            OrDrop::Action(WakeAction::None) => {}
        }
    }

    unsafe fn wake_by_ref(ptr: *const ()) {
        let this = NonNull::new_unchecked(ptr as *mut Self);
        if this.as_ref().state.wake_by_ref() == WakeAction::Poll {
            let _ = Self::poll(this);
        }
    }

    /// Poll the task inline on the calling thread.
    ///
    /// # Safety
    ///
    /// The caller must hold a reference to the frame for the duration of
    /// the call.
    pub(crate) unsafe fn poll(this: NonNull<Self>) -> Poll<()> {
        (this.as_ref().vtable.poll)(this)
    }

    /// Release one reference, deallocating the frame if it was the last.
    ///
    /// # Safety
    ///
    /// The caller must own the reference being released.
    pub(crate) unsafe fn drop_ref(this: NonNull<Self>) {
        if this.as_ref().state.drop_ref() {
            (this.as_ref().vtable.drop_frame)(this)
        }
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.event.is_set()
    }

    pub(crate) fn wait(&self) {
        self.event.wait()
    }

    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        self.event.wait_for(timeout)
    }

    /// Attach `waker` as the task's continuation. Returns `true` if the
    /// caller must suspend; `false` if the task has already completed.
    pub(crate) fn set_continuation(&self, waker: &Waker) -> bool {
        self.rendezvous.set_continuation(waker)
    }

    /// Move the completed task's outcome out, re-raising a stored error.
    ///
    /// # Safety
    ///
    /// The task's completion must have been observed through the event or
    /// the rendezvous, and only one consumer may take the outcome.
    pub(crate) unsafe fn take_output(&self) -> T {
        match self.result.take() {
            Ok(value) => value,
            Err(error) => P::Errors::rethrow(error),
        }
    }

    pub(crate) fn debug(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state)
            .field("ready", &self.is_ready())
            .finish()
    }
}

// === impl Frame ===

impl<F, P> Frame<F, P>
where
    F: Future,
    F::Output: 'static,
    P: Policy,
{
    const VTABLE: Vtable<F::Output, P> = Vtable {
        poll: Self::poll_raw,
        drop_frame: Self::drop_frame_raw,
    };

    /// Allocate a frame for `future` through `allocator`, moving the
    /// allocator into the frame's prefix. Returns a pointer to the core,
    /// with a reference count of two (the frame's own reference and the
    /// handle's).
    pub(crate) fn allocate(
        allocator: P::Allocator,
        future: F,
    ) -> Result<NonNull<Core<F::Output, P>>, AllocError> {
        let layout = Layout::new::<Self>();
        let ptr = allocator.allocate(layout)?.cast::<Self>();
        trace!(ptr = ?ptr, size = layout.size(), "Frame::allocate");
        let frame = Self {
            allocator,
            core: Core {
                state: StateCell::new(),
                vtable: &Self::VTABLE,
                event: P::Event::default(),
                rendezvous: Rendezvous::new(),
                result: ResultCell::new(),
            },
            stage: UnsafeCell::new(Stage {
                future: Some(future),
                storage: P::Storage::default(),
                polled: false,
            }),
        };
        unsafe {
            ptr::write(ptr.as_ptr(), frame);
            Ok(NonNull::new_unchecked(ptr::addr_of_mut!(
                (*ptr.as_ptr()).core
            )))
        }
    }

    /// Recover the frame pointer from a pointer to its core field.
    unsafe fn from_core(core: NonNull<Core<F::Output, P>>) -> NonNull<Self> {
        let base = (core.as_ptr() as *mut u8).sub(offset_of!(Self, core));
        NonNull::new_unchecked(base as *mut Self)
    }

    unsafe fn poll_raw(core_ptr: NonNull<Core<F::Output, P>>) -> Poll<()> {
        let frame_ptr = Self::from_core(core_ptr);
        loop {
            if core_ptr.as_ref().state.start_poll().is_err() {
                // Being polled on another thread, or already completed; in
                // either case the wakeup has been recorded.
                return Poll::Ready(());
            }

            // The context borrows this task's own waker without consuming a
            // reference, so it must not be dropped when the poll ends.
            let waker = ManuallyDrop::new(Waker::from_raw(Core::raw_waker(core_ptr)));
            let mut cx = Context::from_waker(&waker);

            let completed = frame_ptr.as_ref().stage.with_mut(|stage| unsafe {
                let stage = &mut *stage;
                if stage.polled {
                    stage.storage.before_resume();
                } else {
                    stage.polled = true;
                }

                let core = core_ptr.as_ref();
                let poll = P::Errors::catch(|| unsafe {
                    let future = match stage.future.as_mut() {
                        Some(future) => future,
                        None => unreachable_unchecked!("polled a task after its future was dropped"),
                    };
                    Pin::new_unchecked(future).poll(&mut cx)
                });
                let completed = match poll {
                    Ok(Poll::Pending) => false,
                    Ok(Poll::Ready(value)) => {
                        stage.future = None;
                        core.result.set_value(value);
                        true
                    }
                    Err(error) => {
                        trace!("Frame::poll_raw: error captured");
                        stage.future = None;
                        core.result.set_error(error);
                        true
                    }
                };
                // The task is about to suspend, either at an await point or
                // for good.
                stage.storage.before_suspend();
                completed
            });

            if completed {
                let continuation = {
                    let core = core_ptr.as_ref();
                    core.event.set();
                    core.rendezvous.complete()
                };
                if let Some(continuation) = continuation {
                    // Whoever lost the rendezvous race resumes the
                    // continuation; that is us.
                    continuation.wake();
                }
                if let OrDrop::Drop = core_ptr.as_ref().state.end_poll(true) {
                    Self::drop_frame_raw(core_ptr);
                }
                return Poll::Ready(());
            }

            match core_ptr.as_ref().state.end_poll(false) {
                OrDrop::Action(PollAction::Repoll) => continue,
                OrDrop::Action(PollAction::None) => return Poll::Pending,
                // The frame's own reference is still held.
                OrDrop::Drop => unreachable_unchecked!("task dropped while pending"),
            }
        }
    }

    unsafe fn drop_frame_raw(core: NonNull<Core<F::Output, P>>) {
        let this = Self::from_core(core).as_ptr();
        trace!(ptr = ?this, "Frame::drop_frame");
        // Move the allocator out of the prefix, tear down the rest of the
        // frame in place, and only then free the block through the
        // recovered allocator.
        let allocator = ptr::read(ptr::addr_of!((*this).allocator));
        ptr::drop_in_place(ptr::addr_of_mut!((*this).core));
        ptr::drop_in_place(ptr::addr_of_mut!((*this).stage));
        allocator.deallocate(
            NonNull::new_unchecked(this).cast::<u8>(),
            Layout::new::<Self>(),
        );
    }
}

// === impl Rendezvous ===

/// The rendezvous between a producer completing and a consumer attaching a
/// continuation.
///
/// The state word takes one producing transition to [`Self::VALUE`];
/// before that, consumers may register (and re-register) a continuation
/// waker. Whichever side stores second observes the other's prior write,
/// and only that side resumes the continuation, so the continuation is
/// resumed exactly once regardless of interleaving.
///
/// [`Self::REGISTERING`] pins the waker slot while a consumer writes to
/// it; the producer (or a competing consumer) spins it out with
/// exponential backoff rather than blocking.
pub(crate) struct Rendezvous {
    state: AtomicUsize,
    waker: UnsafeCell<Option<Waker>>,
}

impl Rendezvous {
    /// No continuation, no value.
    const EMPTY: usize = 0;
    /// The producer has completed.
    const VALUE: usize = 1;
    /// A continuation waker is registered.
    const WAITING: usize = 2;
    /// A consumer is writing to the waker slot.
    const REGISTERING: usize = 3;

    loom_const_fn! {
        pub(crate) fn new() -> Self {
            Self {
                state: AtomicUsize::new(Self::EMPTY),
                waker: UnsafeCell::new(None),
            }
        }
    }

    /// Returns `true` if the producer has completed.
    pub(crate) fn is_complete(&self) -> bool {
        self.state.load(Acquire) == Self::VALUE
    }

    /// Consumer side: record `waker` as the continuation.
    ///
    /// Returns `true` if the waker was stored before the producer finished
    /// (the caller must suspend), or `false` if the producer has already
    /// completed (the caller resumes inline).
    pub(crate) fn set_continuation(&self, waker: &Waker) -> bool {
        let mut backoff = Backoff::new();
        let mut state = self.state.load(Acquire);
        loop {
            match state {
                Self::VALUE => return false,
                Self::EMPTY | Self::WAITING => {
                    match self.state.compare_exchange(
                        state,
                        Self::REGISTERING,
                        AcqRel,
                        Acquire,
                    ) {
                        Ok(_) => {}
                        Err(actual) => {
                            state = actual;
                            continue;
                        }
                    }
                    self.waker.with_mut(|slot| unsafe {
                        match &mut *slot {
                            Some(old) if old.will_wake(waker) => {}
                            slot => *slot = Some(waker.clone()),
                        }
                    });
                    // The producer never writes over REGISTERING, so a
                    // plain store suffices to publish the slot.
                    self.state.store(Self::WAITING, Release);
                    return true;
                }
                Self::REGISTERING => {
                    // Another consumer is mid-registration; wait it out.
                    backoff.spin();
                    state = self.state.load(Acquire);
                }
                state => unsafe {
                    unreachable_unchecked!("invalid rendezvous state: {state}")
                },
            }
        }
    }

    /// Producer side: mark the value stored, returning the continuation
    /// waker if a consumer registered one first.
    pub(crate) fn complete(&self) -> Option<Waker> {
        let mut backoff = Backoff::new();
        let mut state = self.state.load(Acquire);
        loop {
            match state {
                // Already fired; nothing to resume.
                Self::VALUE => return None,
                Self::REGISTERING => {
                    // A consumer is mid-registration; it will publish
                    // WAITING momentarily.
                    backoff.spin();
                    state = self.state.load(Acquire);
                }
                Self::EMPTY | Self::WAITING => {
                    match self
                        .state
                        .compare_exchange(state, Self::VALUE, AcqRel, Acquire)
                    {
                        // The consumer stored first; we resume it.
                        Ok(Self::WAITING) => {
                            return self.waker.with_mut(|slot| unsafe { (*slot).take() })
                        }
                        // We stored first; the consumer will observe VALUE.
                        Ok(_) => return None,
                        Err(actual) => state = actual,
                    }
                }
                state => unsafe {
                    unreachable_unchecked!("invalid rendezvous state: {state}")
                },
            }
        }
    }
}

impl core::fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = match self.state.load(Relaxed) {
            Self::EMPTY => "Empty",
            Self::VALUE => "Value",
            Self::WAITING => "Waiting",
            Self::REGISTERING => "Registering",
            _ => "Invalid",
        };
        f.debug_struct("Rendezvous").field("state", &state).finish()
    }
}

#[cfg(all(test, loom))]
mod loom_tests {
    use super::*;
    use crate::loom::{self, sync::Arc, thread};
    use core::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering};
    use std::{sync::Arc as StdArc, task::Wake};

    struct CountingWaker(StdAtomicUsize);

    impl Wake for CountingWaker {
        fn wake(self: StdArc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn rendezvous_race_resumes_exactly_once() {
        loom::model(|| {
            let rendezvous = Arc::new(Rendezvous::new());
            let wakes = StdArc::new(CountingWaker(StdAtomicUsize::new(0)));
            let waker = std::task::Waker::from(wakes.clone());

            let producer = thread::spawn({
                let rendezvous = rendezvous.clone();
                move || rendezvous.complete().map(|w| w.wake()).is_some()
            });

            let suspended = rendezvous.set_continuation(&waker);
            let resumed_by_producer = producer.join().unwrap();

            if suspended {
                // the producer must have found our waker and woken it
                assert!(resumed_by_producer);
                assert_eq!(wakes.0.load(Ordering::SeqCst), 1);
            } else {
                // the producer stored first; nobody wakes
                assert!(!resumed_by_producer);
                assert_eq!(wakes.0.load(Ordering::SeqCst), 0);
            }
        });
    }
}
