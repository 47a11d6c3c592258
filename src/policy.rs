//! The policy surface: the compile-time record of collaborators a task
//! runtime is built from.
//!
//! A [`Policy`] names one type per capability slot: allocator, error
//! handler, completion event, background scheduler, and optional per-task
//! user storage. The policy type itself is never instantiated; it is a
//! marker threaded through [`Task`](crate::Task) as a type parameter, the
//! same way a storage marker selects a task's heap mechanism in other
//! runtimes.
//!
//! [`DefaultPolicy`] assembles the std-based collaborators defined in this
//! module. Custom policies replace any subset of the slots:
//!
//! ```
//! use cortado::{
//!     policy::{CatchUnwind, Heap, Policy, SyncEvent},
//!     scheduler::ThreadPool,
//! };
//!
//! enum MyPolicy {}
//!
//! impl Policy for MyPolicy {
//!     type Allocator = Heap;
//!     type Errors = CatchUnwind;
//!     type Event = SyncEvent;
//!     type Scheduler = ThreadPool;
//!     type Storage = ();
//!
//!     fn background() -> &'static ThreadPool {
//!         ThreadPool::global()
//!     }
//! }
//! ```

use crate::scheduler::Schedule;
use core::{
    alloc::Layout,
    any::Any,
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering::*},
    time::Duration,
};
use std::sync::{Condvar, Mutex};

/// A compile-time record of the collaborators a task is built from.
///
/// Implementations are markers: the runtime only ever names
/// `P::Allocator`, `P::Errors`, and so on, and never constructs a `P`.
/// An uninhabited `enum` is the conventional implementor shape.
pub trait Policy: 'static {
    /// Allocates and frees task frames.
    type Allocator: FrameAllocator + Default;

    /// Captures and re-raises errors escaping a task body.
    type Errors: ErrorHandler;

    /// The one-shot completion signal embedded in every task.
    type Event: CompletionEvent + Default;

    /// The scheduler tasks transfer to with
    /// [`resume_background`](crate::resume_background).
    type Scheduler: Schedule + 'static;

    /// Per-task user storage; `()` when unused.
    type Storage: UserStorage;

    /// Returns the default background scheduler.
    ///
    /// The returned reference must be stable for the lifetime of the
    /// program.
    fn background() -> &'static Self::Scheduler;
}

/// The error transport type of a policy's [`ErrorHandler`].
pub type Failure<P> = <<P as Policy>::Errors as ErrorHandler>::Error;

/// An allocator for task frames.
///
/// The allocator instance used to allocate a frame is stored in a prefix of
/// the frame itself, and is the one asked to deallocate it, even when the
/// frame's lifetime crosses threads.
pub trait FrameAllocator: Clone + Send + Sync + 'static {
    /// Allocates a block of memory for `layout`.
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// Deallocates the block at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by a call to [`allocate`] on a clone of
    /// this allocator with the same `layout`, and must not have been
    /// deallocated already.
    ///
    /// [`allocate`]: Self::allocate
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Captures errors escaping a task body and re-raises them at the join
/// site.
pub trait ErrorHandler: 'static {
    /// The transport in which a captured error is stored.
    type Error: Send + 'static;

    /// Runs `f`, capturing any error it raises.
    fn catch<T>(f: impl FnOnce() -> T) -> Result<T, Self::Error>;

    /// Re-raises a previously captured error.
    fn rethrow(error: Self::Error) -> !;
}

/// A one-shot completion signal.
///
/// Setting the event must *happen-before* any observation of `is_set()`
/// returning `true` and any return from `wait`/`wait_for`.
pub trait CompletionEvent: Send + Sync + 'static {
    /// Signals the event. Subsequent waits return immediately.
    fn set(&self);

    /// Returns `true` if the event has been set.
    fn is_set(&self) -> bool;

    /// Blocks the calling thread until the event is set.
    fn wait(&self);

    /// Blocks the calling thread until the event is set or `timeout`
    /// elapses. Returns `true` if the event was set.
    fn wait_for(&self, timeout: Duration) -> bool;
}

/// Optional per-task storage with hooks bracketing every suspension.
///
/// `before_suspend` runs on the thread a task is about to suspend on
/// (including its final suspension); `before_resume` runs on the thread
/// resuming it. The intended use is saving and restoring thread-bound
/// context, such as thread-locals, across thread hops.
pub trait UserStorage: Default + Send + 'static {
    /// Called before the owning task suspends.
    fn before_suspend(&mut self) {}

    /// Called before the owning task resumes.
    fn before_resume(&mut self) {}
}

impl UserStorage for () {}

/// An error returned when a task frame could not be allocated.
#[derive(Clone, Eq, PartialEq)]
pub struct AllocError {
    pub(crate) layout: Layout,
}

// === impl AllocError ===

impl AllocError {
    /// Returns the layout of the failed allocation.
    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }
}

impl fmt::Debug for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocError")
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to allocate a task frame of {} bytes",
            self.layout.size()
        )
    }
}

impl std::error::Error for AllocError {}

/// The global-allocator [`FrameAllocator`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Heap;

// === impl Heap ===

impl FrameAllocator for Heap {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(layout.size() > 0);
        NonNull::new(unsafe { alloc::alloc::alloc(layout) }).ok_or(AllocError { layout })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        alloc::alloc::dealloc(ptr.as_ptr(), layout)
    }
}

/// The [`ErrorHandler`] that captures unwinding panics.
///
/// A panic escaping a task body is caught with
/// [`std::panic::catch_unwind`] and stored as its payload; joining the
/// failed task resumes the unwind via [`std::panic::resume_unwind`]. A
/// rethrow inside an awaiting task unwinds into *that* task's capture,
/// so failures propagate along await chains until some caller observes
/// them.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct CatchUnwind;

// === impl CatchUnwind ===

impl ErrorHandler for CatchUnwind {
    type Error = Box<dyn Any + Send>;

    fn catch<T>(f: impl FnOnce() -> T) -> Result<T, Self::Error> {
        std::panic::catch_unwind(core::panic::AssertUnwindSafe(f))
    }

    fn rethrow(error: Self::Error) -> ! {
        std::panic::resume_unwind(error)
    }
}

/// The default [`CompletionEvent`]: an atomic fast path over a
/// mutex-and-condvar slow path.
pub struct SyncEvent {
    set: AtomicBool,
    lock: Mutex<bool>,
    cv: Condvar,
}

// === impl SyncEvent ===

impl SyncEvent {
    /// Returns a new, unset `SyncEvent`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            lock: Mutex::new(false),
            cv: Condvar::new(),
        }
    }
}

impl Default for SyncEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionEvent for SyncEvent {
    fn set(&self) {
        let mut set = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        *set = true;
        // The release store is ordered inside the critical section so that
        // a fast-path `is_set` cannot observe it before the flag a waiter
        // sleeps on.
        self.set.store(true, Release);
        drop(set);
        self.cv.notify_all();
    }

    fn is_set(&self) -> bool {
        self.set.load(Acquire)
    }

    fn wait(&self) {
        if self.is_set() {
            return;
        }
        let mut set = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*set {
            set = self.cv.wait(set).unwrap_or_else(|e| e.into_inner());
        }
    }

    fn wait_for(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        let deadline = std::time::Instant::now() + timeout;
        let mut set = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*set {
            let now = std::time::Instant::now();
            let Some(remaining) = deadline.checked_duration_since(now).filter(|d| !d.is_zero())
            else {
                return false;
            };
            let (guard, _timed_out) = self
                .cv
                .wait_timeout(set, remaining)
                .unwrap_or_else(|e| e.into_inner());
            set = guard;
        }
        true
    }
}

impl fmt::Debug for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEvent")
            .field("set", &self.is_set())
            .finish()
    }
}

/// The std-based policy: global allocator, panic capture, condvar-backed
/// completion event, and the shared background [`ThreadPool`].
///
/// [`ThreadPool`]: crate::scheduler::ThreadPool
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DefaultPolicy;

// === impl DefaultPolicy ===

impl Policy for DefaultPolicy {
    type Allocator = Heap;
    type Errors = CatchUnwind;
    type Event = SyncEvent;
    type Scheduler = crate::scheduler::ThreadPool;
    type Storage = ();

    fn background() -> &'static crate::scheduler::ThreadPool {
        crate::scheduler::ThreadPool::global()
    }
}
