//! The [`Task`] handle and its await adaptors.
//!
//! A `Task` is the owning, move-only, caller-side handle to an
//! asynchronous computation. The computation itself lives in a refcounted
//! frame (the promise) that survives until both the computation has
//! completed and every handle and waker referencing it is gone.
//!
//! A spawned future runs inline on the spawning thread until its first
//! suspension, and is thereafter resumed on whichever thread completes
//! whatever it is waiting on.

use crate::policy::{DefaultPolicy, Policy};

use core::{
    fmt,
    future::Future,
    marker::PhantomData,
    pin::Pin,
    ptr::NonNull,
    task::{Context, Poll},
    time::Duration,
};

mod promise;
mod result_cell;
mod state;

#[cfg(test)]
mod tests;

pub(crate) use self::promise::{Core, Rendezvous};

use self::promise::Frame;
use crate::policy::AllocError;

/// An owning handle to an in-flight asynchronous computation.
///
/// A `Task<T, P>` either completes with a `T` or fails with the error
/// transport of its policy's error handler. The handle is move-only:
/// cloning it would duplicate its reference to the result, which may be
/// consumed only once.
///
/// # Joining
///
/// A task can be joined three ways:
///
/// - **Blocking**: [`get`](Self::get) parks the calling thread on the
///   policy's completion event, then returns the value (or re-raises the
///   stored error). [`wait`](Self::wait) and [`wait_for`](Self::wait_for)
///   block without consuming the result.
/// - **By value**: a `Task` is a [`Future`]; awaiting it yields the value
///   (or re-raises the stored error) and consumes the handle.
/// - **By reference**: [`wait_async`](Self::wait_async) yields a future
///   that completes when the task does, without consuming the handle or
///   observing its result.
///
/// A task holds a single continuation slot: at most one awaiter may wait
/// on it at a time.
///
/// # Lifecycle
///
/// Dropping a `Task` does **not** cancel the computation; it merely
/// releases the handle's reference. The frame is destroyed once the
/// computation has reached its final suspension *and* the last reference
/// (handle or waker) is gone.
pub struct Task<T: 'static, P: Policy = DefaultPolicy> {
    core: NonNull<Core<T, P>>,
    _marker: PhantomData<T>,
}

// === impl Task ===

impl<T, P> Task<T, P>
where
    T: Send + 'static,
    P: Policy,
{
    /// Spawns `future`, using a default-constructed frame allocator.
    ///
    /// The future is polled once, inline, before this function returns; it
    /// runs on the calling thread until its first suspension.
    ///
    /// # Panics
    ///
    /// If the task frame cannot be allocated.
    ///
    /// # Examples
    ///
    /// ```
    /// use cortado::Task;
    ///
    /// let task: Task<u32> = Task::spawn(async { 6 * 7 });
    /// assert_eq!(task.get(), 42);
    /// ```
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self::spawn_in(P::Allocator::default(), future)
    }

    /// Spawns `future` with a frame allocated by `allocator`.
    ///
    /// # Panics
    ///
    /// If the task frame cannot be allocated.
    pub fn spawn_in<F>(allocator: P::Allocator, future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        match Self::try_spawn_in(allocator, future) {
            Ok(task) => task,
            Err(error) => alloc::alloc::handle_alloc_error(error.layout()),
        }
    }

    /// Spawns `future` with a frame allocated by `allocator`, surfacing
    /// allocation failure to the caller.
    ///
    /// Allocation failure is reported here, at the spawn site; it is never
    /// stored inside a task.
    pub fn try_spawn_in<F>(allocator: P::Allocator, future: F) -> Result<Self, AllocError>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let core = Frame::allocate(allocator, future)?;
        let task = Self {
            core,
            _marker: PhantomData,
        };
        trace!("Task::spawn");
        // Run inline until the first suspension. The handle's reference
        // keeps the frame alive across the poll.
        let _ = unsafe { Core::poll(core) };
        Ok(task)
    }
}

impl<T: 'static, P: Policy> Task<T, P> {
    fn core(&self) -> &Core<T, P> {
        unsafe { self.core.as_ref() }
    }

    /// Returns `true` if the task has completed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.core().is_ready()
    }

    /// Blocks the calling thread until the task completes.
    pub fn wait(&self) {
        self.core().wait()
    }

    /// Blocks the calling thread until the task completes or `timeout`
    /// elapses. Returns `true` if the task completed.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.core().wait_for(timeout)
    }

    /// Blocks until the task completes, then returns its value.
    ///
    /// If the task failed, its stored error is re-raised here, exactly
    /// once, via the policy's error handler.
    pub fn get(self) -> T {
        self.wait();
        unsafe { self.core().take_output() }
    }

    /// Returns a future that completes when the task does, without
    /// consuming the handle or observing its result.
    ///
    /// A stored error stays stored; it is re-raised only by
    /// [`get`](Self::get) or a by-value await.
    pub fn wait_async(&self) -> WaitReady<'_, T, P> {
        WaitReady {
            core: self.core,
            _marker: PhantomData,
        }
    }
}

impl<T: 'static, P: Policy> Future for Task<T, P> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let core = self.core();
        if core.is_ready() || !core.set_continuation(cx.waker()) {
            return Poll::Ready(unsafe { core.take_output() });
        }
        Poll::Pending
    }
}

impl<T: 'static, P: Policy> Unpin for Task<T, P> {}

impl<T: 'static, P: Policy> Drop for Task<T, P> {
    fn drop(&mut self) {
        unsafe { Core::drop_ref(self.core) }
    }
}

impl<T: 'static, P: Policy> fmt::Debug for Task<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.core().debug(f)
    }
}

unsafe impl<T: Send, P: Policy> Send for Task<T, P> {}
unsafe impl<T: Send, P: Policy> Sync for Task<T, P> {}

/// A [`Future`] that completes when the borrowed [`Task`] does.
///
/// Returned by [`Task::wait_async`]. Resolves to `()` and does not observe
/// the task's result.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct WaitReady<'a, T: 'static, P: Policy> {
    core: NonNull<Core<T, P>>,
    _marker: PhantomData<&'a Task<T, P>>,
}

// === impl WaitReady ===

impl<T: 'static, P: Policy> Future for WaitReady<'_, T, P> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let core = unsafe { self.core.as_ref() };
        if core.is_ready() || !core.set_continuation(cx.waker()) {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

impl<T: 'static, P: Policy> Unpin for WaitReady<'_, T, P> {}

impl<T: 'static, P: Policy> fmt::Debug for WaitReady<'_, T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        unsafe { self.core.as_ref() }.debug(f)
    }
}

unsafe impl<T: Send, P: Policy> Send for WaitReady<'_, T, P> {}
unsafe impl<T: Send, P: Policy> Sync for WaitReady<'_, T, P> {}
