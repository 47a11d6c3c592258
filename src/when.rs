//! The [`when_all`] and [`when_any`] task combinators.

use crate::{
    policy::Policy,
    task::{Rendezvous, Task},
};
use alloc::{sync::Arc, vec::Vec};
use core::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// Returns a task that completes once every task in `tasks` has completed.
///
/// The children are awaited in order, by value. If a child failed, its
/// error is re-raised inside the aggregator when that child is awaited,
/// so the aggregator fails with the *first observed* error, and the errors
/// of children after it are lost. Children keep running regardless; only
/// the awaiting short-circuits.
///
/// # Examples
///
/// ```
/// use cortado::{when_all, DefaultPolicy, Task};
///
/// let tasks = (0..4).map(|n| Task::<_, DefaultPolicy>::spawn(async move { n }));
/// when_all(tasks).get();
/// ```
pub fn when_all<T, P>(tasks: impl IntoIterator<Item = Task<T, P>>) -> Task<(), P>
where
    T: Send + 'static,
    P: Policy,
{
    when_all_in(P::Allocator::default(), tasks)
}

/// Like [`when_all`], with the aggregator's frame allocated by `allocator`.
pub fn when_all_in<T, P>(
    allocator: P::Allocator,
    tasks: impl IntoIterator<Item = Task<T, P>>,
) -> Task<(), P>
where
    T: Send + 'static,
    P: Policy,
{
    let tasks: Vec<Task<T, P>> = tasks.into_iter().collect();
    Task::spawn_in(allocator, async move {
        for task in tasks {
            let _ = task.await;
        }
    })
}

/// Returns a task that completes as soon as *one* task in `tasks` does.
///
/// Each child is handed to a small watcher task that awaits it by
/// reference and fires a shared sync-point when it finishes; the first to
/// fire wins the rendezvous and resumes the aggregator. Losing children
/// continue running to completion, detached; their results and errors are
/// not observed.
///
/// # Panics
///
/// If `tasks` is empty (the aggregator would never complete).
///
/// # Examples
///
/// ```
/// use cortado::{resume_background, when_any, DefaultPolicy, Task};
///
/// let tasks = (0..3).map(|n| {
///     Task::<_, DefaultPolicy>::spawn(async move {
///         resume_background::<DefaultPolicy>().await;
///         n
///     })
/// });
/// when_any(tasks).get();
/// ```
pub fn when_any<T, P>(tasks: impl IntoIterator<Item = Task<T, P>>) -> Task<(), P>
where
    T: Send + 'static,
    P: Policy,
{
    when_any_in(P::Allocator::default(), tasks)
}

/// Like [`when_any`], with the aggregator and watcher frames allocated by
/// `allocator`.
pub fn when_any_in<T, P>(
    allocator: P::Allocator,
    tasks: impl IntoIterator<Item = Task<T, P>>,
) -> Task<(), P>
where
    T: Send + 'static,
    P: Policy,
{
    let tasks: Vec<Task<T, P>> = tasks.into_iter().collect();
    assert!(!tasks.is_empty(), "when_any of no tasks would never complete");

    let sync_point = Arc::new(SyncPoint {
        rendezvous: Rendezvous::new(),
    });

    for task in tasks {
        let sync_point = sync_point.clone();
        // The watcher handle is dropped immediately: watchers run
        // detached, keeping their child alive until it completes.
        drop(Task::<(), P>::spawn_in(allocator.clone(), async move {
            task.wait_async().await;
            sync_point.fire();
        }));
    }

    Task::spawn_in(allocator, WaitFired { sync_point })
}

/// The rendezvous selecting the first completing child.
///
/// One producing transition (the winning watcher's `fire`) races one
/// consumer (the aggregator registering itself); losing watchers observe
/// the fired state and do nothing.
struct SyncPoint {
    rendezvous: Rendezvous,
}

// === impl SyncPoint ===

impl SyncPoint {
    fn fire(&self) {
        if let Some(aggregator) = self.rendezvous.complete() {
            // The aggregator registered before any child finished; the
            // winner resumes it.
            aggregator.wake();
        }
    }
}

/// Safety: the waker slot inside the rendezvous is guarded by its state
/// machine; see [`Rendezvous`].
unsafe impl Send for SyncPoint {}
unsafe impl Sync for SyncPoint {}

/// The aggregator's future: completes once the sync-point has fired.
struct WaitFired {
    sync_point: Arc<SyncPoint>,
}

// === impl WaitFired ===

impl Future for WaitFired {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let rendezvous = &self.sync_point.rendezvous;
        if rendezvous.is_complete() || !rendezvous.set_continuation(cx.waker()) {
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

impl fmt::Debug for WaitFired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitFired")
            .field("fired", &self.sync_point.rendezvous.is_complete())
            .finish()
    }
}
