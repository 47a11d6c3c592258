#![cfg(all(test, not(loom)))]

use crate::{
    policy::{
        AllocError, CatchUnwind, FrameAllocator, Heap, Policy, SyncEvent, UserStorage,
    },
    resume_background,
    scheduler::ThreadPool,
    AsyncEvent, DefaultPolicy, Task,
};
use core::{
    alloc::Layout,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};
use std::{sync::Arc, thread};
use tokio_test::{assert_pending, assert_ready, task};

#[test]
fn immediate_value() {
    let _trace = crate::util::test::trace_init();
    let task: Task<u32> = Task::spawn(async { 42 });
    assert!(task.is_ready());
    assert_eq!(task.get(), 42);
}

#[test]
fn immediate_error() {
    let _trace = crate::util::test::trace_init();
    let task: Task<u32> = Task::spawn(async { panic!("kaboom") });
    assert!(task.is_ready());

    let error = std::panic::catch_unwind(core::panic::AssertUnwindSafe(|| task.get()))
        .expect_err("get must re-raise the stored error");
    assert_eq!(*error.downcast_ref::<&str>().unwrap(), "kaboom");
}

#[test]
fn await_chains_continuations() {
    let _trace = crate::util::test::trace_init();
    let event = Arc::new(AsyncEvent::new());

    let first: Task<u32> = Task::spawn({
        let event = event.clone();
        async move {
            event.wait_async().await;
            5
        }
    });
    let second: Task<u32> = Task::spawn(async move { first.await * 2 });

    assert!(!second.is_ready());
    event.set();
    // setting the event resumed `first` inline, which resumed `second`
    assert!(second.is_ready());
    assert_eq!(second.get(), 10);
}

#[test]
fn awaiting_a_completed_task_resumes_inline() {
    let _trace = crate::util::test::trace_init();
    let first: Task<u32> = Task::spawn(async { 7 });
    let second: Task<u32> = Task::spawn(async move { first.await + 1 });
    assert!(second.is_ready());
    assert_eq!(second.get(), 8);
}

#[test]
fn errors_propagate_along_await_chains() {
    let _trace = crate::util::test::trace_init();
    let event = Arc::new(AsyncEvent::new());

    let child: Task<u32> = Task::spawn({
        let event = event.clone();
        async move {
            event.wait_async().await;
            panic!("deep failure");
        }
    });
    let parent: Task<u32> = Task::spawn(async move { child.await });

    event.set();
    assert!(parent.is_ready());
    let error = std::panic::catch_unwind(core::panic::AssertUnwindSafe(|| parent.get()))
        .expect_err("the child's error must propagate through the await");
    assert_eq!(*error.downcast_ref::<&str>().unwrap(), "deep failure");
}

#[test]
fn wait_for_times_out() {
    let _trace = crate::util::test::trace_init();
    let event = Arc::new(AsyncEvent::new());
    let task: Task<()> = Task::spawn({
        let event = event.clone();
        async move { event.wait_async().await }
    });

    assert!(!task.wait_for(Duration::from_millis(10)));
    event.set();
    assert!(task.wait_for(Duration::from_secs(5)));
    task.get();
}

#[test]
fn wait_async_does_not_consume_the_result() {
    let _trace = crate::util::test::trace_init();
    let event = Arc::new(AsyncEvent::new());
    let gated: Task<u32> = Task::spawn({
        let event = event.clone();
        async move {
            event.wait_async().await;
            panic!("stored, not yet raised");
        }
    });

    let mut join = task::spawn(gated.wait_async());
    assert_pending!(join.poll());

    event.set();
    assert!(join.is_woken());
    // the by-reference join completes without observing the error
    assert_ready!(join.poll());
    drop(join);

    // the error is still stored, and is raised exactly once, here
    let error = std::panic::catch_unwind(core::panic::AssertUnwindSafe(|| gated.get()))
        .expect_err("the stored error must survive a by-reference join");
    assert_eq!(
        *error.downcast_ref::<&str>().unwrap(),
        "stored, not yet raised"
    );
}

#[test]
fn background_transfer_changes_threads() {
    let _trace = crate::util::test::trace_init();
    let main = thread::current().id();

    let tasks = (0..16)
        .map(|_| {
            Task::<_, DefaultPolicy>::spawn(async move {
                let before = thread::current().id();
                resume_background::<DefaultPolicy>().await;
                (before, thread::current().id())
            })
        })
        .collect::<Vec<_>>();

    let ids = tasks.into_iter().map(Task::get).collect::<Vec<_>>();

    // everything before the transfer ran inline on the spawning thread
    assert!(ids.iter().all(|(before, _)| *before == main));
    // a wake can land while the spawning thread is still leaving the poll,
    // collapsing that one transfer onto it, but not every time
    assert!(ids.iter().any(|(_, after)| *after != main));
}

#[test]
fn dropping_a_handle_does_not_cancel() {
    let _trace = crate::util::test::trace_init();
    let event = Arc::new(AsyncEvent::new());
    let ran = Arc::new(AtomicUsize::new(0));

    let task: Task<()> = Task::spawn({
        let event = event.clone();
        let ran = ran.clone();
        async move {
            event.wait_async().await;
            ran.fetch_add(1, Ordering::SeqCst);
        }
    });
    drop(task);

    assert_eq!(ran.load(Ordering::SeqCst), 0);
    event.set();
    assert_eq!(ran.load(Ordering::SeqCst), 1, "detached tasks still run");
}

#[test]
fn result_is_dropped_exactly_once() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Droppy;
    impl Drop for Droppy {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    let _trace = crate::util::test::trace_init();

    // unconsumed: the frame teardown drops the stored value
    let task: Task<Droppy> = Task::spawn(async { Droppy });
    task.wait();
    drop(task);
    assert_eq!(DROPS.load(Ordering::SeqCst), 1);

    // consumed: the caller drops the returned value
    let task: Task<Droppy> = Task::spawn(async { Droppy });
    drop(task.get());
    assert_eq!(DROPS.load(Ordering::SeqCst), 2);
}

// === allocator policy plumbing ===

static ALLOCS: AtomicUsize = AtomicUsize::new(0);
static DEALLOCS: AtomicUsize = AtomicUsize::new(0);

#[derive(Copy, Clone, Debug, Default)]
struct CountingAlloc;

impl FrameAllocator for CountingAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        ALLOCS.fetch_add(1, Ordering::SeqCst);
        Heap.allocate(layout)
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        DEALLOCS.fetch_add(1, Ordering::SeqCst);
        Heap.deallocate(ptr, layout)
    }
}

enum CountingPolicy {}

impl Policy for CountingPolicy {
    type Allocator = CountingAlloc;
    type Errors = CatchUnwind;
    type Event = SyncEvent;
    type Scheduler = ThreadPool;
    type Storage = ();

    fn background() -> &'static ThreadPool {
        ThreadPool::global()
    }
}

/// The last reference to a frame may be a waker dropped on a pool thread
/// moments after the join returns; give it a beat.
fn assert_frames_reclaimed() {
    for _ in 0..1000 {
        if ALLOCS.load(Ordering::SeqCst) == DEALLOCS.load(Ordering::SeqCst) {
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
    panic!(
        "allocated {} frames but deallocated {}",
        ALLOCS.load(Ordering::SeqCst),
        DEALLOCS.load(Ordering::SeqCst),
    );
}

#[test]
fn allocator_allocates_and_deallocates_the_frame() {
    let _trace = crate::util::test::trace_init();

    // a frame whose lifetime crosses threads still comes back to the
    // allocator that created it
    let task = Task::<u32, CountingPolicy>::spawn(async {
        resume_background::<CountingPolicy>().await;
        3
    });
    assert_eq!(task.get(), 3);
    assert_frames_reclaimed();

    // a detached frame is reclaimed when its task completes
    let event = Arc::new(AsyncEvent::new());
    let task = Task::<(), CountingPolicy>::spawn({
        let event = event.clone();
        async move { event.wait_async().await }
    });
    drop(task);
    event.set();
    assert_frames_reclaimed();
    assert!(ALLOCS.load(Ordering::SeqCst) >= 2);
}

#[derive(Copy, Clone, Debug, Default)]
struct FailingAlloc;

impl FrameAllocator for FailingAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        Err(AllocError { layout })
    }

    unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {
        unreachable!("nothing was ever allocated")
    }
}

enum FailingPolicy {}

impl Policy for FailingPolicy {
    type Allocator = FailingAlloc;
    type Errors = CatchUnwind;
    type Event = SyncEvent;
    type Scheduler = ThreadPool;
    type Storage = ();

    fn background() -> &'static ThreadPool {
        ThreadPool::global()
    }
}

#[test]
fn allocation_failure_surfaces_at_the_spawn_site() {
    let _trace = crate::util::test::trace_init();
    let result = Task::<u32, FailingPolicy>::try_spawn_in(FailingAlloc, async { 1 });
    let error = result.expect_err("allocation failure must be reported to the spawner");
    assert!(error.layout().size() > 0);
}

// === user storage plumbing ===

static SUSPENDS: AtomicUsize = AtomicUsize::new(0);
static RESUMES: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Default)]
struct HookCounter;

impl UserStorage for HookCounter {
    fn before_suspend(&mut self) {
        SUSPENDS.fetch_add(1, Ordering::SeqCst);
    }

    fn before_resume(&mut self) {
        RESUMES.fetch_add(1, Ordering::SeqCst);
    }
}

enum HookPolicy {}

impl Policy for HookPolicy {
    type Allocator = Heap;
    type Errors = CatchUnwind;
    type Event = SyncEvent;
    type Scheduler = ThreadPool;
    type Storage = HookCounter;

    fn background() -> &'static ThreadPool {
        ThreadPool::global()
    }
}

#[test]
fn storage_hooks_bracket_suspensions() {
    let _trace = crate::util::test::trace_init();
    let event = Arc::new(AsyncEvent::new());

    let task = Task::<(), HookPolicy>::spawn({
        let event = event.clone();
        async move { event.wait_async().await }
    });

    // the first entry suspends once and never "resumes"
    assert_eq!(SUSPENDS.load(Ordering::SeqCst), 1);
    assert_eq!(RESUMES.load(Ordering::SeqCst), 0);

    event.set();
    task.get();

    // the wakeup resumed the task once, and its completion counts as the
    // final suspension
    assert_eq!(SUSPENDS.load(Ordering::SeqCst), 2);
    assert_eq!(RESUMES.load(Ordering::SeqCst), 1);
}

#[test]
fn handles_are_send_and_sync() {
    crate::util::test::assert_send_sync::<Task<u32>>();
    crate::util::test::assert_send_sync::<AsyncEvent>();
    crate::util::test::assert_send_sync::<crate::AsyncMutex>();
}
