use crate::loom::sync::atomic::{
    self, AtomicUsize,
    Ordering::{self, *},
};
use core::fmt;

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's current state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct State<usize> {
        /// If set, this task is currently being polled.
        pub(crate) const POLLING: bool;

        /// If set, this task's [`Waker`] has been woken.
        ///
        /// [`Waker`]: core::task::Waker
        pub(crate) const WOKEN: bool;

        /// If set, this task's future has completed (i.e., it has returned
        /// [`Poll::Ready`], or its error was captured).
        ///
        /// [`Poll::Ready`]: core::task::Poll::Ready
        pub(crate) const COMPLETED: bool;

        /// The number of currently live references to this task.
        ///
        /// When this is 0, the task may be deallocated.
        const REFS = ..;
    }
}

/// An atomic cell that stores a task's current [`State`].
///
/// The cell also stores the task's reference count in the same word: one
/// reference is owned by the frame itself (released when the task
/// completes), one by the [`Task`] handle, and one by each live clone of
/// the task's waker.
///
/// [`Task`]: crate::Task
#[repr(transparent)]
pub(super) struct StateCell(AtomicUsize);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum WakeAction {
    /// The waking thread should poll the task inline.
    Poll,

    /// The task does not need to be polled.
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum PollAction {
    /// The task was woken while it was being polled, and should be polled
    /// again immediately.
    Repoll,

    /// Nothing to do.
    None,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum OrDrop<T> {
    /// Another action should be performed.
    Action(T),

    /// The task should be deallocated.
    Drop,
}

const REF_ONE: usize = State::REFS.first_bit();
const REF_MAX: usize = State::REFS.raw_mask();

// === impl State ===

impl State {
    #[inline]
    pub(crate) fn ref_count(self) -> usize {
        self.get(Self::REFS)
    }

    fn drop_ref(self) -> Self {
        Self(self.0 - REF_ONE)
    }
}

// === impl StateCell ===

impl StateCell {
    loom_const_fn! {
        /// Returns a new `StateCell` with two references: the frame's own,
        /// and the handle's.
        pub(super) fn new() -> Self {
            Self(AtomicUsize::new(REF_ONE * 2))
        }
    }

    /// Attempt to transition the task into the polling state.
    pub(super) fn start_poll(&self) -> Result<State, State> {
        self.transition(|state| {
            // Cannot start polling a task which is being polled on another
            // thread, or which has already completed.
            if test_dbg!(state.get(State::POLLING)) || test_dbg!(state.get(State::COMPLETED)) {
                return Err(*state);
            }

            let new_state = state
                // The task is now being polled.
                .with(State::POLLING, true)
                // If the task was woken, consume the wakeup.
                .with(State::WOKEN, false);
            *state = new_state;
            Ok(new_state)
        })
    }

    /// Leave the polling state.
    ///
    /// When `completed` is true, this also releases the frame's own
    /// reference; the caller must deallocate the frame if `OrDrop::Drop` is
    /// returned.
    pub(super) fn end_poll(&self, completed: bool) -> OrDrop<PollAction> {
        self.transition(|state| {
            debug_assert!(state.get(State::POLLING));
            debug_assert!(!state.get(State::COMPLETED));

            // Was the task woken during the poll? Leave the WOKEN bit set;
            // the next `start_poll` consumes it.
            if !completed && test_dbg!(state.get(State::WOKEN)) {
                *state = state.with(State::POLLING, false);
                return OrDrop::Action(PollAction::Repoll);
            }

            let mut next_state = state
                .with(State::POLLING, false)
                .with(State::WOKEN, false)
                .with(State::COMPLETED, completed);
            if completed {
                // Release the frame's own reference.
                next_state = next_state.drop_ref();
            }
            *state = next_state;

            if next_state.ref_count() == 0 {
                OrDrop::Drop
            } else {
                OrDrop::Action(PollAction::None)
            }
        })
    }

    /// Transition to the woken state by value, consuming the waker's
    /// reference.
    ///
    /// If `OrDrop::Action(WakeAction::Poll)` is returned, the waker's
    /// reference is retained for the duration of the poll and the caller
    /// must release it afterwards.
    pub(super) fn wake_by_val(&self) -> OrDrop<WakeAction> {
        self.transition(|state| {
            // If the task is being polled, it will observe the WOKEN bit
            // when the poll ends and re-poll itself, so don't poll it now.
            if test_dbg!(state.get(State::POLLING)) {
                *state = state.with(State::WOKEN, true).drop_ref();
                debug_assert!(state.ref_count() > 0);
                return OrDrop::Action(WakeAction::None);
            }

            // If the task is already completed or woken, just release the
            // reference that was used for this wakeup.
            if test_dbg!(state.get(State::COMPLETED)) || test_dbg!(state.get(State::WOKEN)) {
                let new_state = state.drop_ref();
                *state = new_state;
                return if new_state.ref_count() == 0 {
                    OrDrop::Drop
                } else {
                    OrDrop::Action(WakeAction::None)
                };
            }

            // Otherwise, transition to the woken state and poll the task on
            // this thread. The waker's reference keeps the frame alive for
            // the duration of the poll.
            *state = state.with(State::WOKEN, true);
            OrDrop::Action(WakeAction::Poll)
        })
    }

    /// Transition to the woken state by reference.
    ///
    /// The caller's borrow of the waker keeps the frame alive for the
    /// duration of any inline poll.
    pub(super) fn wake_by_ref(&self) -> WakeAction {
        self.transition(|state| {
            if test_dbg!(state.get(State::COMPLETED)) || test_dbg!(state.get(State::WOKEN)) {
                return WakeAction::None;
            }

            if test_dbg!(state.get(State::POLLING)) {
                state.set(State::WOKEN, true);
                return WakeAction::None;
            }

            *state = state.with(State::WOKEN, true);
            WakeAction::Poll
        })
    }

    #[inline]
    pub(super) fn clone_ref(&self) {
        // Using a relaxed ordering is alright here, as knowledge of the
        // original reference prevents other threads from erroneously
        // deleting the object; new references can only be formed from an
        // existing one.
        let old_refs = self.0.fetch_add(REF_ONE, Relaxed);

        // Guard against reference count overflow from `mem::forget`-ed
        // handles or wakers.
        if old_refs > REF_MAX - REF_ONE {
            panic!("task reference count overflow");
        }
    }

    /// Release one reference. Returns `true` if the caller must deallocate
    /// the frame.
    #[inline]
    pub(super) fn drop_ref(&self) -> bool {
        test_debug!("StateCell::drop_ref");
        // We do not need to synchronize with other threads unless we are
        // going to delete the task.
        let old_refs = self.0.fetch_sub(REF_ONE, Release);
        let old_refs = old_refs >> State::REFS.least_significant_index();

        // Did we drop the last ref?
        if test_dbg!(old_refs) > 1 {
            return false;
        }

        atomic::fence(Acquire);
        true
    }

    pub(super) fn load(&self, order: Ordering) -> State {
        State(self.0.load(order))
    }

    /// Advance this task's state by running the provided `transition`
    /// function on the current [`State`].
    #[cfg_attr(test, track_caller)]
    fn transition<T>(&self, mut transition: impl FnMut(&mut State) -> T) -> T {
        let mut current = self.load(Acquire);
        loop {
            let mut next = current;
            // Run the transition function.
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            match self
                .0
                .compare_exchange_weak(current.0, next.0, AcqRel, Acquire)
            {
                Ok(_) => return res,
                Err(actual) => current = State(actual),
            }
        }
    }
}

impl fmt::Debug for StateCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Relaxed).fmt(f)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn packing_specs_valid() {
        State::assert_valid()
    }

    #[test]
    fn wake_before_poll_requests_inline_poll() {
        let cell = StateCell::new();
        assert_eq!(cell.wake_by_ref(), WakeAction::Poll);
        // a second wake while the first is still pending is a no-op
        assert_eq!(cell.wake_by_ref(), WakeAction::None);
    }

    #[test]
    fn wake_during_poll_defers() {
        let cell = StateCell::new();
        cell.start_poll().unwrap();
        assert_eq!(cell.wake_by_ref(), WakeAction::None);
        assert_eq!(
            cell.end_poll(false),
            OrDrop::Action(PollAction::Repoll),
            "the deferred wake must be observed when the poll ends",
        );
    }

    #[test]
    fn completion_releases_frame_ref() {
        let cell = StateCell::new();
        cell.start_poll().unwrap();
        assert_eq!(cell.end_poll(true), OrDrop::Action(PollAction::None));
        // dropping the handle's reference is now the last one
        assert!(cell.drop_ref());
    }
}
