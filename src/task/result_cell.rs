use crate::loom::{
    cell::UnsafeCell,
    sync::atomic::{AtomicUsize, Ordering::*},
};
use core::{fmt, mem::ManuallyDrop, ptr};

/// Tagged one-of-three storage for a task's outcome.
///
/// The cell starts empty, takes exactly one producing transition (to a
/// value or to an error), and is consumed at most once. The payload slot is
/// a union, so it is sized and aligned to the larger of the two variants.
///
/// The producer's store of the tag uses `Release` ordering and consumers
/// read it with `Acquire`, so the payload write *happens-before* any
/// observation of the tag.
pub(crate) struct ResultCell<T, E> {
    tag: AtomicUsize,
    slot: UnsafeCell<Slot<T, E>>,
}

#[repr(C)]
union Slot<T, E> {
    empty: (),
    value: ManuallyDrop<T>,
    error: ManuallyDrop<E>,
}

const EMPTY: usize = 0;
const VALUE: usize = 1;
const ERROR: usize = 2;

// === impl ResultCell ===

impl<T, E> ResultCell<T, E> {
    loom_const_fn! {
        pub(super) fn new() -> Self {
            Self {
                tag: AtomicUsize::new(EMPTY),
                slot: UnsafeCell::new(Slot { empty: () }),
            }
        }
    }

    /// Store the task's value.
    ///
    /// # Safety
    ///
    /// Only the producer may call this, at most once, and not concurrently
    /// with [`take`](Self::take).
    pub(crate) unsafe fn set_value(&self, value: T) {
        debug_assert_eq!(self.tag.load(Relaxed), EMPTY, "result stored twice");
        self.slot.with_mut(|slot| unsafe {
            ptr::write(ptr::addr_of_mut!((*slot).value), ManuallyDrop::new(value));
        });
        self.tag.store(VALUE, Release);
    }

    /// Store the task's error.
    ///
    /// # Safety
    ///
    /// Only the producer may call this, at most once, and not concurrently
    /// with [`take`](Self::take).
    pub(crate) unsafe fn set_error(&self, error: E) {
        debug_assert_eq!(self.tag.load(Relaxed), EMPTY, "result stored twice");
        self.slot.with_mut(|slot| unsafe {
            ptr::write(ptr::addr_of_mut!((*slot).error), ManuallyDrop::new(error));
        });
        self.tag.store(ERROR, Release);
    }

    /// Move the stored outcome out of the cell.
    ///
    /// # Safety
    ///
    /// The producing transition must have been observed (via the completion
    /// event or the continuation rendezvous), and only one consumer may
    /// call this.
    ///
    /// # Panics
    ///
    /// If the outcome was already consumed.
    pub(crate) unsafe fn take(&self) -> Result<T, E> {
        match self.tag.load(Acquire) {
            VALUE => {
                self.tag.store(EMPTY, Relaxed);
                Ok(self
                    .slot
                    .with_mut(|slot| unsafe { ManuallyDrop::take(&mut (*slot).value) }))
            }
            ERROR => {
                self.tag.store(EMPTY, Relaxed);
                Err(self
                    .slot
                    .with_mut(|slot| unsafe { ManuallyDrop::take(&mut (*slot).error) }))
            }
            _ => panic!("task output already consumed"),
        }
    }
}

impl<T, E> Drop for ResultCell<T, E> {
    fn drop(&mut self) {
        match self.tag.load(Acquire) {
            VALUE => self.slot.with_mut(|slot| unsafe {
                ManuallyDrop::drop(&mut (*slot).value);
            }),
            ERROR => self.slot.with_mut(|slot| unsafe {
                ManuallyDrop::drop(&mut (*slot).error);
            }),
            _ => {}
        }
    }
}

impl<T, E> fmt::Debug for ResultCell<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.tag.load(Relaxed) {
            EMPTY => "Empty",
            VALUE => "Value",
            ERROR => "Error",
            _ => "Invalid",
        };
        f.debug_struct("ResultCell").field("tag", &tag).finish()
    }
}

unsafe impl<T: Send, E: Send> Send for ResultCell<T, E> {}
unsafe impl<T: Send, E: Send> Sync for ResultCell<T, E> {}
