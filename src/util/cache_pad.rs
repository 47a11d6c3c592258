use core::ops::{Deref, DerefMut};

/// Aligns the wrapped value to the size of a cache line.
///
/// Used for the hot state words of the synchronization primitives, so that
/// contended CAS loops on one word do not false-share with neighboring
/// fields.
#[derive(Clone, Copy, Default, Hash, PartialEq, Eq)]
// 128-byte alignment matches the prefetch granularity of modern x86_64 and
// the cache line size of aarch64 big cores; other mainstream targets use 64.
#[cfg_attr(
    any(target_arch = "x86_64", target_arch = "aarch64"),
    repr(align(128))
)]
#[cfg_attr(
    not(any(target_arch = "x86_64", target_arch = "aarch64")),
    repr(align(64))
)]
pub struct CachePadded<T>(T);

// === impl CachePadded ===

impl<T> CachePadded<T> {
    /// Pads `value` to the size of a cache line.
    pub const fn new(value: T) -> Self {
        Self(value)
    }

    /// Unwraps the padded value, consuming the wrapper.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CachePadded<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}
