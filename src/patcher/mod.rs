//! # Patcher
//!
//! This module covers patchers, which overwrite bytes at a target's entry and
//! restore them on teardown

pub mod entry;

/// All patchers save the bytes they overwrote and revert them on-command
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that `patch`
/// writes exactly the supplied bytes and that the guard restores them.
pub unsafe trait Patcher {
    /// Error type that can occur when patching. If patching always succeeds, use `()`.
    type Error;
    /// Guard type for the patcher. When this guard is dropped, the location should be restored.
    type Guard<'a>: PatchGuard + 'a
    where
        Self: 'a;

    /// Patches a given location.
    ///
    /// # Safety
    ///
    /// `location` must be valid for reads and writes of `patch.len()` bytes,
    /// and no thread may be executing or reading those bytes while they are
    /// being rewritten.
    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error>;
}

/// Guard for a patch
///
/// # Safety
///
/// Guard must fully unpatch the location when dropped, even if `restore` is not called
pub unsafe trait PatchGuard: Sized {
    /// Restores the original value of a patch
    fn restore(self) {
        // most implementations have their functionality in their [`Drop::drop`] implementation
    }
}

/// Converts a const pointer to a mutable pointer for use with [`Patcher::patch`].
///
/// # Safety
///
/// **THIS FUNCTION DOES NOT CHANGE MEMORY PERMISSIONS.**
///
/// It is **NOT** safe to treat the returned value as mutable on its own; it
/// should only be passed to a patcher that makes the location writable for
/// the duration of the write.
pub unsafe fn to_mut<T>(ptr: *const T) -> *mut T {
    ptr as _
}
