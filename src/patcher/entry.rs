//! This module contains the patcher used for native entry points, which are
//! mapped read-execute and must be made writable for the duration of the write

use std::ptr;

use region::Protection;

use super::{PatchGuard, Patcher};

/// Patcher for native entry points.
///
/// Changes the protection of the affected pages, writes the patch, and
/// reverts the protection; the guard restores the original bytes the same
/// way when dropped.
///
/// # Safety
///
/// The protection change covers exactly the pages the patch touches. Writing
/// through an `EntryPatcher` to memory tracked by Rust (anything reachable
/// through a `&T` or `&mut T`) is undefined behavior; entries live in code
/// pages the compiler knows nothing about.
#[derive(Default)]
pub struct EntryPatcher;

impl EntryPatcher {
    /// Creates a new [`EntryPatcher`]
    pub fn new() -> Self {
        Self::default()
    }
}

unsafe impl Patcher for EntryPatcher {
    type Error = region::Error;
    type Guard<'a> = EntryPatchGuard;

    unsafe fn patch<'a>(
        &'a self,
        location: *mut u8,
        patch: &[u8],
    ) -> Result<Self::Guard<'a>, Self::Error> {
        let _guard = region::protect_with_handle(location, patch.len(), Protection::all())?;

        let mut original = vec![0u8; patch.len()];
        // Safety: caller must pass a `location` valid for the full patch
        ptr::copy(location, original.as_mut_ptr(), patch.len());
        ptr::copy(patch.as_ptr(), location, patch.len());

        Ok(EntryPatchGuard { original, location })
    }
}

/// Guard for a patched entry
///
/// See [`EntryPatcher`].
pub struct EntryPatchGuard {
    /// Original bytes from `location`
    original: Vec<u8>,
    /// Location of the patch
    location: *mut u8,
}

unsafe impl PatchGuard for EntryPatchGuard {}

// The guard only carries the patch location; restoring from any thread is as
// safe as patching was
unsafe impl Send for EntryPatchGuard {}
unsafe impl Sync for EntryPatchGuard {}

impl Drop for EntryPatchGuard {
    fn drop(&mut self) {
        // Safety: the location was valid and patchable when the guard was
        // created; protection errors at teardown are unrecoverable
        unsafe {
            let _guard = region::protect_with_handle(
                self.location,
                self.original.len(),
                Protection::all(),
            )
            .unwrap();
            ptr::copy(self.original.as_ptr(), self.location, self.original.len());
        }
    }
}
