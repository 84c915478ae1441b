//! # Hook
//!
//! This module covers hooks, which rewrite a target's native entry so that
//! calls transfer to a replacement, while an alternate entry keeps the
//! pre-redirection body reachable

pub mod jmp;

/// Trait for hooks
///
/// # Safety
///
/// Implementors must rewrite the entry so that every call lands in exactly
/// the installed replacement, and the alternate entry must execute the
/// target's pre-redirection body.
pub unsafe trait Hook {
    /// Errors that could happen while installing or retargeting
    type Error;
    /// Handle representing an installed redirection
    type Handle: HookHandle<Error = Self::Error>;

    /// Rewrites `target`'s native entry to transfer control to `replacement`.
    ///
    /// At most one redirection per target is installed through this crate;
    /// redirecting the same target again goes through
    /// [`HookHandle::retarget`] on the returned handle instead.
    ///
    /// # Safety
    ///
    /// - `target` must be the entry of a callable unit large enough to host
    ///   the rewrite
    /// - `replacement` must be valid executable code matching the target's
    ///   calling convention
    /// - no thread may be executing the target's first bytes during the
    ///   rewrite; once installed, concurrent calls are fine
    unsafe fn install(
        &self,
        target: *const u8,
        replacement: *const u8,
    ) -> Result<Self::Handle, Self::Error>;
}

/// Handle for an installed redirection
///
/// # Safety
///
/// Dropping the handle must fully restore the target's original entry.
pub unsafe trait HookHandle: Sized {
    /// Errors that could happen while retargeting
    type Error;

    /// Address that still executes the target's pre-redirection body.
    ///
    /// Stable across [`HookHandle::retarget`]: the alternate entry never
    /// changes once the redirection is installed.
    fn alt_entry(&self) -> *const u8;

    /// Changes only the destination of the redirection.
    ///
    /// Safe to call while other threads are calling through the target; every
    /// in-flight call observes either the old or the new replacement.
    ///
    /// # Safety
    ///
    /// `replacement` must be valid executable code matching the target's
    /// calling convention.
    unsafe fn retarget(&self, replacement: *const u8) -> Result<(), Self::Error>;
}
