//! # Method
//!
//! This module covers method patchers: the per-target orchestrators that the
//! patch-resolution layer drives through a uniform interface

pub mod native;

use std::sync::Arc;

use crate::callable::Callable;

/// Uniform interface the orchestration layer drives for every patcher kind.
///
/// `prepare_original` is called once to obtain a stand-in for the original
/// that later redirections keep valid; `detour_to` is called for each
/// redirection layered onto the target.
pub trait MethodPatcher {
    /// Errors this patcher kind can surface
    type Error;

    /// Returns a callable standing in for the target's original behavior.
    ///
    /// Idempotent: repeated calls return the same callable.
    fn prepare_original(&mut self) -> Arc<Callable>;

    /// Redirects the target to `replacement`, returning it unchanged on
    /// success
    fn detour_to(&mut self, replacement: Arc<Callable>) -> Result<Arc<Callable>, Self::Error>;

    /// Returns a fresh copy of the original's body, for patcher kinds that
    /// can rewrite bodies; `None` where copy semantics do not apply
    fn copy_original(&mut self) -> Option<Arc<Callable>>;
}
