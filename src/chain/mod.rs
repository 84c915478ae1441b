//! # Chain
//!
//! Diagnostic access to the bottom of a target's redirection chain.
//!
//! The orchestration layer that stacks redirections keeps per-target chain
//! state. Rather than reaching into that state through privileged field
//! access, it implements the narrow [`OriginalProvider`] interface and this
//! module only reads through it.

use std::sync::Arc;

use thiserror::Error;

use crate::callable::Callable;

/// Errors when looking up chain state
#[derive(Debug, Error)]
pub enum ChainError {
    /// The record carries no chain state; the target was never patched
    /// through the chain-tracking layer
    #[error("target has no redirection chain state")]
    NotFound,
}

/// Chain-tracking state for one target, owned by the orchestration layer
pub struct ChainState {
    /// The bottom-most, never-redirected original
    end_of_chain: Arc<Callable>,
}

impl ChainState {
    /// Creates chain state rooted at the unmodified original
    pub fn new(end_of_chain: Arc<Callable>) -> Self {
        Self { end_of_chain }
    }
}

/// Opaque per-target record maintained by the orchestration layer
#[derive(Default)]
pub struct DetourRecord {
    /// Chain state, absent until the target is first patched
    state: Option<ChainState>,
}

impl DetourRecord {
    /// Creates an empty record for a target that has not been patched yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches chain state to the record
    pub fn set_state(&mut self, state: ChainState) {
        self.state = Some(state);
    }
}

/// Read-only projection the orchestration layer exposes for diagnostics
pub trait OriginalProvider {
    /// The bottom-most, never-redirected original for this record's target
    fn original_of(&self) -> Result<Arc<Callable>, ChainError>;
}

impl OriginalProvider for DetourRecord {
    fn original_of(&self) -> Result<Arc<Callable>, ChainError> {
        self.state
            .as_ref()
            .map(|state| state.end_of_chain.clone())
            .ok_or(ChainError::NotFound)
    }
}

/// Returns the callable at the bottom of `record`'s redirection chain
pub fn end_of_chain(record: &DetourRecord) -> Result<Arc<Callable>, ChainError> {
    record.original_of()
}
