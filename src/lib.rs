#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]

//! # libdetour
//!
//! This library redirects calls to a native entry point so that they reach a
//! runtime-supplied replacement callable instead, while keeping the original
//! behavior reachable through an alternate entry and a generated proxy.
//!
//! The interesting targets are ones with no inspectable instruction body
//! (externally-implemented or intrinsic routines): the only way to redirect
//! them is to rewrite their native entry. [`method::NativeDetourPatcher`]
//! orchestrates that:
//!
//! - [`sig`] derives the exact signature a replacement must have
//! - [`store`] holds a relocation-stable reference to "the effective original"
//! - [`hook`] installs and retargets the entry rewrite
//! - [`wrapper`] bridges between callables and raw function pointers
//! - [`chain`] exposes the bottom of a redirection chain for diagnostics

pub mod alloc;
pub mod callable;
pub mod chain;
pub mod code;
pub mod hook;
pub mod method;
pub mod patcher;
pub mod sig;
pub mod store;
pub mod wrapper;
