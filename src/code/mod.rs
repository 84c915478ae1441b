//! # Code
//!
//! This module covers architecture-specific instruction generation and
//! relocation

pub mod x64;
