//! Core error types for hmlang-core.
//!
//! Uses `thiserror` for structured, matchable error variants. Analysis
//! errors (unification mismatches, missing fields, nil loads) are NOT here:
//! they are monotone lattice state carried inside the inference graph, not
//! Rust errors.

use thiserror::Error;

/// Errors produced by the core lattice layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An alias index was not allocated by the alias table.
    #[error("alias not found: {alias}")]
    AliasNotFound { alias: u32 },

    /// A reserved memory slot was written.
    #[error("memory slot {alias} is reserved")]
    ReservedSlot { alias: u32 },
}
