//! Public error surface.
//!
//! Every public entry point returns one of these kinds (or, for
//! constructors, simply doesn't produce a [`Player`](crate::player::Player)).
//! Runtime anomalies that the driver can recover from on its own — voice
//! exhaustion, a malformed score event — are never surfaced here; see
//! `SPEC_FULL.md` §12.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A null/empty/out-of-range argument was passed to a public entry point.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// An allocation failed. `musdoom` itself never allocates in a way that
    /// can fail short of the process being out of memory, but the kind is
    /// part of the contract so that embedders who wrap it in a fallible
    /// allocator have somewhere to put that failure.
    #[error("out of memory")]
    OutOfMemory,

    /// A binary blob (GENMIDI or MUS) failed to parse: bad magic, or shorter
    /// than its own header claims.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// An operation that requires a loaded score was attempted before one
    /// was loaded.
    #[error("not initialized")]
    NotInitialized,

    /// Reserved for future use; no current entry point can return it.
    #[error("already initialized")]
    AlreadyInitialized,
}
