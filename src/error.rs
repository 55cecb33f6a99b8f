//! Error taxonomy for index operations
//!
//! Every failure mode is a tagged variant; callers match on the kind rather
//! than parsing messages. Each variant carries the operation name and the
//! offending input (truncated where it could be large). Internal invariant
//! violations are not represented here — those are bugs and panic with a
//! diagnostic.

use thiserror::Error;
use uuid::Uuid;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ProximumError>;

/// All recoverable failure modes of the index.
#[derive(Error, Debug)]
pub enum ProximumError {
    /// Bad dimension, missing store id, unknown backend, invalid parameter.
    #[error("invalid config in {op}: {reason}")]
    ConfigInvalid { op: &'static str, reason: String },

    /// Vector length does not match the configured dimensionality.
    #[error("{op}: dimension mismatch, expected {expected}, got {actual}")]
    DimensionMismatch {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Insert past the configured capacity, or a neighbor list past its cap.
    #[error("{op}: capacity exceeded ({used} of {limit})")]
    CapacityExceeded {
        op: &'static str,
        used: usize,
        limit: usize,
    },

    /// External ID already mapped to a different internal ID.
    #[error("{op}: external id {id} already maps to internal id {existing}")]
    DuplicateExternalId {
        op: &'static str,
        id: String,
        existing: u32,
    },

    /// Lookup by unknown external ID / commit / branch.
    #[error("{op}: {what} not found: {key}")]
    NotFound {
        op: &'static str,
        what: &'static str,
        key: String,
    },

    /// Branch create collision.
    #[error("{op}: branch already exists: {branch}")]
    BranchExists { op: &'static str, branch: String },

    /// Delete of the current branch or of `main`.
    #[error("{op}: branch is protected: {branch}")]
    BranchProtected { op: &'static str, branch: String },

    /// Branch / fork-for-branch called without a prior sync, or a sync
    /// attempted on an in-memory fork (materialize it with `branch`).
    #[error("{op}: index state is not synced to a branch")]
    Unsynced { op: &'static str },

    /// Mutation attempted on a read-only (time-travel) index.
    #[error("{op}: index is read-only; fork or branch before writing")]
    ReadOnly { op: &'static str },

    /// A soft-evicted chunk could not be reloaded from storage.
    #[error("{op}: chunk unavailable at address {address}")]
    ChunkUnavailable { op: &'static str, address: Uuid },

    /// Verification recomputed a different hash. Reports which chunk or
    /// hash disagreed.
    #[error("{op}: crypto mismatch at {subject}: expected {expected}, got {actual}")]
    CryptoMismatch {
        op: &'static str,
        subject: String,
        expected: String,
        actual: String,
    },

    /// Online compaction delta cap exceeded. Recoverable: retry with a
    /// larger cap, or finish the copy sooner.
    #[error("{op}: delta log overflow, cap is {cap} ops")]
    DeltaOverflow { op: &'static str, cap: usize },

    /// Storage backend failure. Recoverable at caller discretion.
    #[error("{op}: storage failure: {source}")]
    IOFailure {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl ProximumError {
    /// Wrap an I/O error with the failing operation's name.
    pub(crate) fn io(op: &'static str, source: std::io::Error) -> Self {
        ProximumError::IOFailure { op, source }
    }

    /// Serialization failures surface as I/O: the payload on disk (or about
    /// to go to disk) is what's wrong.
    pub(crate) fn codec(op: &'static str, err: serde_json::Error) -> Self {
        ProximumError::IOFailure {
            op,
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        }
    }
}

/// Truncate a potentially large input for inclusion in an error message.
pub(crate) fn truncate_for_error(s: &str) -> String {
    const MAX: usize = 64;
    if s.len() <= MAX {
        s.to_string()
    } else {
        let cut = s
            .char_indices()
            .take_while(|(i, _)| *i < MAX)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(MAX);
        format!("{}… ({} bytes)", &s[..cut], s.len())
    }
}
