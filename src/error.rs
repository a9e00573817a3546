//! Error types for bundle encoding, diffing and patch application

use thiserror::Error;

/// Result type for bundle and patch operations
pub type Result<T> = std::result::Result<T, PatchError>;

/// Errors raised by the codec, the generator and the patcher
#[derive(Error, Debug)]
pub enum PatchError {
    /// Underlying stream or filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed bundle contents
    #[error("Invalid bundle format: {0}")]
    Format(String),

    /// Target path breaks the path rules
    #[error("Invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    /// Current content does not match the checksum the record was built against
    #[error("Checksum mismatch for {path}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        path: String,
        expected: u32,
        actual: u32,
    },

    /// Record expected the path to exist (or not) and the base disagrees
    #[error(
        "Content mismatch for {path}: patch expects it to be {}",
        if *expected_present { "present" } else { "absent" }
    )]
    ContentMismatch { path: String, expected_present: bool },

    /// API misuse: closed reader/writer, second cursor, empty distribution set
    #[error("Usage error: {0}")]
    Usage(String),

    /// Delta payload could not be decoded or applied
    #[error("Delta error: {0}")]
    Delta(String),
}

impl PatchError {
    /// True for errors meaning "this patch does not apply to this base".
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            PatchError::ChecksumMismatch { .. } | PatchError::ContentMismatch { .. }
        )
    }

    pub(crate) fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        PatchError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
