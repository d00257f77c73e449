//! Error types and the crate-wide `Result` alias.
//!
//! Every fallible boundary in this crate — device I/O, page decode, cache,
//! freelist, WAL, B+-tree, transaction, cursor — returns `Result<T>`. The
//! variants mirror the exit codes enumerated for the on-disk format; callers
//! match on `ErrorCode` rather than downcasting.

use std::fmt;
use thiserror::Error;

/// Status codes a caller can match on. Named after the condition, not the
/// internal component that raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvParameter,
    KeyNotFound,
    DuplicateKey,
    KeysizeTooSmall,
    InvKeysize,
    OutOfMemory,
    IoError,
    IntegrityViolated,
    CursorIsNil,
    CursorStillOpen,
    TxnConflict,
    TxnStillOpen,
    LimitsReached,
    AccessDenied,
    NotInitialized,
    AlreadyInitialized,
    DbReadOnly,
    KeyErasedInTxn,
    /// The on-disk image failed a structural sanity check (bad magic, bad
    /// crc, out-of-range offset). Distinct from `IntegrityViolated`, which
    /// is raised by the explicit tree-wide consistency check.
    Corrupt,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::InvParameter => "invalid parameter",
            ErrorCode::KeyNotFound => "key not found",
            ErrorCode::DuplicateKey => "duplicate key",
            ErrorCode::KeysizeTooSmall => "keysize too small",
            ErrorCode::InvKeysize => "invalid keysize",
            ErrorCode::OutOfMemory => "out of memory",
            ErrorCode::IoError => "i/o error",
            ErrorCode::IntegrityViolated => "integrity violated",
            ErrorCode::CursorIsNil => "cursor is nil",
            ErrorCode::CursorStillOpen => "cursor still open",
            ErrorCode::TxnConflict => "transaction conflict",
            ErrorCode::TxnStillOpen => "transaction still open",
            ErrorCode::LimitsReached => "limits reached",
            ErrorCode::AccessDenied => "access denied",
            ErrorCode::NotInitialized => "not initialized",
            ErrorCode::AlreadyInitialized => "already initialized",
            ErrorCode::DbReadOnly => "database is read-only",
            ErrorCode::KeyErasedInTxn => "key erased in transaction",
            ErrorCode::Corrupt => "corrupt database image",
        };
        f.write_str(s)
    }
}

/// The crate's error type: a status code plus optional human context.
#[derive(Error, Debug)]
#[error("{code}{}", .context.as_ref().map(|c| format!(": {c}")).unwrap_or_default())]
pub struct Error {
    pub code: ErrorCode,
    pub context: Option<String>,
}

impl Error {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            context: None,
        }
    }

    pub fn with_context(code: ErrorCode, context: impl Into<String>) -> Self {
        Self {
            code,
            context: Some(context.into()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::with_context(ErrorCode::IoError, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
