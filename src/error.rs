//! Error codes and Result alias for Strata
//!
//! Every fallible operation in the storage core returns `Result<T>`. The
//! `ErrorCode` is the stable, public part of an error; the message is
//! advisory text owned by the error until the caller drops it.

use std::fmt;

// ============================================================================
// Error Codes
// ============================================================================

/// Primary result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Success
    Ok = 0,
    /// Generic error
    Error = 1,
    /// Another connection holds an incompatible file lock
    Busy = 5,
    /// A table is locked by another cursor on the same connection
    Locked = 6,
    /// Allocation failure
    NoMem = 7,
    /// Attempt to write a read-only database
    ReadOnly = 8,
    /// Operation interrupted via the interrupt flag
    Interrupt = 9,
    /// Underlying file operation failed (see `IoKind`)
    IoErr = 10,
    /// Invariant violation detected while reading a page
    Corrupt = 11,
    /// Key not found (internal; not always surfaced)
    NotFound = 12,
    /// Underlying storage reports full
    Full = 13,
    /// The file could not be opened
    CantOpen = 14,
    /// Access permission denied
    Perm = 15,
    /// Schema changed since the statement was prepared
    Schema = 17,
    /// Constraint violation propagated from higher layers
    Constraint = 19,
    /// Datatype or encoding mismatch
    Mismatch = 20,
    /// API contract violated (e.g. operating on a closed handle)
    Misuse = 21,
}

/// Subkind for `ErrorCode::IoErr`, naming the file operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoKind {
    Read,
    Write,
    /// A read returned fewer bytes than requested where that is illegal
    ShortRead,
    Fsync,
    Truncate,
    Lock,
    Delete,
}

impl ErrorCode {
    /// Canonical message for a code when no specific text was attached.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Ok => "not an error",
            ErrorCode::Error => "generic error",
            ErrorCode::Busy => "database is locked",
            ErrorCode::Locked => "database table is locked",
            ErrorCode::NoMem => "out of memory",
            ErrorCode::ReadOnly => "attempt to write a readonly database",
            ErrorCode::Interrupt => "interrupted",
            ErrorCode::IoErr => "disk I/O error",
            ErrorCode::Corrupt => "database disk image is malformed",
            ErrorCode::NotFound => "not found",
            ErrorCode::Full => "database or disk is full",
            ErrorCode::CantOpen => "unable to open database file",
            ErrorCode::Perm => "access permission denied",
            ErrorCode::Schema => "database schema has changed",
            ErrorCode::Constraint => "constraint failed",
            ErrorCode::Mismatch => "datatype mismatch",
            ErrorCode::Misuse => "library routine called out of sequence",
        }
    }
}

// ============================================================================
// Error
// ============================================================================

/// Error value carrying a code, an optional I/O subkind, and a message.
#[derive(Debug, Clone)]
pub struct Error {
    code: ErrorCode,
    io_kind: Option<IoKind>,
    message: Option<String>,
}

impl Error {
    /// Create an error with the code's canonical message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            io_kind: None,
            message: None,
        }
    }

    /// Create an error with specific message text.
    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            io_kind: None,
            message: Some(message.into()),
        }
    }

    /// Create an I/O error naming the failed operation.
    pub fn io(kind: IoKind, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::IoErr,
            io_kind: Some(kind),
            message: Some(message.into()),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn io_kind(&self) -> Option<IoKind> {
        self.io_kind
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or(self.code.as_str())
    }

    /// True for errors that a retry through the busy handler may clear.
    pub fn is_busy(&self) -> bool {
        self.code == ErrorCode::Busy
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.io_kind {
            Some(kind) => write!(f, "{} ({:?})", self.message(), kind),
            None => f.write_str(self.message()),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorCode> for Error {
    fn from(code: ErrorCode) -> Self {
        Error::new(code)
    }
}

/// Result type alias for Strata operations
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Tests
// ============================================================================
