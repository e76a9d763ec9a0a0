use std::{error::Error, fmt};

use backtrace::Backtrace;

/// Classification of engine errors.
///
/// Data-plane kinds (`NotFound`, `DuplicateKey`, `SchemaMismatch`,
/// `ReadOnly`, `Conflict`) are returned to callers for recovery.
/// `Corruption`, `Io` and `Capacity` demote the engine to a read-only
/// in-memory state before they surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    DuplicateKey,
    SchemaMismatch,
    Corruption,
    Io,
    ReadOnly,
    Capacity,
    Conflict,
    Internal,
}

impl ErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::DuplicateKey => "duplicate key",
            ErrorKind::SchemaMismatch => "schema mismatch",
            ErrorKind::Corruption => "corruption",
            ErrorKind::Io => "io error",
            ErrorKind::ReadOnly => "read-only violation",
            ErrorKind::Capacity => "capacity exceeded",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Internal => "internal error",
        }
    }
}

pub struct SmallError {
    kind: ErrorKind,
    details: String,
    backtrace: Backtrace,
}

impl SmallError {
    pub fn new(kind: ErrorKind, msg: &str) -> SmallError {
        SmallError {
            kind,
            details: msg.to_string(),
            backtrace: Backtrace::new_unresolved(),
        }
    }

    pub fn io(msg: &str) -> SmallError {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn corruption(msg: &str) -> SmallError {
        Self::new(ErrorKind::Corruption, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether the engine must transition to read-only in-memory state
    /// when it sees this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Corruption | ErrorKind::Io | ErrorKind::Capacity
        )
    }

    pub fn show_backtrace(&self) {
        let mut resolved = self.backtrace.clone();
        resolved.resolve();
        log::error!("{}\nbacktrace:\n{:?}", self, resolved);
    }
}

impl fmt::Display for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.details)
    }
}

impl fmt::Debug for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl Error for SmallError {}

impl From<std::io::Error> for SmallError {
    fn from(e: std::io::Error) -> Self {
        SmallError::new(ErrorKind::Io, &e.to_string())
    }
}
