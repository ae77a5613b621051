//! Crate-wide error taxonomy.
//!
//! One enum per error *kind* named in the format/schema/resource/policy/API
//! groups, each carrying the context needed to act on it. Mirrors the shape
//! of `Lz4FError` (`frame/types.rs` in the LZ4 port this crate grew from):
//! a flat enum, a manual `Display` impl, and a `std::error::Error` impl with
//! `source()` wired up where a variant wraps an underlying error.

use core::fmt;

/// Errors surfaced by the codec, file reader/writer, operators and server.
#[derive(Debug)]
pub enum Error {
    // ---- Format errors: fatal to the byte stream being read -------------
    /// The file's magic bytes did not match either supported byte order.
    BadMagic,
    /// The tail record was shorter than the fixed tail layout requires.
    TruncatedTail,
    /// The running XOR of per-extent chained checksums did not match the
    /// value recorded in the tail.
    ChainBroken,
    /// A stored checksum did not match the checksum recomputed over the
    /// bytes it covers. Carries which checksum failed.
    BadChecksum(ChecksumKind),
    /// The packed extent declares a compress-mode byte this build does not
    /// implement a decoder for.
    UnknownCompressMode(u8),
    /// An extent's type name is not present in the file's type library.
    TypeNotInLibrary(String),

    // ---- Schema errors: detected at operator setup, before any extent ---
    /// A named field does not exist on the extent type it was resolved against.
    FieldNotFound { type_name: String, field: String },
    /// Two fields that must share a representation do not.
    TypeMismatch { expected: String, found: String },
    /// A packing transform was requested that this crate does not implement.
    UnsupportedTransform(String),

    // ---- Resource errors --------------------------------------------------
    /// Wraps an underlying I/O failure.
    Io(std::io::Error),

    // ---- Policy errors ------------------------------------------------------
    /// Hash-join's small side exceeded the configured row budget.
    TooManyLeftRows { limit: usize, actual: usize },
    /// Sorted-update saw a `replace` for a primary key not present in the base.
    DuplicatePrimaryKey(String),

    // ---- API / server errors ----------------------------------------------
    /// A table name failed the server's naming rules.
    InvalidTableName { name: String, reason: &'static str },
    /// A table lookup missed.
    UnknownTable(String),
    /// `rotate` was invoked outside of the writer callback that owns the
    /// current writer turn.
    NotCalledFromCallback,
    /// Catch-all for malformed server requests.
    RequestError(String),
}

/// Which of the four stored checksums failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Header,
    Fixed,
    Variable,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadMagic => write!(f, "bad magic number at start of file"),
            Error::TruncatedTail => write!(f, "file tail is shorter than the fixed tail layout"),
            Error::ChainBroken => {
                write!(f, "chained checksum mismatch: tail does not match running XOR")
            }
            Error::BadChecksum(kind) => write!(f, "{kind:?} checksum mismatch"),
            Error::UnknownCompressMode(mode) => write!(f, "unknown compress mode byte {mode}"),
            Error::TypeNotInLibrary(name) => {
                write!(f, "extent type '{name}' is not present in the type library")
            }
            Error::FieldNotFound { type_name, field } => {
                write!(f, "field '{field}' not found on type '{type_name}'")
            }
            Error::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {expected}, found {found}")
            }
            Error::UnsupportedTransform(name) => write!(f, "unsupported packing transform '{name}'"),
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::TooManyLeftRows { limit, actual } => write!(
                f,
                "hash-join left side has {actual} rows, exceeding the limit of {limit}"
            ),
            Error::DuplicatePrimaryKey(key) => {
                write!(f, "duplicate primary key '{key}' in sorted-update replace")
            }
            Error::InvalidTableName { name, reason } => {
                write!(f, "invalid table name '{name}': {reason}")
            }
            Error::UnknownTable(name) => write!(f, "unknown table '{name}'"),
            Error::NotCalledFromCallback => {
                write!(f, "rotate() called outside of the writer callback")
            }
            Error::RequestError(msg) => write!(f, "request error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
