use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

/// type alias for all operations in this crate that could fail with a [`KvdError`]
pub type Result<T> = std::result::Result<T, KvdError>;

/// Error variants used throughout the key-value store.
/// It wraps any lower level errors from third party crates
#[derive(Error)]
pub enum KvdError {
    /// variant for errors caused by std::io
    #[error("IO error")]
    Io {
        /// source of the IO Error
        #[from]
        source: io::Error,
    },

    /// a key exceeded the maximum allowed length
    #[error("invalid key length: {0}")]
    InvalidKeyLength(usize),

    /// a value exceeded the maximum allowed length
    #[error("invalid value length: {0}")]
    InvalidValueLength(usize),

    /// a frame's payload ended in the middle of a field
    #[error("frame is truncated")]
    Truncated,

    /// a frame's payload contained bytes past the last field
    #[error("{0} unconsumed bytes after the last field")]
    TrailingBytes(usize),

    /// an operation tag byte on the wire was not a known operation
    #[error("unknown operation tag: {0:#04x}")]
    InvalidOperation(u8),

    /// an error tag byte on the wire was not a known error code
    #[error("unknown error tag: {0:#04x}")]
    InvalidErrorCode(u8),

    /// a frame announced a length larger than any valid message
    #[error("frame length {0} exceeds the protocol maximum")]
    FrameTooLarge(u64),

    /// a key or value is an invalid UTF-8 sequence
    #[error("{0}")]
    Utf8(#[from] FromUtf8Error),

    /// variant for errors when parsing strings to some other type
    #[error("{0}")]
    Parsing(String),

    /// variant for unrecoverable faults in the mapped storage segment
    #[error("storage failure: {0}")]
    Storage(String),

    /// variant for errors while taking a lock
    #[error("{0}")]
    Locking(String),

    /// catch-all variant for error message strings from third party crates
    #[error("{0}")]
    StringErr(String),
}

/// a custom Debug implementation that will write the entire error chain
impl std::fmt::Debug for KvdError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

/// writes the entire error chain of the given error `e`, to the formatter.
fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by: {}", cause)?;
        current = cause.source();
    }
    Ok(())
}
