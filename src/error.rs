//! The closed error taxonomy (spec.md §6/§7).

use thiserror::Error;

/// The crate's result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of failures the store can report.
///
/// Mirrors the reference implementation's small closed error-code set so
/// that a future FFI layer can map each variant onto a stable negative
/// integer via [`ErrorCode`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A required context or output reference was absent.
    #[error("a required argument was null")]
    NullArgument,

    /// An argument failed validation: an unparseable IP, a decay factor
    /// outside `[0.0, 1.0]`, or a corrupt archive header.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Allocation of a bitmap, directory row, or block failed.
    #[error("out of memory")]
    OutOfMemory,

    /// A filesystem operation failed during save, load, or bulk load.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// The stable numeric error code for a given [`Error`], part of the
/// contract for any future FFI binding (`OK = 0`, failures negative).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    NullArgument = -1,
    InvalidArgument = -2,
    OutOfMemory = -3,
    IoFailure = -4,
}

impl From<&Error> for ErrorCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::NullArgument => ErrorCode::NullArgument,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::OutOfMemory => ErrorCode::OutOfMemory,
            Error::Io(_) => ErrorCode::IoFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_negative() {
        assert_eq!(ErrorCode::Ok as i32, 0);
        assert!((ErrorCode::NullArgument as i32) < 0);
        assert!((ErrorCode::InvalidArgument as i32) < 0);
        assert!((ErrorCode::OutOfMemory as i32) < 0);
        assert!((ErrorCode::IoFailure as i32) < 0);
    }

    #[test]
    fn maps_variant_to_code() {
        let e = Error::InvalidArgument("bad".into());
        assert_eq!(ErrorCode::from(&e), ErrorCode::InvalidArgument);
    }
}
