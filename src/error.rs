//! Error taxonomy for the sorted-chunk-list container.
//!
//! A hand-rolled enum rather than a `thiserror` derive: four variants,
//! each carrying just enough context for a caller to react without
//! downcasting.

use std::fmt;

/// Errors surfaced by [`crate::SortedList`] and [`crate::SortedListByKey`].
///
/// All variants are local: no operation retries or escalates on error, and
/// a failed operation leaves the container exactly as it was before the
/// call (see each method's documentation for the specific guarantee).
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// `append`, `insert`, `extend`, or a range assignment would place a
    /// value out of sort order.
    OrderViolation { index: usize, message: String },
    /// An integer index fell outside `[-n, n)` for access, or `pop` was
    /// called on an empty container.
    OutOfRange { index: isize, len: usize },
    /// `remove`/`index_of` found no matching value in the searched range.
    NotFound { message: String },
    /// A slice step of zero, a `load` below the minimum, or mismatched
    /// lengths in an extended-stride assignment.
    InvalidArgument { message: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::OrderViolation { index, message } => {
                write!(f, "order violation at index {}: {}", index, message)
            }
            Error::OutOfRange { index, len } => {
                write!(f, "index {} out of range for length {}", index, len)
            }
            Error::NotFound { message } => write!(f, "not found: {}", message),
            Error::InvalidArgument { message } => write!(f, "invalid argument: {}", message),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub(crate) fn order_violation(index: usize, message: String) -> Error {
        Error::OrderViolation { index, message }
    }

    pub(crate) fn out_of_range(index: isize, len: usize) -> Error {
        Error::OutOfRange { index, len }
    }
}

/// Crate-local result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Build a `NotFound`/`InvalidArgument` error with a formatted message,
/// stamping the call-site's file and line into it.
macro_rules! err_at {
    (NotFound, $($arg:tt)*) => {
        $crate::error::Error::NotFound {
            message: format!("{}:{}: {}", file!(), line!(), format_args!($($arg)*)),
        }
    };
    (InvalidArgument, $($arg:tt)*) => {
        $crate::error::Error::InvalidArgument {
            message: format!("{}:{}: {}", file!(), line!(), format_args!($($arg)*)),
        }
    };
}

pub(crate) use err_at;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let e = Error::OutOfRange { index: -5, len: 3 };
        assert_eq!(e.to_string(), "index -5 out of range for length 3");

        let e = err_at!(NotFound, "value {} absent", 42);
        assert!(e.to_string().contains("value 42 absent"));
    }
}
