use core::fmt;

/// The error type for parsing and emitting wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A buffer was shorter than assumed.
    ///
    /// When parsing, the data may be shorter than the minimum length specified or some length
    /// field pointed beyond the end of the data. When emitting, the provided buffer was too small
    /// to hold the representation.
    Truncated,

    /// The data was recognized but was self-contradictory.
    ///
    /// Examples: a header length field smaller than the fixed header; a window scale option with
    /// a length other than 3.
    Malformed,

    /// A value can not be represented on the wire.
    ///
    /// For example a fast open cookie of odd length or a set of options that does not fit into
    /// the 40 bytes of option space.
    Unsupported,
}

/// The result type for the wire module.
pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Truncated   => write!(f, "truncated data"),
            Error::Malformed   => write!(f, "malformed data"),
            Error::Unsupported => write!(f, "unrepresentable value"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
