//! The process logic of protocol layers.
//!
//! ## Layering
//!
//! The packet logic is contained in `wire` and the processing part in this module. An endpoint
//! represents the local state of a protocol. This state is open to modifications as part of a user
//! program while processing does not take place, similar to reconfiguration on the OS level with
//! utilities such as `sysctl`.
//!
//! ## Errors
//!
//! All layers share one error type. Its variants fall into four classes which callers are expected
//! to treat differently:
//!
//! * Resource errors (`OutOfMemory`) are never fatal. Retry once memory has been freed.
//! * Transient errors (`Congested`, `Busy`, `WindowClosed`) are absorbed by the engine when it
//!   sends on its own behalf. The affected segment is tried again on a later occasion.
//! * Fatal errors (`Unreachable`, `TimedOut`) mean the connection is heading towards teardown.
//! * Programming errors (`InvalidOffset`, `NotCollapsible`, `UnknownSegment`, `Illegal`,
//!   `InvariantViolation`) indicate a bug in the caller or in the engine.
use core::fmt;

use crate::nic::TransmitError;

pub mod tcp;

/// The result type for all layers.
pub type Result<T> = core::result::Result<T, Error>;

/// The error type for all layers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Error {
    /// The action could not be completed because there were not enough resources.
    ///
    /// The shared memory budget or the queue depth was exceeded. It would have been legal with
    /// more resources.
    OutOfMemory,

    /// The transport's local queue is full.
    Congested,

    /// A previous copy of the segment is still queued in the transport.
    Busy,

    /// The segment lies outside the window the peer currently offers.
    WindowClosed,

    /// Unable to find a route towards the destination address.
    Unreachable,

    /// The peer did not respond within the retry limits, the connection is dead.
    TimedOut,

    /// A split offset outside of the payload.
    InvalidOffset,

    /// Segments that can not be merged.
    ///
    /// Either one spans multiple TSO segments, is shared with the transport, has already been
    /// selectively acknowledged or retransmitted, or the two are not adjacent.
    NotCollapsible,

    /// A handle that does not refer to a queued segment.
    UnknownSegment,

    /// The operation was not permitted.
    ///
    /// Returned when the state of the connection does not allow an operation, for example queueing
    /// data after a FIN, or queueing an empty segment.
    Illegal,

    /// An internal invariant would have been broken.
    ///
    /// Debug builds panic instead of returning this.
    InvariantViolation,

    /// The connection has been closed or torn down.
    Closed,
}

impl Error {
    /// Whether the connection can not continue after this error.
    pub fn is_fatal(self) -> bool {
        match self {
            Error::Unreachable | Error::TimedOut => true,
            _ => false,
        }
    }

    /// Whether the same operation may succeed on a later attempt without other changes.
    pub fn is_transient(self) -> bool {
        match self {
            Error::Congested | Error::Busy | Error::WindowClosed | Error::OutOfMemory => true,
            _ => false,
        }
    }
}

impl From<TransmitError> for Error {
    fn from(err: TransmitError) -> Self {
        match err {
            TransmitError::Congested => Error::Congested,
            TransmitError::Unreachable => Error::Unreachable,
            TransmitError::Busy => Error::Busy,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::OutOfMemory        => write!(f, "memory budget exhausted"),
            Error::Congested          => write!(f, "transport congested"),
            Error::Busy               => write!(f, "segment still queued in transport"),
            Error::WindowClosed       => write!(f, "outside of the send window"),
            Error::Unreachable        => write!(f, "destination unreachable"),
            Error::TimedOut           => write!(f, "connection timed out"),
            Error::InvalidOffset      => write!(f, "invalid split offset"),
            Error::NotCollapsible     => write!(f, "segments can not be collapsed"),
            Error::UnknownSegment     => write!(f, "no such segment"),
            Error::Illegal            => write!(f, "operation not permitted"),
            Error::InvariantViolation => write!(f, "internal invariant violated"),
            Error::Closed             => write!(f, "connection closed"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}
