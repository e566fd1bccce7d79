//! Wire representations of TCP headers and options.
//!
//! The engine itself never deals in raw bytes. Everything it puts on the wire passes through
//! [`Repr`] and [`Options`], which are the only places that know the bit layout. Parsing is
//! provided for the option block of incoming acknowledgements and for tests that want to look at
//! what was emitted.
//!
//! [`Repr`]: struct.Repr.html
//! [`Options`]: struct.Options.html
mod error;
mod tcp;

pub use self::error::{Error, Result};

pub use self::tcp::{
    FastOpenCookie,
    Flags,
    Options,
    Repr,
    SeqNumber,
    TcpOption,
    Timestamps,
};

pub(crate) mod field {
    pub(crate) type Field = ::core::ops::Range<usize>;
}
