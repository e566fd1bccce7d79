#[cfg(feature = "log")]
#[macro_use]
mod log {
    macro_rules! net_log {
        (trace, $($arg:expr),*) => { ::log::trace!($($arg),*); };
        (debug, $($arg:expr),*) => { ::log::debug!($($arg),*); };
    }
}

#[cfg(not(feature = "log"))]
#[macro_use]
mod log {
    macro_rules! net_log {
        ($level:ident, $($arg:expr),*) => { $( let _ = $arg; )* }
    }
}

macro_rules! net_trace {
    ($($arg:expr),*) => (net_log!(trace, $($arg),*));
}

macro_rules! net_debug {
    ($($arg:expr),*) => (net_log!(debug, $($arg),*));
}

/// Refuse an operation that would break an internal invariant.
///
/// Panics in debug builds. Release builds log the violation and make the surrounding function
/// return `Err(Error::InvariantViolation)` so that no invalid segment is ever emitted.
macro_rules! invariant {
    ($cond:expr, $what:expr) => {
        if !$cond {
            debug_assert!($cond, "invariant violated: {}", $what);
            net_debug!("invariant violated: {}", $what);
            return Err($crate::layer::Error::InvariantViolation);
        }
    };
}
