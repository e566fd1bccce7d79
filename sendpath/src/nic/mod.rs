//! The transport below the engine.
//!
//! The engine hands finished segments to an implementation of [`Transmit`]. Whatever sits below
//! (the network layer, a routing table, a device queue) is out of view. It only reports back
//! whether it accepted the segment and, if not, whether trying again later makes sense.
//!
//! Two software implementations are included. [`Loopback`] keeps every accepted segment in a
//! queue for inspection and can be scripted to fail. [`Lossy`] wraps another transport and
//! silently drops segments according to a seeded pseudo random pattern.
//!
//! [`Transmit`]: trait.Transmit.html
//! [`Loopback`]: struct.Loopback.html
//! [`Lossy`]: struct.Lossy.html
use core::fmt;

use bytes::Bytes;

use crate::wire::{Repr, SeqNumber};

mod loopback;
mod loss;

pub use self::loopback::Loopback;
pub use self::loss::{Lossy, PrngLoss, Xoroshiro256};

/// A segment ready for the wire.
///
/// The payload shares its bytes with the copy held in the retransmission queue. Neither side ever
/// mutates them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutSegment {
    /// The header, including options and the advertised window.
    pub repr: Repr,
    /// The payload bytes.
    pub payload: Bytes,
    /// The size of each wire segment if the transport is asked to segment this one, `None` if it
    /// must go out as is.
    pub gso_size: Option<u16>,
}

impl OutSegment {
    /// The first sequence number occupied by the segment.
    pub fn seq(&self) -> SeqNumber {
        self.repr.seq_number
    }

    /// The length of the segment in sequence space.
    pub fn sequence_len(&self) -> u32 {
        self.payload.len() as u32 + self.repr.flags.sequence_len()
    }

    /// The sequence number following the segment.
    pub fn end_seq(&self) -> SeqNumber {
        self.seq() + self.sequence_len()
    }

    /// The number of wire segments this expands to.
    pub fn wire_segments(&self) -> usize {
        match self.gso_size {
            Some(size) if size > 0 && !self.payload.is_empty() =>
                (self.payload.len() + usize::from(size) - 1) / usize::from(size),
            _ => 1,
        }
    }
}

/// The ways in which handing a segment to the transport can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransmitError {
    /// The local queue below is full. Try again later.
    Congested,
    /// There is no route towards the peer. Retrying will not help.
    Unreachable,
    /// An earlier copy of this very segment is still queued below.
    Busy,
}

impl TransmitError {
    /// Whether the same segment may be offered again later.
    pub fn is_transient(self) -> bool {
        match self {
            TransmitError::Congested | TransmitError::Busy => true,
            TransmitError::Unreachable => false,
        }
    }
}

impl fmt::Display for TransmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransmitError::Congested   => write!(f, "transmit queue congested"),
            TransmitError::Unreachable => write!(f, "destination unreachable"),
            TransmitError::Busy        => write!(f, "segment still queued"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TransmitError {}

/// The network transmit primitive consumed by the engine.
pub trait Transmit {
    /// Hand one segment to the layer below.
    ///
    /// On success the segment is considered on its way, it is never retracted.
    fn transmit(&mut self, segment: OutSegment) -> Result<(), TransmitError>;

    /// Whether an earlier segment starting at `seq` is still queued below.
    ///
    /// A copy still queued must not be handed over again. The default answers yes and leaves it
    /// to completions reported through [`Engine::on_transmit_complete`] to release segments.
    /// Transports that can look into their queue should answer precisely, the engine then
    /// resends segments whose completion was never reported.
    ///
    /// [`Engine::on_transmit_complete`]: ../layer/tcp/struct.Engine.html#method.on_transmit_complete
    fn still_queued(&self, seq: SeqNumber) -> bool {
        let _ = seq;
        true
    }
}

impl<T: Transmit + ?Sized> Transmit for &'_ mut T {
    fn transmit(&mut self, segment: OutSegment) -> Result<(), TransmitError> {
        (**self).transmit(segment)
    }

    fn still_queued(&self, seq: SeqNumber) -> bool {
        (**self).still_queued(seq)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::wire::{Flags, Options};

    pub(crate) fn segment(seq: u32, len: usize) -> OutSegment {
        OutSegment {
            repr: Repr {
                src_port: 1,
                dst_port: 2,
                flags: Flags::ACK,
                seq_number: SeqNumber(seq),
                ack_number: Some(SeqNumber(0)),
                window_len: 0,
                urgent_at: 0,
                options: Options::default(),
            },
            payload: Bytes::from(vec![0u8; len]),
            gso_size: None,
        }
    }

    #[test]
    fn wire_segments() {
        let mut seg = segment(100, 3000);
        assert_eq!(seg.end_seq(), SeqNumber(3100));
        assert_eq!(seg.wire_segments(), 1);
        seg.gso_size = Some(1460);
        assert_eq!(seg.wire_segments(), 3);
        seg.repr.flags.insert(Flags::FIN);
        assert_eq!(seg.sequence_len(), 3001);
    }

    #[test]
    fn transient_errors() {
        assert!(TransmitError::Congested.is_transient());
        assert!(TransmitError::Busy.is_transient());
        assert!(!TransmitError::Unreachable.is_transient());
    }
}
