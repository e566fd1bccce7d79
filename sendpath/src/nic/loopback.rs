//! Implementation of a software loop-back transport.
use alloc::collections::VecDeque;

use crate::wire::SeqNumber;

use super::{OutSegment, Transmit, TransmitError};

/// A software loop-back transport.
///
/// Maintains a queue of segments in flight which the other end can take out with [`recv`].
/// Optionally bounded, a full queue reports [`TransmitError::Congested`]. Failures can also be
/// scripted ahead of time, each scripted error is consumed by one call to `transmit`.
///
/// [`recv`]: #method.recv
/// [`TransmitError::Congested`]: enum.TransmitError.html#variant.Congested
#[derive(Debug, Default)]
pub struct Loopback {
    queue: VecDeque<OutSegment>,
    capacity: Option<usize>,
    script: VecDeque<TransmitError>,
    sent: usize,
}

impl Loopback {
    /// Create an unbounded loop-back transport.
    pub fn new() -> Self {
        Loopback::default()
    }

    /// Create a loop-back transport holding at most `capacity` segments.
    pub fn with_capacity(capacity: usize) -> Self {
        Loopback {
            capacity: Some(capacity),
            ..Loopback::default()
        }
    }

    /// Fail the next call to `transmit` with `error`.
    ///
    /// Multiple errors queue up in order.
    pub fn fail_next(&mut self, error: TransmitError) {
        self.script.push_back(error);
    }

    /// Take the oldest segment out of the queue.
    pub fn recv(&mut self) -> Option<OutSegment> {
        self.queue.pop_front()
    }

    /// Take all queued segments.
    pub fn drain(&mut self) -> impl Iterator<Item=OutSegment> + '_ {
        self.queue.drain(..)
    }

    /// Look at queued segments without removing them.
    pub fn queued(&self) -> impl Iterator<Item=&OutSegment> + '_ {
        self.queue.iter()
    }

    /// The number of segments waiting in the queue.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no segment is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// The number of segments ever accepted.
    pub fn sent(&self) -> usize {
        self.sent
    }
}

impl Transmit for Loopback {
    fn transmit(&mut self, segment: OutSegment) -> Result<(), TransmitError> {
        if let Some(error) = self.script.pop_front() {
            return Err(error);
        }
        if let Some(capacity) = self.capacity {
            if self.queue.len() >= capacity {
                return Err(TransmitError::Congested);
            }
        }
        self.sent += 1;
        self.queue.push_back(segment);
        Ok(())
    }

    fn still_queued(&self, seq: SeqNumber) -> bool {
        self.queue.iter().any(|queued| queued.seq() == seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::tests::segment;
    use crate::wire::SeqNumber;

    #[test]
    fn simple_loopback() {
        let mut loopback = Loopback::new();
        assert_eq!(loopback.transmit(segment(0, 10)), Ok(()));
        assert_eq!(loopback.transmit(segment(10, 10)), Ok(()));
        assert_eq!(loopback.len(), 2);
        assert_eq!(loopback.recv().map(|seg| seg.seq()), Some(SeqNumber(0)));
        assert_eq!(loopback.drain().count(), 1);
        assert!(loopback.is_empty());
        assert_eq!(loopback.sent(), 2);
    }

    #[test]
    fn bounded_and_scripted() {
        let mut loopback = Loopback::with_capacity(1);
        loopback.fail_next(TransmitError::Busy);
        assert_eq!(loopback.transmit(segment(0, 10)), Err(TransmitError::Busy));
        assert_eq!(loopback.transmit(segment(0, 10)), Ok(()));
        assert_eq!(loopback.transmit(segment(10, 10)), Err(TransmitError::Congested));
        assert_eq!(loopback.sent(), 1);
    }

    #[test]
    fn knows_what_it_holds() {
        let mut loopback = Loopback::new();
        loopback.transmit(segment(0, 10)).unwrap();
        loopback.transmit(segment(10, 10)).unwrap();
        assert!(loopback.still_queued(SeqNumber(10)));
        assert!(!loopback.still_queued(SeqNumber(5)));
        loopback.recv();
        assert!(!loopback.still_queued(SeqNumber(0)));
        assert!(loopback.still_queued(SeqNumber(10)));
    }
}
