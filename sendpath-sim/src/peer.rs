//! The receiving end of the simulated link.
use std::collections::{BTreeMap, VecDeque};

use sendpath::nic::OutSegment;
use sendpath::time::{Duration, Instant};
use sendpath::wire::SeqNumber;

/// A cumulative acknowledger.
///
/// Keeps out of order ranges around so that a single retransmission can fill a hole and
/// acknowledge everything behind it.
pub struct Peer {
    next: SeqNumber,
    held: BTreeMap<u32, u32>,
    delay: Duration,
    in_transit: VecDeque<(Instant, OutSegment)>,
    acks: VecDeque<(Instant, SeqNumber)>,
    received: u64,
    duplicates: u64,
}

impl Peer {
    pub fn new(first: SeqNumber, delay: Duration) -> Self {
        Peer {
            next: first,
            held: BTreeMap::new(),
            delay,
            in_transit: VecDeque::new(),
            acks: VecDeque::new(),
            received: 0,
            duplicates: 0,
        }
    }

    /// A segment left the sender at `now`.
    pub fn send(&mut self, segment: OutSegment, now: Instant) {
        self.in_transit.push_back((now + self.delay, segment));
    }

    /// Let every segment that has arrived by `now` in.
    pub fn deliver(&mut self, now: Instant) {
        while self.in_transit.front().map_or(false, |(at, _)| *at <= now) {
            if let Some((_, segment)) = self.in_transit.pop_front() {
                self.receive(&segment, now);
            }
        }
    }

    /// The next acknowledgement that has made it back by `now`.
    pub fn pop_ack(&mut self, now: Instant) -> Option<SeqNumber> {
        match self.acks.front() {
            Some(&(at, ack)) if at <= now => {
                self.acks.pop_front();
                Some(ack)
            },
            _ => None,
        }
    }

    pub fn next(&self) -> SeqNumber {
        self.next
    }

    /// Payload bytes that arrived, including duplicates.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Segments that carried nothing new.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    fn receive(&mut self, segment: &OutSegment, now: Instant) {
        self.received += segment.payload.len() as u64;
        let (start, end) = (segment.seq(), segment.end_seq());

        if !end.after(self.next) {
            self.duplicates += 1;
        } else if !start.after(self.next) {
            self.next = end;
        } else {
            let held = self.held.entry(start.0).or_insert(end.0);
            *held = (*held).max(end.0);
        }

        while let Some((&start, &end)) = self.held.iter().next() {
            if SeqNumber(start).after(self.next) {
                break;
            }
            self.held.remove(&start);
            if SeqNumber(end).after(self.next) {
                self.next = SeqNumber(end);
            }
        }

        self.acks.push_back((now + self.delay, self.next));
    }
}
