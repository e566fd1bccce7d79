//! Simulates packet loss.
//!
//! The loss layer is a simple wrapper around another transport which simulates a lossy path. It
//! reports success for every segment it drops, just like a real network would.
use crate::wire::SeqNumber;

use super::{OutSegment, Transmit, TransmitError};

/// Simple pseudo-random loss.
///
/// Can simulate burst-losses and uniform losses by dropping packets based on a pulse design.
#[derive(Copy, Clone, Debug, Hash)]
pub struct PrngLoss {
    /// Threshold for dropping the packet.
    pub threshold: u32,
    /// The packet is never dropped while `count` at least as large as `threshold`.
    pub count: u32,
    /// Reset value for `count` when it reaches `0`.
    pub reset: u32,
    /// Loss rate as a (0, 32)-bit fixed point number.
    ///
    /// Or `None` for no loss at all, which can be used to temporarily turn loss off.
    pub lossrate: Option<u32>,
    /// The current prng state (or seed at the start).
    pub prng: Xoroshiro256,
}

/// A transport that loses some of the segments handed to it.
#[derive(Debug)]
pub struct Lossy<T> {
    /// The transport receiving all segments that survive.
    pub inner: T,
    /// The loss pattern.
    pub loss: PrngLoss,
    dropped: usize,
}

/// The xoshiro256** generator.
#[derive(Copy, Clone, Debug, Hash)]
pub struct Xoroshiro256 {
    state: [u64; 4],
}

impl PrngLoss {
    /// A uniform loss simulator.
    ///
    /// The rate is the probability of loss scaled to the full `u32` range.
    pub fn uniform(rate: Option<u32>, seed: u64) -> Self {
        PrngLoss {
            // Threshold always greater than count
            threshold: 1,
            count: 0,
            reset: 0,
            lossrate: rate,
            prng: Xoroshiro256::new(seed),
        }
    }

    /// A uniform loss simulator with the loss given in percent.
    pub fn percent(percent: u32, seed: u64) -> Self {
        let rate = match percent {
            0 => None,
            p if p >= 100 => Some(u32::max_value()),
            p => Some((u64::from(u32::max_value()) * u64::from(p) / 100) as u32),
        };
        Self::uniform(rate, seed)
    }

    /// Wrap a transport to make it lossy.
    pub fn lossy<T>(&self, inner: T) -> Lossy<T> {
        Lossy { inner, loss: *self, dropped: 0 }
    }

    /// Simulate burst losses as pulses.
    ///
    /// Drops all packets while in a high state, lets packets pass while in low state.
    pub fn pulsed(high: u32, length: u32) -> Self {
        assert!(length > 0, "Pulse length must not be zero");
        assert!(high <= length, "Length of high signals must be shorter than total length");
        PrngLoss {
            threshold: high,
            count: length - 1,
            reset: length - 1,
            // Packet always lost when pulse condition is true.
            lossrate: Some(u32::max_value()),
            prng: Xoroshiro256::new(0),
        }
    }

    /// Determine the fate for the next packet, `true` if it is lost.
    pub fn next(&mut self) -> bool {
        let in_window = self.count < self.threshold;
        let roll = self.roll();
        let fate = match self.lossrate {
            Some(rate) => roll <= rate,
            None => false,
        };

        self.count = self.count.checked_sub(1)
            .unwrap_or(self.reset);

        fate & in_window
    }

    /// Generate the next value of the prng.
    fn roll(&mut self) -> u32 {
        (self.prng.next() >> 32) as u32
    }
}

impl Xoroshiro256 {
    /// Seed the generator.
    ///
    /// The seed is spread over the state with splitmix64 so that similar seeds do not produce
    /// similar sequences.
    pub fn new(seed: u64) -> Self {
        let mut x = seed;
        let mut splitmix = || {
            x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
            let mut z = x;
            z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
            z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
            z ^ (z >> 31)
        };
        Xoroshiro256 {
            state: [splitmix(), splitmix(), splitmix(), splitmix()],
        }
    }

    /// Advance the generator.
    pub fn next(&mut self) -> u64 {
        let s = &mut self.state;
        let result_starstar = s[1]
            .wrapping_mul(5)
            .rotate_left(7)
            .wrapping_mul(9);

        let t = s[1] << 17;

        s[2] ^= s[0];
        s[3] ^= s[1];
        s[1] ^= s[2];
        s[0] ^= s[3];

        s[2] ^= t;

        s[3] = s[3].rotate_left(45);

        result_starstar
    }
}

impl<T> Lossy<T> {
    /// The number of segments dropped so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl<T: Transmit> Transmit for Lossy<T> {
    fn transmit(&mut self, segment: OutSegment) -> Result<(), TransmitError> {
        if self.loss.next() {
            net_trace!("lossy: dropping segment at {}", segment.seq());
            self.dropped += 1;
            return Ok(());
        }
        self.inner.transmit(segment)
    }

    fn still_queued(&self, seq: SeqNumber) -> bool {
        self.inner.still_queued(seq)
    }
}
