use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::layer::{Error, Result};

/// A handle to a byte and segment budget.
///
/// Clones refer to the same budget. All operations are lock free and fail fast, nothing ever
/// waits for memory to become available.
#[derive(Clone, Debug)]
pub struct MemoryBudget {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    byte_limit: usize,
    segment_limit: usize,
    bytes: AtomicUsize,
    segments: AtomicUsize,
}

/// The resources charged for one segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Charge {
    /// Bytes, including the per segment overhead.
    pub bytes: usize,
    /// Number of segments.
    pub segments: usize,
}

impl Charge {
    /// Accounted overhead of one queued segment in addition to its payload.
    pub const SEGMENT_OVERHEAD: usize = 256;

    /// The charge for one segment carrying `len` payload bytes.
    pub fn segment(len: usize) -> Self {
        Charge { bytes: len + Self::SEGMENT_OVERHEAD, segments: 1 }
    }
}

impl MemoryBudget {
    /// A budget with the given limits.
    pub fn new(byte_limit: usize, segment_limit: usize) -> Self {
        MemoryBudget {
            inner: Arc::new(Inner {
                byte_limit,
                segment_limit,
                bytes: AtomicUsize::new(0),
                segments: AtomicUsize::new(0),
            }),
        }
    }

    /// A budget that never runs out.
    pub fn unlimited() -> Self {
        Self::new(usize::max_value(), usize::max_value())
    }

    /// Charge resources, failing with `OutOfMemory` if either limit would be exceeded.
    pub fn try_charge(&self, charge: Charge) -> Result<()> {
        Self::try_add(&self.inner.bytes, charge.bytes, self.inner.byte_limit)?;
        if let Err(err) = Self::try_add(&self.inner.segments, charge.segments, self.inner.segment_limit) {
            self.inner.bytes.fetch_sub(charge.bytes, Ordering::AcqRel);
            return Err(err);
        }
        Ok(())
    }

    /// Charge resources regardless of the limits.
    ///
    /// Used for control segments that must go out even under memory pressure.
    pub fn force_charge(&self, charge: Charge) {
        self.inner.bytes.fetch_add(charge.bytes, Ordering::AcqRel);
        self.inner.segments.fetch_add(charge.segments, Ordering::AcqRel);
    }

    /// Return resources previously charged.
    pub fn release(&self, charge: Charge) {
        Self::saturating_sub(&self.inner.bytes, charge.bytes);
        Self::saturating_sub(&self.inner.segments, charge.segments);
    }

    /// Bytes currently charged.
    pub fn bytes_used(&self) -> usize {
        self.inner.bytes.load(Ordering::Acquire)
    }

    /// Segments currently charged.
    pub fn segments_used(&self) -> usize {
        self.inner.segments.load(Ordering::Acquire)
    }

    /// Whether more than half of the byte budget is in use.
    pub fn under_pressure(&self) -> bool {
        self.bytes_used() > self.inner.byte_limit / 2
    }

    fn try_add(counter: &AtomicUsize, amount: usize, limit: usize) -> Result<()> {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(amount).filter(|&next| next <= limit)
            })
            .map(|_| ())
            .map_err(|_| Error::OutOfMemory)
    }

    fn saturating_sub(counter: &AtomicUsize, amount: usize) {
        let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            Some(current.saturating_sub(amount))
        });
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        MemoryBudget::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fails_fast_and_releases() {
        let budget = MemoryBudget::new(1000, 10);
        let charge = Charge::segment(500);
        assert_eq!(budget.try_charge(charge), Ok(()));
        assert_eq!(budget.bytes_used(), 756);
        assert_eq!(budget.try_charge(charge), Err(Error::OutOfMemory));
        assert_eq!(budget.bytes_used(), 756);
        budget.release(charge);
        assert_eq!(budget.bytes_used(), 0);
        assert_eq!(budget.segments_used(), 0);
    }

    #[test]
    fn segment_limit_rolls_back_bytes() {
        let budget = MemoryBudget::new(1 << 20, 1);
        budget.try_charge(Charge::segment(10)).unwrap();
        assert_eq!(budget.try_charge(Charge::segment(10)), Err(Error::OutOfMemory));
        assert_eq!(budget.bytes_used(), 10 + Charge::SEGMENT_OVERHEAD);
    }

    #[test]
    fn shared_between_clones() {
        let budget = MemoryBudget::new(2000, 10);
        let other = budget.clone();
        other.force_charge(Charge::segment(1500));
        assert!(budget.under_pressure());
        assert_eq!(budget.try_charge(Charge::segment(500)), Err(Error::OutOfMemory));
        other.release(Charge::segment(1500));
        assert!(!budget.under_pressure());
    }
}
