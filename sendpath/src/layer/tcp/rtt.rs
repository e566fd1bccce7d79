//! Round trip time estimation per [RFC 6298](https://tools.ietf.org/html/rfc6298).
use crate::time::Duration;

/// The smoothed round trip time and its variation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Estimator {
    /// No measurement has been made.
    NoSample,
    /// At least one measurement has been made.
    Measured {
        /// The smoothed round trip time.
        srtt: Duration,
        /// The round trip time variation.
        rtt_var: Duration,
    },
}

impl Default for Estimator {
    fn default() -> Self {
        Estimator::NoSample
    }
}

impl Estimator {
    /// Constants of [RFC 6298 Section 2].
    ///
    /// [RFC 6298 Section 2]: https://tools.ietf.org/html/rfc6298#section-2
    const K: u32 = 4;
    const G: Duration = Duration::from_millis(100);

    /// Update the estimate with a new measurement.
    pub fn sample(&mut self, rtt: Duration) {
        match self {
            Estimator::NoSample => {
                // SRTT <- R, RTTVAR <- R/2
                *self = Estimator::Measured { srtt: rtt, rtt_var: rtt / 2 }
            }
            Estimator::Measured { srtt, rtt_var } => {
                // RTTVAR <- 3/4 * RTTVAR + 1/4 * |SRTT - R'|
                // SRTT <- 7/8 * SRTT + 1/8 * R'
                let diff = srtt.checked_sub(rtt).unwrap_or_else(|| rtt - *srtt);
                *rtt_var = ((*rtt_var * 3) + diff) / 4;
                *srtt = ((*srtt * 7) + rtt) / 8;
            }
        }
    }

    /// The retransmission timeout, `SRTT + max(G, K*RTTVAR)`, clamped to `[min, max]`.
    ///
    /// Before the first measurement `initial` is used instead.
    pub fn rto(&self, initial: Duration, min: Duration, max: Duration) -> Rto {
        match *self {
            Estimator::NoSample => Rto::new(initial, min, max),
            Estimator::Measured { srtt, rtt_var } => {
                let var = Self::G.max(rtt_var * Self::K);
                Rto::new(srtt.checked_add(var).unwrap_or(max), min, max)
            }
        }
    }

    /// The smoothed round trip time, if measured.
    pub fn srtt(&self) -> Option<Duration> {
        match self {
            Estimator::NoSample => None,
            Estimator::Measured { srtt, .. } => Some(*srtt),
        }
    }
}

/// A retransmission timeout.
///
/// Always between the bounds it was created with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Rto(Duration);

impl Rto {
    /// The Linux minimum.
    pub const MIN: Duration = Duration::from_millis(200);

    /// The Linux maximum.
    pub const MAX: Duration = Duration::from_secs(120);

    /// The value before any measurement.
    pub const DEFAULT: Duration = Duration::from_secs(1);

    /// Clamp `duration` to `[min, max]`.
    pub fn new(duration: Duration, min: Duration, max: Duration) -> Self {
        Rto(duration.max(min).min(max))
    }

    /// The timeout as a duration.
    pub fn get(self) -> Duration {
        self.0
    }

    /// Double the timeout, saturating at `max`.
    pub fn double(self, max: Duration) -> Self {
        Rto(self.0.checked_mul(2).unwrap_or(max).min(max))
    }
}

impl Default for Rto {
    fn default() -> Self {
        Rto(Self::DEFAULT)
    }
}

impl From<Rto> for Duration {
    fn from(rto: Rto) -> Self {
        rto.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rto(estimator: &Estimator) -> Duration {
        estimator.rto(Rto::DEFAULT, Rto::MIN, Rto::MAX).get()
    }

    #[test]
    fn first_sample() {
        let mut estimator = Estimator::default();
        assert_eq!(rto(&estimator), Duration::from_secs(1));
        estimator.sample(Duration::from_secs(2));
        assert_eq!(estimator, Estimator::Measured {
            srtt: Duration::from_secs(2),
            rtt_var: Duration::from_secs(1),
        });
        assert_eq!(rto(&estimator), Duration::from_secs(6));
    }

    #[test]
    fn smoothing() {
        let mut estimator = Estimator::Measured {
            srtt: Duration::from_secs(1),
            rtt_var: Duration::from_secs(1),
        };
        estimator.sample(Duration::from_secs(2));
        assert_eq!(estimator, Estimator::Measured {
            srtt: Duration::from_millis(1125),
            rtt_var: Duration::from_secs(1),
        });
    }

    #[test]
    fn clamped_to_bounds() {
        let mut estimator = Estimator::default();
        estimator.sample(Duration::from_millis(1));
        assert_eq!(rto(&estimator), Rto::MIN);
        estimator = Estimator::Measured {
            srtt: Duration::from_secs(100),
            rtt_var: Duration::from_secs(100),
        };
        assert_eq!(rto(&estimator), Rto::MAX);
    }

    #[test]
    fn doubling_saturates() {
        let rto = Rto::new(Duration::from_secs(40), Rto::MIN, Rto::MAX);
        assert_eq!(rto.double(Rto::MAX).get(), Duration::from_secs(80));
        assert_eq!(rto.double(Rto::MAX).double(Rto::MAX).get(), Rto::MAX);
    }
}
