//! Congestion control plug-ins.
//!
//! The engine keeps the bookkeeping of what is in flight and when the network is considered to
//! have lost data. The algorithm only decides the size of the congestion window and the slow
//! start threshold. Both are counted in segments.
use crate::time::{Duration, Instant};

/// What an acknowledgement of new data told us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AckEvent {
    /// Segments newly acknowledged.
    pub acked: u32,
    /// A round trip time measured from this acknowledgement.
    pub rtt: Option<Duration>,
    /// Segments in flight before the acknowledgement arrived.
    pub in_flight: u32,
    /// Whether the window was the limiting factor in the last round trip.
    pub cwnd_limited: bool,
    /// The time the acknowledgement arrived.
    pub now: Instant,
}

/// A congestion control algorithm.
pub trait CongestionControl {
    /// A segment has been handed to the transport. `in_flight` includes it.
    fn on_packet_sent(&mut self, in_flight: u32, now: Instant);

    /// New data has been acknowledged.
    fn on_ack(&mut self, event: AckEvent);

    /// The congestion window in segments, never zero.
    fn current_window(&self) -> u32;

    /// The slow start threshold in segments.
    fn current_ssthresh(&self) -> u32;

    /// The least number of segments to size TSO segments for, `None` to use the configured floor.
    fn min_tso_segments(&self) -> Option<u32> {
        None
    }

    /// The retransmission timer expired with `in_flight` segments outstanding.
    fn on_retransmit_timeout(&mut self, in_flight: u32);

    /// Override window and threshold.
    ///
    /// Used for reductions the engine decides on its own: restarts after idle, application
    /// limited decay, local congestion and path MTU changes.
    fn set_window(&mut self, cwnd: u32, ssthresh: u32);

    /// The connection is gone.
    fn on_teardown(&mut self) {}
}

/// Models TCP NewReno flow control and congestion avoidance.
///
/// Slow start below the threshold, additive increase of one segment per window above it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NewReno {
    /// The window dictated by congestion.
    congestion_window: u32,
    /// Decider between slow start and congestion avoidance.
    ///
    /// Effectively unbounded initially, then updated on occurrence of congestion.
    ssthresh: u32,
    /// Acknowledged segments not yet turned into window growth.
    count: u32,
}

impl NewReno {
    /// The Linux initial window.
    pub const INITIAL_WINDOW: u32 = 10;

    /// Start with the default initial window.
    pub fn new() -> Self {
        Self::with_window(Self::INITIAL_WINDOW)
    }

    /// Start with a window of `cwnd` segments.
    pub fn with_window(cwnd: u32) -> Self {
        NewReno {
            congestion_window: cwnd.max(1),
            ssthresh: u32::max_value(),
            count: 0,
        }
    }

    /// Whether the window is below the threshold.
    pub fn in_slow_start(&self) -> bool {
        self.congestion_window < self.ssthresh
    }

    fn slow_start(&mut self, acked: u32) -> u32 {
        let cwnd = self.congestion_window.saturating_add(acked).min(self.ssthresh);
        let used = cwnd - self.congestion_window;
        self.congestion_window = cwnd;
        acked - used
    }

    fn congestion_avoidance(&mut self, acked: u32) {
        let window = self.congestion_window;
        self.count = self.count.saturating_add(acked);
        if self.count >= window {
            let delta = self.count / window;
            self.count -= delta * window;
            self.congestion_window = self.congestion_window.saturating_add(delta);
        }
    }
}

impl Default for NewReno {
    fn default() -> Self {
        NewReno::new()
    }
}

impl CongestionControl for NewReno {
    fn on_packet_sent(&mut self, _: u32, _: Instant) { }

    fn on_ack(&mut self, event: AckEvent) {
        if !event.cwnd_limited {
            return;
        }
        let mut acked = event.acked;
        if self.in_slow_start() {
            acked = self.slow_start(acked);
            if acked == 0 {
                return;
            }
        }
        self.congestion_avoidance(acked);
    }

    fn current_window(&self) -> u32 {
        self.congestion_window
    }

    fn current_ssthresh(&self) -> u32 {
        self.ssthresh
    }

    fn on_retransmit_timeout(&mut self, in_flight: u32) {
        self.ssthresh = (in_flight / 2).max(2);
        self.congestion_window = 1;
        self.count = 0;
    }

    fn set_window(&mut self, cwnd: u32, ssthresh: u32) {
        self.congestion_window = cwnd.max(1);
        self.ssthresh = ssthresh;
        self.count = 0;
    }

    fn on_teardown(&mut self) {
        *self = NewReno::with_window(self.congestion_window.min(Self::INITIAL_WINDOW));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(acked: u32) -> AckEvent {
        AckEvent {
            acked,
            rtt: None,
            in_flight: 0,
            cwnd_limited: true,
            now: Instant::from_millis(0),
        }
    }

    #[test]
    fn slow_start_then_avoidance() {
        let mut reno = NewReno::with_window(4);
        reno.set_window(4, 6);
        reno.on_ack(ack(4));
        // Two segments in slow start, the rest is counted towards avoidance.
        assert_eq!(reno.current_window(), 6);
        assert!(!reno.in_slow_start());
        reno.on_ack(ack(3));
        assert_eq!(reno.current_window(), 6);
        reno.on_ack(ack(1));
        assert_eq!(reno.current_window(), 7);
    }

    #[test]
    fn application_limited_does_not_grow() {
        let mut reno = NewReno::new();
        reno.on_ack(AckEvent { cwnd_limited: false, ..ack(10) });
        assert_eq!(reno.current_window(), 10);
    }

    #[test]
    fn timeout_resets() {
        let mut reno = NewReno::with_window(20);
        reno.on_retransmit_timeout(20);
        assert_eq!(reno.current_window(), 1);
        assert_eq!(reno.current_ssthresh(), 10);
        reno.on_retransmit_timeout(1);
        assert_eq!(reno.current_ssthresh(), 2);
    }
}
