//! The gates every segment passes before it is transmitted.
//!
//! Each gate is a pure function of connection state. The engine runs them in a fixed order on the
//! head of the write queue and stops at the first that holds the segment back.
use core::ops;

use crate::nic::Transmit;
use crate::time::Instant;
use crate::wire::SeqNumber;

use super::config::Config;
use super::congestion::CongestionControl;
use super::connection::CaState;
use super::engine::Engine;
use super::segment::Segment;
use super::timer::Timers;

/// Modifiers of Nagle's algorithm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Nagle(u8);

impl Nagle {
    /// Nagle's algorithm in its Minshall variant.
    pub const NONE: Nagle = Nagle(0);
    /// Nagle's algorithm is disabled.
    pub const OFF: Nagle = Nagle(1);
    /// Partial segments are held back regardless of what is outstanding.
    pub const CORK: Nagle = Nagle(2);
    /// Send partial segments now, once.
    pub const PUSH: Nagle = Nagle(4);

    /// Whether all modifiers of `other` are set.
    pub fn contains(self, other: Nagle) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether no modifier is set.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitOr for Nagle {
    type Output = Nagle;

    fn bitor(self, other: Nagle) -> Nagle {
        Nagle(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Nagle {
    fn bitor_assign(&mut self, other: Nagle) {
        self.0 |= other.0;
    }
}

/// The outcome of the gates for one segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// Send up to this many payload bytes of the segment now.
    SendNow(u32),
    /// The pacing rate does not allow sending yet.
    DeferPacing,
    /// The congestion window is full.
    DeferCwnd,
    /// The segment does not fit the peer's window.
    DeferWindow,
    /// A partial segment held back by Nagle's algorithm or a cork.
    DeferNagle,
    /// Waiting for more window to build a larger TSO segment.
    DeferTso,
    /// Too many bytes are queued in the transport already.
    DeferSmallQueue,
}

/// How many segments a write pass may send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PushOne {
    /// As many as the gates allow.
    No,
    /// At most one.
    One,
    /// At most one, even with a full congestion window.
    LossProbe,
}

/// Segments that may be sent now under the congestion window.
///
/// Zero when the window is full. Otherwise at most half the window, so that a single burst
/// leaves room for at least two TSO segments.
pub fn cwnd_quota(in_flight: u32, cwnd: u32) -> u32 {
    if in_flight >= cwnd {
        return 0;
    }
    let half = (cwnd >> 1).max(1);
    half.min(cwnd - in_flight)
}

/// Whether the first MSS of a segment fits into the peer's window.
///
/// A segment carrying only a FIN is always allowed.
pub fn snd_wnd_test(seg: &Segment, window_end: SeqNumber, mss: u32) -> bool {
    if seg.is_empty() && seg.flags().fin() {
        return true;
    }
    let end = if seg.len() as u32 > mss {
        seg.seq() + mss
    } else {
        seg.end_seq()
    };
    !end.after(window_end)
}

/// The Minshall check: a segment smaller than the MSS is still unacknowledged.
pub fn minshall_check(small_end: SeqNumber, unacked: SeqNumber, next: SeqNumber) -> bool {
    small_end.after(unacked) && !small_end.after(next)
}

/// Whether Nagle's algorithm holds back a partial segment.
pub fn nagle_check(partial: bool, nonagle: Nagle, packets_out: u32, minshall: bool) -> bool {
    partial && (nonagle.contains(Nagle::CORK)
        || (nonagle.is_none() && packets_out > 0 && minshall))
}

/// The number of TSO segments a payload of `len` bytes is cut into.
pub fn tso_count(len: u32, mss: u32) -> u32 {
    if mss == 0 || len <= mss {
        1
    } else {
        (len + mss - 1) / mss
    }
}

/// Whether the transport already holds enough of our bytes.
///
/// Allows about `2^-pacing_shift` seconds worth of the pacing rate, at least two segments of
/// `len`, but never more than `limit_output_bytes` unless pacing. Retransmissions may use twice
/// that. Never throttles when nothing is outstanding, an acknowledgement could never restart it.
pub fn small_queue_check(
    host_queued: u32,
    len: u32,
    pacing_rate: Option<u64>,
    config: &Config,
    retransmit: bool,
    rtx_empty: bool,
) -> bool {
    let rate_budget = match pacing_rate {
        Some(rate) => rate >> config.pacing_shift,
        None => u64::from(config.limit_output_bytes),
    };
    let mut limit = rate_budget.max(2 * u64::from(len));
    if !config.pacing {
        limit = limit.min(u64::from(config.limit_output_bytes));
    }
    if retransmit {
        limit <<= 1;
    }
    u64::from(host_queued) > limit && !rtx_empty
}

impl<T: Transmit, C: CongestionControl, S: Timers> Engine<T, C, S> {
    /// Run the gates on a segment at the head of the write queue.
    ///
    /// `max_segs` bounds the TSO segment size. The verdict for a sendable segment carries the
    /// number of payload bytes to send, the caller fragments the rest off.
    pub(crate) fn decide(
        &self,
        seg: &Segment,
        mss: u32,
        max_segs: u32,
        nonagle: Nagle,
        push_one: PushOne,
        now: Instant,
    ) -> Verdict {
        if self.pacing_deferred(now) {
            return Verdict::DeferPacing;
        }

        let mut quota = cwnd_quota(self.queue.in_flight(), self.cc.current_window());
        if quota == 0 {
            if push_one == PushOne::LossProbe {
                quota = 1;
            } else {
                return Verdict::DeferCwnd;
            }
        }

        if !snd_wnd_test(seg, self.conn.window_end(), mss) {
            return Verdict::DeferWindow;
        }

        let is_last = self.queue.is_last_unsent(seg.handle());
        let segs = tso_count(seg.len() as u32, mss);
        if segs == 1 {
            let nonagle = if is_last { nonagle } else { Nagle::PUSH };
            if !self.nagle_test(seg, mss, nonagle) {
                return Verdict::DeferNagle;
            }
        } else if push_one == PushOne::No && self.tso_should_defer(seg, is_last, max_segs, now) {
            return Verdict::DeferTso;
        }

        let mut limit = mss;
        if segs > 1 && !self.conn.urgent_mode() {
            limit = self.mss_split_point(seg, is_last, mss, quota.min(max_segs), nonagle);
        }

        let len = (seg.len() as u32).min(limit);
        if small_queue_check(
            self.conn.host_queued,
            len,
            self.conn.pacing.rate,
            &self.config,
            false,
            self.queue.rtx_is_empty(),
        ) {
            return Verdict::DeferSmallQueue;
        }

        Verdict::SendNow(limit)
    }

    /// The verdict for the head of the write queue, without sending anything.
    pub fn next_verdict(&self, now: Instant) -> Option<Verdict> {
        let handle = self.queue.pop_next_sendable()?;
        let seg = self.queue.get(handle)?;
        let mss = self.current_mss();
        let max_segs = self.tso_segs(mss);
        Some(self.decide(seg, mss, max_segs, self.nonagle(), PushOne::No, now))
    }

    /// Whether the pacing rate holds the next transmission back.
    pub(crate) fn pacing_deferred(&self, now: Instant) -> bool {
        self.config.pacing
            && self.conn.pacing.next_send.map_or(false, |next| next > now)
    }

    /// Whether a segment of at most one MSS may go out now.
    fn nagle_test(&self, seg: &Segment, mss: u32, nonagle: Nagle) -> bool {
        if nonagle.contains(Nagle::PUSH) {
            return true;
        }
        if self.conn.urgent_mode() || seg.flags().fin() {
            return true;
        }
        let send = &self.conn.send;
        let minshall = minshall_check(send.small_end, send.unacked, send.next);
        !nagle_check((seg.len() as u32) < mss, nonagle, self.queue.packets_out(), minshall)
    }

    /// The number of bytes of a multi segment to send now.
    ///
    /// The whole `max_segs` worth if the window allows, otherwise what fits. A partial last MSS is
    /// left behind when Nagle's algorithm would hold it back.
    fn mss_split_point(&self, seg: &Segment, is_last: bool, mss: u32, max_segs: u32, nonagle: Nagle)
        -> u32
    {
        let end = self.conn.window_end();
        let window = if end.after(seg.seq()) { end - seg.seq() } else { 0 };
        let max_len = mss.saturating_mul(max_segs);
        if max_len <= window && !is_last {
            return max_len;
        }

        let needed = (seg.len() as u32).min(window);
        if max_len <= needed {
            return max_len;
        }

        let partial = needed % mss;
        let send = &self.conn.send;
        let minshall = minshall_check(send.small_end, send.unacked, send.next);
        if nagle_check(partial != 0, nonagle, self.queue.packets_out(), minshall) {
            return needed - partial;
        }
        needed
    }

    /// Whether to wait for a larger window before sending a TSO segment.
    ///
    /// Only defers while transmissions are recent, the next acknowledgement is expected soon and
    /// the segment could still grow.
    fn tso_should_defer(&self, seg: &Segment, is_last: bool, max_segs: u32, now: Instant) -> bool {
        if self.conn.ca_state == CaState::Loss {
            return false;
        }
        let recent = self.conn.last_xmit
            .map_or(false, |last| now.saturating_since(last) <= self.config.tso_defer_window);
        if !recent {
            return false;
        }

        let mss = self.current_mss();
        let cwnd = self.cc.current_window();
        let in_flight = self.queue.in_flight();
        if cwnd <= in_flight {
            return false;
        }

        let end = self.conn.window_end();
        let send_win = if end.after(seg.seq()) { end - seg.seq() } else { 0 };
        let cong_win = (cwnd - in_flight).saturating_mul(mss);
        let limit = send_win.min(cong_win);
        let len = seg.len() as u32;

        if limit >= max_segs.saturating_mul(mss) {
            return false;
        }
        if !is_last && limit >= len {
            return false;
        }

        if self.config.tso_win_divisor != 0 {
            let chunk = self.conn.send.window.min(cwnd.saturating_mul(mss));
            if limit >= chunk / self.config.tso_win_divisor {
                return false;
            }
        } else if limit > self.config.max_tso_deferred_mss.saturating_mul(mss) {
            return false;
        }

        let head_sent = match self.queue.rtx_head().and_then(Segment::last_sent) {
            Some(sent) => sent,
            None => return false,
        };
        // The next acknowledgement is likely more than half a round trip away.
        let half_srtt = self.conn.rtt.srtt().map_or_else(Default::default, |srtt| srtt / 2);
        if now.saturating_since(head_sent) < half_srtt {
            return false;
        }

        if cong_win < send_win {
            if cong_win <= len {
                return true;
            }
        } else if send_win <= len {
            return true;
        }

        !seg.flags().fin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::wire::Flags;

    #[test]
    fn quota_full_window() {
        assert_eq!(cwnd_quota(3, 3), 0);
        assert_eq!(cwnd_quota(4, 3), 0);
        assert_eq!(cwnd_quota(0, 10), 5);
        assert_eq!(cwnd_quota(8, 10), 2);
        assert_eq!(cwnd_quota(0, 1), 1);
    }

    #[test]
    fn window_test_fin_only() {
        let fin = Segment::new(SeqNumber(100), Bytes::new(), Flags::FIN);
        assert!(snd_wnd_test(&fin, SeqNumber(50), 1000));

        let data = Segment::new(SeqNumber(100), Bytes::from_static(&[0; 200]), Flags::FIN);
        assert!(!snd_wnd_test(&data, SeqNumber(250), 1000));
        assert!(snd_wnd_test(&data, SeqNumber(301), 1000));
    }

    #[test]
    fn window_test_first_mss_only() {
        let data = Segment::new(SeqNumber(0), Bytes::from(vec![0; 3000]), Flags::NONE);
        assert!(snd_wnd_test(&data, SeqNumber(1460), 1460));
        assert!(!snd_wnd_test(&data, SeqNumber(1459), 1460));
    }

    #[test]
    fn nagle_holds_partial_behind_small() {
        assert!(nagle_check(true, Nagle::NONE, 1, true));
        assert!(!nagle_check(true, Nagle::NONE, 0, true));
        assert!(!nagle_check(true, Nagle::NONE, 1, false));
        assert!(!nagle_check(true, Nagle::OFF, 1, true));
        assert!(nagle_check(true, Nagle::CORK, 0, false));
        assert!(!nagle_check(false, Nagle::CORK, 0, false));
    }

    #[test]
    fn minshall_range() {
        assert!(minshall_check(SeqNumber(150), SeqNumber(100), SeqNumber(200)));
        assert!(!minshall_check(SeqNumber(100), SeqNumber(100), SeqNumber(200)));
        assert!(!minshall_check(SeqNumber(250), SeqNumber(100), SeqNumber(200)));
    }

    #[test]
    fn small_queue_limits() {
        let config = Config::default();
        // Nothing outstanding is never throttled.
        assert!(!small_queue_check(u32::max_value(), 1000, None, &config, false, true));
        assert!(small_queue_check((1 << 20) + 1, 1000, None, &config, false, false));
        assert!(!small_queue_check((1 << 20) + 1, 1000, None, &config, true, false));
        // A slow rate limits to two segments.
        assert!(small_queue_check(2001, 1000, Some(1000), &config, false, false));
        assert!(!small_queue_check(2000, 1000, Some(1000), &config, false, false));
    }

    #[test]
    fn tso_counts() {
        assert_eq!(tso_count(0, 1460), 1);
        assert_eq!(tso_count(1460, 1460), 1);
        assert_eq!(tso_count(1461, 1460), 2);
        assert_eq!(tso_count(3000, 1460), 3);
    }
}
