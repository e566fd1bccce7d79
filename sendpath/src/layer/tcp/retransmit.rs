//! Retransmission, tail loss probes and zero window probes.
//!
//! All three share one timer, see [`XmitTimer`]. Outstanding data arms it for a retransmission
//! timeout or a loss probe, a closed peer window with nothing outstanding arms it for a window
//! probe.
//!
//! [`XmitTimer`]: ../enum.XmitTimer.html
use alloc::vec::Vec;

use crate::layer::{Error, Result};
use crate::nic::Transmit;
use crate::time::{Duration, Instant};

use super::config::MtuProbing;
use super::congestion::CongestionControl;
use super::connection::{CaState, State};
use super::decision::{small_queue_check, snd_wnd_test, Nagle, PushOne};
use super::engine::Engine;
use super::segment::{Segment, SegmentHandle, SegmentState};
use super::timer::{Timers, XmitTimer};

/// How long to wait before retrying after a local resource shortage.
pub(crate) const RESOURCE_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// The extra delay of a loss probe with more than one segment outstanding.
const TLP_MIN_DELAY: Duration = Duration::from_millis(2);

impl<T: Transmit, C: CongestionControl, S: Timers> Engine<T, C, S> {
    /// The retransmission timer expired.
    ///
    /// Resends the oldest outstanding segment, collapses the window and backs off the timeout.
    pub(crate) fn retransmit_timer(&mut self, now: Instant) -> Result<()> {
        if self.queue.packets_out() == 0 {
            return Ok(());
        }
        // The oldest segment the peer has not selectively acknowledged.
        let head = match self.queue.outstanding()
            .find(|seg| seg.state() != SegmentState::SackedAcked)
            .or_else(|| self.queue.rtx_head())
        {
            Some(seg) => seg.handle(),
            None => return Ok(()),
        };
        self.conn.tlp_high_seq = None;
        self.counters.rto_timeouts += 1;
        net_debug!("tcp: retransmission timeout at {}, rto {:?}, {} out",
            head.seq(), self.conn.rto.get(), self.queue.packets_out());

        if self.conn.send.window == 0 && self.conn.current.is_synchronized() {
            // The peer shrunk its window onto outstanding data. Probe with the head while the
            // peer keeps answering.
            if now.saturating_since(self.conn.rcv_tstamp) > self.config.rto_max {
                return self.fail(Error::TimedOut);
            }
            self.enter_loss();
            match self.retransmit_segment(head, 1, now) {
                Err(err) if err.is_fatal() => return self.fail(err),
                _ => (),
            }
            self.conn.rto = self.conn.rto.double(self.config.rto_max);
            self.rearm_rto(now);
            return Ok(());
        }

        self.write_timeout(now)?;

        self.enter_loss();
        self.conn.retransmits += 1;
        match self.retransmit_segment(head, 1, now) {
            Ok(()) => (),
            Err(err) if err.is_fatal() => return self.fail(err),
            Err(err) => {
                net_debug!("tcp: retransmission of {} deferred: {}", head.seq(), err);
                let retry = now + self.conn.rto.get().min(RESOURCE_PROBE_INTERVAL);
                self.set_xmit_timer(XmitTimer::RetransmitArmed(retry));
                return Ok(());
            }
        }

        self.conn.backoff += 1;
        self.conn.rto = self.conn.rto.double(self.config.rto_max);
        self.rearm_rto(now);
        Ok(())
    }

    /// Give up on the connection after too many retransmissions.
    fn write_timeout(&mut self, now: Instant) -> Result<()> {
        let limit = match self.conn.current {
            State::SynSent => self.config.syn_retries,
            State::SynReceived => self.config.synack_retries,
            _ => {
                if self.conn.retransmits >= self.config.retries1 {
                    self.mtu_black_hole(now);
                }
                self.config.retries2
            }
        };
        if self.conn.retransmits >= limit {
            net_debug!("tcp: giving up after {} retransmissions", self.conn.retransmits);
            self.counters.timeouts += 1;
            return self.fail(Error::TimedOut);
        }
        Ok(())
    }

    /// Repeated timeouts may mean large segments are dropped silently on the path.
    ///
    /// Enables the MTU search, or lowers its floor if already searching.
    fn mtu_black_hole(&mut self, now: Instant) {
        if self.config.mtu_probing == MtuProbing::Off {
            return;
        }
        let probe = &mut self.conn.mtu_probe;
        if !probe.enabled {
            probe.enabled = true;
            probe.probe_timestamp = now;
        } else {
            let mss = (self.conn.mss.mtu_to_mss(probe.search_low) >> 1)
                .min(self.config.base_mss)
                .max(self.config.min_snd_mss);
            probe.search_low = self.conn.mss.mss_to_mtu(mss);
        }
        let mss = self.sync_mss();
        net_debug!("tcp: suspected mtu black hole, search from {}, mss {}",
            self.conn.mtu_probe.search_low, mss);
    }

    /// Enter the loss state: everything outstanding that was not selectively acknowledged is
    /// presumed lost.
    pub(crate) fn enter_loss(&mut self) {
        let una = self.conn.send.unacked;
        let reduce = match self.conn.ca_state {
            CaState::Open => true,
            CaState::Cwr => !self.conn.high_seq.after(una),
            CaState::Loss => self.conn.retransmits == 0 || !self.conn.high_seq.after(una),
        };
        if reduce {
            self.cc.on_retransmit_timeout(self.queue.in_flight());
        } else {
            let ssthresh = self.cc.current_ssthresh();
            self.cc.set_window(1, ssthresh);
        }
        let lost = self.queue.mark_all_lost();
        net_trace!("tcp: {} segments presumed lost", lost);
        self.conn.ca_state = CaState::Loss;
        self.conn.high_seq = self.conn.send.next;
    }

    /// Resend an outstanding segment, or its first `segs` MSS.
    pub(crate) fn retransmit_segment(&mut self, handle: SegmentHandle, segs: u32, now: Instant)
        -> Result<()>
    {
        let handle = self.retransmit_inner(handle, segs, now)?;
        self.queue.mark_retransmitted(handle, now)?;
        self.counters.retransmits += 1;
        self.conn.retrans_stamp.get_or_insert(now);
        Ok(())
    }

    /// Transmit an outstanding segment again without accounting it as a retransmission.
    fn retransmit_inner(&mut self, handle: SegmentHandle, segs: u32, now: Instant)
        -> Result<SegmentHandle>
    {
        // A retransmission makes the outcome of a pending path MTU probe inconclusive.
        if self.conn.mtu_probe.in_flight() {
            self.conn.mtu_probe.probe_size = 0;
            self.conn.mtu_probe.probe_seq = None;
        }

        if self.still_in_host_queue(handle) {
            return Err(Error::Busy);
        }
        let seg = self.queue.get(handle).ok_or(Error::UnknownSegment)?;
        if !seg.seq().before(self.conn.window_end()) && seg.seq() != self.conn.send.unacked {
            return Err(Error::WindowClosed);
        }

        let mss = self.current_mss();
        let len = seg.len();
        let limit = mss.saturating_mul(segs.max(1)) as usize;
        if len > limit {
            self.queue.fragment(handle, limit)?;
            self.queue.set_tso_segs(handle, mss)?;
        } else {
            self.queue.set_tso_segs(handle, mss)?;
            if len < mss as usize {
                self.retrans_try_collapse(handle, i64::from(mss));
            }
        }

        self.transmit_segment(handle, now)?;
        Ok(handle)
    }

    /// Merge small segments following `to` into it while they fit into `space` bytes.
    fn retrans_try_collapse(&mut self, to: SegmentHandle, mut space: i64) {
        if !self.config.retrans_collapse {
            return;
        }
        match self.queue.get(to) {
            Some(seg) if !seg.flags().syn() && self.queue.is_collapsible(to) => {
                space -= seg.len() as i64;
            }
            _ => return,
        }
        while let Some(next) = self.queue.next_of(to) {
            self.still_in_host_queue(next);
            let (len, end) = match self.queue.get(next) {
                Some(seg) => (seg.len() as i64, seg.end_seq()),
                None => break,
            };
            if !self.queue.is_collapsible(next) {
                break;
            }
            space -= len;
            if space < 0 || end.after(self.conn.window_end()) {
                break;
            }
            if self.queue.collapse(to, next).is_err() {
                break;
            }
            net_trace!("tcp: collapsed {} into {}", next.seq(), to.seq());
        }
    }

    /// Whether the transport may still hold a copy of an outstanding segment.
    ///
    /// Forgets the copy once the transport no longer has it, whether or not its completion was
    /// reported.
    fn still_in_host_queue(&mut self, handle: SegmentHandle) -> bool {
        match self.queue.get(handle) {
            Some(seg) if seg.is_shared() => (),
            _ => return false,
        }
        if self.transport.still_queued(handle.seq()) {
            return true;
        }
        self.queue.forget_shared(handle);
        false
    }

    /// Resend segments marked lost, as far as the congestion window allows.
    pub(crate) fn xmit_retransmit_queue(&mut self, now: Instant) -> Result<()> {
        if self.queue.packets_out() == 0 {
            return Ok(());
        }
        let lost: Vec<SegmentHandle> = self.queue.lost_handles().collect();
        let max_segs = self.tso_segs(self.current_mss());

        for handle in lost {
            if self.pacing_deferred(now) {
                break;
            }
            let in_flight = self.queue.in_flight();
            let cwnd = self.cc.current_window();
            if in_flight >= cwnd {
                break;
            }
            let segs = (cwnd - in_flight).min(max_segs);
            if self.queue.retrans_out() >= self.queue.lost_out() {
                break;
            }

            let len = match self.queue.get(handle) {
                Some(seg) if seg.state() == SegmentState::Lost => seg.len() as u32,
                _ => continue,
            };
            if small_queue_check(
                self.conn.host_queued,
                len,
                self.conn.pacing.rate,
                &self.config,
                true,
                self.queue.rtx_is_empty(),
            ) {
                break;
            }

            let is_head = self.queue.rtx_head().map(Segment::handle) == Some(handle);
            match self.retransmit_segment(handle, segs, now) {
                Ok(()) => (),
                Err(Error::Busy) => continue,
                Err(err) if err.is_fatal() => return self.fail(err),
                Err(err) => {
                    net_trace!("tcp: retransmission walk stopped at {}: {}", handle.seq(), err);
                    break;
                }
            }
            if is_head {
                let when = now + self.conn.rto.get();
                self.set_xmit_timer(XmitTimer::RetransmitArmed(when));
            }
        }
        Ok(())
    }

    /// Resend outstanding segments that no longer fit the MSS.
    pub(crate) fn simple_retransmit(&mut self, now: Instant) -> Result<()> {
        let mss = self.current_mss();
        let oversized: Vec<SegmentHandle> = self.queue.outstanding()
            .filter(|seg| seg.state() != SegmentState::SackedAcked)
            .filter(|seg| seg.gso_size().map_or(seg.len() as u32, u32::from) > mss)
            .map(Segment::handle)
            .collect();
        for handle in oversized {
            self.queue.mark_lost(handle)?;
        }
        if self.queue.lost_out() == 0 {
            return Ok(());
        }

        if self.conn.ca_state != CaState::Loss {
            let cwnd = self.cc.current_window();
            let ssthresh = self.current_ssthresh();
            self.cc.set_window(cwnd, ssthresh);
            self.conn.high_seq = self.conn.send.next;
            self.conn.ca_state = CaState::Loss;
        }
        self.xmit_retransmit_queue(now)?;
        if !self.xmit_timer.is_armed() {
            self.rearm_rto(now);
        }
        Ok(())
    }

    /// The path MTU probe was not acknowledged in time.
    pub(crate) fn mtu_probe_lost(&mut self, now: Instant) -> Result<()> {
        if self.conn.mtu_probe.probe_size == 0 {
            return self.retransmit_timer(now);
        }
        let probe = &mut self.conn.mtu_probe;
        probe.search_high = probe.probe_size - 1;
        let failed = probe.probe_size;
        probe.probe_size = 0;
        probe.probe_seq = None;
        self.counters.mtu_probe_failed += 1;

        let cwnd = self.cc.current_window();
        let ssthresh = self.cc.current_ssthresh();
        self.cc.set_window(cwnd + 1, ssthresh);
        let mss = self.sync_mss();
        net_debug!("tcp: mtu probe of {} lost, mss {}", failed, mss);
        self.simple_retransmit(now)
    }

    /// Arm a tail loss probe instead of the retransmission timer.
    ///
    /// Returns whether it was armed. Only one probe may be outstanding, and never while a path
    /// MTU probe is.
    pub(crate) fn schedule_loss_probe(&mut self, now: Instant, advancing_rto: bool) -> bool {
        let packets_out = self.queue.packets_out();
        if !self.config.tail_loss_probe
            || !self.conn.sack_ok
            || packets_out == 0
            || self.conn.tlp_high_seq.is_some()
            || self.conn.mtu_probe.in_flight()
            || !self.conn.current.can_send_data()
        {
            return false;
        }
        match self.conn.ca_state {
            CaState::Open | CaState::Cwr => (),
            CaState::Loss => return false,
        }

        let mut timeout = match self.conn.rtt.srtt() {
            Some(srtt) => {
                let extra = if packets_out == 1 { self.config.rto_min } else { TLP_MIN_DELAY };
                srtt * 2 + extra
            }
            None => self.config.rto_initial,
        };
        let rto_delta = if advancing_rto {
            self.conn.rto.get().as_micros() as i64
        } else {
            self.rto_delta_us(now)
        };
        if rto_delta > 0 {
            timeout = timeout.min(Duration::from_micros(rto_delta as u64));
        }
        self.set_xmit_timer(XmitTimer::LossProbeArmed(now + timeout));
        true
    }

    /// Time left until the oldest outstanding segment times out, may be negative.
    fn rto_delta_us(&self, now: Instant) -> i64 {
        let sent = self.queue.rtx_head()
            .and_then(Segment::last_sent)
            .unwrap_or(now);
        let deadline = sent + self.conn.rto.get();
        deadline.total_micros() - now.total_micros()
    }

    /// Arm the retransmission timer for the oldest outstanding segment.
    pub(crate) fn rearm_rto(&mut self, now: Instant) {
        if self.queue.packets_out() == 0 {
            if let XmitTimer::ZeroWindowProbeArmed(_) = self.xmit_timer {
                return;
            }
            self.set_xmit_timer(XmitTimer::Idle);
            return;
        }
        let mut timeout = self.conn.rto.get();
        if let XmitTimer::LossProbeArmed(_) = self.xmit_timer {
            let delta = self.rto_delta_us(now).max(1);
            timeout = Duration::from_micros(delta as u64);
        }
        let when = now + timeout;
        let next = if self.conn.mtu_probe.in_flight() {
            XmitTimer::MtuProbePending(when)
        } else {
            XmitTimer::RetransmitArmed(when)
        };
        self.set_xmit_timer(next);
    }

    /// The loss probe timer expired.
    ///
    /// Sends new data if the peer's window allows, otherwise resends the last outstanding MSS.
    pub(crate) fn send_loss_probe(&mut self, now: Instant) -> Result<()> {
        if self.conn.tlp_high_seq.is_some() {
            self.rearm_rto(now);
            return Ok(());
        }
        let mss = self.current_mss();

        let head_fits = self.queue.write_head()
            .map_or(false, |seg| snd_wnd_test(seg, self.conn.window_end(), mss));
        if head_fits {
            let prior_packets = self.queue.packets_out();
            match self.write_xmit(mss, Nagle::OFF, PushOne::LossProbe, now) {
                Err(err) if err.is_fatal() => return self.fail(err),
                _ => (),
            }
            if self.queue.packets_out() > prior_packets {
                self.loss_probe_sent(now);
            } else {
                self.rearm_rto(now);
            }
            return Ok(());
        }

        let (mut handle, pcount, len) = match self.queue.rtx_tail() {
            Some(seg) => (seg.handle(), seg.tso_segs(), seg.len() as u32),
            None => {
                self.set_xmit_timer(XmitTimer::Idle);
                return Ok(());
            }
        };
        if self.still_in_host_queue(handle) {
            self.rearm_rto(now);
            return Ok(());
        }
        if pcount > 1 && len > (pcount - 1) * mss {
            match self.queue.fragment(handle, ((pcount - 1) * mss) as usize) {
                Ok((_, tail)) => handle = tail,
                Err(_) => {
                    self.rearm_rto(now);
                    return Ok(());
                }
            }
        }

        let sent = self.retransmit_inner(handle, 1, now)
            .and_then(|handle| self.queue.mark_probed(handle, now));
        match sent {
            Ok(()) => {
                self.loss_probe_sent(now);
                Ok(())
            }
            Err(err) if err.is_fatal() => self.fail(err),
            Err(err) => {
                net_trace!("tcp: loss probe of {} deferred: {}", handle.seq(), err);
                self.rearm_rto(now);
                Ok(())
            }
        }
    }

    fn loss_probe_sent(&mut self, now: Instant) {
        self.conn.tlp_high_seq = Some(self.conn.send.next);
        self.counters.loss_probes += 1;
        net_debug!("tcp: loss probe sent, snd_nxt {}", self.conn.send.next);
        self.xmit_timer = XmitTimer::Idle;
        self.rearm_rto(now);
    }

    /// The zero window probe timer expired.
    pub(crate) fn probe_timer(&mut self, now: Instant) -> Result<()> {
        if self.queue.packets_out() > 0 || self.queue.write_is_empty() {
            self.conn.probes_out = 0;
            return Ok(());
        }
        if self.conn.probes_out >= self.config.retries2 {
            net_debug!("tcp: peer window stayed closed for {} probes", self.conn.probes_out);
            self.counters.timeouts += 1;
            return self.fail(Error::TimedOut);
        }
        self.send_probe0(now)
    }

    /// Probe the peer's window and schedule the next probe with backoff.
    fn send_probe0(&mut self, now: Instant) -> Result<()> {
        let sent = self.write_wakeup(now);
        if self.queue.packets_out() > 0 || self.queue.write_is_empty() {
            self.conn.probes_out = 0;
            self.conn.backoff = 0;
            return Ok(());
        }

        self.conn.probes_out += 1;
        let timeout = match sent {
            Ok(()) => {
                self.counters.zero_window_probes += 1;
                if self.conn.backoff < self.config.retries2 {
                    self.conn.backoff += 1;
                }
                self.conn.probe0_when(&self.config)
            }
            Err(err) if err.is_fatal() => return self.fail(err),
            Err(_) => RESOURCE_PROBE_INTERVAL,
        };
        self.set_xmit_timer(XmitTimer::ZeroWindowProbeArmed(now + timeout));
        Ok(())
    }

    /// An acknowledgement arrived while nothing was outstanding.
    ///
    /// Stops probing if the window opened far enough for the next segment, otherwise keeps the
    /// probe timer running.
    pub(crate) fn ack_probe(&mut self, now: Instant) {
        let end = match self.queue.write_head() {
            Some(seg) => seg.end_seq(),
            None => return,
        };
        if !end.after(self.conn.window_end()) {
            self.conn.backoff = 0;
            if let XmitTimer::ZeroWindowProbeArmed(_) = self.xmit_timer {
                self.set_xmit_timer(XmitTimer::Idle);
            }
        } else {
            let when = now + self.conn.probe0_when(&self.config);
            self.set_xmit_timer(XmitTimer::ZeroWindowProbeArmed(when));
        }
    }
}
