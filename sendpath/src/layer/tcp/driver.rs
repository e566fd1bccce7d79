//! The loop that moves segments from the write queue to the transport.
//!
//! Also home of everything updated as a side effect of sending: the pacing rate, congestion
//! window validation and the path MTU probe.
use crate::layer::{Error, Result};
use crate::nic::{OutSegment, Transmit};
use crate::time::{Duration, Instant};
use crate::wire::{Flags, Options, Repr};

use super::congestion::CongestionControl;
use super::connection::{CaState, State};
use super::decision::{Nagle, PushOne, Verdict};
use super::engine::Engine;
use super::segment::{Segment, SegmentHandle};
use super::timer::{TimerPurpose, Timers, XmitTimer};
use super::window::{NET_HEADER_LEN, TCP_HEADER_LEN};

/// What a write pass achieved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum XmitOutcome {
    /// This many TSO segments were handed to the transport.
    Sent(u32),
    /// Nothing was sent, there was nothing to send or an acknowledgement will restart sending.
    Idle,
    /// Nothing was sent although data is queued and nothing is outstanding.
    ///
    /// Without outstanding data no acknowledgement will arrive to restart sending. The engine
    /// arms the zero window probe timer in this case.
    Stalled,
}

/// The outcome of trying to send a path MTU probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Probe {
    /// No probe now, send normally.
    NotProbing,
    /// A probe should be sent but can not be yet, send nothing.
    Wait,
    /// The probe is on its way.
    Sent,
}

impl<T: Transmit, C: CongestionControl, S: Timers> Engine<T, C, S> {
    /// Send segments from the head of the write queue until a gate says no.
    pub(crate) fn write_xmit(&mut self, mss: u32, nonagle: Nagle, push_one: PushOne, now: Instant)
        -> Result<XmitOutcome>
    {
        let mut sent = 0;
        let mut is_cwnd_limited = false;

        if push_one == PushOne::No {
            match self.mtu_probe(now)? {
                Probe::NotProbing => (),
                Probe::Wait => return Ok(XmitOutcome::Idle),
                Probe::Sent => sent = 1,
            }
        }

        let max_segs = self.tso_segs(mss);
        while let Some(handle) = self.queue.pop_next_sendable() {
            self.queue.set_tso_segs(handle, mss)?;
            let verdict = match self.queue.get(handle) {
                Some(seg) => self.decide(seg, mss, max_segs, nonagle, push_one, now),
                None => break,
            };

            let limit = match verdict {
                Verdict::SendNow(limit) => limit,
                Verdict::DeferPacing => {
                    if let Some(next) = self.conn.pacing.next_send {
                        self.timers.arm(next, TimerPurpose::Pacing);
                    }
                    break;
                }
                Verdict::DeferCwnd => {
                    is_cwnd_limited = true;
                    break;
                }
                Verdict::DeferNagle => {
                    self.counters.nagle_deferred += 1;
                    break;
                }
                Verdict::DeferSmallQueue => {
                    if !self.conn.tsq_throttled {
                        self.counters.tsq_throttled += 1;
                    }
                    self.conn.tsq_throttled = true;
                    break;
                }
                Verdict::DeferWindow | Verdict::DeferTso => break,
            };

            let (len, sequence_len) = match self.queue.get(handle) {
                Some(seg) => (seg.len(), seg.sequence_len()),
                None => break,
            };
            invariant!(sequence_len != 0, "empty segment at the head of the write queue");
            if limit == 0 && len > 0 {
                break;
            }
            if len > limit as usize {
                match self.queue.fragment(handle, limit as usize) {
                    Ok(_) => { self.queue.set_tso_segs(handle, mss)?; }
                    Err(Error::OutOfMemory) => break,
                    Err(err) => return Err(err),
                }
            }

            match self.transmit_segment(handle, now) {
                Ok(()) => (),
                Err(err) if err.is_transient() => {
                    net_trace!("tcp: transmit of {} deferred: {}", handle.seq(), err);
                    if err == Error::Congested {
                        self.enter_cwr();
                    }
                    break;
                }
                Err(err) => return Err(err),
            }

            let (len, pcount, end) = match self.queue.get(handle) {
                Some(seg) => (seg.len() as u32, seg.tso_segs(), seg.end_seq()),
                None => break,
            };
            self.on_new_data_sent(handle, now)?;
            if len < pcount.saturating_mul(mss) {
                self.conn.send.small_end = end;
            }
            self.schedule_pacing(len, now);
            sent += pcount;

            if push_one != PushOne::No {
                break;
            }
        }

        is_cwnd_limited |= self.queue.in_flight() >= self.cc.current_window();
        if sent > 0 || is_cwnd_limited {
            self.cwnd_validate(is_cwnd_limited, now);
        }
        if sent > 0 {
            if push_one != PushOne::LossProbe {
                self.schedule_loss_probe(now, false);
            }
            return Ok(XmitOutcome::Sent(sent));
        }
        if self.queue.packets_out() == 0 && !self.queue.write_is_empty() {
            Ok(XmitOutcome::Stalled)
        } else {
            Ok(XmitOutcome::Idle)
        }
    }

    /// Build the header for a queued segment and hand it to the transport.
    ///
    /// Does not move the segment between queues, the caller decides whether this was a first
    /// transmission or a retransmission.
    pub(crate) fn transmit_segment(&mut self, handle: SegmentHandle, now: Instant) -> Result<()> {
        let is_syn = self.queue.get(handle).ok_or(Error::UnknownSegment)?.flags().syn();
        // The window in a SYN is never scaled.
        let window_len = if is_syn {
            self.conn.recv.window.wnd.min(u32::from(u16::max_value())) as u16
        } else {
            self.select_window()
        };

        let seg = self.queue.get(handle).ok_or(Error::UnknownSegment)?;
        let mut flags = seg.flags();
        if !(is_syn && self.conn.current == State::SynSent) {
            flags |= Flags::ACK;
        }

        let options = match seg.syn_options() {
            Some(syn) if is_syn => {
                let mut options = *syn;
                if let Some(ts) = options.timestamps.as_mut() {
                    ts.value = now.tcp_timestamp();
                }
                options
            }
            _ => Options {
                timestamps: self.conn.timestamps(now),
                ..Options::default()
            },
        };

        let mut urgent_at = 0;
        let send = &self.conn.send;
        if self.conn.urgent_mode() && seg.seq().before(send.urgent) {
            if send.urgent.before(seg.seq() + 0x10000) {
                urgent_at = (send.urgent - seg.seq()) as u16;
                flags |= Flags::URG;
            } else if (seg.seq() + 0xFFFF).after(send.next) {
                urgent_at = 0xFFFF;
                flags |= Flags::URG;
            }
        }

        let repr = Repr {
            src_port: self.ports.local,
            dst_port: self.ports.remote,
            flags,
            seq_number: seg.seq(),
            ack_number: if flags.ack() { Some(self.conn.recv.next) } else { None },
            window_len,
            urgent_at,
            options,
        };
        let len = seg.len();
        let out = OutSegment {
            repr,
            payload: seg.payload().clone(),
            gso_size: seg.gso_size(),
        };
        net_trace!("tcp: xmit {}", out.repr);
        self.transport.transmit(out)?;

        self.counters.segments_sent += 1;
        self.counters.bytes_sent += len as u64;
        self.conn.host_queued = self.conn.host_queued.saturating_add(len as u32);
        self.conn.last_xmit = Some(now);
        if len > 0 {
            self.conn.lsndtime = now;
        }
        if flags.ack() {
            self.on_ack_sent();
        }
        Ok(())
    }

    /// Account for the first transmission of the head of the write queue.
    pub(crate) fn on_new_data_sent(&mut self, handle: SegmentHandle, now: Instant) -> Result<()> {
        let prior_packets = self.queue.packets_out();
        let end = self.queue.get(handle).map(Segment::end_seq).ok_or(Error::UnknownSegment)?;
        self.queue.mark_sent(handle, now)?;
        if end.after(self.conn.send.next) {
            self.conn.send.next = end;
        }
        self.cc.on_packet_sent(self.queue.in_flight(), now);

        let tlp_armed = match self.xmit_timer {
            XmitTimer::LossProbeArmed(_) => true,
            _ => false,
        };
        if prior_packets == 0 || tlp_armed {
            self.rearm_rto(now);
        }
        Ok(())
    }

    /// Any segment carrying an acknowledgement makes a pending delayed one moot.
    pub(crate) fn on_ack_sent(&mut self) {
        if self.conn.delack.deadline.take().is_some() {
            self.timers.cancel(TimerPurpose::DelayedAck);
        }
    }

    /// Advance the earliest departure time by the transmission time of `len` bytes.
    fn schedule_pacing(&mut self, len: u32, now: Instant) {
        if !self.config.pacing {
            return;
        }
        let rate = match self.conn.pacing.rate {
            Some(rate) if rate > 0 => rate,
            _ => return,
        };
        let base = self.conn.pacing.next_send.map_or(now, |next| next.max(now));
        let gap = Duration::from_micros(u64::from(len) * 1_000_000 / rate);
        self.conn.pacing.next_send = Some(base + gap);
    }

    /// Recompute the pacing rate from window and round trip time.
    ///
    /// Twice the current rate in slow start, and 1.2 times during congestion avoidance, with the
    /// default ratios.
    pub(crate) fn update_pacing_rate(&mut self) {
        let srtt = match self.conn.rtt.srtt() {
            Some(srtt) if srtt.as_micros() > 0 => srtt.as_micros() as u64,
            _ => return,
        };
        let cwnd = self.cc.current_window();
        let ratio = if cwnd < self.cc.current_ssthresh() / 2 {
            self.config.pacing_ss_ratio
        } else {
            self.config.pacing_ca_ratio
        };
        let rate = u64::from(self.current_mss())
            .saturating_mul(u64::from(ratio))
            .saturating_mul(u64::from(cwnd.max(self.queue.packets_out())))
            .saturating_mul(10_000)
            / srtt;
        self.conn.pacing.rate = Some(rate);
    }

    /// The slow start threshold, or three quarters of the window if that is larger.
    ///
    /// Remembers the previous operating point before a window reduction.
    pub(crate) fn current_ssthresh(&self) -> u32 {
        let ssthresh = self.cc.current_ssthresh();
        if self.conn.ca_state == CaState::Cwr {
            return ssthresh;
        }
        let cwnd = self.cc.current_window();
        ssthresh.max((cwnd >> 1) + (cwnd >> 2))
    }

    /// Whether the window was fully used recently.
    pub(crate) fn is_cwnd_limited(&self) -> bool {
        let cwnd = self.cc.current_window();
        if cwnd < self.cc.current_ssthresh() {
            return cwnd < self.conn.cwnd_usage.max_packets_out.saturating_mul(2);
        }
        self.conn.cwnd_usage.is_cwnd_limited
    }

    /// Track window usage and decay a window the application did not use for a timeout.
    pub(crate) fn cwnd_validate(&mut self, is_cwnd_limited: bool, now: Instant) {
        let packets_out = self.queue.packets_out();
        let usage = &mut self.conn.cwnd_usage;
        if !self.conn.send.unacked.before(usage.max_packets_seq)
            || packets_out > usage.max_packets_out
            || is_cwnd_limited
        {
            usage.max_packets_out = packets_out;
            usage.max_packets_seq = self.conn.send.next;
            usage.is_cwnd_limited = is_cwnd_limited;
        }

        if self.is_cwnd_limited() {
            self.conn.cwnd_usage.used = 0;
            self.conn.cwnd_usage.stamp = now;
            return;
        }

        let usage = &mut self.conn.cwnd_usage;
        usage.used = usage.used.max(packets_out);
        let idle = now.saturating_since(usage.stamp);
        if self.config.slow_start_after_idle && idle >= self.conn.rto.get() {
            self.cwnd_application_limited(now);
        }
    }

    /// Shrink the window towards what was actually used.
    fn cwnd_application_limited(&mut self, now: Instant) {
        if self.conn.ca_state == CaState::Open {
            let cwnd = self.cc.current_window();
            let win_used = self.conn.cwnd_usage.used.max(self.config.initial_cwnd);
            if win_used < cwnd {
                let ssthresh = self.current_ssthresh();
                net_trace!("tcp: application limited, window {} -> {}", cwnd, (cwnd + win_used) >> 1);
                self.cc.set_window((cwnd + win_used) >> 1, ssthresh);
            }
            self.conn.cwnd_usage.used = 0;
        }
        self.conn.cwnd_usage.stamp = now;
    }

    /// Halve the window in response to local congestion.
    pub(crate) fn enter_cwr(&mut self) {
        if self.conn.ca_state != CaState::Open {
            return;
        }
        let cwnd = self.cc.current_window();
        let ssthresh = (cwnd >> 1).max(2);
        net_debug!("tcp: local congestion, window {} -> {}", cwnd, ssthresh.min(cwnd));
        self.cc.set_window(ssthresh.min(cwnd), ssthresh);
        self.conn.ca_state = CaState::Cwr;
        self.conn.high_seq = self.conn.send.next;
    }

    /// Arm the zero window probe timer when nothing else will restart sending.
    pub(crate) fn check_probe_timer(&mut self, now: Instant) {
        if self.queue.packets_out() == 0 && !self.xmit_timer.is_armed() {
            let when = now + self.conn.probe0_base(&self.config);
            self.set_xmit_timer(XmitTimer::ZeroWindowProbeArmed(when));
        }
    }

    /// Try to send a segment larger than the current MSS to discover a larger path MTU.
    fn mtu_probe(&mut self, now: Instant) -> Result<Probe> {
        let probe = self.conn.mtu_probe;
        if !probe.enabled
            || probe.in_flight()
            || self.conn.ca_state != CaState::Open
            || self.cc.current_window() < 11
        {
            return Ok(Probe::NotProbing);
        }

        let mss = self.current_mss();
        let probe_size = self.conn.mss.mtu_to_mss((probe.search_high + probe.search_low) / 2);
        let interval = probe.search_high.saturating_sub(probe.search_low);
        if probe_size > self.conn.mss.mtu_to_mss(probe.search_high)
            || interval < self.config.mtu_probe_threshold
        {
            self.mtu_check_reprobe(now);
            return Ok(Probe::NotProbing);
        }

        let size_needed = probe_size + 4 * mss;
        if self.queue.write_seq() - self.conn.send.next < size_needed {
            return Ok(Probe::NotProbing);
        }
        if self.conn.send.window < size_needed {
            return Ok(Probe::NotProbing);
        }
        if (self.conn.send.next + size_needed).after(self.conn.window_end()) {
            return Ok(Probe::Wait);
        }
        let in_flight = self.queue.in_flight();
        if in_flight + 2 > self.cc.current_window() {
            return Ok(if in_flight == 0 { Probe::NotProbing } else { Probe::Wait });
        }

        let handle = match self.queue.coalesce_head(probe_size as usize) {
            Ok(handle) => handle,
            Err(err) => {
                net_trace!("tcp: no mtu probe of {} bytes: {}", probe_size, err);
                return Ok(Probe::NotProbing);
            }
        };
        // Sent as one wire segment.
        self.queue.set_tso_segs(handle, probe_size)?;
        match self.transmit_segment(handle, now) {
            Ok(()) => (),
            Err(err) if err.is_fatal() => return Err(err),
            Err(_) => return Ok(Probe::NotProbing),
        }

        let cwnd = self.cc.current_window();
        let ssthresh = self.cc.current_ssthresh();
        self.cc.set_window(cwnd - 1, ssthresh);
        let (len, seq, end) = match self.queue.get(handle) {
            Some(seg) => (seg.len() as u32, seg.seq(), seg.end_seq()),
            None => return Err(Error::UnknownSegment),
        };
        self.conn.mtu_probe.probe_size = self.conn.mss.mss_to_mtu(len);
        self.conn.mtu_probe.probe_seq = Some((seq, end));
        self.counters.mtu_probes += 1;
        net_debug!("tcp: mtu probe of {} at {}", self.conn.mtu_probe.probe_size, seq);
        self.on_new_data_sent(handle, now)?;
        Ok(Probe::Sent)
    }

    /// Restart the search from the current MSS after a quiet interval.
    fn mtu_check_reprobe(&mut self, now: Instant) {
        let probe = &mut self.conn.mtu_probe;
        if now.saturating_since(probe.probe_timestamp) < self.config.mtu_probe_interval {
            return;
        }
        let mss = self.conn.mss.cache;
        probe.probe_size = 0;
        probe.search_high = self.conn.mss.mss_clamp
            .saturating_add(TCP_HEADER_LEN + NET_HEADER_LEN)
            .min(self.conn.mss.pmtu);
        probe.search_low = self.conn.mss.mss_to_mtu(mss);
        probe.probe_timestamp = now;
        net_debug!("tcp: mtu search restarts in [{}, {}]", probe.search_low, probe.search_high);
    }

    /// The probe was acknowledged, the path carries at least its size.
    pub(crate) fn mtu_probe_success(&mut self, now: Instant) {
        let probe_size = self.conn.mtu_probe.probe_size;
        if probe_size == 0 {
            return;
        }
        let ssthresh = self.current_ssthresh();
        let cwnd = self.cc.current_window();
        let scaled = u64::from(cwnd) * u64::from(self.conn.mss.mss_to_mtu(self.current_mss()))
            / u64::from(probe_size);
        self.cc.set_window(scaled as u32, ssthresh);
        self.conn.cwnd_usage.stamp = now;

        let probe = &mut self.conn.mtu_probe;
        probe.search_low = probe_size;
        probe.probe_size = 0;
        probe.probe_seq = None;
        self.counters.mtu_probe_success += 1;
        let mss = self.sync_mss();
        net_debug!("tcp: mtu probe of {} succeeded, mss {}", probe_size, mss);
    }
}
