//! Segments without user data and the connection lifecycle around them.
//!
//! Handshake segments, FIN, RST, pure and delayed acknowledgements, window probes and keepalives.
//! Also the selection of the window we advertise, which every outgoing segment carries.
use bytes::Bytes;

use crate::layer::{Error, Result};
use crate::nic::{OutSegment, Transmit};
use crate::time::Instant;
use crate::wire::{Flags, Options, Repr, SeqNumber, Timestamps};

use super::congestion::CongestionControl;
use super::connection::{State, SynRequest};
use super::decision::{Nagle, PushOne};
use super::engine::Engine;
use super::retransmit::RESOURCE_PROBE_INTERVAL;
use super::segment::SegmentHandle;
use super::timer::{TimerPurpose, Timers};
use super::window::{Space, ZeroWindow, DEFAULT_MSS, MAX_WINDOW_SCALE};

impl<T: Transmit, C: CongestionControl, S: Timers> Engine<T, C, S> {
    /// The MSS we announce in our SYN.
    pub(crate) fn advertised_mss(&self) -> u16 {
        self.conn.recv.advertised_mss.min(u32::from(u16::max_value())) as u16
    }

    /// The options of an active open.
    pub(crate) fn syn_options(&self, now: Instant) -> Options {
        let timestamps = if self.config.timestamps {
            Some(Timestamps { value: now.tcp_timestamp(), echo: 0 })
        } else {
            None
        };
        let window_scale = if self.config.window_scaling {
            Some(self.conn.recv.window.wscale)
        } else {
            None
        };
        Options {
            mss: Some(self.advertised_mss()),
            window_scale,
            timestamps,
            sack_permitted: self.config.sack,
            sack_ranges: [None; 3],
            fast_open: self.config.fast_open,
        }
    }

    /// Queue our SYN.
    pub(crate) fn build_syn(&mut self, options: Options) -> Result<SegmentHandle> {
        let handle = self.queue.enqueue(Bytes::new(), Flags::SYN)?;
        if let Some(seg) = self.queue.unsent_mut(handle) {
            seg.syn_options = Some(options);
        }
        Ok(handle)
    }

    /// Record the peer's SYN and queue our SYN-ACK.
    pub(crate) fn build_synack(&mut self, request: &SynRequest, options: Options)
        -> Result<SegmentHandle>
    {
        self.conn.recv.initial_seq = request.seq;
        self.conn.recv.next = request.seq + 1;
        self.conn.recv.window.wup = self.conn.recv.next;
        self.build_syn(options)
    }

    /// Send the SYN or SYN-ACK at the head of the write queue.
    ///
    /// A transient failure still counts as sent, the retransmission timer will try again.
    pub(crate) fn send_control_head(&mut self, handle: SegmentHandle, now: Instant) -> Result<()> {
        let mss = self.current_mss();
        self.queue.set_tso_segs(handle, mss)?;
        match self.transmit_segment(handle, now) {
            Ok(()) => (),
            Err(err) if err.is_fatal() => return self.fail(err),
            Err(err) if err.is_transient() => {
                net_debug!("tcp: handshake segment {} deferred: {}", handle.seq(), err);
            }
            Err(err) => return Err(err),
        }
        self.on_new_data_sent(handle, now)
    }

    /// Take over what the peer announced in its SYN.
    pub(crate) fn negotiate(&mut self, peer: &Options, window: u16) {
        self.conn.sack_ok = self.config.sack && peer.sack_permitted;
        self.conn.timestamps_ok = self.config.timestamps && peer.timestamps.is_some();
        if let (true, Some(ts)) = (self.conn.timestamps_ok, peer.timestamps) {
            self.conn.recv.ts_recent = ts.value;
        }

        match peer.window_scale {
            Some(shift) if self.config.window_scaling => {
                self.conn.send.window_scale = shift.min(MAX_WINDOW_SCALE);
            }
            _ => {
                // Scaling is only in effect if both sides announce it.
                let recv = &mut self.conn.recv.window;
                self.conn.send.window_scale = 0;
                recv.wscale = 0;
                recv.clamp = recv.clamp.min(65535);
                recv.ssthresh = recv.ssthresh.min(65535);
                recv.wnd = recv.wnd.min(65535);
            }
        }

        self.conn.mss.mss_clamp = peer.mss.map_or(DEFAULT_MSS, u32::from);
        self.conn.mss.options_len = if self.conn.timestamps_ok {
            Options::TIMESTAMPS_LEN as u32
        } else {
            0
        };
        self.conn.send.window = u32::from(window);
        self.conn.mss.max_window = u32::from(window);
        let mss = self.sync_mss();
        net_debug!("tcp: negotiated mss {}, sack {}, timestamps {}, wscale {}/{}",
            mss, self.conn.sack_ok, self.conn.timestamps_ok,
            self.conn.send.window_scale, self.conn.recv.window.wscale);
    }

    /// Move to `Established` and start the transfer.
    pub(crate) fn establish(&mut self, now: Instant) {
        self.conn.change_state(State::Established);
        self.conn.lsndtime = now;
        self.conn.rcv_tstamp = now;
        self.conn.cwnd_usage.stamp = now;
        self.conn.mtu_probe = self.conn.mss.init_probe(&self.config, now);
        self.sync_mss();
        if let Some(keepalive) = self.config.keepalive {
            self.timers.arm(now + keepalive.idle, TimerPurpose::Keepalive);
        }
    }

    /// Queue a FIN behind all data and push it out.
    pub(crate) fn send_fin(&mut self, now: Instant) -> Result<()> {
        if self.queue.mark_tail(Flags::FIN).is_none() {
            self.queue.enqueue_fin()?;
        }
        self.xmit(self.nonagle() | Nagle::OFF, PushOne::No, now).map(|_| ())
    }

    /// Send a segment without payload that is never queued.
    fn transmit_control(&mut self, seq: SeqNumber, flags: Flags, now: Instant) -> Result<()> {
        let window_len = self.select_window();
        let repr = Repr {
            src_port: self.ports.local,
            dst_port: self.ports.remote,
            flags,
            seq_number: seq,
            ack_number: if flags.ack() { Some(self.conn.recv.next) } else { None },
            window_len,
            urgent_at: 0,
            options: Options {
                timestamps: self.conn.timestamps(now),
                ..Options::default()
            },
        };
        net_trace!("tcp: xmit {}", repr);
        self.transport.transmit(OutSegment { repr, payload: Bytes::new(), gso_size: None })?;
        self.counters.segments_sent += 1;
        if flags.ack() {
            self.on_ack_sent();
        }
        Ok(())
    }

    /// Reset the connection.
    pub(crate) fn send_reset(&mut self, now: Instant) -> Result<()> {
        let seq = self.conn.acceptable_seq();
        self.transmit_control(seq, Flags::RST | Flags::ACK, now)
    }

    /// Acknowledge everything received so far, now.
    ///
    /// Falls back to a delayed acknowledgement when the transport has no room.
    pub(crate) fn send_pure_ack(&mut self, now: Instant) -> Result<()> {
        let seq = self.conn.acceptable_seq();
        match self.transmit_control(seq, Flags::ACK, now) {
            Ok(()) => Ok(()),
            Err(err) if err.is_fatal() => self.fail(err),
            Err(err) if err.is_transient() => {
                let when = now + self.config.delack_max;
                self.conn.delack.ato = self.config.delack_min;
                self.conn.delack.deadline = Some(when);
                self.timers.arm(when, TimerPurpose::DelayedAck);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// An acknowledgement with an old sequence number that makes the peer answer with its
    /// current window.
    pub(crate) fn send_window_probe(&mut self, now: Instant) -> Result<()> {
        let seq = self.conn.send.unacked - 1;
        self.transmit_control(seq, Flags::ACK, now)
    }

    /// Elicit a response from the peer.
    ///
    /// Sends new data if some fits into the window, in a segment of at most one MSS. Otherwise
    /// sends a window probe.
    pub(crate) fn write_wakeup(&mut self, now: Instant) -> Result<()> {
        if self.conn.current == State::Closed {
            return Err(Error::Closed);
        }
        let end = self.conn.window_end();
        let head = self.queue.write_head()
            .filter(|seg| seg.seq().before(end))
            .map(|seg| (seg.handle(), seg.seq(), seg.sequence_len(), seg.len() as u32));
        let (handle, seq, sequence_len, len) = match head {
            Some(head) => head,
            None => {
                let una = self.conn.send.unacked;
                if self.conn.send.urgent.in_range(una + 1, una + 0x10000) {
                    self.transmit_control(una, Flags::ACK, now)?;
                }
                return self.send_window_probe(now);
            }
        };

        let mss = self.current_mss();
        let seg_size = end - seq;
        if seg_size < sequence_len || len > mss {
            let size = seg_size.min(mss);
            if let Some(seg) = self.queue.unsent_mut(handle) {
                seg.flags.insert(Flags::PSH);
            }
            if size < len {
                self.queue.fragment(handle, size as usize)?;
            }
        }
        self.queue.set_tso_segs(handle, mss)?;
        if let Some(seg) = self.queue.unsent_mut(handle) {
            seg.flags.insert(Flags::PSH);
        }
        self.transmit_segment(handle, now)?;
        self.on_new_data_sent(handle, now)
    }

    /// Adapt the delayed acknowledgement timeout to the arrival pattern of data.
    pub(crate) fn adapt_ato(&mut self, now: Instant) {
        let min = self.config.delack_min;
        let delack = &mut self.conn.delack;
        match delack.last_received {
            None => delack.ato = min,
            Some(last) => {
                let gap = now.saturating_since(last);
                if gap <= min / 2 {
                    delack.ato = delack.ato / 2 + min / 2;
                } else if gap < delack.ato {
                    delack.ato = (delack.ato / 2 + gap).min(self.conn.rto.get());
                }
            }
        }
        delack.last_received = Some(now);
    }

    /// Acknowledge received data after a delay, unless something else carries the
    /// acknowledgement first.
    pub(crate) fn schedule_delayed_ack(&mut self, now: Instant) -> Result<()> {
        let min = self.config.delack_min;
        let mut ato = self.conn.delack.ato;
        if ato > min {
            let mut max_ato = self.config.delack_max;
            if let Some(srtt) = self.conn.rtt.srtt() {
                max_ato = max_ato.min(srtt.max(min));
            }
            ato = ato.min(max_ato);
        }

        let mut deadline = now + ato;
        if let Some(pending) = self.conn.delack.deadline {
            if pending <= now + ato / 4 {
                return self.send_pure_ack(now);
            }
            if deadline >= pending {
                deadline = pending;
            }
        }
        self.conn.delack.deadline = Some(deadline);
        self.timers.arm(deadline, TimerPurpose::DelayedAck);
        Ok(())
    }

    /// The delayed acknowledgement timer expired.
    pub(crate) fn delack_timer(&mut self, now: Instant) -> Result<()> {
        let deadline = match self.conn.delack.deadline {
            Some(deadline) => deadline,
            None => return Ok(()),
        };
        if deadline > now {
            self.timers.arm(deadline, TimerPurpose::DelayedAck);
            return Ok(());
        }
        self.conn.delack.deadline = None;
        self.conn.delack.ato = (self.conn.delack.ato * 2).min(self.conn.rto.get());
        self.counters.delayed_acks += 1;
        self.send_pure_ack(now)
    }

    /// The keepalive timer expired.
    pub(crate) fn keepalive_timer(&mut self, now: Instant) -> Result<()> {
        let keepalive = match self.config.keepalive {
            Some(keepalive) => keepalive,
            None => return Ok(()),
        };
        match self.conn.current {
            State::Established | State::CloseWait => (),
            _ => return Ok(()),
        }

        let next = if self.queue.packets_out() > 0 || !self.queue.write_is_empty() {
            keepalive.idle
        } else {
            let last_heard = match self.conn.delack.last_received {
                Some(last) => last.max(self.conn.rcv_tstamp),
                None => self.conn.rcv_tstamp,
            };
            let elapsed = now.saturating_since(last_heard);
            if elapsed < keepalive.idle {
                keepalive.idle - elapsed
            } else if self.conn.probes_out >= keepalive.probes {
                net_debug!("tcp: no answer to {} keepalive probes", self.conn.probes_out);
                self.counters.timeouts += 1;
                if let Err(err) = self.send_reset(now) {
                    net_debug!("tcp: reset after keepalive timeout not sent: {}", err);
                    if err.is_fatal() {
                        return self.fail(err);
                    }
                }
                return self.fail(Error::TimedOut);
            } else {
                match self.write_wakeup(now) {
                    Ok(()) => {
                        self.conn.probes_out += 1;
                        self.counters.keepalive_probes += 1;
                        keepalive.interval
                    }
                    Err(err) if err.is_fatal() => return self.fail(err),
                    Err(_) => RESOURCE_PROBE_INTERVAL,
                }
            }
        };
        self.timers.arm(now + next, TimerPurpose::Keepalive);
        Ok(())
    }

    /// Choose the window to advertise in the next segment.
    pub(crate) fn select_window(&mut self) -> u16 {
        let space = Space {
            free: self.conn.recv.free_space,
            allowed: self.conn.recv.full_space,
            mss: self.conn.recv.mss,
            advmss: self.conn.recv.advertised_mss,
            under_pressure: self.conn.recv.under_pressure,
        };
        let rcv_nxt = self.conn.recv.next;
        let selection = self.conn.recv.window.select(rcv_nxt, space);
        if selection.wanted_zero {
            self.counters.want_zero_window += 1;
        }
        match selection.transition {
            Some(ZeroWindow::Closed) => {
                net_debug!("tcp: advertising a zero window at {}", rcv_nxt);
                self.counters.to_zero_window += 1;
            }
            Some(ZeroWindow::Opened) => self.counters.from_zero_window += 1,
            None => (),
        }
        selection.field
    }
}
