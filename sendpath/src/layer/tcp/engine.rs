use bytes::Bytes;

use crate::layer::{Error, Result};
use crate::nic::Transmit;
use crate::storage::MemoryBudget;
use crate::time::{Duration, Instant};
use crate::wire::{Flags, Options, SeqNumber};

use super::config::Config;
use super::congestion::{AckEvent, CongestionControl};
use super::connection::{CaState, Connection, Incoming, Ports, State, SynRequest};
use super::counters::Counters;
use super::decision::{Nagle, PushOne};
use super::driver::XmitOutcome;
use super::queue::SegmentQueue;
use super::timer::{TimerPurpose, Timers, XmitTimer};
use super::window;

/// The send engine of one connection.
///
/// Owns the connection state and the segment queue, and borrows nothing. The transport, the
/// congestion control algorithm and the timer service are plugged in as type parameters. Every
/// entry point takes the current time, hands zero or more segments to the transport and returns.
///
/// Errors returned from entry points follow the classes of [`Error`]. A fatal error has already
/// torn the connection down when it is returned.
///
/// [`Error`]: ../enum.Error.html
pub struct Engine<T, C, S> {
    pub(crate) conn: Connection,
    pub(crate) queue: SegmentQueue,
    pub(crate) config: Config,
    pub(crate) counters: Counters,
    pub(crate) ports: Ports,
    pub(crate) transport: T,
    pub(crate) cc: C,
    pub(crate) timers: S,
    pub(crate) xmit_timer: XmitTimer,
}

impl<T: Transmit, C: CongestionControl, S: Timers> Engine<T, C, S> {
    /// A closed connection that will use `iss` as its initial sequence number.
    ///
    /// Segment memory is charged against `budget`, which may be shared with other connections.
    pub fn new(
        config: Config,
        ports: Ports,
        iss: SeqNumber,
        budget: MemoryBudget,
        transport: T,
        cc: C,
        timers: S,
    ) -> Self {
        let conn = Connection::new(iss, &config, Instant::default());
        Engine {
            conn,
            queue: SegmentQueue::new(budget, iss),
            config,
            counters: Counters::default(),
            ports,
            transport,
            cc,
            timers,
            xmit_timer: XmitTimer::Idle,
        }
    }

    /// Open the connection actively by sending a SYN.
    pub fn connect(&mut self, now: Instant) -> Result<()> {
        if self.conn.current != State::Closed || !self.queue.rtx_is_empty() {
            return Err(Error::Illegal);
        }
        let options = self.syn_options(now);
        let handle = self.build_syn(options)?;
        self.conn.change_state(State::SynSent);
        self.conn.retrans_stamp = Some(now);
        self.send_control_head(handle, now)
    }

    /// Answer a peer's SYN with a SYN-ACK.
    pub fn accept(&mut self, request: SynRequest, now: Instant) -> Result<()> {
        if self.conn.current != State::Closed || !self.queue.rtx_is_empty() {
            return Err(Error::Illegal);
        }
        self.negotiate(&request.options, request.window);
        let mut options = Options {
            mss: Some(self.advertised_mss()),
            sack_permitted: self.conn.sack_ok,
            timestamps: self.conn.timestamps(now),
            ..Options::default()
        };
        if self.config.window_scaling && request.options.window_scale.is_some() {
            options.window_scale = Some(self.conn.recv.window.wscale);
        }
        let handle = self.build_synack(&request, options)?;
        self.conn.change_state(State::SynReceived);
        self.conn.retrans_stamp = Some(now);
        self.send_control_head(handle, now)
    }

    /// The peer answered our SYN.
    ///
    /// Negotiates the options, moves to `Established`, acknowledges the SYN-ACK and sends
    /// whatever was queued in the meantime.
    pub fn on_syn_ack(
        &mut self,
        seq: SeqNumber,
        ack: SeqNumber,
        window: u16,
        options: &Options,
        now: Instant,
    ) -> Result<()> {
        if self.conn.current != State::SynSent {
            return Err(Error::Illegal);
        }
        if ack != self.conn.send.next {
            net_debug!("tcp: syn-ack acknowledges {} instead of {}", ack, self.conn.send.next);
            return Err(Error::Illegal);
        }

        self.conn.recv.initial_seq = seq;
        self.conn.recv.next = seq + 1;
        self.conn.recv.window.wup = self.conn.recv.next;
        self.negotiate(options, window);

        let acked = self.queue.acknowledge_up_to(ack);
        self.conn.send.unacked = ack;
        let rtt = if acked.had_retransmits {
            None
        } else {
            acked.rtt_sample_from.map(|sent| now.saturating_since(sent))
        };
        if let Some(rtt) = rtt {
            self.conn.rtt.sample(rtt);
        }
        self.conn.set_rto(&self.config);
        self.conn.backoff = 0;
        self.conn.retransmits = 0;
        self.conn.retrans_stamp = None;
        self.conn.rcv_tstamp = now;
        self.conn.ca_state = CaState::Open;
        self.set_xmit_timer(XmitTimer::Idle);

        self.establish(now);
        self.send_pure_ack(now)?;
        self.xmit(self.nonagle(), PushOne::No, now).map(|_| ())
    }

    /// Queue bytes for sending and push what the gates allow.
    ///
    /// Bytes are appended to the unsent tail segment while it stays below the size goal, the
    /// rest is cut into size goal chunks. `flags` may contain `PSH` (no more appends to the tail),
    /// `URG` (the end of this write is urgent) and `FIN` (close after this write).
    ///
    /// Returns the number of bytes taken. Fewer than offered are taken only when the memory
    /// budget runs out part way. Nothing taken at all is reported as `OutOfMemory`.
    pub fn queue_for_send(&mut self, payload: Bytes, flags: Flags, now: Instant) -> Result<usize> {
        match self.conn.current {
            State::Closed => return Err(Error::Closed),
            State::SynSent | State::SynReceived | State::Established | State::CloseWait => (),
            _ => return Err(Error::Illegal),
        }
        if flags.intersects(!(Flags::PSH | Flags::URG | Flags::FIN)) {
            return Err(Error::Illegal);
        }

        self.slow_start_after_idle_check(now);
        let mss = self.current_mss();
        let size_goal = mss.saturating_mul(self.tso_segs(mss)).max(1) as usize;
        let nonagle = self.nonagle();

        let mut copied = self.queue.append(&payload, size_goal)?;
        let mut short = false;
        while copied < payload.len() {
            let take = (payload.len() - copied).min(size_goal);
            match self.queue.enqueue(payload.slice(copied..copied + take), Flags::NONE) {
                Ok(handle) => {
                    copied += take;
                    let is_head = self.queue.pop_next_sendable() == Some(handle);
                    if take == size_goal && is_head {
                        self.xmit(nonagle, PushOne::One, now)?;
                    }
                }
                Err(Error::OutOfMemory) if copied > 0 => {
                    net_debug!("tcp: memory budget exhausted after {} bytes", copied);
                    short = true;
                    break;
                }
                Err(err) => return Err(err),
            }
        }

        if flags.urg() {
            self.conn.send.urgent = self.queue.write_seq();
        }
        if flags.psh() && copied > 0 {
            self.queue.mark_tail(Flags::PSH);
        }
        if flags.fin() && !short {
            self.close(now)?;
            return Ok(copied);
        }
        self.xmit(nonagle, PushOne::No, now)?;
        Ok(copied)
    }

    /// Send whatever the gates allow now.
    pub fn push_now(&mut self, now: Instant) -> Result<XmitOutcome> {
        self.xmit(self.nonagle(), PushOne::No, now)
    }

    /// Switch Nagle's algorithm off (or on again).
    ///
    /// Switching it off pushes pending partial segments right away.
    pub fn set_nodelay(&mut self, nodelay: bool, now: Instant) -> Result<()> {
        self.config.nodelay = nodelay;
        if nodelay {
            self.xmit(self.nonagle() | Nagle::PUSH, PushOne::No, now)?;
        }
        Ok(())
    }

    /// Cork (or uncork) the connection.
    ///
    /// While corked only full segments are sent. Uncorking pushes what is pending.
    pub fn set_cork(&mut self, cork: bool, now: Instant) -> Result<()> {
        self.config.cork = cork;
        if !cork {
            let mut nonagle = self.nonagle();
            if self.config.nodelay {
                nonagle |= Nagle::PUSH;
            }
            self.xmit(nonagle, PushOne::No, now)?;
        }
        Ok(())
    }

    /// The path MTU changed.
    ///
    /// A smaller MTU immediately resends outstanding segments that no longer fit.
    pub fn set_path_mtu(&mut self, mtu: u32, now: Instant) -> Result<()> {
        let before = self.conn.mss.cache;
        self.conn.mss.sync(mtu, &mut self.conn.mtu_probe);
        net_debug!("tcp: path mtu {}, mss {} -> {}", mtu, before, self.conn.mss.cache);
        if self.conn.mss.cache < before && self.conn.current.is_synchronized() {
            self.simple_retransmit(now)?;
        }
        Ok(())
    }

    /// Process the acknowledgement part of an incoming segment.
    ///
    /// `window` is the unscaled header field. Acknowledgements of unsent data and old duplicates
    /// are ignored.
    pub fn on_ack_received(
        &mut self,
        ack: SeqNumber,
        window: u16,
        options: &Options,
        now: Instant,
    ) -> Result<()> {
        match self.conn.current {
            State::Closed => return Err(Error::Closed),
            State::SynSent => return Err(Error::Illegal),
            _ => (),
        }
        let prior_una = self.conn.send.unacked;
        if ack.after(self.conn.send.next) {
            net_debug!("tcp: ack {} for unsent data, snd_nxt {}", ack, self.conn.send.next);
            return Ok(());
        }
        if ack.before(prior_una) {
            net_trace!("tcp: old ack {}", ack);
            return Ok(());
        }

        let prior_packets = self.queue.packets_out();
        let prior_in_flight = self.queue.in_flight();
        self.conn.rcv_tstamp = now;
        self.conn.probes_out = 0;
        self.update_window(window);

        if self.conn.sack_ok {
            for &(start, end) in options.sack_ranges.iter().flatten() {
                self.queue.mark_sacked(SeqNumber(start), SeqNumber(end));
            }
        }

        let acked = self.queue.acknowledge_up_to(ack);
        self.conn.send.unacked = ack;
        self.conn.host_queued = self.conn.host_queued.saturating_sub(acked.bytes);

        let mut rtt = None;
        if acked.bytes > 0 {
            self.conn.retransmits = 0;
            // Karn: nothing retransmitted may be the source of a sample.
            rtt = acked.rtt_sample_from
                .filter(|_| !acked.had_retransmits)
                .map(|sent| now.saturating_since(sent))
                .or_else(|| self.timestamp_rtt(options, now));
            if let Some(rtt) = rtt {
                self.conn.rtt.sample(rtt);
                self.conn.set_rto(&self.config);
                self.conn.backoff = 0;
            }
        }

        if acked.syn_acked && self.conn.current == State::SynReceived {
            self.establish(now);
        }
        if acked.fin_acked {
            match self.conn.current {
                State::FinWait1 => self.conn.change_state(State::FinWait2),
                State::Closing => self.conn.change_state(State::TimeWait),
                State::LastAck => {
                    self.teardown();
                    return Ok(());
                }
                _ => (),
            }
        }

        if let Some((_, end)) = self.conn.mtu_probe.probe_seq {
            if self.conn.mtu_probe.in_flight() && !end.after(ack) {
                self.mtu_probe_success(now);
            }
        }

        if self.conn.ca_state != CaState::Open && !self.conn.high_seq.after(ack) {
            net_debug!("tcp: recovered at {}, leaving {:?}", ack, self.conn.ca_state);
            self.conn.ca_state = CaState::Open;
            self.conn.retrans_stamp = None;
        }
        if let Some(tlp) = self.conn.tlp_high_seq {
            if !ack.before(tlp) {
                self.conn.tlp_high_seq = None;
            }
        }

        let newly_acked = prior_packets
            .saturating_sub(self.queue.packets_out())
            .max(acked.segments);
        if newly_acked > 0 && self.conn.ca_state != CaState::Cwr {
            let event = AckEvent {
                acked: newly_acked,
                rtt,
                in_flight: prior_in_flight,
                cwnd_limited: self.is_cwnd_limited(),
                now,
            };
            self.cc.on_ack(event);
        }
        self.update_pacing_rate();

        if self.queue.packets_out() == 0 {
            match self.xmit_timer {
                XmitTimer::Idle | XmitTimer::ZeroWindowProbeArmed(_) => (),
                _ => self.set_xmit_timer(XmitTimer::Idle),
            }
        } else if ack.after(prior_una) && !self.schedule_loss_probe(now, true) {
            self.rearm_rto(now);
        }

        if self.conn.ca_state == CaState::Loss {
            self.xmit_retransmit_queue(now)?;
        }
        if prior_packets == 0 && !self.queue.write_is_empty() {
            self.ack_probe(now);
        }
        self.xmit(self.nonagle(), PushOne::No, now).map(|_| ())
    }

    /// Process the data part of an incoming segment.
    ///
    /// Advances `RCV.NXT` for in order data, learns the peer's segment size and decides between
    /// an immediate and a delayed acknowledgement. A FIN moves the state machine.
    pub fn on_data_received(&mut self, incoming: Incoming, now: Instant) -> Result<()> {
        if self.conn.current == State::Closed {
            return Err(Error::Closed);
        }
        if !self.conn.current.is_synchronized() {
            return Err(Error::Illegal);
        }

        self.conn.recv.free_space = incoming.free_space;
        self.conn.recv.under_pressure = incoming.under_pressure;
        if let Some(ts) = incoming.timestamps {
            if self.conn.timestamps_ok && !incoming.seq.after(self.conn.recv.window.wup) {
                self.conn.recv.ts_recent = ts.value;
            }
        }

        let in_order = !incoming.out_of_order && incoming.seq == self.conn.recv.next;
        let fin = incoming.flags.fin();
        if in_order {
            self.conn.recv.next += incoming.len + u32::from(fin);
            if incoming.len > 0 {
                if incoming.len >= self.conn.recv.mss {
                    self.conn.recv.mss = incoming.len.min(self.conn.recv.advertised_mss);
                }
                self.adapt_ato(now);
            }
            if fin {
                match self.conn.current {
                    State::Established => self.conn.change_state(State::CloseWait),
                    State::FinWait1 => self.conn.change_state(State::Closing),
                    State::FinWait2 => self.conn.change_state(State::TimeWait),
                    _ => (),
                }
            }
        }

        let unacked = self.conn.recv.next - self.conn.recv.window.wup;
        if !in_order || fin || unacked > self.conn.recv.mss {
            self.send_pure_ack(now)
        } else if incoming.len > 0 {
            self.schedule_delayed_ack(now)
        } else {
            Ok(())
        }
    }

    /// A timer armed by the engine has expired.
    ///
    /// Stale calls, for timers since moved or cancelled, are ignored. Early calls re-arm.
    pub fn on_timer(&mut self, purpose: TimerPurpose, now: Instant) -> Result<()> {
        if self.conn.current == State::Closed {
            return Ok(());
        }
        match purpose {
            TimerPurpose::Retransmit
            | TimerPurpose::LossProbe
            | TimerPurpose::ZeroWindowProbe => {
                let timer = self.xmit_timer;
                if timer.purpose() != Some(purpose) {
                    net_trace!("tcp: stale {:?} timer", purpose);
                    return Ok(());
                }
                let deadline = match timer.deadline() {
                    Some(deadline) => deadline,
                    None => return Ok(()),
                };
                if deadline > now {
                    self.timers.arm(deadline, purpose);
                    return Ok(());
                }
                self.xmit_timer = XmitTimer::Idle;
                match timer {
                    XmitTimer::RetransmitArmed(_) => self.retransmit_timer(now),
                    XmitTimer::MtuProbePending(_) => self.mtu_probe_lost(now),
                    XmitTimer::LossProbeArmed(_) => self.send_loss_probe(now),
                    XmitTimer::ZeroWindowProbeArmed(_) => self.probe_timer(now),
                    XmitTimer::Idle => Ok(()),
                }
            }
            TimerPurpose::Pacing => {
                if self.pacing_deferred(now) {
                    if let Some(next) = self.conn.pacing.next_send {
                        self.timers.arm(next, TimerPurpose::Pacing);
                    }
                    return Ok(());
                }
                self.xmit(self.nonagle(), PushOne::No, now).map(|_| ())
            }
            TimerPurpose::DelayedAck => self.delack_timer(now),
            TimerPurpose::Keepalive => self.keepalive_timer(now),
        }
    }

    /// The transport is done with a segment ending at `end` that held `bytes` payload bytes.
    ///
    /// Frees room in the transport queue accounting and allows retransmission of the segment
    /// without a copy still being queued.
    pub fn on_transmit_complete(&mut self, end: SeqNumber, bytes: u32, now: Instant) -> Result<()> {
        self.conn.host_queued = self.conn.host_queued.saturating_sub(bytes);
        self.queue.release_shared(end);
        if self.conn.tsq_throttled {
            self.conn.tsq_throttled = false;
            self.xmit(self.nonagle(), PushOne::No, now)?;
        }
        Ok(())
    }

    /// Close our side of the connection.
    ///
    /// Queues a FIN behind all data and pushes. Closing a connection that is closing already does
    /// nothing.
    pub fn close(&mut self, now: Instant) -> Result<()> {
        match self.conn.current {
            State::Closed => return Err(Error::Closed),
            State::SynSent => {
                self.teardown();
                return Ok(());
            }
            State::SynReceived | State::Established => self.conn.change_state(State::FinWait1),
            State::CloseWait => self.conn.change_state(State::LastAck),
            _ => return Ok(()),
        }
        self.send_fin(now)
    }

    /// Reset the connection and tear it down.
    pub fn abort(&mut self, now: Instant) -> Result<()> {
        if self.conn.current == State::Closed {
            return Err(Error::Closed);
        }
        let sent = match self.conn.current {
            State::SynSent => Ok(()),
            _ => self.send_reset(now),
        };
        self.teardown();
        match sent {
            Err(err) if err.is_fatal() => Err(err),
            _ => Ok(()),
        }
    }

    /// Cancel all timers, drop all queued segments and move to `Closed`.
    pub fn teardown(&mut self) {
        for &purpose in TimerPurpose::ALL.iter() {
            self.timers.cancel(purpose);
        }
        self.xmit_timer = XmitTimer::Idle;
        self.conn.delack.deadline = None;
        self.conn.tlp_high_seq = None;
        self.queue.purge();
        self.cc.on_teardown();
        self.conn.change_state(State::Closed);
    }

    /// The current state of the state machine.
    pub fn state(&self) -> State {
        self.conn.current
    }

    /// The connection state.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The segment queue.
    pub fn queue(&self) -> &SegmentQueue {
        &self.queue
    }

    /// Event counters.
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Change the configuration of the live connection.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// The transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// The transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The congestion control algorithm.
    pub fn congestion(&self) -> &C {
        &self.cc
    }

    /// The timer service.
    pub fn timers(&self) -> &S {
        &self.timers
    }

    /// The timer service, mutably.
    pub fn timers_mut(&mut self) -> &mut S {
        &mut self.timers
    }

    /// The state of the shared retransmission timer.
    pub fn xmit_timer(&self) -> XmitTimer {
        self.xmit_timer
    }

    /// The modifiers of Nagle's algorithm from the configuration.
    pub(crate) fn nonagle(&self) -> Nagle {
        let mut nonagle = Nagle::NONE;
        if self.config.nodelay {
            nonagle |= Nagle::OFF;
        }
        if self.config.cork {
            nonagle |= Nagle::CORK;
        }
        nonagle
    }

    /// The MSS to cut new segments with.
    pub(crate) fn current_mss(&self) -> u32 {
        self.conn.mss.cache
    }

    /// The number of MSS sized segments to put into one TSO segment.
    pub(crate) fn tso_segs(&self, mss: u32) -> u32 {
        let min = self.cc.min_tso_segments().unwrap_or(self.config.min_tso_segs);
        window::tso_segment_budget(&self.config, self.conn.pacing.rate, mss, min)
    }

    /// Recompute the MSS for the current path MTU.
    pub(crate) fn sync_mss(&mut self) -> u32 {
        let pmtu = self.conn.mss.pmtu;
        self.conn.mss.sync(pmtu, &mut self.conn.mtu_probe)
    }

    /// Push, and tear down on fatal errors.
    pub(crate) fn xmit(&mut self, nonagle: Nagle, push_one: PushOne, now: Instant)
        -> Result<XmitOutcome>
    {
        if !self.conn.current.can_send_data() {
            return Ok(XmitOutcome::Idle);
        }
        let mss = self.current_mss();
        match self.write_xmit(mss, nonagle, push_one, now) {
            Ok(XmitOutcome::Stalled) => {
                self.check_probe_timer(now);
                Ok(XmitOutcome::Stalled)
            }
            Ok(outcome) => Ok(outcome),
            Err(err) => self.fail(err),
        }
    }

    /// Surface an error, tearing the connection down first if it is fatal.
    pub(crate) fn fail<R>(&mut self, err: Error) -> Result<R> {
        if err.is_fatal() && self.conn.current != State::Closed {
            net_debug!("tcp: connection failed: {}", err);
            self.teardown();
        }
        Err(err)
    }

    /// Move the shared retransmission timer to a new state.
    pub(crate) fn set_xmit_timer(&mut self, next: XmitTimer) {
        if let Some(purpose) = self.xmit_timer.purpose() {
            if next.purpose() != Some(purpose) {
                self.timers.cancel(purpose);
            }
        }
        if let (Some(purpose), Some(deadline)) = (next.purpose(), next.deadline()) {
            self.timers.arm(deadline, purpose);
        }
        self.xmit_timer = next;
    }

    /// Take over the window of an acknowledgement.
    fn update_window(&mut self, window: u16) {
        let scaled = u32::from(window) << self.conn.send.window_scale;
        if scaled == 0 && self.conn.send.window != 0 {
            net_trace!("tcp: peer closed its window at {}", self.conn.send.unacked);
        }
        self.conn.send.window = scaled;
        if scaled > self.conn.mss.max_window {
            self.conn.mss.max_window = scaled;
            self.sync_mss();
        }
    }

    /// A round trip time sample from an echoed timestamp.
    fn timestamp_rtt(&self, options: &Options, now: Instant) -> Option<Duration> {
        if !self.conn.timestamps_ok {
            return None;
        }
        let echo = options.timestamps?.echo;
        if echo == 0 {
            return None;
        }
        let delta = now.tcp_timestamp().wrapping_sub(echo);
        if delta >= 1 << 31 {
            return None;
        }
        Some(Duration::from_millis(u64::from(delta.max(1))))
    }

    /// Restart slow start when the connection was idle for longer than the timeout.
    fn slow_start_after_idle_check(&mut self, now: Instant) {
        if !self.config.slow_start_after_idle || self.queue.packets_out() > 0 {
            return;
        }
        let idle = now.saturating_since(self.conn.lsndtime);
        if idle > self.conn.rto.get() {
            self.cwnd_restart(idle, now);
        }
    }

    /// Halve the window for every timeout the connection was idle, down to the initial window.
    fn cwnd_restart(&mut self, mut idle: Duration, now: Instant) {
        let rto = self.conn.rto.get();
        let mut cwnd = self.cc.current_window();
        let restart = self.config.initial_cwnd.min(cwnd);
        let ssthresh = self.current_ssthresh();
        while idle > rto && cwnd > restart {
            idle -= rto;
            cwnd >>= 1;
        }
        net_trace!("tcp: restart window {} -> {}", self.cc.current_window(), cwnd.max(restart));
        self.cc.set_window(cwnd.max(restart), ssthresh);
        self.conn.cwnd_usage.stamp = now;
        self.conn.cwnd_usage.used = 0;
    }
}
