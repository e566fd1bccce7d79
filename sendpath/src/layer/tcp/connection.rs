use crate::time::{Duration, Instant};
use crate::wire::{Flags, Options, SeqNumber, Timestamps};

use super::config::Config;
use super::rtt::{Estimator, Rto};
use super::window::{self, MtuProbe, PathMss, ReceiveWindow, NET_HEADER_LEN, TCP_HEADER_LEN};

/// The state of a connection.
///
/// Includes the current state machine state, the negotiated parameters, the send and receive
/// sequence state and everything the engine tracks over time to decide when to send. All of it is
/// public, it may be inspected and changed while the engine is not processing.
#[derive(Clone, Copy, Debug, Hash)]
pub struct Connection {
    /// The current state of the state machine.
    pub current: State,

    /// The previous state of the state machine.
    pub previous: State,

    /// The sending state.
    ///
    /// In RFC793 this is referred to as `SND`.
    pub send: Send,

    /// The receiving state, as far as it feeds back into sending.
    ///
    /// In RFC793 this is referred to as `RCV`.
    pub recv: Receive,

    /// The path MTU and the effective MSS derived from it.
    pub mss: PathMss,

    /// The path MTU search.
    pub mtu_probe: MtuProbe,

    /// If we are permitted to use SACKs.
    pub sack_ok: bool,

    /// If both sides send timestamps.
    pub timestamps_ok: bool,

    /// The congestion state.
    pub ca_state: CaState,

    /// `SND.NXT` at the time the current congestion state was entered.
    pub high_seq: SeqNumber,

    /// The round trip time estimate.
    pub rtt: Estimator,

    /// The current retransmission timeout, including backoff.
    pub rto: Rto,

    /// Exponential backoff of the retransmission and probe timers.
    pub backoff: u32,

    /// Retransmission timeouts since the last acknowledgement of new data.
    pub retransmits: u32,

    /// Unanswered zero window or keepalive probes.
    pub probes_out: u32,

    /// `SND.NXT` when the outstanding tail loss probe was sent.
    pub tlp_high_seq: Option<SeqNumber>,

    /// The pacing rate and the next allowed send time.
    pub pacing: Pacing,

    /// Bytes handed to the transport and not yet confirmed as gone.
    pub host_queued: u32,

    /// A transmission was held back because too much is queued in the transport.
    pub tsq_throttled: bool,

    /// Whether recent rounds used the full congestion window.
    pub cwnd_usage: CwndUsage,

    /// When data was last sent.
    pub lsndtime: Instant,

    /// When anything was last handed to the transport.
    pub last_xmit: Option<Instant>,

    /// When the last acknowledgement arrived.
    pub rcv_tstamp: Instant,

    /// When the first retransmission of the current episode was attempted.
    pub retrans_stamp: Option<Instant>,

    /// The pending delayed acknowledgement.
    pub delack: DelayedAck,
}

/// Send sequence state.
#[derive(Clone, Copy, Debug, Hash)]
pub struct Send {
    /// The next not yet acknowledged sequence number.
    ///
    /// In RFC793 this is referred to as `SND.UNA`.
    pub unacked: SeqNumber,

    /// The next sequence number to use for transmission.
    ///
    /// In RFC793 this is referred to as `SND.NXT`.
    pub next: SeqNumber,

    /// The end of the last segment sent smaller than the MSS.
    ///
    /// Used by the Minshall variant of Nagle's algorithm.
    pub small_end: SeqNumber,

    /// The send window size indicated by the receiver, already scaled.
    ///
    /// Must not send packet containing a sequence number beyond `unacked + window`. In RFC793 this
    /// is referred to as `SND.WND`.
    pub window: u32,

    /// The window scale the peer uses for its advertisements.
    pub window_scale: u8,

    /// The initial sequence number.
    ///
    /// In RFC793 this is referred to as `ISS`.
    pub initial_seq: SeqNumber,

    /// The urgent pointer. Urgent mode lasts while it is ahead of `unacked`.
    pub urgent: SeqNumber,
}

/// Receive sequence state.
#[derive(Clone, Copy, Debug, Hash)]
pub struct Receive {
    /// The next expected sequence number.
    ///
    /// In RFC793 this is referred to as `RCV.NXT`.
    pub next: SeqNumber,

    /// The initial receive sequence number.
    ///
    /// In RFC793 this is referred to as `IRS`.
    pub initial_seq: SeqNumber,

    /// The window we advertise.
    pub window: ReceiveWindow,

    /// Free space in the receive buffer, as last reported.
    pub free_space: u32,

    /// The whole receive buffer.
    pub full_space: u32,

    /// Whether the receiver is short on memory.
    pub under_pressure: bool,

    /// The MSS we announced.
    pub advertised_mss: u32,

    /// The estimated segment size the peer sends with.
    pub mss: u32,

    /// The most recent timestamp value received, echoed in our timestamps.
    pub ts_recent: u32,
}

/// State enum of the statemachine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum State {
    /// Marker state for an unused or torn down connection.
    Closed,

    /// An open connection request.
    SynSent,

    /// Connection request we intend to answer, waiting on ack.
    SynReceived,

    /// An open connection.
    Established,

    /// Closed our side of the connection.
    FinWait1,

    /// Closing connection nicely, initiated by us and acknowledged.
    FinWait2,

    /// Closed both sides but we don't know the other knows.
    Closing,

    /// Both sides recognized connection as closed.
    TimeWait,

    /// Other side closed its connection.
    CloseWait,

    /// Connection closed after other side closed its already.
    LastAck,
}

/// The congestion state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CaState {
    /// Nothing special going on.
    Open,
    /// The window was reduced because of local congestion.
    Cwr,
    /// A retransmission timeout occurred, everything outstanding is presumed lost.
    Loss,
}

/// Pacing state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Pacing {
    /// Bytes per second, unknown before the first round trip time measurement.
    pub rate: Option<u64>,
    /// No segment is sent before this time, when pacing.
    pub next_send: Option<Instant>,
}

/// Congestion window validation after RFC 2861.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CwndUsage {
    /// Largest number of outstanding segments in the current window.
    pub max_packets_out: u32,
    /// `SND.NXT` when `max_packets_out` was recorded.
    pub max_packets_seq: SeqNumber,
    /// Whether the window was the limit at that time.
    pub is_cwnd_limited: bool,
    /// Largest number of outstanding segments while application limited.
    pub used: u32,
    /// When the window was last fully used or adjusted.
    pub stamp: Instant,
}

/// The delayed acknowledgement state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DelayedAck {
    /// The acknowledgement timeout estimate.
    pub ato: Duration,
    /// When the scheduled acknowledgement is due.
    pub deadline: Option<Instant>,
    /// When data was last received.
    pub last_received: Option<Instant>,
}

/// Source and destination ports of the segments we send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Ports {
    /// Our port.
    pub local: u16,
    /// The peer's port.
    pub remote: u16,
}

/// The SYN of a peer that we answer with a SYN-ACK.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SynRequest {
    /// The peer's initial sequence number.
    pub seq: SeqNumber,
    /// The unscaled window of the SYN.
    pub window: u16,
    /// The options of the SYN.
    pub options: Options,
}

/// A segment from the peer that carries data or a FIN.
///
/// Only what feeds back into sending is described. Acknowledgement information of the same
/// segment is handed to [`Engine::on_ack_received`] separately.
///
/// [`Engine::on_ack_received`]: struct.Engine.html#method.on_ack_received
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Incoming {
    /// The first sequence number of the segment.
    pub seq: SeqNumber,
    /// Payload length.
    pub len: u32,
    /// The flags of the segment, only FIN matters.
    pub flags: Flags,
    /// The timestamps option, if present.
    pub timestamps: Option<Timestamps>,
    /// Free space in the receive buffer after the segment was queued.
    pub free_space: u32,
    /// Whether the receiver is short on memory.
    pub under_pressure: bool,
    /// The segment left a hole, it was queued out of order.
    pub out_of_order: bool,
}

impl Connection {
    /// A closed connection that will start sending at `iss`.
    pub fn new(iss: SeqNumber, config: &Config, now: Instant) -> Self {
        let mss = PathMss::new(config.mtu, config.min_snd_mss);
        let advertised_mss = config.mtu.saturating_sub(NET_HEADER_LEN + TCP_HEADER_LEN);
        let initial = window::initial_window(
            config.rcv_buf,
            advertised_mss,
            0,
            config.window_scaling,
            config.rcv_buf);

        Connection {
            current: State::Closed,
            previous: State::Closed,
            send: Send {
                unacked: iss,
                next: iss,
                small_end: iss,
                window: 0,
                window_scale: 0,
                initial_seq: iss,
                urgent: iss,
            },
            recv: Receive {
                next: SeqNumber(0),
                initial_seq: SeqNumber(0),
                window: ReceiveWindow::new(initial, SeqNumber(0)),
                free_space: config.rcv_buf,
                full_space: config.rcv_buf,
                under_pressure: false,
                advertised_mss,
                mss: advertised_mss.min(window::DEFAULT_MSS),
                ts_recent: 0,
            },
            mss,
            mtu_probe: MtuProbe::default(),
            sack_ok: false,
            timestamps_ok: false,
            ca_state: CaState::Open,
            high_seq: iss,
            rtt: Estimator::default(),
            rto: Rto::new(config.rto_initial, config.rto_min, config.rto_max),
            backoff: 0,
            retransmits: 0,
            probes_out: 0,
            tlp_high_seq: None,
            pacing: Pacing::default(),
            host_queued: 0,
            tsq_throttled: false,
            cwnd_usage: CwndUsage {
                max_packets_out: 0,
                max_packets_seq: iss,
                is_cwnd_limited: false,
                used: 0,
                stamp: now,
            },
            lsndtime: now,
            last_xmit: None,
            rcv_tstamp: now,
            retrans_stamp: None,
            delack: DelayedAck {
                ato: config.delack_min,
                deadline: None,
                last_received: None,
            },
        }
    }

    /// Move the state machine.
    pub fn change_state(&mut self, to: State) {
        if to != self.current {
            net_debug!("tcp: state {:?} -> {:?}", self.current, to);
            self.previous = self.current;
            self.current = to;
        }
    }

    /// The first sequence number outside the peer's window.
    pub fn window_end(&self) -> SeqNumber {
        self.send.unacked + self.send.window
    }

    /// Whether urgent data has not been acknowledged yet.
    pub fn urgent_mode(&self) -> bool {
        self.send.urgent.after(self.send.unacked)
    }

    /// Recompute the retransmission timeout from the round trip time estimate.
    pub fn set_rto(&mut self, config: &Config) {
        self.rto = self.rtt.rto(config.rto_initial, config.rto_min, config.rto_max);
    }

    /// The base timeout of a zero window probe.
    pub fn probe0_base(&self, config: &Config) -> Duration {
        self.rto.get().max(config.rto_min)
    }

    /// The backed off timeout of the next zero window probe.
    pub fn probe0_when(&self, config: &Config) -> Duration {
        let base = self.probe0_base(config);
        let factor = 1u32.checked_shl(self.backoff).unwrap_or(u32::max_value());
        base.checked_mul(factor)
            .unwrap_or(config.rto_max)
            .min(config.rto_max)
    }

    /// The timestamps option for a segment sent at `now`.
    pub fn timestamps(&self, now: Instant) -> Option<Timestamps> {
        if self.timestamps_ok {
            Some(Timestamps { value: now.tcp_timestamp(), echo: self.recv.ts_recent })
        } else {
            None
        }
    }

    /// The sequence number for a segment without data.
    ///
    /// `SND.NXT` unless the peer shrunk its window below it.
    pub fn acceptable_seq(&self) -> SeqNumber {
        let end = self.window_end();
        let granularity = 1u32 << self.recv.window.wscale;
        if !end.before(self.send.next) || self.send.next - end < granularity {
            self.send.next
        } else {
            end
        }
    }
}

impl State {
    /// Whether our SYN has been acknowledged or we acknowledged the peer's.
    pub fn is_synchronized(self) -> bool {
        match self {
            State::Closed | State::SynSent | State::SynReceived => false,
            _ => true,
        }
    }

    /// Whether queued data may be transmitted.
    pub fn can_send_data(self) -> bool {
        match self {
            State::Established
            | State::CloseWait
            | State::FinWait1
            | State::Closing
            | State::LastAck => true,
            _ => false,
        }
    }
}

impl Default for State {
    fn default() -> Self {
        State::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_connection() {
        let config = Config::default();
        let conn = Connection::new(SeqNumber(100), &config, Instant::from_millis(0));
        assert_eq!(conn.current, State::Closed);
        assert_eq!(conn.mss.cache, 1460);
        assert_eq!(conn.recv.advertised_mss, 1460);
        assert_eq!(conn.rto.get(), Duration::from_secs(1));
        assert!(!conn.current.can_send_data());
    }

    #[test]
    fn probe0_backoff_is_capped() {
        let config = Config::default();
        let mut conn = Connection::new(SeqNumber(0), &config, Instant::from_millis(0));
        assert_eq!(conn.probe0_when(&config), Duration::from_secs(1));
        conn.backoff = 3;
        assert_eq!(conn.probe0_when(&config), Duration::from_secs(8));
        conn.backoff = 40;
        assert_eq!(conn.probe0_when(&config), config.rto_max);
    }

    #[test]
    fn acceptable_seq_behind_shrunk_window() {
        let config = Config::default();
        let mut conn = Connection::new(SeqNumber(0), &config, Instant::from_millis(0));
        conn.recv.window.wscale = 0;
        conn.send.next = SeqNumber(5000);
        conn.send.window = 8000;
        assert_eq!(conn.acceptable_seq(), SeqNumber(5000));
        conn.send.window = 1000;
        assert_eq!(conn.acceptable_seq(), SeqNumber(1000));
    }
}
