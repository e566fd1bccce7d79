use crate::time::Duration;
use crate::wire::FastOpenCookie;

/// Tunables of one connection.
///
/// All fields are public. They are read whenever they are needed so most of them can be changed
/// on a live connection through [`Engine::config_mut`], similar to changing a `sysctl`. Defaults
/// follow the Linux defaults where such a default exists.
///
/// [`Engine::config_mut`]: struct.Engine.html#method.config_mut
#[derive(Clone, Debug)]
pub struct Config {
    /// Disable Nagle's algorithm.
    pub nodelay: bool,
    /// Hold back partial segments until uncorked.
    pub cork: bool,

    /// Offer selective acknowledgements.
    pub sack: bool,
    /// Offer timestamps.
    pub timestamps: bool,
    /// Offer window scaling.
    pub window_scaling: bool,
    /// A fast open cookie (or a request for one) to put into our SYN.
    pub fast_open: Option<FastOpenCookie>,

    /// The MTU of the path towards the peer, before probing.
    pub mtu: u32,
    /// Packetization layer path MTU discovery.
    pub mtu_probing: MtuProbing,
    /// The MSS to start a search from and to fall back to on black holes.
    pub base_mss: u32,
    /// Stop probing once the search range is narrower than this many bytes.
    pub mtu_probe_threshold: u32,
    /// Time after which a finished search is started over.
    pub mtu_probe_interval: Duration,
    /// The smallest MSS we ever send with.
    pub min_snd_mss: u32,

    /// Lower bound of the retransmission timeout.
    pub rto_min: Duration,
    /// Upper bound of the retransmission timeout, also used for probe backoff.
    pub rto_max: Duration,
    /// Retransmission timeout before the first measurement.
    pub rto_initial: Duration,
    /// SYN retransmissions before giving up on an active open.
    pub syn_retries: u32,
    /// SYN-ACK retransmissions before giving up on a passive open.
    pub synack_retries: u32,
    /// Retransmission timeouts after which path MTU black hole detection kicks in.
    pub retries1: u32,
    /// Retransmission timeouts after which the connection is declared dead.
    pub retries2: u32,

    /// The initial congestion window, in segments.
    pub initial_cwnd: u32,
    /// The largest segment the transport will cut into wire segments for us.
    pub gso_max_size: u32,
    /// The most wire segments one transmitted segment may stand for. `1` disables TSO.
    pub gso_max_segs: u32,
    /// Room reserved for headers in a TSO segment.
    pub header_margin: u32,
    /// The smallest number of wire segments a TSO segment is sized for.
    pub min_tso_segs: u32,
    /// Send a TSO segment when at least this fraction of a window is available. `0` disables.
    pub tso_win_divisor: u32,
    /// Without a divisor, send once more than this many MSS are available.
    pub max_tso_deferred_mss: u32,
    /// Defer TSO segments only if the last transmission is at most this long ago.
    pub tso_defer_window: Duration,

    /// Hold segments back to the pacing rate.
    pub pacing: bool,
    /// Budget `rate >> pacing_shift` bytes of the pacing rate per TSO segment and transport queue.
    pub pacing_shift: u32,
    /// Pacing rate in percent of cwnd per RTT during slow start.
    pub pacing_ss_ratio: u32,
    /// Pacing rate in percent of cwnd per RTT during congestion avoidance.
    pub pacing_ca_ratio: u32,
    /// Upper bound of bytes queued in the transport.
    pub limit_output_bytes: u32,

    /// Schedule tail loss probes.
    pub tail_loss_probe: bool,
    /// Merge small segments on retransmission.
    pub retrans_collapse: bool,
    /// Reset the congestion window after an idle period.
    pub slow_start_after_idle: bool,

    /// The receive buffer size, advertised through the window.
    pub rcv_buf: u32,
    /// Shortest delay of a delayed acknowledgement.
    pub delack_min: Duration,
    /// Longest delay of a delayed acknowledgement.
    pub delack_max: Duration,
    /// Keepalive probing, `None` disables it.
    pub keepalive: Option<Keepalive>,
}

/// When to search for a larger path MTU.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MtuProbing {
    /// Never probe.
    Off,
    /// Start probing after a suspected black hole.
    BlackHole,
    /// Probe from the start of the connection.
    Always,
}

/// Keepalive timing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Keepalive {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Time between unanswered probes.
    pub interval: Duration,
    /// Unanswered probes after which the connection is dead.
    pub probes: u32,
}

impl Default for Keepalive {
    fn default() -> Self {
        Keepalive {
            idle: Duration::from_secs(7200),
            interval: Duration::from_secs(75),
            probes: 9,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            nodelay: false,
            cork: false,
            sack: true,
            timestamps: true,
            window_scaling: true,
            fast_open: None,
            mtu: 1500,
            mtu_probing: MtuProbing::Off,
            base_mss: 1024,
            mtu_probe_threshold: 8,
            mtu_probe_interval: Duration::from_secs(600),
            min_snd_mss: 48,
            rto_min: Duration::from_millis(200),
            rto_max: Duration::from_secs(120),
            rto_initial: Duration::from_secs(1),
            syn_retries: 6,
            synack_retries: 5,
            retries1: 3,
            retries2: 15,
            initial_cwnd: 10,
            gso_max_size: 65536,
            gso_max_segs: 64,
            header_margin: 320,
            min_tso_segs: 2,
            tso_win_divisor: 3,
            max_tso_deferred_mss: 3,
            tso_defer_window: Duration::from_millis(1),
            pacing: false,
            pacing_shift: 10,
            pacing_ss_ratio: 200,
            pacing_ca_ratio: 120,
            limit_output_bytes: 1 << 20,
            tail_loss_probe: true,
            retrans_collapse: true,
            slow_start_after_idle: true,
            rcv_buf: 131_072,
            delack_min: Duration::from_millis(40),
            delack_max: Duration::from_millis(200),
            keepalive: None,
        }
    }
}
