/// Event counts of one connection.
///
/// Only ever incremented. Read them through [`Engine::counters`].
///
/// [`Engine::counters`]: struct.Engine.html#method.counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Counters {
    /// Segments handed to the transport, counting each TSO segment once.
    pub segments_sent: u64,
    /// Payload bytes handed to the transport, including retransmissions.
    pub bytes_sent: u64,
    /// Segments retransmitted.
    pub retransmits: u64,
    /// Retransmission timer expirations.
    pub rto_timeouts: u64,
    /// Tail loss probes sent.
    pub loss_probes: u64,
    /// Zero window probes sent.
    pub zero_window_probes: u64,
    /// Path MTU probes sent.
    pub mtu_probes: u64,
    /// Path MTU probes acknowledged.
    pub mtu_probe_success: u64,
    /// Path MTU probes lost.
    pub mtu_probe_failed: u64,
    /// Advertised window went from open to zero.
    pub to_zero_window: u64,
    /// Advertised window went from zero to open.
    pub from_zero_window: u64,
    /// A zero window was wanted while the previous advertisement was still open.
    pub want_zero_window: u64,
    /// Transmissions held back by small queue backpressure.
    pub tsq_throttled: u64,
    /// Transmissions held back by Nagle's algorithm or corking.
    pub nagle_deferred: u64,
    /// Pure acknowledgements sent after a delay.
    pub delayed_acks: u64,
    /// Keepalive probes sent.
    pub keepalive_probes: u64,
    /// Connections given up after too many retries.
    pub timeouts: u64,
}
