use core::fmt;

use sendpath::layer::tcp::Counters;
use sendpath::time::Duration;

/// The result of a simulated transfer.
pub struct Score {
    /// Bytes acknowledged by the peer.
    pub(crate) data_len: u64,
    /// Simulated time from connecting to the last acknowledgement.
    pub(crate) time: Duration,
    /// Payload bytes that reached the peer, retransmissions included.
    pub(crate) received: u64,
    /// Segments dropped by the link.
    pub(crate) dropped: usize,
    /// Segments that arrived but carried nothing new.
    pub(crate) duplicates: u64,
    /// The congestion window at the end, in segments.
    pub(crate) cwnd: u32,
    /// The effective MSS at the end.
    pub(crate) mss: u32,
    pub(crate) counters: Counters,
}

impl Score {
    fn total_kb(&self) -> u64 {
        self.data_len / 1024
    }

    fn elapsed_secs(&self) -> f32 {
        self.time.as_millis() as f32 / 1000.0
    }

    fn effective_rate(&self) -> f32 {
        (self.data_len as f32) / self.elapsed_secs().max(0.001)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "[  3] 0.0-{end:.1} sec\t{total} KBytes\t{rate:.0} Byte/sec",
            end = self.elapsed_secs(),
            total = self.total_kb(),
            rate = self.effective_rate(),
        )?;
        let c = &self.counters;
        writeln!(
            f,
            "      segments {}\tretransmits {}\ttimeouts {}\tloss probes {}",
            c.segments_sent, c.retransmits, c.rto_timeouts, c.loss_probes,
        )?;
        writeln!(
            f,
            "      received {} bytes\tdropped {}\tduplicates {}\tzero window probes {}",
            self.received, self.dropped, self.duplicates, c.zero_window_probes,
        )?;
        write!(
            f,
            "      mtu probes {} ({} ok, {} lost)\tmss {}\tcwnd {}\tsmall queue stalls {}",
            c.mtu_probes, c.mtu_probe_success, c.mtu_probe_failed, self.mss, self.cwnd,
            c.tsq_throttled,
        )
    }
}
