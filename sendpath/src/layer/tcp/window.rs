//! Window and segment size selection.
//!
//! Everything here is pure arithmetic on connection state: the receive window we advertise, the
//! MSS we send with (including the path MTU search range) and the number of MSS sized segments
//! we bundle into one TSO segment.
use crate::time::Instant;
use crate::wire::SeqNumber;

use super::config::{Config, MtuProbing};

/// Length of the network layer header accounted for every segment.
pub const NET_HEADER_LEN: u32 = 20;

/// Length of a TCP header without options.
pub const TCP_HEADER_LEN: u32 = 20;

/// The MSS assumed for a peer that did not announce one.
pub const DEFAULT_MSS: u32 = 536;

/// No segment ever carries less payload than this, whatever the configuration.
pub const MIN_MSS: u32 = 8;

/// The largest window scale shift.
pub const MAX_WINDOW_SCALE: u8 = 14;

/// The state behind the window we advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReceiveWindow {
    /// The window last advertised, in bytes.
    pub wnd: u32,
    /// The receive sequence number at the time of the last advertisement.
    pub wup: SeqNumber,
    /// Our window scale shift.
    pub wscale: u8,
    /// No window ever offered is larger.
    pub clamp: u32,
    /// Soft upper bound of the offered window.
    pub ssthresh: u32,
}

/// The receive buffer as seen at the time of a window selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Space {
    /// Bytes that can be received without exceeding the buffer.
    pub free: u32,
    /// The whole buffer.
    pub allowed: u32,
    /// The MSS we expect the peer to send with.
    pub mss: u32,
    /// Our MSS announcement.
    pub advmss: u32,
    /// Whether memory is running low.
    pub under_pressure: bool,
}

/// The outcome of a window selection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Selection {
    /// The value of the header field, already scaled.
    pub field: u16,
    /// A change between a zero and an open advertisement.
    pub transition: Option<ZeroWindow>,
    /// A zero window was chosen although the last advertisement was still open.
    pub wanted_zero: bool,
}

/// Transitions of the advertised window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ZeroWindow {
    /// From open to zero.
    Closed,
    /// From zero to open.
    Opened,
}

/// The receive window state of a fresh connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InitialWindow {
    /// The window to announce in the SYN.
    pub rcv_wnd: u32,
    /// The largest window ever offered.
    pub clamp: u32,
    /// The window scale to announce.
    pub wscale: u8,
}

/// Choose the initial window and scale for a buffer of `space` bytes.
///
/// `clamp` of zero means unbounded. The scale is chosen such that a window of `max(space,
/// rmem_max)` bytes can be expressed.
pub fn initial_window(space: u32, mss: u32, clamp: u32, wscale_ok: bool, rmem_max: u32)
    -> InitialWindow
{
    let mut clamp = if clamp == 0 { 65535 << MAX_WINDOW_SCALE } else { clamp };
    let mut space = space.min(clamp);
    if mss > 0 && space > mss {
        space -= space % mss;
    }
    let rcv_wnd = space.min(65535);

    let mut wscale = 0;
    if wscale_ok {
        let space = space.max(rmem_max).min(clamp);
        let log = if space == 0 { 0 } else { 31 - space.leading_zeros() };
        wscale = (log.saturating_sub(15)).min(u32::from(MAX_WINDOW_SCALE)) as u8;
    }
    clamp = clamp.min(65535 << wscale);

    InitialWindow { rcv_wnd, clamp, wscale }
}

impl ReceiveWindow {
    /// Start from an initial window.
    pub fn new(initial: InitialWindow, rcv_nxt: SeqNumber) -> Self {
        ReceiveWindow {
            wnd: initial.rcv_wnd,
            wup: rcv_nxt,
            wscale: initial.wscale,
            clamp: initial.clamp,
            ssthresh: initial.clamp,
        }
    }

    /// What is left of the last advertisement, from the peer's point of view.
    pub fn remaining(&self, rcv_nxt: SeqNumber) -> u32 {
        let end = self.wup + self.wnd;
        if end.after(rcv_nxt) {
            end - rcv_nxt
        } else {
            0
        }
    }

    /// The window the buffer allows for, in bytes.
    ///
    /// Offers zero when the free space is less than a sixteenth of the buffer or less than one
    /// MSS. Without scaling the window is a multiple of the MSS and is only moved when it
    /// changed by at least one MSS. With scaling it is aligned to the scale granularity.
    pub fn compute(&mut self, space: Space) -> u32 {
        let full = self.clamp.min(space.allowed);
        let mut mss = space.mss;
        let mut free = space.free.min(full);

        if mss > full {
            mss = full;
            if mss == 0 {
                return 0;
            }
        }

        if free < full / 2 {
            if space.under_pressure {
                self.ssthresh = self.ssthresh.min(space.advmss.saturating_mul(4));
            }
            free &= !((1u32 << self.wscale) - 1);
            if free < space.allowed / 16 || free < mss {
                return 0;
            }
        }

        if free > self.ssthresh {
            free = self.ssthresh;
        }

        if self.wscale > 0 {
            let unit = 1u32 << self.wscale;
            if free % unit != 0 {
                ((free >> self.wscale) + 1) << self.wscale
            } else {
                free
            }
        } else {
            let window = self.wnd;
            if window <= free.saturating_sub(mss) || window > free {
                free - free % mss.max(1)
            } else if mss == full && free > window + (full >> 1) {
                free
            } else {
                window
            }
        }
    }

    /// Select the window for the next outgoing segment and remember it as advertised.
    ///
    /// The right edge of the window never moves backwards, except to announce a zero window.
    pub fn select(&mut self, rcv_nxt: SeqNumber, space: Space) -> Selection {
        let old = self.wnd;
        let current = self.remaining(rcv_nxt);
        let mut new = self.compute(space);
        let mut wanted_zero = false;

        if new < current {
            if new == 0 {
                wanted_zero = true;
            } else {
                let unit = 1u32 << self.wscale;
                new = current.saturating_add(unit - 1) & !(unit - 1);
            }
        }

        self.wnd = new;
        self.wup = rcv_nxt;

        let limit = 65535u32 << self.wscale;
        let field = (new.min(limit) >> self.wscale) as u16;
        let transition = if field == 0 && old != 0 {
            Some(ZeroWindow::Closed)
        } else if field != 0 && old == 0 {
            Some(ZeroWindow::Opened)
        } else {
            None
        };

        Selection { field, transition, wanted_zero }
    }
}

/// The state of the path MTU search.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MtuProbe {
    /// Whether the search is running.
    pub enabled: bool,
    /// The largest MTU known to work.
    pub search_low: u32,
    /// The smallest MTU known not to work, minus one.
    pub search_high: u32,
    /// MTU of the probe in flight, zero if none.
    pub probe_size: u32,
    /// When the current search started.
    pub probe_timestamp: Instant,
    /// The sequence range of the probe in flight.
    pub probe_seq: Option<(SeqNumber, SeqNumber)>,
}

impl Default for MtuProbe {
    fn default() -> Self {
        MtuProbe {
            enabled: false,
            search_low: 0,
            search_high: 0,
            probe_size: 0,
            probe_timestamp: Instant::from_millis(0),
            probe_seq: None,
        }
    }
}

impl MtuProbe {
    /// Whether a probe is in flight.
    pub fn in_flight(&self) -> bool {
        self.probe_size != 0
    }
}

/// Conversions between path MTU and MSS, and the cached effective MSS.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PathMss {
    /// The path MTU the cache was computed for.
    pub pmtu: u32,
    /// The MSS the peer announced, or the default.
    pub mss_clamp: u32,
    /// Option bytes on every established segment.
    pub options_len: u32,
    /// The largest window the peer ever offered.
    pub max_window: u32,
    /// The configured smallest MSS.
    pub min_snd_mss: u32,
    /// The effective MSS.
    pub cache: u32,
}

impl PathMss {
    /// Sizes for a path of `pmtu` bytes before anything was negotiated.
    pub fn new(pmtu: u32, min_snd_mss: u32) -> Self {
        let mut mss = PathMss {
            pmtu,
            mss_clamp: u32::max_value(),
            options_len: 0,
            max_window: 0,
            min_snd_mss,
            cache: DEFAULT_MSS,
        };
        mss.cache = mss.mtu_to_mss(pmtu);
        mss
    }

    /// The MSS that fits a path MTU, clamped to the peer's MSS and floored.
    pub fn mtu_to_mss(&self, pmtu: u32) -> u32 {
        let mss = pmtu.saturating_sub(NET_HEADER_LEN + TCP_HEADER_LEN).min(self.mss_clamp);
        mss.saturating_sub(self.options_len).max(self.floor())
    }

    /// The path MTU a segment of `mss` payload bytes needs.
    pub fn mss_to_mtu(&self, mss: u32) -> u32 {
        mss + self.options_len + TCP_HEADER_LEN + NET_HEADER_LEN
    }

    /// Never send segments larger than half of the largest window the peer offered.
    pub fn bound_to_half_wnd(&self, size: u32) -> u32 {
        let cutoff = if self.max_window > DEFAULT_MSS {
            self.max_window / 2
        } else {
            self.max_window
        };
        if cutoff != 0 && size > cutoff {
            cutoff.max(48u32.saturating_sub(self.options_len))
        } else {
            size
        }
    }

    /// Recompute the effective MSS for a new path MTU.
    ///
    /// Also narrows the search range to the path MTU and, while searching, keeps the MSS at the
    /// lower end of the range.
    pub fn sync(&mut self, pmtu: u32, probe: &mut MtuProbe) -> u32 {
        if probe.search_high > pmtu {
            probe.search_high = pmtu;
        }
        let mut mss = self.bound_to_half_wnd(self.mtu_to_mss(pmtu));
        self.pmtu = pmtu;
        if probe.enabled {
            mss = mss.min(self.mtu_to_mss(probe.search_low));
        }
        self.cache = mss.max(self.floor());
        self.cache
    }

    /// Start the MTU search, enabled right away if configured to always probe.
    pub fn init_probe(&self, config: &Config, now: Instant) -> MtuProbe {
        let search_high = self.mss_clamp
            .min(self.pmtu.saturating_sub(NET_HEADER_LEN + TCP_HEADER_LEN))
            .saturating_add(TCP_HEADER_LEN + NET_HEADER_LEN);
        MtuProbe {
            enabled: config.mtu_probing == MtuProbing::Always,
            search_low: self.mss_to_mtu(config.base_mss),
            search_high,
            probe_size: 0,
            probe_timestamp: now,
            probe_seq: None,
        }
    }

    fn floor(&self) -> u32 {
        self.min_snd_mss.max(MIN_MSS)
    }
}

/// The number of MSS sized segments to put into one TSO segment.
///
/// Aims for about `2^-pacing_shift` seconds worth of the pacing rate but at least
/// `min_tso_segs`. Never zero, never above `gso_max_segs`.
pub fn tso_segment_budget(config: &Config, pacing_rate: Option<u64>, mss: u32, min_tso_segs: u32)
    -> u32
{
    let rate_bytes = match pacing_rate {
        Some(rate) => rate >> config.pacing_shift,
        None => u64::max_value(),
    };
    let gso_bytes = u64::from(config.gso_max_size.saturating_sub(config.header_margin));
    let bytes = rate_bytes.min(gso_bytes) as u32;
    let segs = (bytes / mss.max(1)).max(min_tso_segs);
    segs.min(config.gso_max_segs).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u32 = 1460;

    fn unscaled(full: u32) -> ReceiveWindow {
        ReceiveWindow {
            wnd: 0,
            wup: SeqNumber(0),
            wscale: 0,
            clamp: full,
            ssthresh: full,
        }
    }

    fn space(free: u32, allowed: u32) -> Space {
        Space { free, allowed, mss: MSS, advmss: MSS, under_pressure: false }
    }

    #[test]
    fn zero_when_full() {
        let mut window = unscaled(4 * MSS);
        assert_eq!(window.compute(space(0, 4 * MSS)), 0);
        let offered = window.compute(space(MSS, 4 * MSS));
        assert!(offered >= MSS);
    }

    #[test]
    fn zero_below_sixteenth() {
        let mut window = unscaled(65535);
        // One MSS free but less than a sixteenth of the buffer.
        assert_eq!(window.compute(space(MSS, 65535)), 0);
        assert_eq!(window.compute(space(8 * MSS, 65535)), 8 * MSS);
    }

    #[test]
    fn mss_larger_than_buffer() {
        let mut window = unscaled(1000);
        assert_eq!(window.compute(space(1000, 1000)), 1000);
        let mut window = unscaled(0);
        assert_eq!(window.compute(space(0, 0)), 0);
    }

    #[test]
    fn scaled_alignment() {
        let mut window = unscaled(1 << 20);
        window.wscale = 7;
        assert_eq!(window.compute(space(100_000, 1 << 20)) % 128, 0);
    }

    #[test]
    fn never_shrinks_except_to_zero() {
        let full = 40 * MSS;
        let mut window = unscaled(full);
        window.wnd = full;
        let mut rcv_nxt = SeqNumber(0);
        let first = window.select(rcv_nxt, space(full, full));
        assert_eq!(u32::from(first.field), full);
        assert_eq!(first.transition, None);

        // Less free space would shrink the right edge, keep it instead.
        let edge = rcv_nxt + u32::from(first.field);
        rcv_nxt += 10 * MSS;
        let second = window.select(rcv_nxt, space(20 * MSS, full));
        assert!(!(rcv_nxt + u32::from(second.field)).before(edge));

        // But an explicit zero is allowed.
        let third = window.select(rcv_nxt, space(0, full));
        assert_eq!(third.field, 0);
        assert!(third.wanted_zero);
        assert_eq!(third.transition, Some(ZeroWindow::Closed));

        let fourth = window.select(rcv_nxt, space(full, full));
        assert_eq!(fourth.transition, Some(ZeroWindow::Opened));
    }

    #[test]
    fn initial_scale() {
        let initial = initial_window(131_072, MSS, 0, true, 131_072);
        assert_eq!(initial.wscale, 2);
        assert_eq!(initial.rcv_wnd, 65535);
        assert_eq!(initial.clamp, 65535 << 2);

        let initial = initial_window(20_000, MSS, 0, false, 0);
        assert_eq!(initial.wscale, 0);
        assert_eq!(initial.rcv_wnd, 13 * MSS);
        assert_eq!(initial.clamp, 65535);
    }

    #[test]
    fn mss_conversions() {
        let mut mss = PathMss::new(1500, 48);
        assert_eq!(mss.cache, 1460);
        mss.options_len = 12;
        assert_eq!(mss.mtu_to_mss(1500), 1448);
        assert_eq!(mss.mss_to_mtu(1448), 1500);
        mss.mss_clamp = 536;
        assert_eq!(mss.mtu_to_mss(1500), 524);
        assert_eq!(mss.mtu_to_mss(60), 48);
    }

    #[test]
    fn half_window_bound() {
        let mut mss = PathMss::new(1500, 48);
        let mut probe = MtuProbe::default();
        mss.max_window = 2000;
        assert_eq!(mss.sync(1500, &mut probe), 1000);
        mss.max_window = 65535;
        assert_eq!(mss.sync(1500, &mut probe), 1460);
    }

    #[test]
    fn probing_keeps_low_end() {
        let config = Config { mtu_probing: MtuProbing::Always, ..Config::default() };
        let mut mss = PathMss::new(9000, 48);
        let mut probe = mss.init_probe(&config, Instant::from_millis(0));
        assert!(probe.enabled);
        assert_eq!(probe.search_low, 1024 + 40);
        assert_eq!(mss.sync(9000, &mut probe), 1024);
        assert_eq!(probe.search_high, 9000);
    }

    #[test]
    fn tso_budget() {
        let config = Config::default();
        assert_eq!(tso_segment_budget(&config, None, MSS, 2), 44);
        // Paced at 1 MiB/s a millisecond is less than a segment, the floor applies.
        assert_eq!(tso_segment_budget(&config, Some(1 << 20), MSS, 2), 2);
        let config = Config { gso_max_segs: 1, ..Config::default() };
        assert_eq!(tso_segment_budget(&config, None, MSS, 2), 1);
    }
}
