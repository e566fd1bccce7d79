use crate::time::{Expiration, Instant};

/// What a timer is armed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    /// Retransmission timeout.
    Retransmit,
    /// Tail loss probe.
    LossProbe,
    /// Probe of a closed peer window.
    ZeroWindowProbe,
    /// End of a pacing gap.
    Pacing,
    /// A delayed acknowledgement is due.
    DelayedAck,
    /// Keepalive probing.
    Keepalive,
}

impl TimerPurpose {
    /// All purposes, in a fixed order.
    pub const ALL: [TimerPurpose; 6] = [
        TimerPurpose::Retransmit,
        TimerPurpose::LossProbe,
        TimerPurpose::ZeroWindowProbe,
        TimerPurpose::Pacing,
        TimerPurpose::DelayedAck,
        TimerPurpose::Keepalive,
    ];

    fn index(self) -> usize {
        match self {
            TimerPurpose::Retransmit => 0,
            TimerPurpose::LossProbe => 1,
            TimerPurpose::ZeroWindowProbe => 2,
            TimerPurpose::Pacing => 3,
            TimerPurpose::DelayedAck => 4,
            TimerPurpose::Keepalive => 5,
        }
    }
}

/// The timer service consumed by the engine.
///
/// At most one deadline per purpose is pending. Arming an armed purpose moves its deadline. Once
/// a deadline has passed, the owner calls [`Engine::on_timer`] with the purpose. Calls for
/// cancelled or moved timers are harmless, the engine checks its own state.
///
/// [`Engine::on_timer`]: struct.Engine.html#method.on_timer
pub trait Timers {
    /// Arm (or move) the timer for `purpose`.
    fn arm(&mut self, deadline: Instant, purpose: TimerPurpose);

    /// Disarm the timer for `purpose`, if armed.
    fn cancel(&mut self, purpose: TimerPurpose);
}

impl<T: Timers + ?Sized> Timers for &'_ mut T {
    fn arm(&mut self, deadline: Instant, purpose: TimerPurpose) {
        (**self).arm(deadline, purpose)
    }

    fn cancel(&mut self, purpose: TimerPurpose) {
        (**self).cancel(purpose)
    }
}

/// The one logical retransmission timer of a connection.
///
/// Retransmission timeouts, loss probes and zero window probes share it, only one of them is
/// ever armed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum XmitTimer {
    /// Nothing outstanding, nothing to probe.
    Idle,
    /// Waiting for an acknowledgement of outstanding data.
    RetransmitArmed(Instant),
    /// A tail loss probe is scheduled.
    LossProbeArmed(Instant),
    /// Probing a closed peer window.
    ZeroWindowProbeArmed(Instant),
    /// Waiting for the acknowledgement of a path MTU probe.
    MtuProbePending(Instant),
}

impl XmitTimer {
    /// The timer purpose this state is armed with.
    pub fn purpose(self) -> Option<TimerPurpose> {
        match self {
            XmitTimer::Idle => None,
            XmitTimer::RetransmitArmed(_) | XmitTimer::MtuProbePending(_) => Some(TimerPurpose::Retransmit),
            XmitTimer::LossProbeArmed(_) => Some(TimerPurpose::LossProbe),
            XmitTimer::ZeroWindowProbeArmed(_) => Some(TimerPurpose::ZeroWindowProbe),
        }
    }

    /// The deadline, if armed.
    pub fn deadline(self) -> Option<Instant> {
        match self {
            XmitTimer::Idle => None,
            XmitTimer::RetransmitArmed(at)
            | XmitTimer::LossProbeArmed(at)
            | XmitTimer::ZeroWindowProbeArmed(at)
            | XmitTimer::MtuProbePending(at) => Some(at),
        }
    }

    /// Whether the state is armed at all.
    pub fn is_armed(self) -> bool {
        self != XmitTimer::Idle
    }
}

impl Default for XmitTimer {
    fn default() -> Self {
        XmitTimer::Idle
    }
}

/// A table of deadlines, advanced by hand.
///
/// Used by tests and simulations that drive time themselves.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManualTimers {
    deadlines: [Expiration; 6],
}

impl ManualTimers {
    /// A table with nothing armed.
    pub fn new() -> Self {
        ManualTimers::default()
    }

    /// The deadline of `purpose`, if armed.
    pub fn deadline(&self, purpose: TimerPurpose) -> Option<Instant> {
        self.deadlines[purpose.index()].into()
    }

    /// Whether `purpose` is armed.
    pub fn is_armed(&self, purpose: TimerPurpose) -> bool {
        self.deadline(purpose).is_some()
    }

    /// The earliest armed deadline.
    pub fn next(&self) -> Option<(Instant, TimerPurpose)> {
        TimerPurpose::ALL.iter()
            .filter_map(|&purpose| self.deadline(purpose).map(|at| (at, purpose)))
            .min_by_key(|&(at, _)| at)
    }

    /// Disarm and return the earliest timer due at `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerPurpose> {
        let purpose = TimerPurpose::ALL.iter()
            .copied()
            .min_by_key(|purpose| self.deadlines[purpose.index()])?;
        let slot = &mut self.deadlines[purpose.index()];
        if !slot.is_due(now) {
            return None;
        }
        *slot = Expiration::Never;
        Some(purpose)
    }
}

impl Timers for ManualTimers {
    fn arm(&mut self, deadline: Instant, purpose: TimerPurpose) {
        net_trace!("timer: arm {:?} at {}", purpose, deadline);
        self.deadlines[purpose.index()] = Expiration::When(deadline);
    }

    fn cancel(&mut self, purpose: TimerPurpose) {
        self.deadlines[purpose.index()] = Expiration::Never;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pops_in_deadline_order() {
        let mut timers = ManualTimers::new();
        timers.arm(Instant::from_millis(300), TimerPurpose::Retransmit);
        timers.arm(Instant::from_millis(40), TimerPurpose::DelayedAck);
        timers.arm(Instant::from_millis(100), TimerPurpose::Retransmit);
        assert_eq!(timers.next(), Some((Instant::from_millis(40), TimerPurpose::DelayedAck)));

        assert_eq!(timers.pop_due(Instant::from_millis(39)), None);
        assert_eq!(timers.pop_due(Instant::from_millis(500)), Some(TimerPurpose::DelayedAck));
        assert_eq!(timers.pop_due(Instant::from_millis(500)), Some(TimerPurpose::Retransmit));
        assert_eq!(timers.pop_due(Instant::from_millis(500)), None);
    }

    #[test]
    fn cancel_disarms() {
        let mut timers = ManualTimers::new();
        timers.arm(Instant::from_millis(1), TimerPurpose::Keepalive);
        timers.cancel(TimerPurpose::Keepalive);
        assert!(!timers.is_armed(TimerPurpose::Keepalive));
        assert_eq!(timers.next(), None);
    }

    #[test]
    fn xmit_timer_purposes() {
        let at = Instant::from_millis(5);
        assert_eq!(XmitTimer::MtuProbePending(at).purpose(), Some(TimerPurpose::Retransmit));
        assert_eq!(XmitTimer::LossProbeArmed(at).deadline(), Some(at));
        assert!(!XmitTimer::Idle.is_armed());
    }
}
