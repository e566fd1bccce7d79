//! The TCP send engine.
//!
//! Turns a byte stream queued by the user into segments and decides when each may be handed to the
//! transport. Incoming acknowledgements, window updates and timer expirations are fed back in and
//! drive retransmission and window growth. Receiving and reassembling data is not part of this
//! module, only what the receive side needs to tell the send side: where the next expected byte
//! is, how much buffer space is free and whether data arrived out of order.
//!
//! ## Structure
//!
//! An [`Engine`] owns the [`Connection`] state and a [`SegmentQueue`]. Everything else is plugged
//! in. Segments go out through a [`Transmit`] implementation, the congestion window is decided by
//! a [`CongestionControl`] algorithm and deadlines are kept by a [`Timers`] service.
//!
//! Sending is done in passes. Each pass runs the gates of the [`decision`] on the head of the write
//! queue, cuts the segment down to what may be sent, hands it over and moves it to the
//! retransmission queue. A pass ends at the first gate that says no. Which gate said no is
//! available as a [`Verdict`] for inspection.
//!
//! [`Engine`]: struct.Engine.html
//! [`Connection`]: struct.Connection.html
//! [`SegmentQueue`]: struct.SegmentQueue.html
//! [`Transmit`]: ../../nic/trait.Transmit.html
//! [`CongestionControl`]: trait.CongestionControl.html
//! [`Timers`]: trait.Timers.html
//! [`decision`]: fn.cwnd_quota.html
//! [`Verdict`]: enum.Verdict.html
//!
//! ## Timers
//!
//! Retransmission timeouts, tail loss probes and zero window probes share one logical timer whose
//! state is an [`XmitTimer`]. At most one of them is ever armed. Pacing, delayed acknowledgements
//! and keepalives have timers of their own.
//!
//! [`XmitTimer`]: enum.XmitTimer.html
//!
//! ## Deviations
//!
//! Loss is only ever detected by timeouts and probes. Duplicate acknowledgements are not counted
//! and there is no fast retransmit, selective acknowledgements only keep segments out of the
//! retransmission walk. The congestion avoidance state has no `Disorder` or `Recovery` phase for
//! the same reason.
mod config;
mod congestion;
mod connection;
mod control;
mod counters;
mod decision;
mod driver;
mod engine;
mod queue;
mod retransmit;
mod rtt;
mod segment;
mod timer;
pub mod window;

#[cfg(test)]
mod tests;

pub use config::{Config, Keepalive, MtuProbing};

pub use congestion::{AckEvent, CongestionControl, NewReno};

pub use connection::{
    CaState,
    Connection,
    CwndUsage,
    DelayedAck,
    Incoming,
    Pacing,
    Ports,
    Receive,
    Send,
    State,
    SynRequest,
};

pub use counters::Counters;

pub use decision::{
    cwnd_quota,
    minshall_check,
    nagle_check,
    small_queue_check,
    snd_wnd_test,
    tso_count,
    Nagle,
    PushOne,
    Verdict,
};

pub use driver::XmitOutcome;

pub use engine::Engine;

pub use queue::{Acked, SegmentQueue};

pub use rtt::{Estimator, Rto};

pub use segment::{Segment, SegmentHandle, SegmentState};

pub use timer::{ManualTimers, TimerPurpose, Timers, XmitTimer};
