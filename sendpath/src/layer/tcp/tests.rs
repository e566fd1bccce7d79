//! Tcp layer tests.
//!
//! Every test runs a connection against a loopback transport and a hand driven timer table. The
//! peer is played by the test itself: it answers the handshake, acknowledges what it wants to and
//! fires timers at their deadlines. Nothing here parses segments back from bytes, the transport
//! keeps them in their structured form.
use bytes::Bytes;

use crate::layer::Error;
use crate::nic::{Loopback, OutSegment, TransmitError};
use crate::storage::MemoryBudget;
use crate::time::{Duration, Instant};
use crate::wire::{Flags, Options, SeqNumber};

use super::*;

const ISS: SeqNumber = SeqNumber(1000);
const IRS: SeqNumber = SeqNumber(5000);
const MSS: u32 = 1460;
const RTT: Duration = Duration::from_millis(10);

type TestEngine = Engine<Loopback, NewReno, ManualTimers>;

fn config() -> Config {
    Config {
        timestamps: false,
        ..Config::default()
    }
}

fn peer_options() -> Options {
    Options {
        mss: Some(1460),
        sack_permitted: true,
        ..Options::default()
    }
}

fn start() -> Instant {
    Instant::from_millis(1_000)
}

fn payload(len: usize) -> Bytes {
    Bytes::from(vec![0x5a_u8; len])
}

fn new_engine(config: Config, cc: NewReno) -> TestEngine {
    Engine::new(
        config,
        Ports { local: 80, remote: 49152 },
        ISS,
        MemoryBudget::unlimited(),
        Loopback::new(),
        cc,
        ManualTimers::new())
}

/// A connection that completed an active open, with one round trip time sample of `RTT`.
fn established_with_window(config: Config, cc: NewReno, window: u16) -> (TestEngine, Instant) {
    let mut engine = new_engine(config, cc);
    engine.connect(start()).unwrap();
    let syn = drain(&mut engine);
    assert_eq!(syn.len(), 1);
    assert!(syn[0].repr.flags.syn());

    let now = start() + RTT;
    engine.on_syn_ack(IRS, ISS + 1, window, &peer_options(), now).unwrap();
    assert_eq!(engine.state(), State::Established);
    drain(&mut engine);
    (engine, now)
}

fn established(config: Config, cc: NewReno) -> (TestEngine, Instant) {
    established_with_window(config, cc, 65535)
}

fn drain(engine: &mut TestEngine) -> Vec<OutSegment> {
    engine.transport_mut().drain().collect()
}

fn ack(engine: &mut TestEngine, ack: SeqNumber, now: Instant) {
    engine.on_ack_received(ack, 65535, &Options::default(), now).unwrap();
}

fn incoming(seq: SeqNumber, len: u32) -> Incoming {
    Incoming {
        seq,
        len,
        flags: Flags::NONE,
        timestamps: None,
        free_space: 65535,
        under_pressure: false,
        out_of_order: false,
    }
}

#[test]
fn nagle_batches_small_writes() {
    let (mut engine, now) = established(config(), NewReno::new());
    for _ in 0..3 {
        assert_eq!(engine.queue_for_send(payload(100), Flags::NONE, now), Ok(100));
    }

    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq(), ISS + 1);
    assert_eq!(sent[0].payload.len(), 100);
    assert_eq!(engine.counters().nagle_deferred, 2);
    // The two held back writes share one segment.
    assert_eq!(engine.queue().unsent().count(), 1);
    assert_eq!(engine.queue().unsent_bytes(), 200);

    for _ in 0..3 {
        assert_eq!(engine.push_now(now), Ok(XmitOutcome::Idle));
    }
    assert!(engine.transport().is_empty());

    ack(&mut engine, ISS + 101, now + RTT);
    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq(), ISS + 101);
    assert_eq!(sent[0].payload.len(), 200);
}

#[test]
fn full_window_defers_until_ack() {
    let config = Config { nodelay: true, ..config() };
    let (mut engine, now) = established(config, NewReno::with_window(3));
    engine.queue_for_send(payload(3 * MSS as usize), Flags::NONE, now).unwrap();

    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|seg| seg.payload.len() == MSS as usize));
    assert_eq!(engine.queue().in_flight(), 3);

    engine.queue_for_send(payload(MSS as usize), Flags::NONE, now).unwrap();
    assert_eq!(engine.next_verdict(now), Some(Verdict::DeferCwnd));
    assert_eq!(engine.push_now(now + RTT / 2), Ok(XmitOutcome::Idle));
    assert_eq!(engine.next_verdict(now + RTT / 2), Some(Verdict::DeferCwnd));
    assert!(engine.transport().is_empty());

    ack(&mut engine, ISS + 1 + MSS, now + RTT);
    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq(), ISS + 1 + 3 * MSS);
    assert_eq!(engine.next_verdict(now + RTT), None);
}

#[test]
fn timeout_retransmits_head_with_backoff() {
    let config = Config { nodelay: true, tail_loss_probe: false, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.queue_for_send(payload(1000), Flags::NONE, now).unwrap();
    let first = drain(&mut engine);
    assert_eq!(first.len(), 1);

    let rto = engine.connection().rto.get();
    assert_eq!(rto, Duration::from_millis(200));
    let deadline = now + rto;
    assert_eq!(engine.xmit_timer(), XmitTimer::RetransmitArmed(deadline));
    assert_eq!(engine.timers().deadline(TimerPurpose::Retransmit), Some(deadline));

    // Too early, only re-armed.
    engine.on_timer(TimerPurpose::Retransmit, deadline - Duration::from_millis(1)).unwrap();
    assert!(engine.transport().is_empty());

    engine.on_timer(TimerPurpose::Retransmit, deadline).unwrap();
    let resent = drain(&mut engine);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].seq(), first[0].seq());
    assert_eq!(resent[0].payload, first[0].payload);
    assert_eq!(engine.counters().retransmits, 1);
    assert_eq!(engine.counters().rto_timeouts, 1);
    assert_eq!(engine.connection().retransmits, 1);
    assert_eq!(engine.connection().ca_state, CaState::Loss);
    assert_eq!(engine.congestion().current_window(), 1);

    let backed_off = engine.connection().rto.get();
    assert!(backed_off > rto);
    assert_eq!(engine.timers().deadline(TimerPurpose::Retransmit), Some(deadline + backed_off));

    ack(&mut engine, ISS + 1001, deadline + RTT);
    assert_eq!(engine.connection().ca_state, CaState::Open);
    assert_eq!(engine.xmit_timer(), XmitTimer::Idle);
    assert!(!engine.timers().is_armed(TimerPurpose::Retransmit));
}

#[test]
fn timeouts_give_up_after_retries() {
    let config = Config { nodelay: true, tail_loss_probe: false, retries2: 2, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.queue_for_send(payload(1000), Flags::NONE, now).unwrap();

    for _ in 0..2 {
        let at = engine.timers().deadline(TimerPurpose::Retransmit).unwrap();
        engine.on_timer(TimerPurpose::Retransmit, at).unwrap();
    }
    let at = engine.timers().deadline(TimerPurpose::Retransmit).unwrap();
    assert_eq!(engine.on_timer(TimerPurpose::Retransmit, at), Err(Error::TimedOut));
    assert_eq!(engine.state(), State::Closed);
    assert_eq!(engine.counters().timeouts, 1);
    assert_eq!(engine.timers().next(), None);
    assert!(engine.queue().rtx_is_empty());
}

#[test]
fn cut_at_mss_without_offload() {
    let config = Config { gso_max_segs: 1, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.queue_for_send(payload(3000), Flags::NONE, now).unwrap();

    let sent = drain(&mut engine);
    let lens: Vec<usize> = sent.iter().map(|seg| seg.payload.len()).collect();
    assert_eq!(lens, [1460, 1460, 80]);
    assert!(sent.iter().all(|seg| seg.gso_size.is_none()));
    for pair in sent.windows(2) {
        assert_eq!(pair[0].end_seq(), pair[1].seq());
    }
}

#[test]
fn offload_segment_carries_whole_mss_and_cork_holds_tail() {
    let (mut engine, now) = established(config(), NewReno::new());
    engine.set_cork(true, now).unwrap();
    engine.queue_for_send(payload(3000), Flags::NONE, now).unwrap();

    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload.len(), 2 * MSS as usize);
    assert_eq!(sent[0].gso_size, Some(MSS as u16));
    assert_eq!(sent[0].wire_segments(), 2);
    assert_eq!(engine.queue().packets_out(), 2);
    assert_eq!(engine.next_verdict(now), Some(Verdict::DeferNagle));

    engine.set_cork(false, now).unwrap();
    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq(), ISS + 1 + 2 * MSS);
    assert_eq!(sent[0].payload.len(), 80);
}

#[test]
fn window_and_sequence_order_hold_over_transfer() {
    let config = Config { nodelay: true, ..config() };
    let window = 4000;
    let (mut engine, mut now) = established_with_window(config, NewReno::new(), window);
    let total = 20_000;
    engine.queue_for_send(payload(total as usize), Flags::NONE, now).unwrap();

    let mut next = ISS + 1;
    for _ in 0..100 {
        let window_end = engine.connection().window_end();
        assert!(engine.queue().in_flight() <= engine.congestion().current_window());
        for seg in drain(&mut engine) {
            assert_eq!(seg.seq(), next);
            assert!(!seg.end_seq().after(window_end), "{} beyond {}", seg.end_seq(), window_end);
            next = seg.end_seq();
        }
        if next == ISS + 1 + total {
            break;
        }
        now += RTT;
        engine.on_ack_received(next, window, &Options::default(), now).unwrap();
    }
    assert_eq!(next, ISS + 1 + total);
}

#[test]
fn loss_probe_resends_last_mss() {
    let config = Config { nodelay: true, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.queue_for_send(payload(2000), Flags::NONE, now).unwrap();
    assert_eq!(drain(&mut engine).len(), 1);
    assert_eq!(engine.queue().packets_out(), 2);

    let probe_at = now + RTT * 2 + Duration::from_millis(2);
    assert_eq!(engine.xmit_timer(), XmitTimer::LossProbeArmed(probe_at));

    engine.on_transmit_complete(ISS + 2001, 2000, now).unwrap();
    engine.on_timer(TimerPurpose::LossProbe, probe_at).unwrap();
    let probe = drain(&mut engine);
    assert_eq!(probe.len(), 1);
    assert_eq!(probe[0].seq(), ISS + 1 + MSS);
    assert_eq!(probe[0].payload.len(), 2000 - MSS as usize);
    assert_eq!(engine.counters().loss_probes, 1);
    assert_eq!(engine.counters().retransmits, 0);
    assert_eq!(engine.connection().tlp_high_seq, Some(ISS + 2001));
    match engine.xmit_timer() {
        XmitTimer::RetransmitArmed(_) => (),
        other => panic!("Unexpected timer {:?}", other),
    }

    // No second probe while the first is unanswered.
    engine.queue_for_send(payload(100), Flags::NONE, probe_at).unwrap();
    assert_eq!(drain(&mut engine).len(), 1);
    match engine.xmit_timer() {
        XmitTimer::RetransmitArmed(_) => (),
        other => panic!("Unexpected timer {:?}", other),
    }

    ack(&mut engine, ISS + 2101, probe_at + RTT);
    assert_eq!(engine.connection().tlp_high_seq, None);
}

#[test]
fn loss_probe_exceeds_full_window_by_one() {
    let config = Config { nodelay: true, ..config() };
    let (mut engine, now) = established(config, NewReno::with_window(2));
    engine.queue_for_send(payload(3 * MSS as usize), Flags::NONE, now).unwrap();
    assert_eq!(drain(&mut engine).len(), 2);
    assert_eq!(engine.next_verdict(now), Some(Verdict::DeferCwnd));

    let probe_at = now + RTT * 2 + Duration::from_millis(2);
    assert_eq!(engine.xmit_timer(), XmitTimer::LossProbeArmed(probe_at));
    engine.on_timer(TimerPurpose::LossProbe, probe_at).unwrap();

    let probe = drain(&mut engine);
    assert_eq!(probe.len(), 1);
    assert_eq!(probe[0].seq(), ISS + 1 + 2 * MSS);
    assert_eq!(engine.queue().in_flight(), 3);
    assert_eq!(engine.congestion().current_window(), 2);
    assert_eq!(engine.counters().loss_probes, 1);
}

#[test]
fn loss_probe_waits_for_transport_queue() {
    let config = Config { nodelay: true, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.queue_for_send(payload(2000), Flags::NONE, now).unwrap();
    let probe_at = now + RTT * 2 + Duration::from_millis(2);
    assert_eq!(engine.xmit_timer(), XmitTimer::LossProbeArmed(probe_at));

    // The first transmission has not left the transport yet.
    engine.on_timer(TimerPurpose::LossProbe, probe_at).unwrap();
    assert_eq!(engine.transport().len(), 1);
    assert_eq!(engine.counters().loss_probes, 0);
    assert_eq!(engine.connection().tlp_high_seq, None);
    let rto = engine.connection().rto.get();
    assert_eq!(engine.xmit_timer(), XmitTimer::RetransmitArmed(probe_at + rto));
}

#[test]
fn loss_probe_without_completion() {
    let config = Config { nodelay: true, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.queue_for_send(payload(2000), Flags::NONE, now).unwrap();
    assert_eq!(drain(&mut engine).len(), 1);
    let probe_at = now + RTT * 2 + Duration::from_millis(2);

    // The transport let go of the segment but never reported it.
    engine.on_timer(TimerPurpose::LossProbe, probe_at).unwrap();
    let probe = drain(&mut engine);
    assert_eq!(probe.len(), 1);
    assert_eq!(probe[0].seq(), ISS + 1 + MSS);
    assert_eq!(probe[0].payload.len(), 2000 - MSS as usize);
    assert_eq!(engine.counters().loss_probes, 1);
    assert_eq!(engine.connection().tlp_high_seq, Some(ISS + 2001));
}

#[test]
fn zero_window_probes_back_off() {
    let config = Config { nodelay: true, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.on_ack_received(ISS + 1, 0, &Options::default(), now).unwrap();
    assert_eq!(engine.queue_for_send(payload(500), Flags::NONE, now), Ok(500));
    assert!(engine.transport().is_empty());
    assert_eq!(engine.next_verdict(now), Some(Verdict::DeferWindow));

    let base = engine.connection().rto.get();
    let first = now + base;
    assert_eq!(engine.xmit_timer(), XmitTimer::ZeroWindowProbeArmed(first));

    engine.on_timer(TimerPurpose::ZeroWindowProbe, first).unwrap();
    let probe = drain(&mut engine);
    assert_eq!(probe.len(), 1);
    assert_eq!(probe[0].seq(), ISS);
    assert!(probe[0].payload.is_empty());
    assert_eq!(probe[0].repr.ack_number, Some(IRS + 1));
    assert_eq!(engine.counters().zero_window_probes, 1);
    let second = first + base * 2;
    assert_eq!(engine.xmit_timer(), XmitTimer::ZeroWindowProbeArmed(second));

    engine.on_timer(TimerPurpose::ZeroWindowProbe, second).unwrap();
    assert_eq!(drain(&mut engine).len(), 1);
    assert_eq!(engine.xmit_timer(), XmitTimer::ZeroWindowProbeArmed(second + base * 4));
    assert_eq!(engine.connection().probes_out, 2);

    engine.on_ack_received(ISS + 1, 65535, &Options::default(), second + RTT).unwrap();
    let data = drain(&mut engine);
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].seq(), ISS + 1);
    assert_eq!(data[0].payload.len(), 500);
    assert_eq!(engine.connection().probes_out, 0);
    assert_eq!(engine.connection().backoff, 0);
}

#[test]
fn zero_window_probing_gives_up() {
    let config = Config { nodelay: true, retries2: 2, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.on_ack_received(ISS + 1, 0, &Options::default(), now).unwrap();
    engine.queue_for_send(payload(500), Flags::NONE, now).unwrap();

    for _ in 0..2 {
        let at = engine.xmit_timer().deadline().unwrap();
        engine.on_timer(TimerPurpose::ZeroWindowProbe, at).unwrap();
    }
    let at = engine.xmit_timer().deadline().unwrap();
    assert_eq!(engine.on_timer(TimerPurpose::ZeroWindowProbe, at), Err(Error::TimedOut));
    assert_eq!(engine.state(), State::Closed);
    assert_eq!(engine.counters().timeouts, 1);
}

#[test]
fn small_window_gets_partial_segment() {
    let config = Config { nodelay: true, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.on_ack_received(ISS + 1, 0, &Options::default(), now).unwrap();
    engine.queue_for_send(payload(1000), Flags::NONE, now).unwrap();

    engine.on_ack_received(ISS + 1, 500, &Options::default(), now + RTT).unwrap();
    assert!(engine.transport().is_empty());
    let at = match engine.xmit_timer() {
        XmitTimer::ZeroWindowProbeArmed(at) => at,
        other => panic!("Unexpected timer {:?}", other),
    };

    engine.on_timer(TimerPurpose::ZeroWindowProbe, at).unwrap();
    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq(), ISS + 1);
    assert_eq!(sent[0].payload.len(), 500);
    assert!(sent[0].repr.flags.psh());
    assert_eq!(engine.counters().zero_window_probes, 0);
    match engine.xmit_timer() {
        XmitTimer::RetransmitArmed(_) | XmitTimer::LossProbeArmed(_) => (),
        other => panic!("Unexpected timer {:?}", other),
    }
}

fn probing() -> Config {
    Config {
        nodelay: true,
        mtu_probing: MtuProbing::Always,
        ..config()
    }
}

#[test]
fn mtu_probe_success_raises_mss() {
    let (mut engine, now) = established(probing(), NewReno::with_window(20));
    // Searching starts from the base MSS.
    assert_eq!(engine.connection().mss.cache, 1024);
    engine.queue_for_send(payload(10_000), Flags::NONE, now).unwrap();

    let sent = drain(&mut engine);
    assert_eq!(sent[0].payload.len(), 1242);
    assert_eq!(sent[0].gso_size, None);
    assert_eq!(sent.iter().map(|seg| seg.payload.len()).sum::<usize>(), 10_000);
    assert_eq!(engine.counters().mtu_probes, 1);
    assert_eq!(engine.connection().mtu_probe.probe_size, 1282);
    match engine.xmit_timer() {
        XmitTimer::MtuProbePending(_) => (),
        other => panic!("Unexpected timer {:?}", other),
    }

    ack(&mut engine, ISS + 1 + 1242, now + RTT);
    assert_eq!(engine.counters().mtu_probe_success, 1);
    let probe = engine.connection().mtu_probe;
    assert_eq!(probe.search_low, 1282);
    assert_eq!(probe.probe_size, 0);
    assert_eq!(engine.connection().mss.cache, 1242);
}

#[test]
fn mtu_probe_loss_narrows_search() {
    let (mut engine, now) = established(probing(), NewReno::with_window(20));
    engine.queue_for_send(payload(10_000), Flags::NONE, now).unwrap();
    drain(&mut engine);
    let deadline = match engine.xmit_timer() {
        XmitTimer::MtuProbePending(at) => at,
        other => panic!("Unexpected timer {:?}", other),
    };

    engine.on_transmit_complete(ISS + 10_001, 10_000, now).unwrap();
    engine.on_timer(TimerPurpose::Retransmit, deadline).unwrap();

    assert_eq!(engine.counters().mtu_probe_failed, 1);
    let probe = engine.connection().mtu_probe;
    assert_eq!(probe.search_high, 1281);
    assert_eq!(probe.probe_size, 0);
    assert_eq!(engine.connection().mss.cache, 1024);

    // Only the oversized probe is resent, cut to the current MSS.
    let resent = drain(&mut engine);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].seq(), ISS + 1);
    assert_eq!(resent[0].payload.len(), 1242);
    assert_eq!(resent[0].gso_size, Some(1024));
    assert_eq!(engine.counters().retransmits, 1);
}

#[test]
fn smaller_path_mtu_resends_oversized() {
    let config = Config { nodelay: true, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.queue_for_send(payload(MSS as usize), Flags::NONE, now).unwrap();
    drain(&mut engine);
    engine.on_transmit_complete(ISS + 1 + MSS, MSS, now).unwrap();

    engine.set_path_mtu(1280, now).unwrap();
    assert_eq!(engine.connection().mss.cache, 1240);
    let resent = drain(&mut engine);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].seq(), ISS + 1);
    assert_eq!(resent[0].payload.len(), MSS as usize);
    assert_eq!(resent[0].gso_size, Some(1240));
    assert_eq!(engine.connection().ca_state, CaState::Loss);
}

#[test]
fn retransmission_skips_sacked() {
    let config = Config { nodelay: true, tail_loss_probe: false, gso_max_segs: 1, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.queue_for_send(payload(3 * MSS as usize), Flags::NONE, now).unwrap();
    assert_eq!(drain(&mut engine).len(), 3);

    let sack = Options {
        sack_ranges: [Some(((ISS + 1 + MSS).0, (ISS + 1 + 2 * MSS).0)), None, None],
        ..Options::default()
    };
    engine.on_ack_received(ISS + 1, 65535, &sack, now + RTT).unwrap();
    assert_eq!(engine.queue().sacked_out(), 1);

    let deadline = engine.timers().deadline(TimerPurpose::Retransmit).unwrap();
    engine.on_timer(TimerPurpose::Retransmit, deadline).unwrap();
    let resent = drain(&mut engine);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].seq(), ISS + 1);

    ack(&mut engine, ISS + 1 + MSS, deadline + RTT);
    let resent = drain(&mut engine);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].seq(), ISS + 1 + 2 * MSS);
}

#[test]
fn timeout_skips_sacked_head() {
    let config = Config { nodelay: true, tail_loss_probe: false, gso_max_segs: 1, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.queue_for_send(payload(3 * MSS as usize), Flags::NONE, now).unwrap();
    assert_eq!(drain(&mut engine).len(), 3);

    let sack = Options {
        sack_ranges: [Some(((ISS + 1).0, (ISS + 1 + MSS).0)), None, None],
        ..Options::default()
    };
    engine.on_ack_received(ISS + 1, 65535, &sack, now + RTT).unwrap();
    assert_eq!(engine.queue().sacked_out(), 1);

    let deadline = engine.timers().deadline(TimerPurpose::Retransmit).unwrap();
    engine.on_timer(TimerPurpose::Retransmit, deadline).unwrap();
    let resent = drain(&mut engine);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].seq(), ISS + 1 + MSS);
    assert_eq!(engine.counters().retransmits, 1);
}

#[test]
fn unreachable_tears_down() {
    let (mut engine, now) = established(config(), NewReno::new());
    let budget = engine.queue().budget().clone();
    engine.transport_mut().fail_next(TransmitError::Unreachable);

    assert_eq!(engine.queue_for_send(payload(100), Flags::NONE, now), Err(Error::Unreachable));
    assert_eq!(engine.state(), State::Closed);
    assert!(engine.queue().write_is_empty());
    assert!(engine.queue().rtx_is_empty());
    assert_eq!(engine.timers().next(), None);
    assert_eq!(budget.bytes_used(), 0);

    assert_eq!(engine.push_now(now), Ok(XmitOutcome::Idle));
    assert_eq!(engine.queue_for_send(payload(100), Flags::NONE, now), Err(Error::Closed));
}

#[test]
fn congested_transport_is_transient() {
    let config = Config { nodelay: true, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.transport_mut().fail_next(TransmitError::Congested);

    assert_eq!(engine.queue_for_send(payload(100), Flags::NONE, now), Ok(100));
    assert!(engine.transport().is_empty());
    assert_eq!(engine.state(), State::Established);
    assert_eq!(engine.connection().send.next, ISS + 1);
    assert_eq!(engine.connection().ca_state, CaState::Cwr);
    assert_eq!(engine.congestion().current_window(), 5);
    // Nothing is outstanding that could restart sending.
    match engine.xmit_timer() {
        XmitTimer::ZeroWindowProbeArmed(_) => (),
        other => panic!("Unexpected timer {:?}", other),
    }

    assert_eq!(engine.push_now(now + RTT), Ok(XmitOutcome::Sent(1)));
    assert_eq!(drain(&mut engine).len(), 1);
}

#[test]
#[cfg(debug_assertions)]
#[should_panic(expected = "empty segment at the head of the write queue")]
fn empty_head_segment_is_refused() {
    let config = Config { nodelay: true, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.on_ack_received(ISS + 1, 0, &Options::default(), now).unwrap();
    engine.queue_for_send(payload(100), Flags::NONE, now).unwrap();
    assert!(engine.transport().is_empty());

    let head = engine.queue().write_head().unwrap().handle();
    let seg = engine.queue.unsent_mut(head).unwrap();
    seg.payload = Bytes::new();
    seg.end_seq = seg.seq;
    let _ = engine.push_now(now);
}

#[test]
fn busy_retransmission_is_retried() {
    let config = Config { nodelay: true, tail_loss_probe: false, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.queue_for_send(payload(100), Flags::NONE, now).unwrap();
    drain(&mut engine);

    let deadline = now + engine.connection().rto.get();
    engine.transport_mut().fail_next(TransmitError::Busy);
    assert_eq!(engine.on_timer(TimerPurpose::Retransmit, deadline), Ok(()));
    assert!(engine.transport().is_empty());
    assert_eq!(engine.counters().retransmits, 0);
    assert_eq!(engine.state(), State::Established);
    let retry = deadline + Duration::from_millis(200);
    assert_eq!(engine.xmit_timer(), XmitTimer::RetransmitArmed(retry));

    engine.on_timer(TimerPurpose::Retransmit, retry).unwrap();
    let resent = drain(&mut engine);
    assert_eq!(resent.len(), 1);
    assert_eq!(resent[0].seq(), ISS + 1);
    assert_eq!(engine.counters().retransmits, 1);
}

#[test]
fn small_queue_waits_for_completion() {
    let config = Config { nodelay: true, limit_output_bytes: 3000, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.queue_for_send(payload(10 * MSS as usize), Flags::NONE, now).unwrap();

    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload.len(), 5 * MSS as usize);
    assert_eq!(engine.next_verdict(now), Some(Verdict::DeferSmallQueue));
    assert!(engine.connection().tsq_throttled);
    assert_eq!(engine.counters().tsq_throttled, 1);

    engine.on_transmit_complete(ISS + 1 + 5 * MSS, 5 * MSS, now).unwrap();
    assert!(!engine.connection().tsq_throttled);
    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq(), ISS + 1 + 5 * MSS);
    assert_eq!(sent[0].payload.len(), 5 * MSS as usize);
}

#[test]
fn pacing_spaces_transmissions() {
    let config = Config { nodelay: true, pacing: true, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.queue_for_send(payload(100), Flags::NONE, now).unwrap();
    let now = now + RTT;
    ack(&mut engine, ISS + 101, now);
    drain(&mut engine);
    let rate = engine.connection().pacing.rate.unwrap();

    // The rate allows two MSS per offload segment.
    engine.queue_for_send(payload(5000), Flags::NONE, now).unwrap();
    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload.len(), 2 * MSS as usize);

    let gap = Duration::from_micros(u64::from(2 * MSS) * 1_000_000 / rate);
    assert_eq!(engine.timers().deadline(TimerPurpose::Pacing), Some(now + gap));
    assert_eq!(engine.next_verdict(now), Some(Verdict::DeferPacing));

    engine.on_timer(TimerPurpose::Pacing, now + gap).unwrap();
    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].seq(), ISS + 101 + 2 * MSS);
    assert_eq!(sent[0].payload.len(), 5000 - 2 * MSS as usize);
}

#[test]
fn idle_restarts_window() {
    let (mut engine, now) = established(config(), NewReno::with_window(40));
    engine.queue_for_send(payload(100), Flags::NONE, now + Duration::from_millis(700)).unwrap();
    assert_eq!(engine.congestion().current_window(), 10);

    let config = Config { slow_start_after_idle: false, ..config() };
    let (mut engine, now) = established(config, NewReno::with_window(40));
    engine.queue_for_send(payload(100), Flags::NONE, now + Duration::from_millis(700)).unwrap();
    assert_eq!(engine.congestion().current_window(), 40);
}

#[test]
fn delayed_ack_fires_after_ato() {
    let (mut engine, now) = established(config(), NewReno::new());
    engine.on_data_received(incoming(IRS + 1, 500), now).unwrap();
    assert!(engine.transport().is_empty());

    let due = now + Duration::from_millis(40);
    assert_eq!(engine.timers().deadline(TimerPurpose::DelayedAck), Some(due));
    engine.on_timer(TimerPurpose::DelayedAck, due).unwrap();

    let acks = drain(&mut engine);
    assert_eq!(acks.len(), 1);
    assert!(acks[0].payload.is_empty());
    assert_eq!(acks[0].repr.ack_number, Some(IRS + 501));
    assert_eq!(engine.counters().delayed_acks, 1);
}

#[test]
fn data_carries_pending_ack() {
    let config = Config { nodelay: true, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.on_data_received(incoming(IRS + 1, 500), now).unwrap();
    assert!(engine.timers().is_armed(TimerPurpose::DelayedAck));

    engine.queue_for_send(Bytes::from_static(b"response"), Flags::PSH, now).unwrap();
    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].repr.ack_number, Some(IRS + 501));
    assert!(!engine.timers().is_armed(TimerPurpose::DelayedAck));
    assert_eq!(engine.connection().delack.deadline, None);

    engine.on_timer(TimerPurpose::DelayedAck, now + Duration::from_millis(40)).unwrap();
    assert!(engine.transport().is_empty());
}

#[test]
fn full_or_out_of_order_data_is_acked_at_once() {
    let (mut engine, now) = established(config(), NewReno::new());
    engine.on_data_received(incoming(IRS + 1, MSS), now).unwrap();
    assert!(engine.transport().is_empty());
    engine.on_data_received(incoming(IRS + 1 + MSS, MSS), now).unwrap();

    let acks = drain(&mut engine);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].repr.ack_number, Some(IRS + 1 + 2 * MSS));
    assert!(!engine.timers().is_armed(TimerPurpose::DelayedAck));

    let hole = Incoming { out_of_order: true, ..incoming(IRS + 5000, 100) };
    engine.on_data_received(hole, now).unwrap();
    let dup = drain(&mut engine);
    assert_eq!(dup.len(), 1);
    assert_eq!(dup[0].repr.ack_number, Some(IRS + 1 + 2 * MSS));
}

#[test]
fn keepalive_probes_then_resets() {
    let keepalive = Keepalive {
        idle: Duration::from_secs(10),
        interval: Duration::from_secs(1),
        probes: 2,
    };
    let config = Config { keepalive: Some(keepalive), ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    let first = now + keepalive.idle;
    assert_eq!(engine.timers().deadline(TimerPurpose::Keepalive), Some(first));

    engine.on_timer(TimerPurpose::Keepalive, first).unwrap();
    let probe = drain(&mut engine);
    assert_eq!(probe.len(), 1);
    assert_eq!(probe[0].seq(), ISS);
    assert_eq!(engine.counters().keepalive_probes, 1);
    let second = first + keepalive.interval;
    assert_eq!(engine.timers().deadline(TimerPurpose::Keepalive), Some(second));

    engine.on_timer(TimerPurpose::Keepalive, second).unwrap();
    let third = second + keepalive.interval;
    assert_eq!(engine.on_timer(TimerPurpose::Keepalive, third), Err(Error::TimedOut));
    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 2);
    assert!(sent[1].repr.flags.rst());
    assert_eq!(engine.state(), State::Closed);
}

#[test]
fn keepalive_reset_failure_is_reported() {
    let keepalive = Keepalive {
        idle: Duration::from_secs(10),
        interval: Duration::from_secs(1),
        probes: 1,
    };
    let config = Config { keepalive: Some(keepalive), ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    let first = now + keepalive.idle;
    engine.on_timer(TimerPurpose::Keepalive, first).unwrap();
    assert_eq!(drain(&mut engine).len(), 1);

    let second = first + keepalive.interval;
    engine.transport_mut().fail_next(TransmitError::Unreachable);
    assert_eq!(engine.on_timer(TimerPurpose::Keepalive, second), Err(Error::Unreachable));
    assert!(engine.transport().is_empty());
    assert_eq!(engine.state(), State::Closed);
    assert_eq!(engine.counters().timeouts, 1);
}

#[test]
fn keepalive_times_out_without_room_for_reset() {
    let keepalive = Keepalive {
        idle: Duration::from_secs(10),
        interval: Duration::from_secs(1),
        probes: 1,
    };
    let config = Config { keepalive: Some(keepalive), ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    let first = now + keepalive.idle;
    engine.on_timer(TimerPurpose::Keepalive, first).unwrap();
    drain(&mut engine);

    let second = first + keepalive.interval;
    engine.transport_mut().fail_next(TransmitError::Congested);
    assert_eq!(engine.on_timer(TimerPurpose::Keepalive, second), Err(Error::TimedOut));
    assert!(engine.transport().is_empty());
    assert_eq!(engine.state(), State::Closed);
}

#[test]
fn answered_keepalive_waits_for_idle() {
    let keepalive = Keepalive {
        idle: Duration::from_secs(10),
        interval: Duration::from_secs(1),
        probes: 2,
    };
    let config = Config { keepalive: Some(keepalive), ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    let first = now + keepalive.idle;
    engine.on_timer(TimerPurpose::Keepalive, first).unwrap();
    drain(&mut engine);

    engine.on_ack_received(ISS + 1, 65535, &Options::default(), first + RTT).unwrap();
    assert_eq!(engine.connection().probes_out, 0);

    engine.on_timer(TimerPurpose::Keepalive, first + keepalive.interval).unwrap();
    assert!(engine.transport().is_empty());
    assert_eq!(
        engine.timers().deadline(TimerPurpose::Keepalive),
        Some(first + RTT + keepalive.idle));
}

#[test]
fn syn_retransmitted_until_limit() {
    let config = Config { syn_retries: 2, ..config() };
    let mut engine = new_engine(config, NewReno::new());
    engine.connect(start()).unwrap();
    assert_eq!(engine.state(), State::SynSent);

    let syn = drain(&mut engine);
    assert_eq!(syn.len(), 1);
    assert!(syn[0].repr.flags.syn());
    assert!(!syn[0].repr.flags.ack());
    assert_eq!(syn[0].repr.options.mss, Some(1460));
    assert!(syn[0].repr.options.sack_permitted);

    let first = start() + Duration::from_secs(1);
    assert_eq!(engine.xmit_timer(), XmitTimer::RetransmitArmed(first));
    engine.on_timer(TimerPurpose::Retransmit, first).unwrap();
    let again = drain(&mut engine);
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].seq(), ISS);
    assert!(again[0].repr.flags.syn());
    assert_eq!(again[0].repr.options, syn[0].repr.options);

    let second = first + Duration::from_secs(2);
    engine.on_timer(TimerPurpose::Retransmit, second).unwrap();
    let third = second + Duration::from_secs(4);
    assert_eq!(engine.on_timer(TimerPurpose::Retransmit, third), Err(Error::TimedOut));
    assert_eq!(engine.state(), State::Closed);
}

#[test]
fn syn_ack_after_retransmitted_syn_takes_no_sample() {
    let mut engine = new_engine(config(), NewReno::new());
    engine.connect(start()).unwrap();
    let first = start() + Duration::from_secs(1);
    engine.on_timer(TimerPurpose::Retransmit, first).unwrap();

    engine.on_syn_ack(IRS, ISS + 1, 65535, &peer_options(), first + RTT).unwrap();
    assert_eq!(engine.state(), State::Established);
    assert_eq!(engine.connection().rtt.srtt(), None);
    assert_eq!(engine.connection().rto.get(), Duration::from_secs(1));
    assert_eq!(engine.connection().ca_state, CaState::Open);
}

#[test]
fn syn_ack_for_other_seq_is_refused() {
    let mut engine = new_engine(config(), NewReno::new());
    engine.connect(start()).unwrap();
    assert_eq!(
        engine.on_syn_ack(IRS, ISS + 7, 65535, &peer_options(), start() + RTT),
        Err(Error::Illegal));
    assert_eq!(engine.state(), State::SynSent);
}

#[test]
fn passive_open() {
    let mut engine = new_engine(config(), NewReno::new());
    let request = SynRequest {
        seq: IRS,
        window: 65535,
        options: Options { window_scale: Some(7), ..peer_options() },
    };
    engine.accept(request, start()).unwrap();
    assert_eq!(engine.state(), State::SynReceived);

    let synack = drain(&mut engine);
    assert_eq!(synack.len(), 1);
    assert!(synack[0].repr.flags.syn());
    assert!(synack[0].repr.flags.ack());
    assert_eq!(synack[0].repr.ack_number, Some(IRS + 1));
    assert_eq!(synack[0].repr.options.window_scale, Some(engine.connection().recv.window.wscale));

    ack(&mut engine, ISS + 1, start() + RTT);
    assert_eq!(engine.state(), State::Established);
    assert_eq!(engine.connection().send.window, 65535 << 7);
}

#[test]
fn active_close() {
    let config = Config { nodelay: true, ..config() };
    let (mut engine, now) = established(config, NewReno::new());
    engine.queue_for_send(payload(100), Flags::NONE, now).unwrap();
    engine.close(now).unwrap();
    assert_eq!(engine.state(), State::FinWait1);

    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 2);
    assert!(sent[1].repr.flags.fin());
    assert_eq!(sent[1].seq(), ISS + 101);
    assert!(sent[1].payload.is_empty());

    ack(&mut engine, ISS + 102, now + RTT);
    assert_eq!(engine.state(), State::FinWait2);

    let fin = Incoming { flags: Flags::FIN, ..incoming(IRS + 1, 0) };
    engine.on_data_received(fin, now + RTT).unwrap();
    assert_eq!(engine.state(), State::TimeWait);
    let acks = drain(&mut engine);
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].repr.ack_number, Some(IRS + 2));
}

#[test]
fn passive_close() {
    let (mut engine, now) = established(config(), NewReno::new());
    let fin = Incoming { flags: Flags::FIN, ..incoming(IRS + 1, 0) };
    engine.on_data_received(fin, now).unwrap();
    assert_eq!(engine.state(), State::CloseWait);
    assert_eq!(drain(&mut engine).len(), 1);

    engine.close(now).unwrap();
    assert_eq!(engine.state(), State::LastAck);
    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].repr.flags.fin());
    assert_eq!(sent[0].repr.ack_number, Some(IRS + 2));

    ack(&mut engine, ISS + 2, now + RTT);
    assert_eq!(engine.state(), State::Closed);
    assert_eq!(engine.timers().next(), None);
}

#[test]
fn fin_rides_on_corked_tail() {
    let (mut engine, now) = established(config(), NewReno::new());
    engine.set_cork(true, now).unwrap();
    engine.queue_for_send(payload(100), Flags::FIN, now).unwrap();
    assert_eq!(engine.state(), State::FinWait1);

    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].payload.len(), 100);
    assert!(sent[0].repr.flags.fin());
    assert_eq!(sent[0].end_seq(), ISS + 102);
}

#[test]
fn abort_resets() {
    let (mut engine, now) = established(config(), NewReno::new());
    engine.abort(now).unwrap();
    let sent = drain(&mut engine);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].repr.flags.rst());
    assert_eq!(engine.state(), State::Closed);
    assert_eq!(engine.abort(now), Err(Error::Closed));
}
