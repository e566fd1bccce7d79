//! Bulk transfer over a simulated link.
//!
//! Runs a single connection against a peer that acknowledges cumulatively, over a link with a
//! fixed one way delay that drops segments. Time is simulated in steps of one millisecond, the
//! run ends once every byte has been acknowledged. Call example:
//!
//! * `sendpath-sim -n 10000000 --loss 2 --pacing`
//! * `sendpath-sim --burst 3 --burst-len 50 --mtu-probing --window 16000`
mod config;
mod peer;
mod score;

use std::io::{stdout, Write};
use std::process;

use bytes::Bytes;

use sendpath::layer::{tcp, Error, Result};
use sendpath::layer::tcp::CongestionControl;
use sendpath::nic::{Loopback, Lossy, PrngLoss};
use sendpath::storage::MemoryBudget;
use sendpath::time::{Duration, Instant};
use sendpath::wire::{Flags, Options, SeqNumber};

use config::Config;
use peer::Peer;
use score::Score;

type SimEngine = tcp::Engine<Lossy<Loopback>, tcp::NewReno, tcp::ManualTimers>;

const ISS: SeqNumber = SeqNumber(0x1000_0000);
const IRS: SeqNumber = SeqNumber(0x7000_0000);
const TICK: Duration = Duration::from_millis(1);

fn main() {
    let config = Config::from_args();

    let out = stdout();
    let mut out = out.lock();

    match run(&config) {
        Ok(score) => {
            let _ = writeln!(out, "[+] Done");
            let _ = writeln!(out, "{}", score);
        },
        Err(err) => {
            eprintln!("[-] Transfer failed: {}", err);
            process::exit(1);
        },
    }
}

fn connect(config: &Config, now: Instant) -> Result<SimEngine> {
    // The handshake is never lost, loss is switched on once established.
    let link = PrngLoss::percent(0, config.seed).lossy(Loopback::new());
    let mut engine = tcp::Engine::new(
        config.tcp(),
        tcp::Ports { local: 40000, remote: 5001 },
        ISS,
        MemoryBudget::new(config.sndbuf, usize::max_value()),
        link,
        tcp::NewReno::new(),
        tcp::ManualTimers::new());

    engine.connect(now)?;
    engine.transport_mut().inner.drain().for_each(drop);

    let peer = Options {
        mss: Some(config.mtu.saturating_sub(40).min(u32::from(u16::max_value())) as u16),
        sack_permitted: true,
        ..Options::default()
    };
    engine.on_syn_ack(IRS, ISS + 1, config.window, &peer, now + config.delay() * 2)?;
    engine.transport_mut().inner.drain().for_each(drop);
    engine.transport_mut().loss = config.loss();
    Ok(engine)
}

fn run(config: &Config) -> Result<Score> {
    let start = Instant::from_millis(0);
    let mut now = start + config.delay() * 2;
    let deadline = start + config.limit();
    let mut engine = connect(config, start)?;
    let mut peer = Peer::new(ISS + 1, config.delay());

    let data: Bytes = (0..config.bytes)
        .map(|idx| b'0' + (idx % 10) as u8)
        .collect::<Vec<_>>()
        .into();
    let done = ISS + 1 + config.bytes as u32;
    let mut queued = 0;

    while engine.connection().send.unacked != done {
        if now > deadline {
            return Err(Error::TimedOut);
        }

        while queued < config.bytes {
            let end = (queued + config.write_len.max(1)).min(config.bytes);
            match engine.queue_for_send(data.slice(queued..end), Flags::NONE, now) {
                Ok(copied) => queued += copied,
                // Full send buffer, retry once acknowledgements free some of it.
                Err(Error::OutOfMemory) => break,
                Err(err) => return Err(err),
            }
        }

        // Everything handed to the link leaves it within one step.
        let sent: Vec<_> = engine.transport_mut().inner.drain().collect();
        let (next, host_queued) = (engine.connection().send.next, engine.connection().host_queued);
        engine.on_transmit_complete(next, host_queued, now)?;
        for segment in sent {
            peer.send(segment, now);
        }

        now += TICK;
        peer.deliver(now);
        while let Some(ack) = peer.pop_ack(now) {
            engine.on_ack_received(ack, config.window, &Options::default(), now)?;
        }
        while let Some(purpose) = engine.timers_mut().pop_due(now) {
            engine.on_timer(purpose, now)?;
        }
    }

    debug_assert_eq!(peer.next(), done);
    Ok(Score {
        data_len: config.bytes as u64,
        time: now - start,
        received: peer.received(),
        dropped: engine.transport().dropped(),
        duplicates: peer.duplicates(),
        cwnd: engine.congestion().current_window(),
        mss: engine.connection().mss.cache,
        counters: *engine.counters(),
    })
}
