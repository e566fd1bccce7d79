use structopt::StructOpt;

use sendpath::layer::tcp;
use sendpath::nic::PrngLoss;
use sendpath::time::Duration;

#[derive(Clone, Debug, StructOpt)]
#[structopt(name = "sendpath-sim", about = "Bulk transfer over a simulated lossy link")]
pub struct Config {
    /// Total bytes to transfer.
    #[structopt(short = "n", long = "bytes", default_value = "4194304")]
    pub bytes: usize,

    /// Bytes handed to the engine per write.
    #[structopt(short = "l", long = "len", default_value = "65536")]
    pub write_len: usize,

    /// Uniform segment loss, in percent.
    #[structopt(long = "loss", default_value = "0")]
    pub loss: u32,

    /// Drop this many consecutive segments out of every `--burst-len`.
    #[structopt(long = "burst")]
    pub burst: Option<u32>,

    #[structopt(long = "burst-len", default_value = "100")]
    pub burst_len: u32,

    /// Seed of the loss generator.
    #[structopt(long = "seed", default_value = "1")]
    pub seed: u64,

    /// One way delay of the link, in milliseconds.
    #[structopt(long = "delay", default_value = "5")]
    pub delay_ms: u64,

    /// Receive window the peer advertises.
    #[structopt(long = "window", default_value = "65535")]
    pub window: u16,

    #[structopt(long = "mtu", default_value = "1500")]
    pub mtu: u32,

    /// Send buffer shared by all queued segments, in bytes.
    #[structopt(long = "sndbuf", default_value = "1048576")]
    pub sndbuf: usize,

    #[structopt(long)]
    pub nodelay: bool,

    #[structopt(long)]
    pub pacing: bool,

    /// Search for a larger path MTU from the start.
    #[structopt(long = "mtu-probing")]
    pub mtu_probing: bool,

    /// Never build segments spanning more than one MSS.
    #[structopt(long = "no-tso")]
    pub no_tso: bool,

    /// Give up after this many simulated seconds.
    #[structopt(long = "limit", default_value = "300")]
    pub limit_secs: u64,
}

impl Config {
    pub fn from_args() -> Self {
        StructOpt::from_args()
    }

    pub fn tcp(&self) -> tcp::Config {
        let defaults = tcp::Config::default();
        tcp::Config {
            nodelay: self.nodelay,
            pacing: self.pacing,
            mtu: self.mtu,
            mtu_probing: if self.mtu_probing {
                tcp::MtuProbing::Always
            } else {
                tcp::MtuProbing::Off
            },
            gso_max_segs: if self.no_tso { 1 } else { defaults.gso_max_segs },
            ..defaults
        }
    }

    pub fn loss(&self) -> PrngLoss {
        match self.burst {
            Some(high) => PrngLoss::pulsed(high.min(self.burst_len), self.burst_len.max(1)),
            None => PrngLoss::percent(self.loss, self.seed),
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn limit(&self) -> Duration {
        Duration::from_secs(self.limit_secs)
    }
}
