use clap::{Args, Parser, Subcommand};
use xcorr_core::{BaudRate, OperatingMode, SimulatedProfile};

#[derive(Parser)]
#[command(
    name = "xcorr",
    version,
    about = "Correlator acquisition and spectral reduction tool",
    long_about = "Acquire counter, autocorrelation and crosscorrelation data from a\n\
                  multi-line correlator and reduce it to per-channel series.\n\
                  Runs against the bundled simulated correlator."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand)]
pub enum Command {
    /// Connect, capture for a while and report the reduced series
    Run(RunArgs),
    /// Show geometry and buffer sizes of the simulated correlator
    Info(InfoArgs),
    /// List operating modes and the variants each one supports
    Modes(ModesArgs),
}

/// Simulated correlator geometry
#[derive(Args, Clone)]
pub struct DeviceArgs {
    /// Number of input lines
    #[arg(long, default_value_t = 4)]
    pub lines: usize,

    /// Delay channels of the batch scanner
    #[arg(long, default_value_t = 64)]
    pub delay_size: usize,

    /// Autocorrelation lags per live packet
    #[arg(long, default_value_t = 16)]
    pub spectra_jitter: usize,

    /// One-sided crosscorrelation lags per live packet
    #[arg(long, default_value_t = 8)]
    pub correlator_jitter: usize,

    /// Sampling clock in Hz
    #[arg(long, default_value_t = 400_000_000.0)]
    pub clock: f64,

    /// Seconds per packet
    #[arg(long, default_value_t = 0.01)]
    pub packet_period: f64,

    /// Milliseconds per stacked scan pass
    #[arg(long, default_value_t = 5)]
    pub scan_pass_ms: u64,

    /// Seed for synthetic data
    #[arg(long)]
    pub seed: Option<u64>,
}

impl DeviceArgs {
    pub fn profile(&self) -> SimulatedProfile {
        SimulatedProfile {
            num_lines: self.lines,
            delay_size: self.delay_size,
            spectra_jitter_size: self.spectra_jitter,
            correlator_jitter_size: self.correlator_jitter,
            clock_frequency: self.clock,
            packet_period: self.packet_period,
            scan_pass_ms: self.scan_pass_ms,
            seed: self.seed,
            ..Default::default()
        }
    }
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub device: DeviceArgs,

    /// Device endpoint
    #[arg(long, default_value = "sim0")]
    pub endpoint: String,

    /// Operating mode (counter, autocorrelator, crosscorrelator)
    #[arg(long, default_value = "counter", value_parser = parse_mode)]
    pub mode: OperatingMode,

    /// Reduce every packet instead of running device-driven scans
    #[arg(long, default_value_t = false)]
    pub live: bool,

    /// Also produce the square-root compressed series
    #[arg(long, default_value_t = false)]
    pub log: bool,

    /// Also produce the inverse-transformed series
    #[arg(long, default_value_t = false)]
    pub inverse: bool,

    /// Frequency divider exponent (0-63)
    #[arg(long)]
    pub time_scale: Option<u8>,

    /// Frames per live block and passes per scan
    #[arg(long)]
    pub stack: Option<usize>,

    /// Capture duration in milliseconds
    #[arg(long, default_value_t = 3000)]
    pub duration_ms: u64,

    /// Publisher cadence in milliseconds
    #[arg(long)]
    pub publish_interval_ms: Option<u64>,

    /// Pipeline configuration file (JSON)
    #[arg(long, env = "XCORR_CONFIG")]
    pub config: Option<String>,

    /// Lines to switch to low power
    #[arg(long, num_args = 1..)]
    pub low_power: Vec<usize>,

    /// Lines to switch to high power
    #[arg(long, num_args = 1..)]
    pub high_power: Vec<usize>,

    /// Serial link speed in bits per second
    #[arg(long, value_parser = parse_baud)]
    pub baud: Option<BaudRate>,

    /// Capture a dark baseline for these channels halfway through the run
    #[arg(long, num_args = 1..)]
    pub dark: Vec<usize>,

    /// Print one summary object at the end instead of streaming events
    #[arg(long, default_value_t = false)]
    pub summary: bool,

    /// Output file for the summary (default: stdout)
    #[arg(short, long)]
    pub output: Option<String>,

    /// Compact JSON output (no indentation)
    #[arg(long, default_value_t = false)]
    pub compact: bool,

    /// Suppress progress messages on stderr
    #[arg(long, default_value_t = false)]
    pub quiet: bool,
}

#[derive(Args)]
pub struct InfoArgs {
    #[command(flatten)]
    pub device: DeviceArgs,

    /// Frequency divider exponent used for buffer sizes
    #[arg(long, default_value_t = 0)]
    pub time_scale: u8,

    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args)]
pub struct ModesArgs {
    /// Output as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

/// Parse a mode name, accepting the short forms "auto" and "cross".
pub fn parse_mode(s: &str) -> Result<OperatingMode, String> {
    s.parse::<OperatingMode>().map_err(|e| e.to_string())
}

/// Parse a baud rate given in bits per second.
pub fn parse_baud(s: &str) -> Result<BaudRate, String> {
    let bps = s
        .trim()
        .parse::<u32>()
        .map_err(|_| format!("Invalid baud rate '{}': not an integer", s))?;
    BaudRate::from_bits_per_second(bps).map_err(|e| e.to_string())
}
