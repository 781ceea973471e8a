// Common types describing the instrument and its raw data

use crate::error::{XcError, XcResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable per-session facts about the connected correlator.
///
/// Read once after connect; every buffer size in the pipeline is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceGeometry {
    pub num_lines: usize,
    pub num_baselines: usize,
    /// Number of delay channels of the batch scanner
    pub delay_size: usize,
    /// Autocorrelation lags carried by each live packet, per line
    pub spectra_jitter_size: usize,
    /// One-sided crosscorrelation lags carried by each live packet, per baseline
    pub correlator_jitter_size: usize,
    /// Sampling clock in Hz
    pub clock_frequency: f64,
    /// Time covered by one packet in seconds
    pub packet_period: f64,
}

impl DeviceGeometry {
    pub fn new(
        num_lines: usize,
        delay_size: usize,
        spectra_jitter_size: usize,
        correlator_jitter_size: usize,
        clock_frequency: f64,
        packet_period: f64,
    ) -> Self {
        Self {
            num_lines,
            num_baselines: num_lines * num_lines.saturating_sub(1) / 2,
            delay_size,
            spectra_jitter_size,
            correlator_jitter_size,
            clock_frequency,
            packet_period,
        }
    }

    /// Reject geometries reported by a disconnected or misbehaving device
    pub fn validate(&self) -> XcResult<()> {
        if self.num_lines < 2 {
            return Err(XcError::Configuration(format!(
                "at least 2 lines are required, device reports {}",
                self.num_lines
            )));
        }
        if self.num_baselines != self.num_lines * (self.num_lines - 1) / 2 {
            return Err(XcError::Configuration(format!(
                "{} baselines do not match {} lines",
                self.num_baselines, self.num_lines
            )));
        }
        if self.delay_size == 0 {
            return Err(XcError::Configuration("delay size is zero".to_string()));
        }
        if self.spectra_jitter_size == 0 || self.correlator_jitter_size == 0 {
            return Err(XcError::Configuration("jitter size is zero".to_string()));
        }
        if !(self.clock_frequency.is_finite() && self.clock_frequency > 0.0) {
            return Err(XcError::Configuration(format!(
                "invalid clock frequency {}",
                self.clock_frequency
            )));
        }
        if !(self.packet_period.is_finite() && self.packet_period > 0.0) {
            return Err(XcError::Configuration(format!(
                "invalid packet period {}",
                self.packet_period
            )));
        }
        Ok(())
    }

    /// Delay between adjacent bins in nanoseconds
    pub fn sample_spacing_ns(&self, time_scale: TimeScale) -> f64 {
        time_scale.factor() * 1_000_000_000.0 / self.clock_frequency
    }

    /// Lines forming a baseline, in lexicographic pair order
    pub fn baseline_lines(&self, baseline: usize) -> Option<(usize, usize)> {
        let mut index = baseline;
        for a in 0..self.num_lines {
            let pairs = self.num_lines - a - 1;
            if index < pairs {
                return Some((a, a + 1 + index));
            }
            index -= pairs;
        }
        None
    }

    pub fn live_autocorrelation_lags(&self) -> usize {
        self.spectra_jitter_size
    }

    pub fn live_crosscorrelation_lags(&self) -> usize {
        2 * self.correlator_jitter_size + 1
    }
}

/// Frequency divider exponent: sample spacing scales by `2^k`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct TimeScale(u8);

impl TimeScale {
    pub const MAX: u8 = 63;

    pub fn new(exponent: u8) -> XcResult<Self> {
        if exponent > Self::MAX {
            return Err(XcError::Configuration(format!(
                "time scale {} exceeds {}",
                exponent,
                Self::MAX
            )));
        }
        Ok(Self(exponent))
    }

    pub fn exponent(&self) -> u8 {
        self.0
    }

    pub fn factor(&self) -> f64 {
        2f64.powi(self.0 as i32)
    }
}

impl TryFrom<u8> for TimeScale {
    type Error = XcError;

    fn try_from(value: u8) -> XcResult<Self> {
        Self::new(value)
    }
}

impl From<TimeScale> for u8 {
    fn from(value: TimeScale) -> u8 {
        value.0
    }
}

impl fmt::Display for TimeScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "2^{}", self.0)
    }
}

/// One coherence measurement as reported by the hardware
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub correlations: u64,
    pub counts: u64,
    pub coherence: f64,
}

impl Correlation {
    pub fn with_coherence(coherence: f64) -> Self {
        Self {
            correlations: 0,
            counts: 0,
            coherence,
        }
    }
}

/// One hardware read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawFrame {
    /// Event counts since the previous read, one per line
    pub counts: Vec<u64>,
    /// `num_lines * spectra_jitter_size` autocorrelation lags
    #[serde(default)]
    pub autocorrelations: Vec<Correlation>,
    /// `num_baselines * (2 * correlator_jitter_size + 1)` crosscorrelation lags
    #[serde(default)]
    pub crosscorrelations: Vec<Correlation>,
}

impl RawFrame {
    /// A frame with the same coherence at every lag, sized for `geometry`
    pub fn uniform(geometry: &DeviceGeometry, count: u64, coherence: f64) -> Self {
        Self {
            counts: vec![count; geometry.num_lines],
            autocorrelations: vec![
                Correlation::with_coherence(coherence);
                geometry.num_lines * geometry.live_autocorrelation_lags()
            ],
            crosscorrelations: vec![
                Correlation::with_coherence(coherence);
                geometry.num_baselines * geometry.live_crosscorrelation_lags()
            ],
        }
    }
}

/// Serial link speeds supported by the instrument
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BaudRate {
    R57600,
    R115200,
    R230400,
    R460800,
}

impl BaudRate {
    /// Value written to the device's baud-rate register
    pub fn index(&self) -> u8 {
        match self {
            BaudRate::R57600 => 0,
            BaudRate::R115200 => 1,
            BaudRate::R230400 => 2,
            BaudRate::R460800 => 3,
        }
    }

    pub fn bits_per_second(&self) -> u32 {
        match self {
            BaudRate::R57600 => 57_600,
            BaudRate::R115200 => 115_200,
            BaudRate::R230400 => 230_400,
            BaudRate::R460800 => 460_800,
        }
    }

    pub fn from_bits_per_second(bps: u32) -> XcResult<Self> {
        match bps {
            57_600 => Ok(BaudRate::R57600),
            115_200 => Ok(BaudRate::R115200),
            230_400 => Ok(BaudRate::R230400),
            460_800 => Ok(BaudRate::R460800),
            other => Err(XcError::Configuration(format!("unsupported baud rate {}", other))),
        }
    }
}

/// Power and inversion switches of one input line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineFlags {
    pub low_power: bool,
    pub high_power: bool,
    #[serde(default)]
    pub invert_autocorrelation: bool,
    #[serde(default)]
    pub invert_crosscorrelation: bool,
}

impl LineFlags {
    pub fn power(low_power: bool, high_power: bool) -> Self {
        Self {
            low_power,
            high_power,
            ..Default::default()
        }
    }

    /// Packed register value: bit0 low, bit1 high, bit2 invert auto, bit3 invert cross
    pub fn bits(&self) -> u8 {
        (self.low_power as u8)
            | (self.high_power as u8) << 1
            | (self.invert_autocorrelation as u8) << 2
            | (self.invert_crosscorrelation as u8) << 3
    }
}

/// Current state of the pipeline
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum PipelineState {
    #[default]
    Disconnected,

    /// Connected, capture disabled
    Idle,

    Capturing,

    /// Capture requested but held while the pipeline is reconfigured
    Paused,
}

impl PipelineState {
    pub fn is_connected(&self) -> bool {
        !matches!(self, PipelineState::Disconnected)
    }
}

/// Plot axis extents for the active mode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    pub x_min: f64,
    pub x_max: f64,
    pub x_label: String,
    pub y_label: String,
}
