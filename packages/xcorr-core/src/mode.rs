// Operating modes and reduction flags

use crate::error::{XcError, XcResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Base operating mode of the correlator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    Counter,
    Autocorrelator,
    Crosscorrelator,
}

impl OperatingMode {
    pub const ALL: [OperatingMode; 3] = [
        OperatingMode::Counter,
        OperatingMode::Autocorrelator,
        OperatingMode::Crosscorrelator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::Counter => "counter",
            OperatingMode::Autocorrelator => "autocorrelator",
            OperatingMode::Crosscorrelator => "crosscorrelator",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            OperatingMode::Counter => "Per-line event count rate over time",
            OperatingMode::Autocorrelator => "Per-line coherence over delay",
            OperatingMode::Crosscorrelator => "Per-baseline coherence over signed lag",
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            OperatingMode::Crosscorrelator => Scope::Baseline,
            _ => Scope::Line,
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperatingMode {
    type Err = XcError;

    fn from_str(s: &str) -> XcResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "counter" => Ok(OperatingMode::Counter),
            "autocorrelator" | "auto" => Ok(OperatingMode::Autocorrelator),
            "crosscorrelator" | "cross" => Ok(OperatingMode::Crosscorrelator),
            other => Err(XcError::Configuration(format!("unknown mode '{}'", other))),
        }
    }
}

/// Orthogonal switches applied on top of the base mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReductionFlags {
    /// Reduce every packet incrementally instead of running device-driven scans
    #[serde(default)]
    pub live: bool,
    /// Also emit the square-root compressed variant
    #[serde(default)]
    pub log: bool,
    /// Also emit the inverse-transformed, axis-swapped variant
    #[serde(default)]
    pub inverse: bool,
}

/// Which derived curve a series holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesKind {
    Plain,
    Log,
    Inverse,
}

impl fmt::Display for SeriesKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesKind::Plain => f.write_str("plain"),
            SeriesKind::Log => f.write_str("log"),
            SeriesKind::Inverse => f.write_str("inverse"),
        }
    }
}

/// Whether channels index lines or baselines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Line,
    Baseline,
}

/// Base mode plus flags, validated on construction.
///
/// Counter mode only ever produces the plain series, so `log` and `inverse`
/// are rejected for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawSessionMode", into = "RawSessionMode")]
pub struct SessionMode {
    base: OperatingMode,
    flags: ReductionFlags,
}

impl SessionMode {
    pub fn new(base: OperatingMode, flags: ReductionFlags) -> XcResult<Self> {
        if base == OperatingMode::Counter && (flags.log || flags.inverse) {
            return Err(XcError::Configuration(
                "counter mode does not support log or inverse variants".to_string(),
            ));
        }
        Ok(Self { base, flags })
    }

    pub fn counter() -> Self {
        Self {
            base: OperatingMode::Counter,
            flags: ReductionFlags::default(),
        }
    }

    pub fn base(&self) -> OperatingMode {
        self.base
    }

    pub fn flags(&self) -> ReductionFlags {
        self.flags
    }

    pub fn is_live(&self) -> bool {
        self.flags.live
    }

    /// Runs device-driven batch scans (correlator modes without `live`)
    pub fn is_batch_scan(&self) -> bool {
        self.base != OperatingMode::Counter && !self.flags.live
    }

    /// Series kinds produced in this mode, plain first
    pub fn kinds(&self) -> Vec<SeriesKind> {
        let mut kinds = vec![SeriesKind::Plain];
        if self.flags.log {
            kinds.push(SeriesKind::Log);
        }
        if self.flags.inverse {
            kinds.push(SeriesKind::Inverse);
        }
        kinds
    }

    pub fn scope(&self) -> Scope {
        self.base.scope()
    }
}

impl Default for SessionMode {
    fn default() -> Self {
        Self::counter()
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)?;
        if self.flags.live {
            f.write_str("+live")?;
        }
        if self.flags.log {
            f.write_str("+log")?;
        }
        if self.flags.inverse {
            f.write_str("+inverse")?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct RawSessionMode {
    base: OperatingMode,
    #[serde(default, flatten)]
    flags: ReductionFlags,
}

impl TryFrom<RawSessionMode> for SessionMode {
    type Error = XcError;

    fn try_from(raw: RawSessionMode) -> XcResult<Self> {
        SessionMode::new(raw.base, raw.flags)
    }
}

impl From<SessionMode> for RawSessionMode {
    fn from(mode: SessionMode) -> Self {
        Self {
            base: mode.base,
            flags: mode.flags,
        }
    }
}
