// Correlator device boundary
//
// The pipeline talks to hardware only through the `Device` trait. New
// transports are added by:
// 1. Implementing the Device trait
// 2. Adding a variant to DeviceConfig
// 3. Registering it in `create_device`
//
// Current implementations:
// - Simulated: in-process correlator with scripted or synthetic data

mod simulated;

use crate::error::XcResult;
use crate::types::{BaudRate, Correlation, DeviceGeometry, LineFlags, RawFrame, TimeScale};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub use simulated::{DeviceCall, ScanPattern, SimulatedDevice, SimulatedHandle, SimulatedProfile};

/// Progress and interruption of a device-driven scan.
///
/// Shared between the capture loop (which runs the scan) and command paths
/// (which interrupt it and read its progress).
#[derive(Debug, Default)]
pub struct ScanControl {
    interrupted: AtomicBool,
    progress_bits: AtomicU64,
}

impl ScanControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear interruption and progress before a scan starts
    pub fn reset(&self) {
        self.interrupted.store(false, Ordering::SeqCst);
        self.progress_bits.store(0f64.to_bits(), Ordering::SeqCst);
    }

    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Record progress in percent; never moves backwards within a scan
    pub fn report(&self, percent: f64) {
        let clamped = if percent.is_finite() {
            percent.clamp(0.0, 100.0)
        } else {
            0.0
        };
        // Non-negative f64 bit patterns order like the values they encode
        self.progress_bits
            .fetch_max(clamped.to_bits(), Ordering::SeqCst);
    }

    pub fn percent(&self) -> f64 {
        f64::from_bits(self.progress_bits.load(Ordering::SeqCst))
    }
}

/// Capability of a connected correlator.
///
/// Calls block the current thread; the pipeline only invokes them from
/// blocking tasks. Any call may fail with `DeviceUnavailable` or `Protocol`.
pub trait Device: Send {
    /// Open the endpoint and read the session geometry
    fn connect(&mut self, endpoint: &str) -> XcResult<DeviceGeometry>;

    fn disconnect(&mut self) -> XcResult<()>;

    fn enable_capture(&mut self, enabled: bool) -> XcResult<()>;

    fn set_power(&mut self, line: usize, flags: LineFlags) -> XcResult<()>;

    fn set_baud_rate(&mut self, rate: BaudRate) -> XcResult<()>;

    fn set_frequency_divider(&mut self, time_scale: TimeScale) -> XcResult<()>;

    /// Read one packet
    fn read_frame(&mut self) -> XcResult<RawFrame>;

    /// Fill `buffer` with `stack` stacked autocorrelation passes.
    ///
    /// Returns the final progress in percent. Stops early, leaving the buffer
    /// unspecified, when `control` is interrupted.
    fn scan_autocorrelations(
        &mut self,
        buffer: &mut [Correlation],
        stack: usize,
        control: &ScanControl,
    ) -> XcResult<f64>;

    /// Crosscorrelation counterpart of `scan_autocorrelations`
    fn scan_crosscorrelations(
        &mut self,
        buffer: &mut [Correlation],
        stack: usize,
        control: &ScanControl,
    ) -> XcResult<f64>;
}

/// Configuration for the available device types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DeviceConfig {
    /// In-process simulated correlator
    #[serde(rename = "simulated")]
    Simulated(SimulatedProfile),
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig::Simulated(SimulatedProfile::default())
    }
}

/// Factory function to create a Device from configuration
pub fn create_device(config: DeviceConfig) -> XcResult<Box<dyn Device>> {
    match config {
        DeviceConfig::Simulated(profile) => {
            profile.geometry().validate()?;
            Ok(Box::new(SimulatedDevice::new(profile)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::XcError;

    #[test]
    fn test_progress_never_decreases() {
        let control = ScanControl::new();
        control.report(40.0);
        control.report(25.0);
        assert_eq!(control.percent(), 40.0);
        control.report(250.0);
        assert_eq!(control.percent(), 100.0);
        control.reset();
        assert_eq!(control.percent(), 0.0);
    }

    #[test]
    fn test_interrupt_cleared_by_reset() {
        let control = ScanControl::new();
        control.interrupt();
        assert!(control.is_interrupted());
        control.reset();
        assert!(!control.is_interrupted());
    }

    #[test]
    fn test_config_is_tagged() {
        let json = r#"{"type":"simulated","num_lines":3,"seed":7}"#;
        let config: DeviceConfig = serde_json::from_str(json).unwrap();
        let DeviceConfig::Simulated(profile) = config;
        assert_eq!(profile.num_lines, 3);
        assert_eq!(profile.seed, Some(7));
        assert_eq!(profile.delay_size, SimulatedProfile::default().delay_size);
    }

    #[test]
    fn test_factory_rejects_invalid_profile() {
        let profile = SimulatedProfile {
            num_lines: 1,
            ..Default::default()
        };
        assert!(matches!(
            create_device(DeviceConfig::Simulated(profile)),
            Err(XcError::Configuration(_))
        ));
        assert!(create_device(DeviceConfig::default()).is_ok());
    }
}
