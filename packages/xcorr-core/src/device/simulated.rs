// Simulated correlator that stands in for real hardware
//
// Frames come from a script pushed through a `SimulatedHandle` or, when the
// script is empty and synthesis is enabled, from a seeded generator. Useful for:
// - Testing the pipeline without a serial link
// - Demo and development from the CLI

use super::{Device, ScanControl};
use crate::error::{XcError, XcResult};
use crate::types::{BaudRate, Correlation, DeviceGeometry, LineFlags, RawFrame, TimeScale};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Shape of the coherence a simulated scan reports
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ScanPattern {
    /// Same coherence in every bin
    Constant { value: f64 },
    /// `exp(-d / tau_bins)` from zero delay, plus uniform noise of the given amplitude
    Decay { tau_bins: f64, noise: f64 },
}

impl Default for ScanPattern {
    fn default() -> Self {
        ScanPattern::Decay {
            tau_bins: 8.0,
            noise: 0.02,
        }
    }
}

fn default_num_lines() -> usize {
    4
}

fn default_delay_size() -> usize {
    64
}

fn default_spectra_jitter_size() -> usize {
    16
}

fn default_correlator_jitter_size() -> usize {
    8
}

fn default_clock_frequency() -> f64 {
    400_000_000.0
}

fn default_packet_period() -> f64 {
    0.01
}

fn default_scan_pass_ms() -> u64 {
    5
}

fn default_synthetic() -> bool {
    true
}

/// Geometry and behaviour of a simulated correlator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatedProfile {
    #[serde(default = "default_num_lines")]
    pub num_lines: usize,
    #[serde(default = "default_delay_size")]
    pub delay_size: usize,
    #[serde(default = "default_spectra_jitter_size")]
    pub spectra_jitter_size: usize,
    #[serde(default = "default_correlator_jitter_size")]
    pub correlator_jitter_size: usize,
    #[serde(default = "default_clock_frequency")]
    pub clock_frequency: f64,
    /// Seconds between packets; reads block for this long
    #[serde(default = "default_packet_period")]
    pub packet_period: f64,
    /// Milliseconds per stacked scan pass
    #[serde(default = "default_scan_pass_ms")]
    pub scan_pass_ms: u64,
    /// Seed for synthetic data (None = from entropy)
    #[serde(default)]
    pub seed: Option<u64>,
    /// Generate frames once the script runs dry
    #[serde(default = "default_synthetic")]
    pub synthetic: bool,
    #[serde(default)]
    pub scan_pattern: ScanPattern,
}

impl Default for SimulatedProfile {
    fn default() -> Self {
        Self {
            num_lines: default_num_lines(),
            delay_size: default_delay_size(),
            spectra_jitter_size: default_spectra_jitter_size(),
            correlator_jitter_size: default_correlator_jitter_size(),
            clock_frequency: default_clock_frequency(),
            packet_period: default_packet_period(),
            scan_pass_ms: default_scan_pass_ms(),
            seed: None,
            synthetic: default_synthetic(),
            scan_pattern: ScanPattern::default(),
        }
    }
}

impl SimulatedProfile {
    pub fn geometry(&self) -> DeviceGeometry {
        DeviceGeometry::new(
            self.num_lines,
            self.delay_size,
            self.spectra_jitter_size,
            self.correlator_jitter_size,
            self.clock_frequency,
            self.packet_period,
        )
    }
}

/// A command the simulated device received
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DeviceCall {
    Connect(String),
    Disconnect,
    EnableCapture(bool),
    SetPower { line: usize, bits: u8 },
    SetBaudRate(BaudRate),
    SetFrequencyDivider(u8),
}

#[derive(Debug)]
struct SharedState {
    script: VecDeque<XcResult<RawFrame>>,
    scan_pattern: ScanPattern,
    synthetic: bool,
    hung_up: bool,
    refuse_connect: bool,
    calls: Vec<DeviceCall>,
}

/// Test and demo control over a `SimulatedDevice`, usable after the device
/// has been handed to a pipeline
#[derive(Debug, Clone)]
pub struct SimulatedHandle {
    state: Arc<Mutex<SharedState>>,
}

impl SimulatedHandle {
    pub fn push_frame(&self, frame: RawFrame) {
        self.state.lock().script.push_back(Ok(frame));
    }

    /// Queue a read failure
    pub fn push_error(&self, error: XcError) {
        self.state.lock().script.push_back(Err(error));
    }

    pub fn set_scan_pattern(&self, pattern: ScanPattern) {
        self.state.lock().scan_pattern = pattern;
    }

    pub fn set_synthetic(&self, enabled: bool) {
        self.state.lock().synthetic = enabled;
    }

    /// Every later read fails with `DeviceUnavailable`
    pub fn hang_up(&self) {
        self.state.lock().hung_up = true;
    }

    /// The next `connect` fails with `DeviceUnavailable`
    pub fn refuse_connect(&self) {
        self.state.lock().refuse_connect = true;
    }

    pub fn pending_frames(&self) -> usize {
        self.state.lock().script.len()
    }

    pub fn calls(&self) -> Vec<DeviceCall> {
        self.state.lock().calls.clone()
    }
}

pub struct SimulatedDevice {
    profile: SimulatedProfile,
    state: Arc<Mutex<SharedState>>,
    rng: StdRng,
    connected: bool,
}

impl SimulatedDevice {
    pub fn new(profile: SimulatedProfile) -> Self {
        let rng = match profile.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let state = SharedState {
            script: VecDeque::new(),
            scan_pattern: profile.scan_pattern,
            synthetic: profile.synthetic,
            hung_up: false,
            refuse_connect: false,
            calls: Vec::new(),
        };
        Self {
            profile,
            state: Arc::new(Mutex::new(state)),
            rng,
            connected: false,
        }
    }

    pub fn handle(&self) -> SimulatedHandle {
        SimulatedHandle {
            state: Arc::clone(&self.state),
        }
    }

    fn record(&self, call: DeviceCall) {
        self.state.lock().calls.push(call);
    }

    fn ensure_connected(&self) -> XcResult<()> {
        if !self.connected {
            return Err(XcError::NotConnected);
        }
        if self.state.lock().hung_up {
            return Err(XcError::DeviceUnavailable("device stopped responding".to_string()));
        }
        Ok(())
    }

    fn packet_interval(&self) -> Duration {
        Duration::from_secs_f64(self.profile.packet_period)
    }

    fn synthetic_frame(&mut self) -> RawFrame {
        let geometry = self.profile.geometry();
        let period = self.profile.packet_period;

        let counts = (0..geometry.num_lines)
            .map(|line| {
                let mean = (1_000.0 + 250.0 * line as f64) * period;
                let jitter = (self.rng.random::<f64>() - 0.5) * 2.0 * mean.sqrt();
                (mean + jitter).max(0.0).round() as u64
            })
            .collect();

        let pattern = ScanPattern::Decay {
            tau_bins: 4.0,
            noise: 0.05,
        };
        let auto_lags = geometry.live_autocorrelation_lags();
        let autocorrelations = (0..geometry.num_lines * auto_lags)
            .map(|i| self.correlation(pattern, (i % auto_lags) as f64))
            .collect();

        let cross_lags = geometry.live_crosscorrelation_lags();
        let centre = geometry.correlator_jitter_size as f64;
        let crosscorrelations = (0..geometry.num_baselines * cross_lags)
            .map(|i| self.correlation(pattern, ((i % cross_lags) as f64 - centre).abs()))
            .collect();

        RawFrame {
            counts,
            autocorrelations,
            crosscorrelations,
        }
    }

    fn correlation(&mut self, pattern: ScanPattern, distance: f64) -> Correlation {
        let coherence = match pattern {
            ScanPattern::Constant { value } => value,
            ScanPattern::Decay { tau_bins, noise } => {
                let base = (-distance / tau_bins.max(f64::EPSILON)).exp();
                base + noise * (self.rng.random::<f64>() - 0.5)
            }
        };
        let counts = 10_000;
        Correlation {
            correlations: (coherence.max(0.0) * counts as f64) as u64,
            counts,
            coherence,
        }
    }

    /// Run `stack` passes, then fill every region of `buffer`
    fn scan(
        &mut self,
        buffer: &mut [Correlation],
        regions: usize,
        signed: bool,
        stack: usize,
        control: &ScanControl,
    ) -> XcResult<f64> {
        self.ensure_connected()?;
        let stack = stack.max(1);
        let pass = Duration::from_millis(self.profile.scan_pass_ms);

        for done in 0..stack {
            if control.is_interrupted() {
                log::debug!("Simulated scan interrupted after {} of {} passes", done, stack);
                return Ok(control.percent());
            }
            std::thread::sleep(pass);
            self.ensure_connected()?;
            control.report((done + 1) as f64 * 100.0 / stack as f64);
        }

        let pattern = self.state.lock().scan_pattern;
        let stride = buffer.len() / regions.max(1);
        let centre = (stride / 2) as f64;
        for (i, slot) in buffer.iter_mut().enumerate() {
            let j = (i % stride.max(1)) as f64;
            let distance = if signed { (j - centre).abs() } else { j };
            *slot = self.correlation(pattern, distance);
        }
        Ok(control.percent())
    }
}

impl Device for SimulatedDevice {
    fn connect(&mut self, endpoint: &str) -> XcResult<DeviceGeometry> {
        self.record(DeviceCall::Connect(endpoint.to_string()));
        {
            let mut state = self.state.lock();
            if state.refuse_connect {
                state.refuse_connect = false;
                return Err(XcError::DeviceUnavailable(format!(
                    "cannot open {}",
                    endpoint
                )));
            }
            state.hung_up = false;
        }
        self.connected = true;
        log::info!("Simulated correlator connected on {}", endpoint);
        Ok(self.profile.geometry())
    }

    fn disconnect(&mut self) -> XcResult<()> {
        self.record(DeviceCall::Disconnect);
        self.connected = false;
        Ok(())
    }

    fn enable_capture(&mut self, enabled: bool) -> XcResult<()> {
        self.ensure_connected()?;
        self.record(DeviceCall::EnableCapture(enabled));
        Ok(())
    }

    fn set_power(&mut self, line: usize, flags: LineFlags) -> XcResult<()> {
        self.ensure_connected()?;
        if line >= self.profile.num_lines {
            return Err(XcError::Protocol(format!("no line {}", line)));
        }
        self.record(DeviceCall::SetPower {
            line,
            bits: flags.bits(),
        });
        Ok(())
    }

    fn set_baud_rate(&mut self, rate: BaudRate) -> XcResult<()> {
        self.ensure_connected()?;
        self.record(DeviceCall::SetBaudRate(rate));
        Ok(())
    }

    fn set_frequency_divider(&mut self, time_scale: TimeScale) -> XcResult<()> {
        self.ensure_connected()?;
        self.record(DeviceCall::SetFrequencyDivider(time_scale.exponent()));
        Ok(())
    }

    fn read_frame(&mut self) -> XcResult<RawFrame> {
        self.ensure_connected()?;
        let (next, synthetic) = {
            let mut state = self.state.lock();
            (state.script.pop_front(), state.synthetic)
        };
        match next {
            Some(frame) => frame,
            None if synthetic => {
                std::thread::sleep(self.packet_interval());
                Ok(self.synthetic_frame())
            }
            None => {
                std::thread::sleep(self.packet_interval());
                Err(XcError::Protocol("no packet".to_string()))
            }
        }
    }

    fn scan_autocorrelations(
        &mut self,
        buffer: &mut [Correlation],
        stack: usize,
        control: &ScanControl,
    ) -> XcResult<f64> {
        let lines = self.profile.num_lines;
        self.scan(buffer, lines, false, stack, control)
    }

    fn scan_crosscorrelations(
        &mut self,
        buffer: &mut [Correlation],
        stack: usize,
        control: &ScanControl,
    ) -> XcResult<f64> {
        let baselines = self.profile.geometry().num_baselines;
        self.scan(buffer, baselines, true, stack, control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> SimulatedProfile {
        SimulatedProfile {
            seed: Some(42),
            synthetic: false,
            scan_pass_ms: 0,
            packet_period: 0.001,
            ..Default::default()
        }
    }

    #[test]
    fn test_requires_connect() {
        let mut device = SimulatedDevice::new(profile());
        assert!(matches!(device.read_frame(), Err(XcError::NotConnected)));
        device.connect("sim0").unwrap();
        assert!(matches!(device.read_frame(), Err(XcError::Protocol(_))));
    }

    #[test]
    fn test_scripted_frames_in_order() {
        let mut device = SimulatedDevice::new(profile());
        let handle = device.handle();
        let geometry = device.connect("sim0").unwrap();
        handle.push_frame(RawFrame::uniform(&geometry, 1, 0.1));
        handle.push_error(XcError::Protocol("short".into()));
        handle.push_frame(RawFrame::uniform(&geometry, 2, 0.2));

        assert_eq!(device.read_frame().unwrap().counts[0], 1);
        assert!(device.read_frame().is_err());
        assert_eq!(device.read_frame().unwrap().counts[0], 2);
        assert_eq!(handle.pending_frames(), 0);
    }

    #[test]
    fn test_hang_up_and_refused_connect() {
        let mut device = SimulatedDevice::new(profile());
        let handle = device.handle();
        device.connect("sim0").unwrap();
        handle.hang_up();
        assert!(matches!(device.read_frame(), Err(XcError::DeviceUnavailable(_))));

        handle.refuse_connect();
        assert!(matches!(device.connect("sim0"), Err(XcError::DeviceUnavailable(_))));
        assert!(device.connect("sim0").is_ok());
        assert!(device.read_frame().is_err());
    }

    #[test]
    fn test_constant_scan_fills_buffer() {
        let mut device = SimulatedDevice::new(profile());
        device.handle().set_scan_pattern(ScanPattern::Constant { value: 1.0 });
        device.connect("sim0").unwrap();
        let control = ScanControl::new();
        let mut buffer = vec![Correlation::default(); 64];
        let percent = device.scan_autocorrelations(&mut buffer, 4, &control).unwrap();
        assert_eq!(percent, 100.0);
        assert!(buffer.iter().all(|c| c.coherence == 1.0));
    }

    #[test]
    fn test_interrupted_scan_stops_early() {
        let mut device = SimulatedDevice::new(profile());
        device.connect("sim0").unwrap();
        let control = ScanControl::new();
        control.interrupt();
        let mut buffer = vec![Correlation::default(); 8];
        let percent = device.scan_crosscorrelations(&mut buffer, 20, &control).unwrap();
        assert_eq!(percent, 0.0);
    }

    #[test]
    fn test_synthetic_frames_are_seeded() {
        let synthetic = SimulatedProfile {
            synthetic: true,
            ..profile()
        };
        let mut a = SimulatedDevice::new(synthetic.clone());
        let mut b = SimulatedDevice::new(synthetic);
        a.connect("a").unwrap();
        b.connect("b").unwrap();
        let fa = a.read_frame().unwrap();
        let fb = b.read_frame().unwrap();
        assert_eq!(fa, fb);
        let g = a.profile.geometry();
        assert_eq!(fa.autocorrelations.len(), g.num_lines * g.live_autocorrelation_lags());
        assert_eq!(fa.crosscorrelations.len(), g.num_baselines * g.live_crosscorrelation_lags());
    }

    #[test]
    fn test_records_pass_throughs() {
        let mut device = SimulatedDevice::new(profile());
        let handle = device.handle();
        device.connect("sim0").unwrap();
        device.set_power(2, LineFlags::power(true, true)).unwrap();
        device.set_baud_rate(BaudRate::R230400).unwrap();
        assert!(device.set_power(9, LineFlags::default()).is_err());
        assert_eq!(
            handle.calls(),
            vec![
                DeviceCall::Connect("sim0".into()),
                DeviceCall::SetPower { line: 2, bits: 3 },
                DeviceCall::SetBaudRate(BaudRate::R230400),
            ]
        );
    }
}
