// Per-channel accumulation state
//
// Holds the counter history, the boxcar stacks of the live correlator modes,
// the running means of device-driven scans and the dark baselines captured by
// the user. Darks are subtracted as readings are stored, never on read.

use crate::error::{XcError, XcResult};
use crate::mode::{OperatingMode, Scope, SessionMode};
use crate::series::{Bin, ChannelSeries};
use crate::types::DeviceGeometry;
use std::collections::BTreeMap;

/// Cumulative mean: `avg' = avg * (n - 1) / n + v / n`
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    mean: f64,
    count: u64,
}

impl RunningMean {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in `value` and return the updated mean
    pub fn push(&mut self, value: f64) -> f64 {
        self.count += 1;
        if self.count == 1 {
            self.mean = value;
        } else {
            let n = self.count as f64;
            self.mean = self.mean * (n - 1.0) / n + value / n;
        }
        self.mean
    }

    pub fn value(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

/// Block average over `depth` consecutive frames
#[derive(Debug, Clone)]
pub struct BoxcarStack {
    depth: usize,
    frames: usize,
    sums: Vec<f64>,
    counts: Vec<usize>,
}

impl BoxcarStack {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            frames: 0,
            sums: Vec::new(),
            counts: Vec::new(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Frames folded into the current block so far
    pub fn pending(&self) -> usize {
        self.frames
    }

    /// Add one frame; returns the per-bin averages when the block completes.
    ///
    /// Bins missing from some frames are averaged over the frames that carried
    /// them; a bin missing from every frame of the block yields `None`.
    pub fn push(&mut self, samples: &[Option<f64>]) -> Option<Vec<Option<f64>>> {
        if self.sums.len() < samples.len() {
            self.sums.resize(samples.len(), 0.0);
            self.counts.resize(samples.len(), 0);
        }
        for (i, sample) in samples.iter().enumerate() {
            if let Some(v) = sample {
                self.sums[i] += v;
                self.counts[i] += 1;
            }
        }
        self.frames += 1;
        if self.frames < self.depth {
            return None;
        }

        let block = self
            .sums
            .iter()
            .zip(&self.counts)
            .map(|(sum, &count)| (count > 0).then(|| sum / count as f64))
            .collect();
        self.reset();
        Some(block)
    }

    pub fn reset(&mut self) {
        self.frames = 0;
        self.sums.clear();
        self.counts.clear();
    }
}

/// Reference level subtracted from a channel's readings
#[derive(Debug, Clone, PartialEq)]
pub enum DarkBaseline {
    Scalar(f64),
    PerBin(ChannelSeries),
}

impl DarkBaseline {
    /// `y` less the baseline at `x`; bins without a dark entry pass through
    pub fn subtract(&self, x: f64, y: f64) -> f64 {
        match self {
            DarkBaseline::Scalar(level) => y - level,
            DarkBaseline::PerBin(dark) => dark.get(x).map_or(y, |d| y - d),
        }
    }
}

fn subtract_dark(dark: Option<&DarkBaseline>, x: f64, y: f64) -> f64 {
    dark.map_or(y, |d| d.subtract(x, y))
}

/// The newest `ceil(window / period)` values, newest at x = 0
fn newest_first<I>(values: I, period: f64, window_secs: f64) -> ChannelSeries
where
    I: DoubleEndedIterator<Item = f64>,
{
    let visible = (window_secs / period).ceil() as usize;
    values
        .rev()
        .take(visible)
        .enumerate()
        .map(|(y, v)| (y as f64 * period, v))
        .collect()
}

/// Scan means of one bin, before and after dark subtraction
#[derive(Debug, Clone, Copy, Default)]
struct BinMean {
    raw: RunningMean,
    corrected: RunningMean,
}

#[derive(Debug, Clone)]
struct ChannelState {
    /// Raw event counts, kept for dark snapshots
    counts: Vec<u64>,
    /// Count rates as stored, dark already subtracted
    rates: Vec<f64>,
    /// Latest readings before dark subtraction
    raw: ChannelSeries,
    /// Readings as stored, dark already subtracted
    series: ChannelSeries,
    xs: Vec<f64>,
    means: BTreeMap<u64, BinMean>,
    boxcar: BoxcarStack,
}

impl ChannelState {
    fn new(stack: usize) -> Self {
        Self {
            counts: Vec::new(),
            rates: Vec::new(),
            raw: ChannelSeries::new(),
            series: ChannelSeries::new(),
            xs: Vec::new(),
            means: BTreeMap::new(),
            boxcar: BoxcarStack::new(stack),
        }
    }

    fn clear_reduction(&mut self) {
        self.raw.clear();
        self.series.clear();
        self.xs.clear();
        self.means.clear();
        self.boxcar.reset();
    }

    /// Subsequent scans average afresh against the new baseline
    fn restart_corrected_means(&mut self) {
        for mean in self.means.values_mut() {
            mean.corrected = RunningMean::new();
        }
    }
}

/// Accumulation state for every channel of the active mode
pub struct Accumulator {
    mode: SessionMode,
    geometry: DeviceGeometry,
    stack: usize,
    channels: Vec<ChannelState>,
    darks: BTreeMap<(OperatingMode, usize), DarkBaseline>,
}

impl Accumulator {
    pub fn new(mode: SessionMode, geometry: DeviceGeometry, stack: usize) -> Self {
        let mut accumulator = Self {
            mode,
            geometry,
            stack: stack.max(1),
            channels: Vec::new(),
            darks: BTreeMap::new(),
        };
        accumulator.reset(mode);
        accumulator
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Switch modes, dropping every series of the previous mode.
    ///
    /// Dark baselines are kept per base mode and apply again when it returns.
    pub fn reset(&mut self, mode: SessionMode) {
        self.mode = mode;
        let count = match mode.scope() {
            Scope::Line => self.geometry.num_lines,
            Scope::Baseline => self.geometry.num_baselines,
        };
        self.channels = (0..count).map(|_| ChannelState::new(self.stack)).collect();
    }

    /// Bin positions changed: drop reductions, keep counter history and darks
    pub fn rescale(&mut self) {
        for channel in &mut self.channels {
            channel.clear_reduction();
        }
    }

    /// Change the stack depth; live blocks in progress and scan means restart
    pub fn set_stack(&mut self, depth: usize) {
        self.stack = depth.max(1);
        for channel in &mut self.channels {
            channel.boxcar = BoxcarStack::new(self.stack);
            channel.means.clear();
        }
    }

    pub fn check_channel(&self, channel: usize) -> XcResult<()> {
        if channel < self.channels.len() {
            Ok(())
        } else {
            Err(XcError::Configuration(format!(
                "channel {} out of range for {} ({} channels)",
                channel,
                self.mode.base(),
                self.channels.len()
            )))
        }
    }

    /// Append one event count to a line's history, dark subtracted from its rate
    pub fn record_count(&mut self, line: usize, count: u64) {
        let dark = self.darks.get(&(self.mode.base(), line));
        let period = self.geometry.packet_period;
        if let Some(state) = self.channels.get_mut(line) {
            state.counts.push(count);
            state.rates.push(subtract_dark(dark, 0.0, count as f64 / period));
        }
    }

    pub fn history_len(&self, line: usize) -> usize {
        self.channels.get(line).map_or(0, |s| s.counts.len())
    }

    /// Stored count rates over the last `window_secs`
    fn counter_rates(&self, line: usize, window_secs: f64) -> ChannelSeries {
        match self.channels.get(line) {
            Some(state) => newest_first(
                state.rates.iter().copied(),
                self.geometry.packet_period,
                window_secs,
            ),
            None => ChannelSeries::new(),
        }
    }

    /// Count rates over the last `window_secs` without any dark subtracted
    fn raw_counter_rates(&self, line: usize, window_secs: f64) -> ChannelSeries {
        let period = self.geometry.packet_period;
        match self.channels.get(line) {
            Some(state) => newest_first(
                state.counts.iter().map(|c| *c as f64 / period),
                period,
                window_secs,
            ),
            None => ChannelSeries::new(),
        }
    }

    /// Fold one live frame into a channel's boxcar.
    ///
    /// A completed block replaces the channel's readings with its own average
    /// and the next block starts from zero. Returns true when that happened.
    pub fn stack_frame(&mut self, channel: usize, bins: &[Bin]) -> bool {
        let dark = self.darks.get(&(self.mode.base(), channel));
        let Some(state) = self.channels.get_mut(channel) else {
            return false;
        };
        if state.xs.len() < bins.len() {
            state.xs.resize(bins.len(), 0.0);
        }
        for (i, bin) in bins.iter().enumerate() {
            state.xs[i] = bin.x;
        }
        let samples: Vec<Option<f64>> = bins.iter().map(|b| b.y).collect();
        let Some(block) = state.boxcar.push(&samples) else {
            return false;
        };

        for (i, value) in block.into_iter().enumerate() {
            if let Some(v) = value {
                let x = state.xs[i];
                state.raw.insert(x, v);
                state.series.insert(x, subtract_dark(dark, x, v));
            }
        }
        true
    }

    /// Fold a completed scan into the per-bin running means.
    ///
    /// The dark is subtracted from each reading before it is averaged; faulted
    /// bins keep their previous value.
    pub fn stack_scan(&mut self, channel: usize, bins: &[Bin]) {
        let dark = self.darks.get(&(self.mode.base(), channel));
        let Some(state) = self.channels.get_mut(channel) else {
            return;
        };
        for bin in bins {
            let Some(y) = bin.y else {
                continue;
            };
            let mean = state.means.entry(bin.x.to_bits()).or_default();
            state.raw.insert(bin.x, mean.raw.push(y));
            state
                .series
                .insert(bin.x, mean.corrected.push(subtract_dark(dark, bin.x, y)));
        }
    }

    /// The channel's plain series as stored
    pub fn corrected(&self, channel: usize, window_secs: f64) -> ChannelSeries {
        match self.mode.base() {
            OperatingMode::Counter => self.counter_rates(channel, window_secs),
            _ => self
                .channels
                .get(channel)
                .map_or_else(ChannelSeries::new, |state| state.series.clone()),
        }
    }

    pub fn dark(&self, channel: usize) -> Option<&DarkBaseline> {
        self.darks.get(&(self.mode.base(), channel))
    }

    /// Capture the channel's current raw readings as its dark baseline.
    ///
    /// Readings already stored are left as they are; the baseline applies to
    /// readings taken from now on.
    pub fn capture_dark(&mut self, channel: usize, window_secs: f64) -> XcResult<()> {
        self.check_channel(channel)?;
        let base = self.mode.base();
        let dark = match base {
            OperatingMode::Counter => {
                let mean = self
                    .raw_counter_rates(channel, window_secs)
                    .mean()
                    .ok_or_else(|| {
                        XcError::Configuration(format!("line {} has no counts yet", channel))
                    })?;
                DarkBaseline::Scalar(mean)
            }
            OperatingMode::Autocorrelator => {
                let raw = &self.channels[channel].raw;
                if raw.is_empty() {
                    return Err(XcError::Configuration(format!(
                        "line {} has no spectrum yet",
                        channel
                    )));
                }
                DarkBaseline::PerBin(raw.clone())
            }
            OperatingMode::Crosscorrelator => {
                return Err(XcError::Configuration(
                    "dark baselines are not supported for crosscorrelations".to_string(),
                ))
            }
        };
        self.darks.insert((base, channel), dark);
        self.channels[channel].restart_corrected_means();
        Ok(())
    }

    pub fn clear_dark(&mut self, channel: usize) -> XcResult<()> {
        self.check_channel(channel)?;
        if self.darks.remove(&(self.mode.base(), channel)).is_some() {
            self.channels[channel].restart_corrected_means();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::ReductionFlags;

    fn geometry() -> DeviceGeometry {
        DeviceGeometry::new(4, 16, 8, 4, 400_000_000.0, 0.5)
    }

    fn live_auto() -> SessionMode {
        SessionMode::new(
            OperatingMode::Autocorrelator,
            ReductionFlags {
                live: true,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn batch_auto() -> SessionMode {
        SessionMode::new(OperatingMode::Autocorrelator, ReductionFlags::default()).unwrap()
    }

    fn bins(values: &[f64]) -> Vec<Bin> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| Bin::new(i as f64, Some(*v)))
            .collect()
    }

    #[test]
    fn test_running_mean_equals_arithmetic_mean() {
        let values = [3.0, -1.5, 8.25, 0.0, 4.0, 1e-3, 12.0];
        let mut mean = RunningMean::new();
        for (n, v) in values.iter().enumerate() {
            let got = mean.push(*v);
            let expected = values[..=n].iter().sum::<f64>() / (n + 1) as f64;
            assert!((got - expected).abs() < 1e-12);
        }
        assert_eq!(mean.count(), values.len() as u64);
    }

    #[test]
    fn test_first_value_inserted_verbatim() {
        let mut mean = RunningMean::new();
        assert_eq!(mean.value(), None);
        assert_eq!(mean.push(0.1), 0.1);
    }

    #[test]
    fn test_boxcar_publishes_once_per_block() {
        let mut boxcar = BoxcarStack::new(4);
        assert!(boxcar.push(&[Some(1.0)]).is_none());
        assert!(boxcar.push(&[Some(2.0)]).is_none());
        assert!(boxcar.push(&[Some(3.0)]).is_none());
        assert_eq!(boxcar.push(&[Some(4.0)]), Some(vec![Some(2.5)]));
        assert_eq!(boxcar.pending(), 0);
        assert!(boxcar.push(&[Some(10.0)]).is_none());
    }

    #[test]
    fn test_boxcar_skips_missing_samples() {
        let mut boxcar = BoxcarStack::new(2);
        boxcar.push(&[Some(1.0), None]);
        assert_eq!(boxcar.push(&[Some(3.0), None]), Some(vec![Some(2.0), None]));
    }

    #[test]
    fn test_live_blocks_restart_after_publish() {
        let mut acc = Accumulator::new(live_auto(), geometry(), 4);
        for v in [1.0, 2.0, 3.0] {
            assert!(!acc.stack_frame(0, &bins(&[v])));
        }
        assert!(acc.stack_frame(0, &bins(&[4.0])));
        assert_eq!(acc.corrected(0, 10.0).get(0.0), Some(2.5));

        for v in [5.0, 6.0, 7.0, 8.0] {
            acc.stack_frame(0, &bins(&[v]));
        }
        assert_eq!(acc.corrected(0, 10.0).get(0.0), Some(6.5));

        for _ in 0..4 {
            acc.stack_frame(0, &bins(&[10.0]));
        }
        assert_eq!(acc.corrected(0, 10.0).get(0.0), Some(10.0));
    }

    #[test]
    fn test_scans_average_together() {
        let mut acc = Accumulator::new(batch_auto(), geometry(), 20);
        acc.stack_scan(0, &bins(&[1.0, 3.0]));
        acc.stack_scan(0, &bins(&[3.0, 5.0]));
        let series = acc.corrected(0, 10.0);
        assert_eq!(series.get(0.0), Some(2.0));
        assert_eq!(series.get(1.0), Some(4.0));

        acc.stack_scan(0, &bins(&[5.0, 7.0]));
        let series = acc.corrected(0, 10.0);
        assert!((series.get(0.0).unwrap() - 3.0).abs() < 1e-12);
        assert!((series.get(1.0).unwrap() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_stack_change_restarts_scan_means() {
        let mut acc = Accumulator::new(batch_auto(), geometry(), 20);
        acc.stack_scan(0, &bins(&[1.0]));
        acc.stack_scan(0, &bins(&[3.0]));
        acc.set_stack(5);
        acc.stack_scan(0, &bins(&[10.0]));
        assert_eq!(acc.corrected(0, 10.0).get(0.0), Some(10.0));

        acc.rescale();
        assert!(acc.corrected(0, 10.0).is_empty());
        acc.stack_scan(0, &bins(&[4.0]));
        assert_eq!(acc.corrected(0, 10.0).get(0.0), Some(4.0));
    }

    #[test]
    fn test_counter_rates_newest_first() {
        let mut acc = Accumulator::new(SessionMode::counter(), geometry(), 20);
        for c in [1, 2, 3, 4, 5] {
            acc.record_count(0, c);
        }
        // 1 second window at 0.5 s per packet shows the two newest counts
        let series = acc.corrected(0, 1.0);
        assert_eq!(series.len(), 2);
        assert_eq!(series.get(0.0), Some(10.0));
        assert_eq!(series.get(0.5), Some(8.0));
        assert_eq!(acc.history_len(0), 5);
    }

    #[test]
    fn test_counter_dark_applies_to_later_counts_only() {
        let mut acc = Accumulator::new(SessionMode::counter(), geometry(), 20);
        for c in [2, 4] {
            acc.record_count(1, c);
        }
        acc.capture_dark(1, 10.0).unwrap();
        assert_eq!(acc.dark(1), Some(&DarkBaseline::Scalar(6.0)));

        // Counts recorded before the dark keep their rates
        let series = acc.corrected(1, 10.0);
        assert_eq!(series.get(0.0), Some(8.0));
        assert_eq!(series.get(0.5), Some(4.0));

        acc.record_count(1, 4);
        let series = acc.corrected(1, 10.0);
        assert_eq!(series.get(0.0), Some(2.0));
        assert_eq!(series.get(0.5), Some(8.0));

        // Clearing leaves the subtracted reading in place
        acc.clear_dark(1).unwrap();
        acc.record_count(1, 4);
        let series = acc.corrected(1, 10.0);
        assert_eq!(series.get(0.0), Some(8.0));
        assert_eq!(series.get(0.5), Some(2.0));
    }

    #[test]
    fn test_counter_dark_ignores_active_dark() {
        let mut acc = Accumulator::new(SessionMode::counter(), geometry(), 20);
        acc.record_count(0, 3);
        acc.capture_dark(0, 10.0).unwrap();
        acc.record_count(0, 3);
        // A second capture is taken from raw rates, not the subtracted ones
        acc.capture_dark(0, 10.0).unwrap();
        assert_eq!(acc.dark(0), Some(&DarkBaseline::Scalar(6.0)));
    }

    #[test]
    fn test_per_bin_dark_subtracts_matching_bins_only() {
        let mut acc = Accumulator::new(batch_auto(), geometry(), 20);
        acc.stack_scan(0, &bins(&[0.5, 0.25]));
        acc.capture_dark(0, 10.0).unwrap();
        // The reading the dark was taken from stays as stored
        assert_eq!(acc.corrected(0, 10.0).get(0.0), Some(0.5));

        acc.stack_scan(0, &bins(&[0.5, 0.25]));
        assert!(acc.corrected(0, 10.0).values().all(|v| v.abs() < 1e-12));

        acc.stack_scan(0, &[Bin::new(7.0, Some(0.75))]);
        let series = acc.corrected(0, 10.0);
        assert_eq!(series.get(7.0), Some(0.75));

        acc.clear_dark(0).unwrap();
        assert!(acc.corrected(0, 10.0).get(0.0).unwrap().abs() < 1e-12);
        acc.stack_scan(0, &bins(&[0.5]));
        assert_eq!(acc.corrected(0, 10.0).get(0.0), Some(0.5));
    }

    #[test]
    fn test_live_dark_subtracted_from_block() {
        let mut acc = Accumulator::new(live_auto(), geometry(), 2);
        acc.stack_frame(0, &bins(&[1.0]));
        acc.stack_frame(0, &bins(&[3.0]));
        acc.capture_dark(0, 10.0).unwrap();
        assert_eq!(acc.corrected(0, 10.0).get(0.0), Some(2.0));

        acc.stack_frame(0, &bins(&[2.0]));
        acc.stack_frame(0, &bins(&[4.0]));
        assert_eq!(acc.corrected(0, 10.0).get(0.0), Some(1.0));
    }

    #[test]
    fn test_faulted_bins_keep_previous_value() {
        let mut acc = Accumulator::new(batch_auto(), geometry(), 20);
        acc.stack_scan(0, &bins(&[0.5, 0.25]));
        acc.stack_scan(0, &[Bin::new(0.0, Some(0.9)), Bin::new(1.0, None)]);
        let series = acc.corrected(0, 10.0);
        assert!((series.get(0.0).unwrap() - 0.7).abs() < 1e-12);
        assert_eq!(series.get(1.0), Some(0.25));
    }

    #[test]
    fn test_crosscorrelator_dark_rejected() {
        let mode = SessionMode::new(OperatingMode::Crosscorrelator, ReductionFlags::default()).unwrap();
        let mut acc = Accumulator::new(mode, geometry(), 20);
        assert_eq!(acc.channel_count(), 6);
        acc.stack_scan(0, &bins(&[0.5]));
        assert!(matches!(acc.capture_dark(0, 10.0), Err(XcError::Configuration(_))));
    }

    #[test]
    fn test_reset_clears_series_but_keeps_darks_per_mode() {
        let auto = SessionMode::new(OperatingMode::Autocorrelator, ReductionFlags::default()).unwrap();
        let mut acc = Accumulator::new(auto, geometry(), 20);
        acc.stack_scan(2, &bins(&[0.5]));
        acc.capture_dark(2, 10.0).unwrap();

        acc.reset(SessionMode::counter());
        assert!(acc.corrected(2, 10.0).is_empty());
        assert!(acc.dark(2).is_none());

        acc.reset(auto);
        assert!(acc.corrected(2, 10.0).is_empty());
        assert!(acc.dark(2).is_some());
    }

    #[test]
    fn test_out_of_range_channel() {
        let mut acc = Accumulator::new(SessionMode::counter(), geometry(), 20);
        assert!(acc.check_channel(4).is_err());
        assert!(acc.clear_dark(9).is_err());
        assert!(acc.corrected(9, 1.0).is_empty());
    }
}
