// Mode-dependent reduction with parallel computation using Rayon
//
// Extraction turns a scan buffer or a live frame into per-channel bins with
// physical x coordinates. Variant derivation turns a channel's corrected
// plain series into its log and inverse curves. Both run one channel per
// task on a dedicated pool; a task never reads another channel's region.

use crate::buffer::SampleBuffer;
use crate::error::{XcError, XcResult};
use crate::mode::{OperatingMode, SeriesKind, SessionMode};
use crate::series::{Bin, ChannelSeries};
use crate::transform::{swap_halves, Transform};
use crate::types::{Correlation, DeviceGeometry, RawFrame};
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use std::sync::Arc;

/// Bins at the start of every autocorrelation scan region that carry no data
pub const SCAN_AUTOCORRELATION_OFFSET: usize = 2;

/// Bins at the start of every live autocorrelation region that carry no data
pub const LIVE_AUTOCORRELATION_OFFSET: usize = 1;

fn coherence(sample: Option<&Correlation>) -> Option<f64> {
    sample.map(|c| c.coherence).filter(|v| v.is_finite())
}

/// Delay bins of one line from a batch scan; x in ns from zero delay.
///
/// Negative coherence is clamped to zero.
pub fn scan_autocorrelation_bins(buffer: &SampleBuffer, line: usize, spacing_ns: f64) -> Vec<Bin> {
    let Some(region) = buffer.line_region(line) else {
        return Vec::new();
    };
    region
        .iter()
        .skip(SCAN_AUTOCORRELATION_OFFSET)
        .enumerate()
        .map(|(j, c)| Bin::new(j as f64 * spacing_ns, coherence(Some(c)).map(|v| v.max(0.0))))
        .collect()
}

/// Lag bins of one baseline from a batch scan; x in ns, negative when the first line leads
pub fn scan_crosscorrelation_bins(
    buffer: &SampleBuffer,
    baseline: usize,
    spacing_ns: f64,
) -> Vec<Bin> {
    let Some(region) = buffer.baseline_region(baseline) else {
        return Vec::new();
    };
    let centre = (region.len() / 2) as f64;
    region
        .iter()
        .enumerate()
        .map(|(j, c)| Bin::new((j as f64 - centre) * spacing_ns, coherence(Some(c))))
        .collect()
}

/// Delay bins of one line from a live frame.
///
/// Indices past the end of a short frame yield faulted bins.
pub fn live_autocorrelation_bins(
    frame: &RawFrame,
    geometry: &DeviceGeometry,
    line: usize,
    spacing_ns: f64,
) -> Vec<Bin> {
    let lags = geometry.live_autocorrelation_lags();
    let start = line * lags;
    (LIVE_AUTOCORRELATION_OFFSET..lags)
        .map(|j| {
            let x = (j - LIVE_AUTOCORRELATION_OFFSET) as f64 * spacing_ns;
            Bin::new(x, coherence(frame.autocorrelations.get(start + j)))
        })
        .collect()
}

/// Lag bins of one baseline from a live frame
pub fn live_crosscorrelation_bins(
    frame: &RawFrame,
    geometry: &DeviceGeometry,
    baseline: usize,
    spacing_ns: f64,
) -> Vec<Bin> {
    let lags = geometry.live_crosscorrelation_lags();
    let centre = geometry.correlator_jitter_size as f64;
    let start = baseline * lags;
    (0..lags)
        .map(|j| {
            let x = (j as f64 - centre) * spacing_ns;
            Bin::new(x, coherence(frame.crosscorrelations.get(start + j)))
        })
        .collect()
}

pub fn faulted(bins: &[Bin]) -> usize {
    bins.iter().filter(|b| b.y.is_none()).count()
}

/// Square-root compressed copy, negative values clamped to zero
pub fn log_variant(plain: &ChannelSeries) -> ChannelSeries {
    plain.iter().map(|(x, y)| (x, y.max(0.0).sqrt())).collect()
}

/// Inverse-transformed copy with the halves swapped to centre zero frequency.
///
/// The clamped values form a spectrum whose real and imaginary parts are
/// equal. Output x is in Hz, `(j - n / 2) * 1e9 / (n * spacing_ns)`.
pub fn inverse_variant(
    plain: &ChannelSeries,
    spacing_ns: f64,
    transform: &dyn Transform,
) -> XcResult<ChannelSeries> {
    let n = plain.len();
    if n < 2 {
        return Err(XcError::Transform(format!("{} samples cannot be inverted", n)));
    }
    let spectrum: Vec<Complex<f64>> = plain
        .values()
        .map(|v| {
            let v = v.max(0.0);
            Complex::new(v, v)
        })
        .collect();

    let mut output = transform.inverse(&spectrum, n)?;
    swap_halves(&mut output);

    let step_hz = 1_000_000_000.0 / (n as f64 * spacing_ns);
    let centre = (n / 2) as f64;
    Ok(output
        .into_iter()
        .enumerate()
        .map(|(j, y)| ((j as f64 - centre) * step_hz, y))
        .collect())
}

/// Runs extraction and variant derivation across channels
pub struct Reducer {
    thread_pool: rayon::ThreadPool,
    transform: Arc<dyn Transform>,
}

impl Reducer {
    pub fn new(worker_threads: Option<usize>, transform: Arc<dyn Transform>) -> XcResult<Self> {
        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads.unwrap_or_else(num_cpus::get).max(1))
            .thread_name(|i| format!("xcorr-reduce-worker-{}", i))
            .build()
            .map_err(|e| {
                XcError::Configuration(format!("Failed to create thread pool: {}", e))
            })?;

        Ok(Self {
            thread_pool,
            transform,
        })
    }

    pub fn transform(&self) -> &Arc<dyn Transform> {
        &self.transform
    }

    /// Per-channel bins from a finished batch scan
    pub fn extract_scan(
        &self,
        buffer: &SampleBuffer,
        mode: SessionMode,
        spacing_ns: f64,
    ) -> Vec<Vec<Bin>> {
        let geometry = buffer.layout().geometry;
        self.thread_pool.install(|| match mode.base() {
            OperatingMode::Autocorrelator => (0..geometry.num_lines)
                .into_par_iter()
                .map(|line| scan_autocorrelation_bins(buffer, line, spacing_ns))
                .collect(),
            OperatingMode::Crosscorrelator => (0..geometry.num_baselines)
                .into_par_iter()
                .map(|baseline| scan_crosscorrelation_bins(buffer, baseline, spacing_ns))
                .collect(),
            OperatingMode::Counter => Vec::new(),
        })
    }

    /// Per-channel bins from one live frame
    pub fn extract_live(
        &self,
        frame: &RawFrame,
        geometry: &DeviceGeometry,
        mode: SessionMode,
        spacing_ns: f64,
    ) -> Vec<Vec<Bin>> {
        self.thread_pool.install(|| match mode.base() {
            OperatingMode::Autocorrelator => (0..geometry.num_lines)
                .into_par_iter()
                .map(|line| live_autocorrelation_bins(frame, geometry, line, spacing_ns))
                .collect(),
            OperatingMode::Crosscorrelator => (0..geometry.num_baselines)
                .into_par_iter()
                .map(|baseline| live_crosscorrelation_bins(frame, geometry, baseline, spacing_ns))
                .collect(),
            OperatingMode::Counter => Vec::new(),
        })
    }

    /// Every series kind the mode asks for, per channel.
    ///
    /// A failed inverse drops only that channel's inverse curve.
    pub fn derive_variants(
        &self,
        mode: SessionMode,
        spacing_ns: f64,
        plains: Vec<(usize, ChannelSeries)>,
    ) -> Vec<(usize, Vec<(SeriesKind, ChannelSeries)>)> {
        let kinds = mode.kinds();
        let transform = self.transform.as_ref();
        self.thread_pool.install(|| {
            plains
                .into_par_iter()
                .map(|(channel, plain)| {
                    let mut variants = Vec::with_capacity(kinds.len());
                    for kind in &kinds {
                        match kind {
                            SeriesKind::Plain => {}
                            SeriesKind::Log => variants.push((SeriesKind::Log, log_variant(&plain))),
                            SeriesKind::Inverse => {
                                match inverse_variant(&plain, spacing_ns, transform) {
                                    Ok(series) => variants.push((SeriesKind::Inverse, series)),
                                    Err(e) => log::warn!(
                                        "Skipping inverse for channel {}: {}",
                                        channel,
                                        e
                                    ),
                                }
                            }
                        }
                    }
                    variants.insert(0, (SeriesKind::Plain, plain));
                    (channel, variants)
                })
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferLayout;
    use crate::mode::ReductionFlags;
    use crate::transform::RustFftTransform;
    use crate::types::TimeScale;

    fn geometry() -> DeviceGeometry {
        DeviceGeometry::new(4, 16, 8, 4, 400_000_000.0, 0.01)
    }

    fn filled_buffer(value: f64) -> SampleBuffer {
        let layout = Arc::new(BufferLayout::new(geometry(), TimeScale::default(), 1).unwrap());
        let mut buffer = SampleBuffer::allocate(layout);
        for c in buffer.autocorrelations_mut() {
            c.coherence = value;
        }
        for c in buffer.crosscorrelations_mut() {
            c.coherence = value;
        }
        buffer
    }

    fn reducer() -> Reducer {
        Reducer::new(Some(2), Arc::new(RustFftTransform)).unwrap()
    }

    #[test]
    fn test_scan_autocorrelation_skips_offset() {
        let buffer = filled_buffer(1.0);
        let bins = scan_autocorrelation_bins(&buffer, 0, 2.5);
        assert_eq!(bins.len(), 14);
        assert!(bins.iter().all(|b| b.y == Some(1.0)));
        assert_eq!(bins[0].x, 0.0);
        assert_eq!(bins[13].x, 13.0 * 2.5);
        assert!(scan_autocorrelation_bins(&buffer, 4, 2.5).is_empty());
    }

    #[test]
    fn test_scan_autocorrelation_clamps_negative() {
        let buffer = filled_buffer(-0.3);
        let bins = scan_autocorrelation_bins(&buffer, 1, 2.5);
        assert!(bins.iter().all(|b| b.y == Some(0.0)));
        // Crosscorrelations keep their sign
        let cross = scan_crosscorrelation_bins(&buffer, 0, 2.5);
        assert!(cross.iter().all(|b| b.y == Some(-0.3)));
    }

    #[test]
    fn test_scan_crosscorrelation_is_signed() {
        let buffer = filled_buffer(0.5);
        let bins = scan_crosscorrelation_bins(&buffer, 5, 1.0);
        assert_eq!(bins.len(), 65);
        assert_eq!(bins[0].x, -32.0);
        assert_eq!(bins[32].x, 0.0);
        assert_eq!(bins[64].x, 32.0);
    }

    #[test]
    fn test_short_live_frame_faults_missing_bins() {
        let g = geometry();
        let mut frame = RawFrame::uniform(&g, 1, 0.25);
        frame.autocorrelations.truncate(g.live_autocorrelation_lags() * 3 + 4);
        let full = live_autocorrelation_bins(&frame, &g, 2, 1.0);
        assert_eq!(full.len(), 7);
        assert_eq!(faulted(&full), 0);
        let short = live_autocorrelation_bins(&frame, &g, 3, 1.0);
        assert_eq!(short.len(), 7);
        assert_eq!(faulted(&short), 4);
        assert_eq!(short[0].y, Some(0.25));
    }

    #[test]
    fn test_non_finite_coherence_faults_bin() {
        let g = geometry();
        let mut frame = RawFrame::uniform(&g, 1, 0.25);
        frame.crosscorrelations[g.live_crosscorrelation_lags() + 4].coherence = f64::NAN;
        let bins = live_crosscorrelation_bins(&frame, &g, 1, 1.0);
        assert_eq!(bins.len(), 9);
        assert_eq!(bins[4].x, 0.0);
        assert_eq!(bins[4].y, None);
    }

    #[test]
    fn test_log_variant_clamps_negative() {
        let plain: ChannelSeries = vec![(0.0, 4.0), (1.0, -1.0)].into_iter().collect();
        let log = log_variant(&plain);
        assert_eq!(log.get(0.0), Some(2.0));
        assert_eq!(log.get(1.0), Some(0.0));
    }

    #[test]
    fn test_inverse_variant_centres_zero_frequency() {
        let plain: ChannelSeries = (0..8).map(|j| (j as f64, 1.0)).collect();
        let inverse = inverse_variant(&plain, 1.0, &RustFftTransform).unwrap();
        assert_eq!(inverse.len(), 8);
        let (min, max) = inverse.x_range().unwrap();
        assert!((min + 4.0 * 1.25e8).abs() < 1e-3);
        assert!((max - 3.0 * 1.25e8).abs() < 1e-3);
        // Flat spectrum inverts to an impulse, centred after the swap
        assert!((inverse.get(0.0).unwrap() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_inverse_requires_two_samples() {
        let plain: ChannelSeries = vec![(0.0, 1.0)].into_iter().collect();
        assert!(matches!(
            inverse_variant(&plain, 1.0, &RustFftTransform),
            Err(XcError::Transform(_))
        ));
    }

    #[test]
    fn test_failed_inverse_keeps_other_variants() {
        let mode = SessionMode::new(
            OperatingMode::Autocorrelator,
            ReductionFlags {
                live: false,
                log: true,
                inverse: true,
            },
        )
        .unwrap();
        let good: ChannelSeries = (0..4).map(|j| (j as f64, 0.5)).collect();
        let bad: ChannelSeries = vec![(0.0, 0.5)].into_iter().collect();
        let mut out = reducer().derive_variants(mode, 1.0, vec![(0, good), (1, bad)]);
        out.sort_by_key(|(channel, _)| *channel);

        let kinds = |v: &Vec<(SeriesKind, ChannelSeries)>| -> Vec<SeriesKind> {
            v.iter().map(|(k, _)| *k).collect()
        };
        assert_eq!(
            kinds(&out[0].1),
            vec![SeriesKind::Plain, SeriesKind::Log, SeriesKind::Inverse]
        );
        assert_eq!(kinds(&out[1].1), vec![SeriesKind::Plain, SeriesKind::Log]);
    }

    #[test]
    fn test_extract_scan_per_mode() {
        let r = reducer();
        let buffer = filled_buffer(1.0);
        let auto = SessionMode::new(OperatingMode::Autocorrelator, ReductionFlags::default()).unwrap();
        let cross = SessionMode::new(OperatingMode::Crosscorrelator, ReductionFlags::default()).unwrap();
        assert_eq!(r.extract_scan(&buffer, auto, 1.0).len(), 4);
        assert_eq!(r.extract_scan(&buffer, cross, 1.0).len(), 6);
        assert!(r.extract_scan(&buffer, SessionMode::counter(), 1.0).is_empty());
    }
}
