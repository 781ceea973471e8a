// Sample buffers for device-driven scans
//
// Buffer sizes are a pure function of the device geometry and the time scale.
// A time-scale change never resizes a buffer in place: it publishes a new
// layout generation, and the capture loop allocates a fresh buffer the next
// time it observes a generation it does not hold.

use crate::error::{XcError, XcResult};
use crate::types::{Correlation, DeviceGeometry, TimeScale};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;

/// Length of the autocorrelation scan buffer: `lines * delay * (k + 2) / 2`
pub fn autocorrelation_len(geometry: &DeviceGeometry, time_scale: TimeScale) -> usize {
    geometry.num_lines * geometry.delay_size * (time_scale.exponent() as usize + 2) / 2
}

/// Length of the crosscorrelation scan buffer: `baselines * (2 * delay * (k + 2) + 1)`
pub fn crosscorrelation_len(geometry: &DeviceGeometry, time_scale: TimeScale) -> usize {
    geometry.num_baselines * (2 * geometry.delay_size * (time_scale.exponent() as usize + 2) + 1)
}

/// Shape of one generation of scan buffers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferLayout {
    pub geometry: DeviceGeometry,
    pub time_scale: TimeScale,
    pub generation: u64,
    pub autocorrelation_len: usize,
    pub crosscorrelation_len: usize,
}

impl BufferLayout {
    pub fn new(geometry: DeviceGeometry, time_scale: TimeScale, generation: u64) -> XcResult<Self> {
        geometry.validate()?;
        let autocorrelation_len = autocorrelation_len(&geometry, time_scale);
        let crosscorrelation_len = crosscorrelation_len(&geometry, time_scale);
        if autocorrelation_len == 0 || crosscorrelation_len == 0 {
            return Err(XcError::Configuration(format!(
                "empty buffer layout for {} lines at time scale {}",
                geometry.num_lines, time_scale
            )));
        }
        Ok(Self {
            geometry,
            time_scale,
            generation,
            autocorrelation_len,
            crosscorrelation_len,
        })
    }

    /// Bins per line in the autocorrelation buffer
    pub fn line_stride(&self) -> usize {
        self.autocorrelation_len / self.geometry.num_lines
    }

    /// Bins per baseline in the crosscorrelation buffer (odd, zero lag in the centre)
    pub fn baseline_stride(&self) -> usize {
        self.crosscorrelation_len / self.geometry.num_baselines
    }
}

/// One scan's worth of raw coherence samples
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    layout: Arc<BufferLayout>,
    autocorrelations: Vec<Correlation>,
    crosscorrelations: Vec<Correlation>,
}

impl SampleBuffer {
    pub fn allocate(layout: Arc<BufferLayout>) -> Self {
        log::debug!(
            "Allocating sample buffer generation {} ({} auto, {} cross bins)",
            layout.generation,
            layout.autocorrelation_len,
            layout.crosscorrelation_len
        );
        Self {
            autocorrelations: vec![Correlation::default(); layout.autocorrelation_len],
            crosscorrelations: vec![Correlation::default(); layout.crosscorrelation_len],
            layout,
        }
    }

    pub fn layout(&self) -> &Arc<BufferLayout> {
        &self.layout
    }

    pub fn generation(&self) -> u64 {
        self.layout.generation
    }

    pub fn autocorrelations(&self) -> &[Correlation] {
        &self.autocorrelations
    }

    pub fn crosscorrelations(&self) -> &[Correlation] {
        &self.crosscorrelations
    }

    pub fn autocorrelations_mut(&mut self) -> &mut [Correlation] {
        &mut self.autocorrelations
    }

    pub fn crosscorrelations_mut(&mut self) -> &mut [Correlation] {
        &mut self.crosscorrelations
    }

    /// Autocorrelation bins belonging to `line`
    pub fn line_region(&self, line: usize) -> Option<&[Correlation]> {
        let stride = self.layout.line_stride();
        self.autocorrelations.get(line * stride..(line + 1) * stride)
    }

    /// Crosscorrelation bins belonging to `baseline`
    pub fn baseline_region(&self, baseline: usize) -> Option<&[Correlation]> {
        let stride = self.layout.baseline_stride();
        self.crosscorrelations
            .get(baseline * stride..(baseline + 1) * stride)
    }
}

/// The current layout, swapped atomically on reconfiguration
pub struct VersionedLayout {
    current: RwLock<Arc<BufferLayout>>,
}

impl VersionedLayout {
    pub fn new(geometry: DeviceGeometry, time_scale: TimeScale) -> XcResult<Self> {
        Ok(Self {
            current: RwLock::new(Arc::new(BufferLayout::new(geometry, time_scale, 1)?)),
        })
    }

    pub fn current(&self) -> Arc<BufferLayout> {
        Arc::clone(&self.current.read())
    }

    /// Publish a layout for `time_scale`; on error the previous layout stays current
    pub fn replace(&self, time_scale: TimeScale) -> XcResult<Arc<BufferLayout>> {
        let mut current = self.current.write();
        let next = Arc::new(BufferLayout::new(
            current.geometry,
            time_scale,
            current.generation + 1,
        )?);
        *current = Arc::clone(&next);
        Ok(next)
    }
}
