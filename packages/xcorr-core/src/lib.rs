// Correlator acquisition and spectral reduction
//
// Architecture:
// - Device: pluggable correlator boundary (simulated implementation bundled)
// - Buffer: versioned scan buffers sized from geometry and time scale
// - Accumulator: counter history, boxcar stacks, running means, dark baselines
// - Reduction: per-channel extraction and log/inverse variants on a rayon pool
// - Publisher: latest-value slots delivered to a Sink on a fixed cadence
// - Pipeline: state machine, capture loop and configuration commands

pub mod accumulator;
pub mod buffer;
pub mod config;
pub mod device;
pub mod error;
pub mod mode;
pub mod pipeline;
pub mod publisher;
pub mod reduction;
pub mod series;
pub mod sink;
pub mod transform;
pub mod types;

pub use accumulator::{Accumulator, BoxcarStack, DarkBaseline, RunningMean};
pub use buffer::{
    autocorrelation_len, crosscorrelation_len, BufferLayout, SampleBuffer, VersionedLayout,
};
pub use config::PipelineConfig;
pub use device::{
    create_device, Device, DeviceCall, DeviceConfig, ScanControl, ScanPattern, SimulatedDevice,
    SimulatedHandle, SimulatedProfile,
};
pub use error::{XcError, XcResult};
pub use mode::{OperatingMode, ReductionFlags, Scope, SeriesKind, SessionMode};
pub use pipeline::{axis_range, Pipeline, PipelineStats};
pub use publisher::{PublishReport, Publisher, SeriesStore};
pub use series::{Bin, ChannelSeries, SeriesKey, SweepUpdate};
pub use sink::{CallbackSink, NullSink, OverflowStrategy, QueueSink, Sink, SinkEvent};
pub use transform::{swap_halves, RustFftTransform, Transform};
pub use types::{
    AxisRange, BaudRate, Correlation, DeviceGeometry, LineFlags, PipelineState, RawFrame,
    TimeScale,
};
