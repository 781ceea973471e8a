// Pipeline configuration

use crate::error::{XcError, XcResult};
use crate::types::TimeScale;
use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_stack() -> usize {
    20
}

fn default_publish_interval_ms() -> u64 {
    1000
}

fn default_counter_window_secs() -> f64 {
    10.0
}

fn default_idle_poll_ms() -> u64 {
    20
}

/// Tunables of a pipeline session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Frames per live boxcar block, and passes per device-driven scan
    #[serde(default = "default_stack")]
    pub stack: usize,

    /// Publisher cadence
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,

    /// Width of the counter display window in seconds
    #[serde(default = "default_counter_window_secs")]
    pub counter_window_secs: f64,

    /// How often the capture loop re-checks a disabled capture flag
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// Frequency divider applied after connect
    #[serde(default)]
    pub time_scale: TimeScale,

    /// Reduction pool size (None = number of CPUs)
    #[serde(default)]
    pub worker_threads: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stack: default_stack(),
            publish_interval_ms: default_publish_interval_ms(),
            counter_window_secs: default_counter_window_secs(),
            idle_poll_ms: default_idle_poll_ms(),
            time_scale: TimeScale::default(),
            worker_threads: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> XcResult<()> {
        if self.stack == 0 {
            return Err(XcError::Configuration("stack must be at least 1".to_string()));
        }
        if self.publish_interval_ms == 0 {
            return Err(XcError::Configuration(
                "publish interval must be positive".to_string(),
            ));
        }
        if !(self.counter_window_secs.is_finite() && self.counter_window_secs > 0.0) {
            return Err(XcError::Configuration(format!(
                "invalid counter window {}",
                self.counter_window_secs
            )));
        }
        if self.worker_threads == Some(0) {
            return Err(XcError::Configuration(
                "worker thread count must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load and validate a JSON configuration file; missing fields take defaults
    pub fn from_json_file(path: &Path) -> XcResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: PipelineConfig = serde_json::from_str(&text).map_err(|e| {
            XcError::Configuration(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }
}
